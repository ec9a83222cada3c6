//! Errors raised while running automation.

use crate::args::ArgError;
use crate::dice::DiceError;
use crate::initiative::PassiveEffectError;
use crate::script::EvalError;
use crate::world::CounterError;
use thiserror::Error;

/// Every failure an automation run can produce.
///
/// Most variants are local to the node that raised them: when they happen
/// inside a list of child effects the message is narrated and the siblings
/// keep running. [`AutomationError::StopExecution`] ends the whole run and
/// [`AutomationError::RequiresLicense`] is only raised before anything runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AutomationError {
    #[error("{0}")]
    Automation(String),

    #[error("{0}")]
    Target(String),

    #[error("{0}")]
    NoAttackBonus(String),

    #[error("{0}")]
    NoSpellDc(String),

    #[error("{0}")]
    InvalidSaveType(String),

    #[error("{0}")]
    NoCounterFound(String),

    #[error("{0}")]
    InvalidIntExpression(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("Error evaluating expression: {source} (in `{expression}`)")]
    Evaluation {
        expression: String,
        #[source]
        source: EvalError,
    },

    #[error("Dice error: {0}")]
    Dice(#[from] DiceError),

    #[error("{0}")]
    Counter(#[from] CounterError),

    #[error("{0}")]
    StopExecution(String),

    #[error("You do not have access to the {entity_type} {name}.")]
    RequiresLicense { name: String, entity_type: String },
}

impl AutomationError {
    /// Whether a parent list of effects narrates this error and carries on.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            AutomationError::StopExecution(_) | AutomationError::RequiresLicense { .. }
        )
    }

    pub(crate) fn automation(msg: impl Into<String>) -> Self {
        AutomationError::Automation(msg.into())
    }

    pub(crate) fn target(msg: impl Into<String>) -> Self {
        AutomationError::Target(msg.into())
    }

    pub(crate) fn evaluation(expression: &str, source: EvalError) -> Self {
        AutomationError::Evaluation {
            expression: expression.to_string(),
            source,
        }
    }
}

impl From<ArgError> for AutomationError {
    fn from(e: ArgError) -> Self {
        AutomationError::InvalidArgument(e.to_string())
    }
}

impl From<PassiveEffectError> for AutomationError {
    fn from(e: PassiveEffectError) -> Self {
        AutomationError::InvalidArgument(e.to_string())
    }
}

/// Python-style `repr` of a string, used in error messages.
pub(crate) fn quoted(s: &str) -> String {
    format!("'{s}'")
}
