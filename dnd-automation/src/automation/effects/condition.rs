use super::{build_child_str, run_children, Effect, SummaryContext};
use crate::automation::errors::AutomationError;
use crate::automation::results::ConditionResult;
use crate::automation::runtime::AutomationContext;
use crate::script::Names;
use serde::{Deserialize, Serialize};

/// What a [`Condition`] runs when its expression cannot be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorBehaviour {
    True,
    #[default]
    False,
    Both,
    Neither,
    Raise,
}

/// Branch on a script expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub condition: String,
    #[serde(rename = "onTrue")]
    pub on_true: Vec<Effect>,
    #[serde(rename = "onFalse")]
    pub on_false: Vec<Effect>,
    #[serde(rename = "errorBehaviour", default)]
    pub error_behaviour: ErrorBehaviour,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Effect>,
}

impl Condition {
    pub fn new(condition: impl Into<String>, on_true: Vec<Effect>, on_false: Vec<Effect>) -> Self {
        Self {
            condition: condition.into(),
            on_true,
            on_false,
            error_behaviour: ErrorBehaviour::default(),
            meta: Vec::new(),
        }
    }

    pub fn with_error_behaviour(mut self, behaviour: ErrorBehaviour) -> Self {
        self.error_behaviour = behaviour;
        self
    }

    pub(super) fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<ConditionResult, AutomationError> {
        let mut did_error = false;
        let (do_true, do_false) = match ctx.parse_expression(&self.condition) {
            Ok(value) => (value.truthy(), !value.truthy()),
            Err(e) => {
                did_error = true;
                match self.error_behaviour {
                    ErrorBehaviour::True => (true, false),
                    ErrorBehaviour::False => (false, true),
                    ErrorBehaviour::Both => (true, true),
                    ErrorBehaviour::Neither => (false, false),
                    ErrorBehaviour::Raise => {
                        return Err(AutomationError::StopExecution(format!(
                            "Error when evaluating condition `{}`:\n{e}",
                            self.condition
                        )))
                    }
                }
            }
        };

        let mut children = Vec::new();
        if do_true {
            children.extend(run_children(&self.on_true, ctx)?);
        }
        if do_false {
            children.extend(run_children(&self.on_false, ctx)?);
        }

        Ok(ConditionResult {
            did_true: do_true,
            did_false: do_false,
            did_error,
            children,
        })
    }

    pub(super) fn build_str(&self, sctx: &SummaryContext<'_>, names: &mut Names) -> String {
        let on_true = build_child_str(&self.on_true, sctx, names);
        let on_false = build_child_str(&self.on_false, sctx, names);
        match (on_true.is_empty(), on_false.is_empty()) {
            (true, true) => String::new(),
            (false, true) => format!("maybe {on_true}"),
            (true, false) => format!("maybe {on_false}"),
            _ if on_true == on_false => on_true,
            _ => format!("{on_true} or {on_false}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::results::EffectResult;
    use crate::testing::{automation, sample_wizard, Harness};
    use serde_json::json;

    fn branch(condition: &str, behaviour: &str) -> crate::automation::Automation {
        automation(json!([{
            "type": "condition",
            "condition": condition,
            "errorBehaviour": behaviour,
            "onTrue": [{"type": "text", "text": "yes"}],
            "onFalse": [{"type": "text", "text": "no"}]
        }]))
    }

    fn condition_result(result: &crate::automation::AutomationResult) -> &ConditionResult {
        match &result.children[0] {
            EffectResult::Condition(c) => c,
            other => panic!("expected a condition, got {other:?}"),
        }
    }

    #[test]
    fn test_branches_on_value() {
        let mut h = Harness::new(sample_wizard());
        let result = h.run(&branch("level >= 5", "false"), "").unwrap();
        let cond = condition_result(&result);
        assert!(cond.did_true && !cond.did_false);
        assert_eq!(result.output.field("Effect").unwrap().value, "yes");

        let result = h.run(&branch("level > 10", "false"), "").unwrap();
        assert!(condition_result(&result).did_false);
    }

    #[test]
    fn test_error_behaviours() {
        let mut h = Harness::new(sample_wizard());
        let result = h.run(&branch("nope", "both"), "").unwrap();
        let cond = condition_result(&result);
        assert!(cond.did_error && cond.did_true && cond.did_false);
        assert_eq!(cond.children.len(), 2);

        let result = h.run(&branch("nope", "neither"), "").unwrap();
        assert!(condition_result(&result).children.is_empty());

        let err = h.run(&branch("nope", "raise"), "").unwrap_err();
        assert!(matches!(err, AutomationError::StopExecution(_)));
    }

    #[test]
    fn test_build_str() {
        let h = Harness::new(sample_wizard());
        let auto = automation(json!([{
            "type": "target", "target": "each",
            "effects": [{
                "type": "condition", "condition": "True",
                "onTrue": [{"type": "damage", "damage": "1d6"}],
                "onFalse": [{"type": "damage", "damage": "1d8"}]
            }]
        }]));
        assert_eq!(auto.build_str(h.caster(), &h.compendium), "1d6 damage or 1d8 damage.");

        let auto = automation(json!([{
            "type": "target", "target": "each",
            "effects": [{
                "type": "condition", "condition": "True",
                "onTrue": [{"type": "damage", "damage": "1d6"}],
                "onFalse": []
            }]
        }]));
        assert_eq!(auto.build_str(h.caster(), &h.compendium), "Maybe 1d6 damage.");
    }
}
