use super::Effect;
use crate::automation::errors::AutomationError;
use crate::automation::results::TempHpResult;
use crate::automation::runtime::AutomationContext;
use crate::automation::utils::{upcast_scaled_dice, HigherLevels};
use crate::dice::DiceExpression;
use crate::script::{AnnotatedString, Names, Value};
use serde::{Deserialize, Serialize};

/// Set the current target's temporary hit points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempHp {
    pub amount: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub higher: Option<HigherLevels>,
    #[serde(rename = "cantripScale", default, skip_serializing_if = "Option::is_none")]
    pub cantrip_scale: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Effect>,
}

impl TempHp {
    pub fn new(amount: impl Into<String>) -> Self {
        Self {
            amount: amount.into(),
            higher: None,
            cantrip_scale: None,
            meta: Vec::new(),
        }
    }

    pub(super) fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<Option<TempHpResult>, AutomationError> {
        if ctx.target.is_none() {
            return Err(AutomationError::target(
                "Tried to add temp HP without a target! Make sure all TempHP effects are inside of a Target effect.",
            ));
        }
        let max_arg = ctx.args.last_bool("max", true);

        let is_meta = AnnotatedString::new(self.amount.as_str())
            .single_reference()
            .is_some_and(|name| ctx.metavars.contains_key(name));
        if ctx.target_is_simple() && is_meta {
            return Ok(None);
        }

        let amount = ctx.parse_annostr(&self.amount)?;
        let dice = DiceExpression::parse(&amount)?;
        let mut dice = upcast_scaled_dice(
            ctx,
            dice,
            self.cantrip_scale.unwrap_or(false),
            self.higher.as_ref(),
        )?;
        if max_arg {
            dice.maximize();
        }

        let roll = ctx.roll(&dice)?;
        let thp = roll.total.max(0);
        ctx.queue(format!("**THP**: {}", roll.result()));
        ctx.set_metavar("lastTempHp", thp);

        if let Some(id) = ctx.target.as_ref().and_then(|t| t.creature_id()) {
            if let Some(creature) = ctx.encounter.get_mut(id) {
                creature.set_temp_hp(thp);
                let line = format!("{}: {}", creature.name, creature.hp_str(false));
                ctx.footer_queue(line);
            }
        }

        Ok(Some(TempHpResult {
            amount: thp,
            amount_roll: Some(roll),
        }))
    }

    pub(super) fn build_str(&self, names: &mut Names) -> String {
        let amount = match AnnotatedString::new(self.amount.as_str()).transformed(names) {
            Ok(amount) => {
                names.insert("lastTempHp".into(), Value::str(amount.clone()));
                amount
            }
            Err(_) => {
                names.insert("lastTempHp".into(), Value::Int(0));
                self.amount.clone()
            }
        };
        format!("{amount} temp HP")
    }
}
