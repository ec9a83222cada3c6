use super::{is_false, Effect};
use crate::automation::errors::AutomationError;
use crate::automation::results::RollEffectResult;
use crate::automation::runtime::AutomationContext;
use crate::automation::utils::{title, transformed_or_raw, upcast_scaled_dice, HigherLevels};
use crate::dice::DiceExpression;
use crate::script::{Names, RollMetaVar, Value};
use serde::{Deserialize, Serialize};

/// Roll dice and bind the result to a variable for later nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roll {
    pub dice: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub higher: Option<HigherLevels>,
    #[serde(rename = "cantripScale", default, skip_serializing_if = "Option::is_none")]
    pub cantrip_scale: Option<bool>,
    /// Roll silently, ignoring `-d`, `-mi` and `-max`.
    #[serde(default, skip_serializing_if = "is_false")]
    pub hidden: bool,
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Ignore `-d` and effect damage bonuses.
    #[serde(rename = "fixedValue", default, skip_serializing_if = "is_false")]
    pub fixed_value: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Effect>,
}

impl Roll {
    pub fn new(dice: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            dice: dice.into(),
            name: name.into(),
            higher: None,
            cantrip_scale: None,
            hidden: false,
            display_name: None,
            fixed_value: false,
            meta: Vec::new(),
        }
    }

    pub(super) fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<RollEffectResult, AutomationError> {
        let mut d_args = ctx.args.get("d", true);
        let max_arg = ctx.args.last_bool("max", true);
        let mi_arg = ctx.args.last_parsed::<i64>("mi", false)?;
        d_args.extend(ctx.caster_effects().into_iter().filter_map(|e| e.damage_bonus.clone()));

        let dice = DiceExpression::parse(&ctx.parse_annostr(&self.dice)?)?;
        let mut dice = upcast_scaled_dice(
            ctx,
            dice,
            self.cantrip_scale.unwrap_or(false),
            self.higher.as_ref(),
        )?;

        if !self.hidden {
            if let Some(mi) = mi_arg.filter(|mi| *mi != 0) {
                dice.set_minimum(mi);
            }
            if !self.fixed_value && !d_args.is_empty() {
                dice.append(DiceExpression::parse(&d_args.join("+"))?);
            }
            if max_arg {
                dice.maximize();
            }
        }

        let roll = ctx.roll(&dice)?;
        if !self.hidden {
            let label = self.display_name.clone().unwrap_or_else(|| title(&self.name));
            ctx.meta_queue(format!("**{label}**: {}", roll.result()));
        }

        let simplified = roll.simplified();
        ctx.set_metavar(
            &self.name,
            Value::Roll(RollMetaVar {
                text: simplified.expr.plain(),
                total: roll.total,
            }),
        );
        ctx.set_metavar("lastRoll", roll.total);

        Ok(RollEffectResult {
            result: roll.total,
            roll,
            simplified,
            hidden: self.hidden,
        })
    }

    pub(super) fn build_str(&self, names: &mut Names) -> String {
        let dice = transformed_or_raw(names, &self.dice);
        names.insert(self.name.clone(), Value::Str(dice));
        names.insert("lastRoll".into(), Value::Int(0));
        String::new()
    }
}
