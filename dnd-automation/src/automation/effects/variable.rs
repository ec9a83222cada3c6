use super::Effect;
use crate::automation::errors::AutomationError;
use crate::automation::results::SetVariableResult;
use crate::automation::runtime::AutomationContext;
use crate::automation::utils::HigherLevels;
use crate::script::{self, Names, Value};
use serde::{Deserialize, Serialize};

/// Evaluate an expression and bind it, as an integer, to a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetVariable {
    pub name: String,
    pub value: String,
    /// Replacement expressions keyed by cast level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub higher: Option<HigherLevels>,
    #[serde(rename = "onError", default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Effect>,
}

impl SetVariable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            higher: None,
            on_error: None,
            meta: Vec::new(),
        }
    }

    pub fn with_on_error(mut self, on_error: impl Into<String>) -> Self {
        self.on_error = Some(on_error.into());
        self
    }

    pub(super) fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<SetVariableResult, AutomationError> {
        let level_value = self.level_value(ctx)?;

        let (value, did_error) = match ctx.parse_expression(&level_value) {
            Ok(value) => (value, false),
            Err(e) => match &self.on_error {
                Some(on_error) => (ctx.parse_expression(on_error)?, true),
                None => {
                    return Err(AutomationError::StopExecution(format!(
                        "Error in SetVariable (`{} = {level_value}`):\n{e}",
                        self.name
                    )))
                }
            },
        };

        let final_value = value.to_int().map_err(|_| {
            AutomationError::automation(format!(
                "{value} cannot be interpreted as an integer (in `{} = {level_value}`).",
                self.name
            ))
        })?;
        ctx.set_metavar(&self.name, final_value);

        Ok(SetVariableResult { value, did_error })
    }

    /// The expression for the current cast level.
    fn level_value(&self, ctx: &mut AutomationContext<'_>) -> Result<String, AutomationError> {
        let spell_level = ctx.spell().map(|s| i64::from(s.level));
        let (Some(higher), Some(spell_level)) = (&self.higher, spell_level) else {
            return Ok(self.value.clone());
        };
        let cast_level = ctx.get_cast_level()?;
        if cast_level == spell_level {
            return Ok(self.value.clone());
        }
        Ok(higher
            .get(&cast_level.to_string())
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| self.value.clone()))
    }

    pub(super) fn build_str(&self, names: &mut Names) -> String {
        let value = script::evaluate(&self.value, names)
            .or_else(|e| match &self.on_error {
                Some(on_error) => script::evaluate(on_error, names),
                None => Err(e),
            })
            .unwrap_or_else(|_| Value::str(self.value.clone()));
        let bound = value.to_int().map(Value::Int).unwrap_or(value);
        names.insert(self.name.clone(), bound);
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::results::EffectResult;
    use crate::gamedata::Spell;
    use crate::automation::RunOptions;
    use crate::testing::{automation, sample_wizard, Harness};
    use serde_json::json;

    #[test]
    fn test_binds_integer() {
        let auto = automation(json!([
            {"type": "variable", "name": "bonus", "value": "proficiencyBonus + 1"},
            {"type": "text", "text": "{bonus}"}
        ]));
        let mut h = Harness::new(sample_wizard());
        let result = h.run(&auto, "").unwrap();
        assert_eq!(result.output.field("Effect").unwrap().value, "4");
    }

    #[test]
    fn test_on_error_fallback_and_stop() {
        let auto = automation(json!([
            {"type": "variable", "name": "x", "value": "missing + 1", "onError": "5"}
        ]));
        let mut h = Harness::new(sample_wizard());
        let result = h.run(&auto, "").unwrap();
        let EffectResult::SetVariable(set) = &result.children[0] else {
            panic!("expected a variable result");
        };
        assert!(set.did_error);
        assert_eq!(set.value, Value::Int(5));

        let auto = automation(json!([
            {"type": "variable", "name": "x", "value": "missing + 1"},
            {"type": "text", "text": "never"}
        ]));
        let mut h = Harness::new(sample_wizard());
        let err = h.run(&auto, "").unwrap_err();
        assert!(matches!(err, AutomationError::StopExecution(_)));
    }

    #[test]
    fn test_non_integer_is_an_error() {
        let auto = automation(json!([{"type": "variable", "name": "x", "value": "'abc'"}]));
        let mut h = Harness::new(sample_wizard());
        let err = h.run(&auto, "").unwrap_err();
        assert!(err.to_string().starts_with("abc cannot be interpreted as an integer"));
    }

    #[test]
    fn test_higher_level_value() {
        let auto = automation(json!([
            {"type": "variable", "name": "darts", "value": "3", "higher": {"2": "4", "3": "5"}},
            {"type": "text", "text": "{darts} darts"}
        ]));
        let mut h = Harness::new(sample_wizard());
        let options = RunOptions::new("user").with_spell(Spell::new(1, "Magic Missile", 1));
        let result = h.run_with_options(&auto, "-l 3", options).unwrap();
        assert_eq!(result.output.field("Effect").unwrap().value, "5 darts");
    }

    #[test]
    fn test_build_str_binds_value() {
        let mut names = Names::new();
        names.insert("proficiencyBonus".into(), Value::Int(3));
        assert_eq!(SetVariable::new("x", "proficiencyBonus * 2").build_str(&mut names), "");
        assert_eq!(names.get("x"), Some(&Value::Int(6)));
        SetVariable::new("y", "nope").build_str(&mut names);
        assert_eq!(names.get("y"), Some(&Value::str("nope")));
    }
}
