//! Helpers shared by the effect executors.

use super::errors::AutomationError;
use super::runtime::AutomationContext;
use crate::dice::DiceExpression;
use crate::script::{AnnotatedString, Names, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A number or an expression evaluating to one, e.g. `3` or `"proficiencyBonus + 1"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntExpr {
    Int(i64),
    Expr(String),
}

impl IntExpr {
    pub fn source(&self) -> String {
        match self {
            IntExpr::Int(i) => i.to_string(),
            IntExpr::Expr(s) => s.clone(),
        }
    }
}

impl fmt::Display for IntExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source())
    }
}

impl From<i64> for IntExpr {
    fn from(i: i64) -> Self {
        IntExpr::Int(i)
    }
}

impl From<&str> for IntExpr {
    fn from(s: &str) -> Self {
        IntExpr::Expr(s.to_string())
    }
}

/// Per-level addends keyed by spell level, e.g. `{"3": "1d6"}`.
pub type HigherLevels = BTreeMap<String, String>;

/// Damage dice for the cantrip tier of a caster level.
pub fn cantrip_dice(caster_level: i64) -> u32 {
    match caster_level {
        l if l < 5 => 1,
        l if l < 11 => 2,
        l if l < 17 => 3,
        _ => 4,
    }
}

/// Apply cantrip scaling and the per-level `higher` addend.
pub fn upcast_scaled_dice(
    ctx: &mut AutomationContext<'_>,
    mut dice: DiceExpression,
    cantrip_scale: bool,
    higher: Option<&HigherLevels>,
) -> Result<DiceExpression, AutomationError> {
    if ctx.is_spell() && cantrip_scale {
        dice.set_dice_count(cantrip_dice(ctx.caster().spellbook.caster_level));
    }
    if let Some(higher) = higher {
        let level = ctx.get_cast_level()?;
        if let Some(extra) = higher.get(&level.to_string()).filter(|s| !s.trim().is_empty()) {
            dice.append(DiceExpression::parse(extra)?);
        }
    }
    Ok(dice)
}

/// Evaluate an int expression for a summary string, `NaN` when it cannot be.
pub fn stringify_intexpr(names: &Names, expr: &str) -> Option<i64> {
    if let Ok(i) = expr.trim().parse::<i64>() {
        return Some(i);
    }
    let stripped = expr.trim_matches(|c| c == '{' || c == '}');
    crate::script::evaluate(stripped, names)
        .ok()
        .and_then(|v| v.to_int().ok())
}

/// Like [`stringify_intexpr`], formatted.
pub fn intexpr_str(value: Option<i64>, signed: bool) -> String {
    match (value, signed) {
        (Some(v), true) => format!("{v:+}"),
        (Some(v), false) => v.to_string(),
        (None, _) => "NaN".to_string(),
    }
}

/// Interpolate a string for summaries, falling back to the raw text.
pub fn transformed_or_raw(names: &Names, text: &str) -> String {
    AnnotatedString::new(text)
        .transformed(names)
        .unwrap_or_else(|_| text.to_string())
}

/// `+2` and `-1` modify `base`; anything else replaces it.
pub fn maybe_mod(value: &str, base: Option<i64>) -> Result<i64, AutomationError> {
    let trimmed = value.trim();
    let invalid = || AutomationError::InvalidArgument(format!("{trimmed} is not a valid number."));
    let parsed = trimmed.parse::<i64>().map_err(|_| invalid())?;
    if trimmed.starts_with('+') || trimmed.starts_with('-') {
        base.unwrap_or(0).checked_add(parsed).ok_or_else(invalid)
    } else {
        Ok(parsed)
    }
}

/// `a, b or c`
pub fn natural_join<S: AsRef<str>>(items: &[S], conj: &str) -> String {
    match items {
        [] => String::new(),
        [one] => one.as_ref().to_string(),
        [init @ .., last] => {
            let head: Vec<&str> = init.iter().map(AsRef::as_ref).collect();
            format!("{} {conj} {}", head.join(", "), last.as_ref())
        }
    }
}

/// Cut `text` to `max` characters, adding `...` when cut.
pub fn trim_with_ellipsis(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

/// Split text into chunks of at most `size` characters, preferring line breaks.
pub fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split('\n') {
        let mut line = line.to_string();
        while line.chars().count() > size {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let head: String = line.chars().take(size).collect();
            line = line.chars().skip(size).collect();
            chunks.push(head);
        }
        let needed = if current.is_empty() { 0 } else { 1 } + line.chars().count();
        if current.chars().count() + needed > size {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(&line);
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Python `title()` of a name such as a roll's label.
pub fn title(s: &str) -> String {
    crate::script::title_case(s)
}

/// Whether a value counts as an effect handle for parenting.
pub fn effect_of(value: &Value) -> Option<crate::initiative::EffectRef> {
    match value {
        Value::Effect(handle) => Some(handle.effect),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cantrip_tiers() {
        assert_eq!(cantrip_dice(1), 1);
        assert_eq!(cantrip_dice(5), 2);
        assert_eq!(cantrip_dice(11), 3);
        assert_eq!(cantrip_dice(20), 4);
    }

    #[test]
    fn test_maybe_mod() {
        assert_eq!(maybe_mod("+2", Some(10)).unwrap(), 12);
        assert_eq!(maybe_mod("-1", Some(10)).unwrap(), 9);
        assert_eq!(maybe_mod("15", Some(10)).unwrap(), 15);
        assert_eq!(maybe_mod("+3", None).unwrap(), 3);
        assert!(maybe_mod("abc", None).is_err());
        assert!(maybe_mod("+9223372036854775807", Some(14)).is_err());
    }

    #[test]
    fn test_natural_join() {
        assert_eq!(natural_join::<&str>(&[], "or"), "");
        assert_eq!(natural_join(&["Stealth"], "or"), "Stealth");
        assert_eq!(natural_join(&["Athletics", "Acrobatics"], "or"), "Athletics or Acrobatics");
        assert_eq!(natural_join(&["a", "b", "c"], "and"), "a, b and c");
    }

    #[test]
    fn test_stringify_intexpr() {
        let mut names = Names::new();
        names.insert("proficiencyBonus".into(), Value::Int(3));
        assert_eq!(stringify_intexpr(&names, "5"), Some(5));
        assert_eq!(stringify_intexpr(&names, "{proficiencyBonus + 1}"), Some(4));
        assert_eq!(stringify_intexpr(&names, "nope"), None);
        assert_eq!(intexpr_str(None, true), "NaN");
        assert_eq!(intexpr_str(Some(5), true), "+5");
    }

    #[test]
    fn test_trim_and_chunk() {
        assert_eq!(trim_with_ellipsis("abcdef", 3), "abc...");
        assert_eq!(trim_with_ellipsis("abc", 3), "abc");

        let chunks = chunk_text("aaaa\nbbbb\ncccc", 9);
        assert_eq!(chunks, vec!["aaaa\nbbbb", "cccc"]);
        let chunks = chunk_text("abcdefghij", 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_intexpr_serde() {
        let parsed: IntExpr = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, IntExpr::Int(3));
        let parsed: IntExpr = serde_json::from_str("\"level + 1\"").unwrap();
        assert_eq!(parsed, IntExpr::Expr("level + 1".into()));
    }
}
