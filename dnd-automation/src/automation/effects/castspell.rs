use super::{run_children, Effect, PreflightContext, SummaryContext};
use crate::automation::errors::AutomationError;
use crate::automation::results::{CastSpellResult, EffectResult};
use crate::automation::runtime::AutomationContext;
use crate::automation::utils::{trim_with_ellipsis, IntExpr};
use crate::automation::Automation;
use crate::gamedata::{Lookup, Spell};
use crate::initiative::EffectRef;
use crate::script::Value;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Cast another spell from the compendium, running its automation with the
/// given overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastSpell {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc: Option<IntExpr>,
    #[serde(rename = "attackBonus", default, skip_serializing_if = "Option::is_none")]
    pub attack_bonus: Option<IntExpr>,
    #[serde(rename = "castingMod", default, skip_serializing_if = "Option::is_none")]
    pub casting_mod: Option<IntExpr>,
    /// Variable holding an effect to parent the spell's concentration effects to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Effect>,
}

/// Cast-time state a nested spell replaces and must hand back.
struct SavedOverrides {
    ab: Option<i64>,
    dc: Option<i64>,
    casting_mod: Option<Value>,
    level: Option<i64>,
    spell_level: Option<Value>,
    conc_effect: Option<EffectRef>,
}

impl CastSpell {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            level: None,
            dc: None,
            attack_bonus: None,
            casting_mod: None,
            parent: None,
            meta: Vec::new(),
        }
    }

    pub fn at_level(mut self, level: i64) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_dc(mut self, dc: impl Into<IntExpr>) -> Self {
        self.dc = Some(dc.into());
        self
    }

    pub(super) async fn preflight(
        &self,
        pctx: &PreflightContext<'_>,
    ) -> Result<(), AutomationError> {
        let Some(spell) = pctx.compendium.lookup_spell(self.id) else {
            return Ok(());
        };
        pctx.require_access(Lookup::Spell(spell)).await?;
        if let Some(automation) = &spell.automation {
            let nested = PreflightContext { in_spell: true, ..*pctx };
            for effect in automation.effects() {
                effect.preflight(&nested).await?;
            }
        }
        Ok(())
    }

    pub(super) fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<CastSpellResult, AutomationError> {
        let compendium = ctx.compendium;
        let Some(spell) = compendium.lookup_spell(self.id) else {
            ctx.meta_queue(format!("**Error**: Spell {} not found.", self.id));
            return Ok(CastSpellResult::default());
        };
        let failed = CastSpellResult {
            spell_id: Some(self.id),
            spell_name: Some(spell.name.clone()),
            ..Default::default()
        };

        let cast_level = self.level.unwrap_or(spell.level as i64);
        if !(spell.level as i64..=9).contains(&cast_level) {
            ctx.meta_queue(format!(
                "**Error**: Unable to cast {} at level {cast_level} (invalid level).",
                spell.name
            ));
            return Ok(failed);
        }
        if ctx.is_spell() {
            ctx.meta_queue("**Error**: Unable to cast another spell inside a spell.");
            return Ok(failed);
        }

        debug!(spell = %spell.name, cast_level, "Casting spell");
        let mut result = CastSpellResult {
            success: true,
            level_override: self.level,
            ..failed
        };
        match spell.automation.as_ref().filter(|a| !a.is_empty()) {
            Some(automation) => {
                let children =
                    self.run_automation(ctx, spell, automation, cast_level, &mut result)?;
                result.children = children;
                if cast_level != spell.level as i64 {
                    if let Some(higher) = &spell.higherlevels {
                        let higher = trim_with_ellipsis(higher, ctx.config.field_max_len);
                        ctx.effect_queue(format!("**At Higher Levels**: {higher}"));
                    }
                }
            }
            None => {
                ctx.queue(trim_with_ellipsis(&spell.description, ctx.config.field_max_len));
                ctx.push_embed_field(&spell.name, false, false);
                if cast_level != spell.level as i64 {
                    if let Some(higher) = &spell.higherlevels {
                        ctx.queue(trim_with_ellipsis(higher, ctx.config.field_max_len));
                        ctx.push_embed_field("At Higher Levels", false, false);
                    }
                }
            }
        }
        Ok(result)
    }

    fn run_automation(
        &self,
        ctx: &mut AutomationContext<'_>,
        spell: &Spell,
        automation: &Automation,
        cast_level: i64,
        result: &mut CastSpellResult,
    ) -> Result<Vec<EffectResult>, AutomationError> {
        let saved = SavedOverrides {
            ab: ctx.ab_override,
            dc: ctx.dc_override,
            casting_mod: ctx.base_name("spell").cloned(),
            level: ctx.spell_level_override,
            spell_level: ctx.metavars.get("spell_level").cloned(),
            conc_effect: ctx.conc_effect,
        };
        let spell_level = ctx.spell_level_override.filter(|l| *l != 0).unwrap_or(cast_level);
        ctx.set_metavar("spell_level", spell_level);

        let out = self
            .apply_overrides(ctx, spell, result)
            .and_then(|()| run_children(automation.effects(), ctx));

        ctx.ab_override = saved.ab;
        ctx.dc_override = saved.dc;
        ctx.replace_base_name("spell", saved.casting_mod);
        ctx.spell_level_override = saved.level;
        ctx.conc_effect = saved.conc_effect;
        ctx.spell = None;
        match saved.spell_level {
            Some(value) => ctx.set_metavar("spell_level", value),
            None => {
                ctx.metavars.remove("spell_level");
            }
        }
        out
    }

    fn apply_overrides(
        &self,
        ctx: &mut AutomationContext<'_>,
        spell: &Spell,
        result: &mut CastSpellResult,
    ) -> Result<(), AutomationError> {
        ctx.conc_effect = match &self.parent {
            Some(var) => match ctx.metavars.get(var) {
                Some(Value::Effect(handle)) => Some(handle.effect),
                Some(other) => {
                    return Err(AutomationError::InvalidArgument(format!(
                        "Could not set IEffect parent: The variable `{var}` is not an IEffectMetaVar (got `{}`).",
                        other.type_name()
                    )))
                }
                None => None,
            },
            None => None,
        };

        if let Some(ab) = &self.attack_bonus {
            let ab = ctx.parse_intexpression(ab)?;
            ctx.ab_override = Some(ab);
            result.attack_bonus_override = Some(ab);
        }
        if let Some(dc) = &self.dc {
            let dc = ctx.parse_intexpression(dc)?;
            ctx.dc_override = Some(dc);
            result.dc_override = Some(dc);
        }
        if let Some(casting_mod) = &self.casting_mod {
            let casting_mod = ctx.parse_intexpression(casting_mod)?;
            ctx.replace_base_name("spell", Some(Value::Int(casting_mod)));
            result.casting_mod_override = Some(casting_mod);
        }
        if let Some(level) = self.level {
            ctx.spell_level_override = Some(level);
            ctx.set_metavar("spell_level", level);
        }
        ctx.spell = Some(spell.clone());
        Ok(())
    }

    pub(super) fn build_str(&self, sctx: &SummaryContext<'_>) -> String {
        match sctx.compendium.lookup_spell(self.id) {
            Some(spell) => match self.level.filter(|l| *l != spell.level as i64) {
                Some(level) => format!("casts {} at level {level}", spell.name),
                None => format!("casts {}", spell.name),
            },
            None => "casts an unknown spell".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::results::EffectResult;
    use crate::automation::RunOptions;
    use crate::gamedata::StaticEntitlements;
    use crate::testing::{automation, sample_goblin, sample_wizard, Harness};
    use serde_json::json;

    fn burning_hands() -> Spell {
        Spell::new(10, "Burning Hands", 1)
            .with_higher_levels("1d6 more per slot level.")
            .with_automation(automation(json!([{
                "type": "target", "target": "all",
                "effects": [{
                    "type": "save", "stat": "dex",
                    "fail": [{"type": "damage", "damage": "3d6[fire]"}],
                    "success": []
                }]
            }])))
    }

    fn cast_result(result: &crate::automation::AutomationResult, index: usize) -> &CastSpellResult {
        match &result.children[index] {
            EffectResult::CastSpell(c) => c,
            other => panic!("expected a cast, got {other:?}"),
        }
    }

    fn save_dc(result: &EffectResult) -> i64 {
        let mut pending = vec![result];
        while let Some(next) = pending.pop() {
            if let EffectResult::Save(save) = next {
                return save.dc;
            }
            pending.extend(next.children());
        }
        panic!("no save in {result:?}");
    }

    #[test]
    fn test_cast_with_overrides_then_restores() {
        let mut h = Harness::new(sample_wizard()).with_target(sample_goblin()).with_rolls(vec![2]);
        h.compendium.add_spell(burning_hands());
        let auto = automation(json!([
            {"type": "spell", "id": 10, "dc": 12, "level": 2},
            {"type": "target", "target": "all", "effects": [
                {"type": "save", "stat": "dex", "fail": [], "success": []}
            ]}
        ]));
        let result = h.run(&auto, "").unwrap();

        let cast = cast_result(&result, 0);
        assert!(cast.success);
        assert_eq!(cast.dc_override, Some(12));
        assert_eq!(cast.level_override, Some(2));
        assert_eq!(save_dc(&result.children[0]), 12);
        assert_eq!(save_dc(&result.children[1]), 14);
        assert!(!result.is_spell);
        assert_eq!(
            result.output.field("Effect").unwrap().value,
            "**At Higher Levels**: 1d6 more per slot level."
        );
    }

    #[test]
    fn test_casting_mod_override_is_visible_to_children() {
        let spell = Spell::new(11, "Guiding Bolt", 1).with_automation(automation(json!([
            {"type": "text", "text": "mod {spell}"}
        ])));
        let mut h = Harness::new(sample_wizard());
        h.compendium.add_spell(spell);
        let auto = automation(json!([
            {"type": "spell", "id": 11, "castingMod": 5},
            {"type": "text", "text": "after {spell}", "title": "After"}
        ]));
        let result = h.run(&auto, "").unwrap();
        assert_eq!(result.output.field("Effect").unwrap().value, "mod 5");
        assert_eq!(result.output.field("After").unwrap().value, "after 3");
    }

    #[test]
    fn test_cannot_cast_inside_a_spell() {
        let inner = Spell::new(2, "Mage Hand", 0).with_description("A spectral hand.");
        let outer = Spell::new(1, "Wish", 9)
            .with_automation(automation(json!([{"type": "spell", "id": 2}])));
        let mut h = Harness::new(sample_wizard());
        h.compendium.add_spell(inner);
        h.compendium.add_spell(outer.clone());

        let auto = automation(json!([{"type": "spell", "id": 2}]));
        let options = RunOptions::new("user").with_spell(outer);
        let result = h.run_with_options(&auto, "", options).unwrap();
        let cast = cast_result(&result, 0);
        assert!(!cast.success);
        assert_eq!(cast.spell_id, Some(2));
        assert!(result
            .output
            .field("Meta")
            .unwrap()
            .value
            .contains("**Error**: Unable to cast another spell inside a spell."));

        // casting the outer spell runs its automation, whose nested cast fails
        let auto = automation(json!([{"type": "spell", "id": 1}]));
        let result = h.run(&auto, "").unwrap();
        let EffectResult::CastSpell(nested) = &cast_result(&result, 0).children[0] else {
            panic!("expected the nested cast");
        };
        assert!(!nested.success);
    }

    #[test]
    fn test_missing_spell_and_invalid_level() {
        let mut h = Harness::new(sample_wizard());
        h.compendium.add_spell(burning_hands());

        let result = h.run(&automation(json!([{"type": "spell", "id": 99}])), "").unwrap();
        assert!(!cast_result(&result, 0).success);
        assert!(result
            .output
            .field("Meta")
            .unwrap()
            .value
            .contains("**Error**: Spell 99 not found."));

        let below_spell_level = automation(json!([{"type": "spell", "id": 10, "level": 0}]));
        let result = h.run(&below_spell_level, "").unwrap();
        assert_eq!(cast_result(&result, 0).spell_id, Some(10));
        assert!(result
            .output
            .field("Meta")
            .unwrap()
            .value
            .contains("Unable to cast Burning Hands at level 0 (invalid level)."));
    }

    #[test]
    fn test_spell_without_automation_shows_description() {
        let spell = Spell::new(3, "Light", 0)
            .with_description("The object sheds bright light.")
            .with_higher_levels("Nothing more.");
        let mut h = Harness::new(sample_wizard());
        h.compendium.add_spell(spell);
        let cast = automation(json!([{"type": "spell", "id": 3, "level": 1}]));
        let result = h.run(&cast, "").unwrap();
        assert!(cast_result(&result, 0).success);
        assert_eq!(result.output.field("Light").unwrap().value, "The object sheds bright light.");
        assert_eq!(result.output.field("At Higher Levels").unwrap().value, "Nothing more.");
    }

    #[test]
    fn test_build_str() {
        let mut h = Harness::new(sample_wizard());
        h.compendium.add_spell(burning_hands());
        let auto = automation(json!([{"type": "spell", "id": 10, "level": 3}]));
        assert_eq!(auto.build_str(h.caster(), &h.compendium), "Casts Burning Hands at level 3.");
        let auto = automation(json!([{"type": "spell", "id": 10, "level": 1}]));
        assert_eq!(auto.build_str(h.caster(), &h.compendium), "Casts Burning Hands.");
        let auto = automation(json!([{"type": "spell", "id": 404}]));
        assert_eq!(auto.build_str(h.caster(), &h.compendium), "Casts an unknown spell.");
    }

    #[tokio::test]
    async fn test_preflight_checks_spell_license() {
        let mut h = Harness::new(sample_wizard());
        h.compendium
            .add_spell(burning_hands().with_sourced(crate::gamedata::Sourced::licensed("PHB", 10)));
        let cast = CastSpell::new(10);

        let none = StaticEntitlements::new();
        let pctx = PreflightContext::new(&h.compendium, &none, "user");
        assert!(matches!(
            cast.preflight(&pctx).await,
            Err(AutomationError::RequiresLicense { .. })
        ));

        let owned = StaticEntitlements::new().grant("user", "spell", 10);
        let pctx = PreflightContext::new(&h.compendium, &owned, "user");
        assert!(cast.preflight(&pctx).await.is_ok());
    }
}
