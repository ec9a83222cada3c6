//! The automation engine.
//!
//! An [`Automation`] is a list of [`Effect`] nodes, usually deserialized from
//! stored spell or action data. Running one walks the tree depth first
//! against an [`AutomationContext`], mutating the encounter as a side effect
//! and returning an [`AutomationResult`] tree plus rendered output.
//!
//! ```ignore
//! let mut ctx = AutomationContext::new(
//!     &mut encounter, &compendium, &mut dice, &config,
//!     caster, targets, ArgBag::parse("-d 2"), RunOptions::new("user"),
//! )?;
//! let result = automation.run(&mut ctx, &entitlements).await?;
//! println!("{}", result.output.to_text());
//! ```

pub mod effects;
pub mod errors;
pub mod results;
pub mod runtime;
pub mod utils;

pub use effects::{Effect, PreflightContext};
pub use errors::AutomationError;
pub use results::{AutomationResult, EffectResult};
pub use runtime::{AutomationContext, AutomationOutput, AutomationTarget, EmbedField, RunOptions};

use crate::gamedata::{Compendium, EntitlementProvider};
use crate::initiative::EffectRef;
use crate::world::{CreatureId, Encounter};
use effects::{build_child_str, SummaryContext};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// A tree of effects, stored as its root list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Automation {
    effects: Vec<Effect>,
}

impl Automation {
    pub fn new(effects: Vec<Effect>) -> Self {
        Self { effects }
    }

    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Check entitlements for every spell and entity the tree references.
    /// Runs to completion before anything is executed so a denied license
    /// never leaves partial side effects.
    pub async fn preflight(&self, pctx: &PreflightContext<'_>) -> Result<(), AutomationError> {
        for effect in &self.effects {
            effect.preflight(pctx).await?;
        }
        Ok(())
    }

    /// Preflight, then execute.
    pub async fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
        entitlements: &dyn EntitlementProvider,
    ) -> Result<AutomationResult, AutomationError> {
        let pctx = PreflightContext::new(ctx.compendium, entitlements, &ctx.user_id);
        self.preflight(&pctx).await?;
        self.execute(ctx)
    }

    /// Walk the tree without a preflight pass. Errors from top-level effects
    /// end the run; whatever they already changed stays changed.
    pub fn execute(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<AutomationResult, AutomationError> {
        info!(
            caster = %ctx.caster().name,
            targets = ctx.targets.len(),
            effects = self.effects.len(),
            "Running automation"
        );

        let mut children = Vec::with_capacity(self.effects.len());
        for effect in &self.effects {
            if let Some(result) = effect.run(ctx)? {
                children.push(result);
            }
        }

        let result = AutomationResult {
            children,
            is_spell: ctx.is_spell(),
            caster_needs_commit: ctx.caster_needs_commit,
            output: ctx.build_output(),
        };
        info!(
            damage = result.get_damage(),
            caster_needs_commit = result.caster_needs_commit,
            "Automation finished"
        );
        Ok(result)
    }

    /// One-line human summary, e.g. `Attack: +6 to hit. Hit: 1d10[fire] damage.`
    pub fn build_str(
        &self,
        caster: &crate::world::Creature,
        compendium: &dyn Compendium,
    ) -> String {
        if self.effects.is_empty() {
            return "No effects.".to_string();
        }
        let mut names = caster.names();
        names.insert("caster".into(), caster.to_value());
        let sctx = SummaryContext { caster, compendium };
        let mut inner = build_child_str(&self.effects, &sctx, &mut names);
        if inner.is_empty() {
            inner = self.effects.iter().map(Effect::type_name).collect::<Vec<_>>().join(", ");
        }
        let mut chars = inner.chars();
        match chars.next() {
            Some(first) => format!("{}{}.", first.to_uppercase(), chars.as_str()),
            None => String::new(),
        }
    }
}

impl fmt::Display for Automation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Automation ({} effects)", self.effects.len())
    }
}

/// Automation attached to an initiative effect, ready to run for the
/// creature holding the effect.
#[derive(Debug, Clone)]
pub struct InteractionRun {
    pub caster: CreatureId,
    pub automation: Automation,
    pub options: RunOptions,
}

impl InteractionRun {
    /// The button labelled `label` on `effect`. The run binds the effect as
    /// `ieffect` and ignores every creature's active effects.
    pub fn button(
        encounter: &Encounter,
        effect: EffectRef,
        label: &str,
        user_id: &str,
    ) -> Result<Self, AutomationError> {
        let ieffect = encounter
            .get_effect(effect)
            .ok_or_else(|| AutomationError::automation("The triggering effect no longer exists."))?;
        let button = ieffect
            .buttons
            .iter()
            .find(|b| b.label == label)
            .ok_or_else(|| {
                AutomationError::automation(format!(
                    "{} has no button labelled {label}.",
                    ieffect.name
                ))
            })?;

        let mut options = RunOptions::new(user_id)
            .from_ieffect_button(effect)
            .with_ieffects_allowed(false, false);
        options.ab_override = button.override_default_attack_bonus;
        options.dc_override = button.override_default_dc;
        options.spell_override = button.override_default_casting_mod;
        Ok(Self {
            caster: effect.combatant_id,
            automation: button.automation.clone(),
            options,
        })
    }

    /// The attack named `name` granted by `effect`.
    pub fn attack(
        encounter: &Encounter,
        effect: EffectRef,
        name: &str,
        user_id: &str,
    ) -> Result<Self, AutomationError> {
        let ieffect = encounter
            .get_effect(effect)
            .ok_or_else(|| AutomationError::automation("The granting effect no longer exists."))?;
        let interaction = ieffect
            .attacks
            .iter()
            .find(|a| a.attack.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                AutomationError::automation(format!(
                    "{} grants no attack named {name}.",
                    ieffect.name
                ))
            })?;

        let mut options = RunOptions::new(user_id);
        options.ieffect = Some(effect);
        options.ab_override = interaction.override_default_attack_bonus;
        options.dc_override = interaction.override_default_dc;
        options.spell_override = interaction.override_default_casting_mod;
        Ok(Self {
            caster: effect.combatant_id,
            automation: interaction.attack.automation.clone(),
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gamedata::{Spell, Sourced, StaticEntitlements};
    use crate::initiative::{ButtonInteraction, InitiativeEffect, PassiveEffects};
    use crate::testing::{automation, sample_goblin, sample_wizard, Harness};
    use serde_json::json;

    #[test]
    fn test_build_str_fallbacks() {
        let h = Harness::new(sample_wizard());
        assert_eq!(Automation::default().build_str(h.caster(), &h.compendium), "No effects.");
        let auto = automation(json!([{"type": "text", "text": "hello"}]));
        assert_eq!(auto.build_str(h.caster(), &h.compendium), "Text.");
    }

    #[test]
    fn test_build_str_attack() {
        let h = Harness::new(sample_wizard());
        let auto = automation(json!([{
            "type": "target", "target": "each",
            "effects": [{
                "type": "attack",
                "hit": [{"type": "damage", "damage": "1d10[fire]"}],
                "miss": []
            }]
        }]));
        assert_eq!(
            auto.build_str(h.caster(), &h.compendium),
            "Attack: +6 to hit. Hit: 1d10[fire] damage."
        );
    }

    #[test]
    fn test_top_level_errors_propagate_after_side_effects() {
        let auto = automation(json!([
            {"type": "target", "target": "all", "effects": [{"type": "damage", "damage": "3"}]},
            {"type": "condition", "condition": "nope", "errorBehaviour": "raise", "onTrue": [], "onFalse": []}
        ]));
        let mut h = Harness::new(sample_wizard()).with_target(sample_goblin());
        let err = h.run(&auto, "").unwrap_err();
        assert!(matches!(err, AutomationError::StopExecution(_)));
        assert_eq!(h.target(0).current_hp(), Some(4));
    }

    #[tokio::test]
    async fn test_run_preflights_before_any_mutation() {
        let spell = Spell::new(7, "Toll the Dead", 0).with_sourced(Sourced::licensed("XGtE", 7));
        let auto = automation(json!([
            {"type": "target", "target": "all", "effects": [{"type": "damage", "damage": "3"}]},
            {"type": "spell", "id": 7}
        ]));
        let mut h = Harness::new(sample_wizard()).with_target(sample_goblin());
        h.compendium.add_spell(spell);

        let err = h.run_checked(&auto, "", &StaticEntitlements::new()).await.unwrap_err();
        assert!(matches!(err, AutomationError::RequiresLicense { .. }));
        assert_eq!(h.target(0).current_hp(), Some(7));

        let owned = StaticEntitlements::new().grant("user", "spell", 7);
        let result = h.run_checked(&auto, "", &owned).await.unwrap();
        assert_eq!(result.get_damage(), 3);
    }

    #[test]
    fn test_button_run_binds_effect_and_overrides() {
        let mut h = Harness::new(sample_wizard().in_combat());
        let caster = h.caster;
        let button = ButtonInteraction {
            label: "Burn".into(),
            automation: automation(json!([{"type": "text", "text": "DC {spell_dc}, {ieffect.name}"}])),
            verb: None,
            style: None,
            override_default_dc: Some(17),
            override_default_attack_bonus: None,
            override_default_casting_mod: None,
        };
        let effect = InitiativeEffect::new(caster, "Heat Metal", PassiveEffects::default())
            .with_button(button);
        let effect_ref = effect.reference();
        h.encounter.add_effect(effect);

        let run = InteractionRun::button(&h.encounter, effect_ref, "Burn", "user").unwrap();
        assert_eq!(run.caster, caster);
        assert!(run.options.from_button);
        assert!(!run.options.allow_caster_ieffects);
        let result = h.run_with_options(&run.automation, "", run.options).unwrap();
        assert_eq!(result.output.field("Effect").unwrap().value, "DC 17, Heat Metal");

        assert!(InteractionRun::button(&h.encounter, effect_ref, "Freeze", "user").is_err());
    }
}
