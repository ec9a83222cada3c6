//! Testing utilities for automation.
//!
//! This module provides tools for deterministic tests:
//! - `ScriptedDice` so every roll is known in advance
//! - Sample creatures with round numbers
//! - `Harness`, which owns an encounter and compendium and runs automation

use crate::args::ArgBag;
use crate::automation::{
    Automation, AutomationContext, AutomationError, AutomationResult, PreflightContext, RunOptions,
};
use crate::config::AutomationConfig;
use crate::dice::DiceSource;
use crate::gamedata::{EntitlementProvider, StaticCompendium};
use crate::world::{
    Ability, AbilityScores, Creature, CreatureId, CreatureKind, Encounter, SkillValue, Spellbook,
    TargetRef,
};

/// User id every harness run is attributed to.
pub const TEST_USER: &str = "user";

/// A dice source that returns scripted values in order, then keeps
/// returning the last one. Values are clamped to the die's faces.
#[derive(Debug, Clone)]
pub struct ScriptedDice {
    values: Vec<i64>,
    next: usize,
}

impl ScriptedDice {
    pub fn new(values: Vec<i64>) -> Self {
        Self { values, next: 0 }
    }

    /// Every die shows `value`.
    pub fn fixed(value: i64) -> Self {
        Self::new(vec![value])
    }
}

impl DiceSource for ScriptedDice {
    fn roll_die(&mut self, sides: u32) -> i64 {
        let value = match self.values.get(self.next) {
            Some(v) => {
                self.next += 1;
                *v
            }
            None => self.values.last().copied().unwrap_or(1),
        };
        value.clamp(1, sides.max(1) as i64)
    }
}

/// Deserialize an automation from JSON, panicking on malformed input.
pub fn automation(value: serde_json::Value) -> Automation {
    match serde_json::from_value(value) {
        Ok(automation) => automation,
        Err(e) => panic!("invalid automation: {e}"),
    }
}

/// Level 5 wizard: INT 16, spell DC 14, +6 to hit, slots 4/3/2.
pub fn sample_wizard() -> Creature {
    Creature::new("Merlin", CreatureKind::Character)
        .with_abilities(AbilityScores::new(8, 14, 12, 16, 13, 10))
        .with_level(5, 3)
        .with_ac(12)
        .with_hp(27)
        .with_save(Ability::Intelligence, SkillValue::proficient(6, 1.0))
        .with_save(Ability::Wisdom, SkillValue::proficient(4, 1.0))
        .with_spellbook(
            Spellbook::new()
                .with_casting(14, 6, 3, 5)
                .with_slots(1, 4)
                .with_slots(2, 3)
                .with_slots(3, 2),
        )
}

/// AC 15, 7 HP, DEX 14, stealth +6.
pub fn sample_goblin() -> Creature {
    Creature::new("Goblin", CreatureKind::Monster)
        .with_abilities(AbilityScores::new(8, 14, 10, 10, 8, 8))
        .with_ac(15)
        .with_hp(7)
        .with_skill("stealth", SkillValue::proficient(6, 2.0))
}

/// Level 3 fighter: STR 16, athletics +5.
pub fn sample_fighter() -> Creature {
    Creature::new("Roland", CreatureKind::Character)
        .with_abilities(AbilityScores::new(16, 12, 14, 10, 12, 8))
        .with_level(3, 2)
        .with_ac(18)
        .with_hp(28)
        .with_skill("athletics", SkillValue::proficient(5, 1.0))
        .with_save(Ability::Strength, SkillValue::proficient(5, 1.0))
        .with_save(Ability::Constitution, SkillValue::proficient(4, 1.0))
}

/// Runs automation for one caster against a fixed set of targets.
pub struct Harness {
    pub encounter: Encounter,
    pub compendium: StaticCompendium,
    pub dice: ScriptedDice,
    pub config: AutomationConfig,
    pub caster: CreatureId,
    pub targets: Vec<CreatureId>,
}

impl Harness {
    pub fn new(caster: Creature) -> Self {
        let mut encounter = Encounter::new();
        let caster = encounter.add(caster);
        Self {
            encounter,
            compendium: StaticCompendium::new(),
            dice: ScriptedDice::fixed(10),
            config: AutomationConfig::default(),
            caster,
            targets: Vec::new(),
        }
    }

    /// Add a creature to the encounter and to every run's targets.
    pub fn with_target(mut self, target: Creature) -> Self {
        let id = self.encounter.add(target);
        self.targets.push(id);
        self
    }

    pub fn with_rolls(mut self, rolls: Vec<i64>) -> Self {
        self.dice = ScriptedDice::new(rolls);
        self
    }

    pub fn with_compendium(mut self, compendium: StaticCompendium) -> Self {
        self.compendium = compendium;
        self
    }

    pub fn with_config(mut self, config: AutomationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn caster(&self) -> &Creature {
        self.creature(self.caster)
    }

    pub fn target(&self, index: usize) -> &Creature {
        self.creature(self.targets[index])
    }

    fn creature(&self, id: CreatureId) -> &Creature {
        match self.encounter.get(id) {
            Some(creature) => creature,
            None => panic!("creature {id:?} left the encounter"),
        }
    }

    /// Run without a preflight pass. `-t name` arguments add targets after
    /// the harness's own; names nobody in the encounter answers to become
    /// narrative-only targets.
    pub fn run(
        &mut self,
        automation: &Automation,
        args: &str,
    ) -> Result<AutomationResult, AutomationError> {
        self.run_with_options(automation, args, RunOptions::new(TEST_USER))
    }

    pub fn run_with_options(
        &mut self,
        automation: &Automation,
        args: &str,
        options: RunOptions,
    ) -> Result<AutomationResult, AutomationError> {
        let args = ArgBag::parse(args);
        let targets = self.resolve_targets(&args);
        let mut ctx = self.context(targets, args, options)?;
        automation.execute(&mut ctx)
    }

    /// Run with entitlement checks, the way a caller would.
    pub async fn run_checked(
        &mut self,
        automation: &Automation,
        args: &str,
        entitlements: &dyn EntitlementProvider,
    ) -> Result<AutomationResult, AutomationError> {
        let pctx = PreflightContext::new(&self.compendium, entitlements, TEST_USER);
        automation.preflight(&pctx).await?;
        self.run(automation, args)
    }

    fn resolve_targets(&self, args: &ArgBag) -> Vec<TargetRef> {
        let mut targets: Vec<TargetRef> = self
            .targets
            .iter()
            .copied()
            .map(TargetRef::Creature)
            .collect();
        targets.extend(args.target_names().iter().map(|name| self.encounter.resolve_target(name)));
        targets
    }

    fn context(
        &mut self,
        targets: Vec<TargetRef>,
        args: ArgBag,
        options: RunOptions,
    ) -> Result<AutomationContext<'_>, AutomationError> {
        AutomationContext::new(
            &mut self.encounter,
            &self.compendium,
            &mut self.dice,
            &self.config,
            self.caster,
            targets,
            args,
            options,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::EffectResult;
    use crate::dice::roll_with;
    use serde_json::json;

    #[test]
    fn test_scripted_dice_repeat_last_value() {
        let mut dice = ScriptedDice::new(vec![12, 3]);
        let roll = roll_with("1d20+2d6", &mut dice).unwrap();
        assert_eq!(roll.total, 18);

        let mut dice = ScriptedDice::fixed(20);
        assert_eq!(dice.roll_die(6), 6);
    }

    #[test]
    fn test_samples() {
        let wizard = sample_wizard();
        assert!(wizard.is_character());
        assert_eq!(wizard.spellbook.dc, Some(14));
        assert_eq!(wizard.spellbook.get_slots(3), 2);
        let goblin = sample_goblin();
        assert_eq!(goblin.ac, Some(15));
        assert_eq!(goblin.current_hp(), Some(7));
    }

    #[test]
    fn test_harness_resolves_named_targets() {
        let mut h = Harness::new(sample_wizard()).with_target(sample_goblin());
        let auto = automation(json!([
            {"type": "target", "target": "all", "effects": [{"type": "damage", "damage": "2"}]}
        ]));
        let result = h.run(&auto, "-t Goblin -t Dummy").unwrap();
        // the harness target plus both named ones
        let EffectResult::Target(target) = &result.children[0] else {
            panic!("expected a target result");
        };
        assert_eq!(target.iterations.len(), 3);
        assert!(target.iterations[2].is_simple);
        assert_eq!(h.target(0).current_hp(), Some(3));
    }
}
