use super::Effect;
use crate::automation::errors::AutomationError;
use crate::automation::results::DamageResult;
use crate::automation::runtime::AutomationContext;
use crate::automation::utils::{upcast_scaled_dice, HigherLevels};
use crate::dice::{DiceError, DiceExpression};
use crate::resistance::{do_resistances, DamageTransforms, Resistances};
use crate::script::{AnnotatedString, Names, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Damage (or, when negative, healing) dealt to the current target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Damage {
    /// Annotated dice string, e.g. `{damage}` or `2d6[fire]`.
    pub damage: String,
    /// Healing may raise HP past the maximum.
    #[serde(default)]
    pub overheal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub higher: Option<HigherLevels>,
    #[serde(rename = "cantripScale", default, skip_serializing_if = "Option::is_none")]
    pub cantrip_scale: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Effect>,
}

impl Damage {
    pub fn new(damage: impl Into<String>) -> Self {
        Self {
            damage: damage.into(),
            overheal: false,
            higher: None,
            cantrip_scale: None,
            meta: Vec::new(),
        }
    }

    pub(super) fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<Option<DamageResult>, AutomationError> {
        if ctx.target.is_none() {
            return Err(AutomationError::target(
                "Tried to do damage without a target! Make sure all Damage effects are inside of a Target effect.",
            ));
        }

        let mut d_args = ctx.args.get("d", true);
        let c_args = ctx.args.get("c", true);
        let crit_arg = ctx.args.last_bool("crit", true);
        let nocrit = ctx.args.last_bool("nocrit", true);
        let max_arg = ctx.args.last_bool("max", true);
        let magic_arg = ctx.args.last_bool("magical", true);
        let silvered_arg = ctx.args.last_bool("silvered", true);
        let mi_arg = ctx.args.last_parsed::<i64>("mi", false)?;
        let dtype_args = ctx.args.get("dtype", true);
        let mut critdice: i64 = ctx.args.get_parsed::<i64>("critdice", false)?.iter().sum();
        let hide = ctx.args.last_bool("h", false);

        if !ctx.args.contains("critdice") {
            if let Some(options) = ctx.caster_options() {
                critdice = options.extra_crit_dice;
            }
        }

        let mut resistances = if ctx.target_is_simple() {
            Resistances::new()
        } else {
            ctx.target_resists()
        };
        resistances.update(Resistances::from_args(&mut ctx.args, true));

        // a lone variable against a simple target was already narrated by its Roll
        if ctx.target_is_simple() && self.is_meta(ctx) {
            return Ok(None);
        }

        d_args.extend(ctx.caster_effects().into_iter().filter_map(|e| e.damage_bonus.clone()));
        if self.contains_roll_meta(ctx) {
            // the Roll already carries the -d bonus
            d_args.clear();
        }

        let damage = ctx.parse_annostr(&self.damage)?;
        let dice = DiceExpression::parse(&damage)?;
        let mut dice = upcast_scaled_dice(
            ctx,
            dice,
            self.cantrip_scale.unwrap_or(false),
            self.higher.as_ref(),
        )?;

        if let Some(mi) = mi_arg.filter(|mi| *mi != 0) {
            dice.set_minimum(mi);
        }
        for d in &d_args {
            dice.append(DiceExpression::parse(d)?);
        }

        let in_crit = (ctx.in_crit || crit_arg) && !(nocrit || ctx.in_save);
        if in_crit {
            dice.double_dice()?;
            if critdice > 0 && !ctx.is_spell() {
                let extra = u32::try_from(critdice).map_err(|_| DiceError::Overflow)?;
                dice.add_leftmost_dice(extra)?;
            }
            for c in &c_args {
                dice.append(DiceExpression::parse(c)?);
            }
        }
        if max_arg {
            dice.maximize();
        }

        let mut roll = ctx.roll(&dice)?;

        let caster_effects = ctx.caster_effects();
        let mut always = BTreeSet::new();
        if caster_effects.iter().any(|e| e.magical_damage) || ctx.is_spell() || magic_arg {
            always.insert("magical".to_string());
        }
        if caster_effects.iter().any(|e| e.silvered_damage) || silvered_arg {
            always.insert("silvered".to_string());
        }

        let transforms = DamageTransforms::from_args(&dtype_args);
        for line in transforms.describe() {
            ctx.meta_queue(line);
        }
        do_resistances(&mut roll, &resistances, &always, &transforms);

        let mut roll_for = if roll.total < 0 { "Healing" } else { "Damage" }.to_string();
        if in_crit {
            roll_for.push_str(" (CRIT!)");
        }
        if hide {
            ctx.queue(format!("**{roll_for}**: {}", roll.simplified().result()));
            ctx.pm_invoker(format!("**{roll_for}**: {}", roll.result()));
        } else {
            ctx.queue(format!("**{roll_for}**: {}", roll.result()));
        }

        ctx.damage_target(roll.total, self.overheal);
        ctx.set_metavar("lastDamage", roll.total);

        Ok(Some(DamageResult {
            damage: roll.total,
            damage_roll: Some(roll),
            in_crit,
        }))
    }

    /// The damage string is exactly one variable.
    fn is_meta(&self, ctx: &AutomationContext<'_>) -> bool {
        AnnotatedString::new(self.damage.as_str())
            .single_reference()
            .is_some_and(|name| ctx.metavars.contains_key(name))
    }

    /// The damage string interpolates the output of a Roll effect.
    fn contains_roll_meta(&self, ctx: &AutomationContext<'_>) -> bool {
        let rolls: Vec<&str> = ctx
            .metavars
            .iter()
            .filter(|(_, v)| matches!(v, Value::Roll(_)))
            .map(|(k, _)| k.as_str())
            .collect();
        AnnotatedString::new(self.damage.as_str()).references_any(&rolls)
    }

    pub(super) fn build_str(&self, names: &mut Names) -> String {
        let damage = match AnnotatedString::new(self.damage.as_str()).transformed(names) {
            Ok(damage) => {
                names.insert("lastDamage".into(), Value::str(damage.clone()));
                damage
            }
            Err(_) => {
                names.insert("lastDamage".into(), Value::Int(0));
                self.damage.clone()
            }
        };
        match damage.strip_prefix('-') {
            Some(healing) => format!("{} healing", healing.trim()),
            None => format!("{damage} damage"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::results::EffectResult;
    use crate::automation::runtime::RunOptions;
    use crate::automation::AutomationResult;
    use crate::gamedata::Spell;
    use crate::testing::{automation, sample_fighter, sample_goblin, sample_wizard, Harness};
    use crate::world::CharacterOptions;
    use serde_json::json;

    fn damage_results(result: &AutomationResult) -> Vec<&DamageResult> {
        let EffectResult::Target(target) = &result.children[0] else {
            panic!("expected a target result");
        };
        target
            .iterations
            .iter()
            .flat_map(|i| i.results.iter())
            .filter_map(|r| match r {
                EffectResult::Damage(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    fn each(effects: serde_json::Value) -> crate::automation::Automation {
        automation(json!([{"type": "target", "target": "each", "effects": effects}]))
    }

    #[test]
    fn test_resistance_halves_damage() {
        let auto = each(json!([{"type": "damage", "damage": "2d6[fire]"}]));
        let goblin = sample_goblin().with_resistance("fire");
        let mut h = Harness::new(sample_wizard()).with_target(goblin).with_rolls(vec![3]);
        let result = h.run(&auto, "").unwrap();
        assert_eq!(damage_results(&result)[0].damage, 3);
        assert_eq!(h.target(0).current_hp(), Some(4));
    }

    #[test]
    fn test_crit_arg_doubles_dice_but_not_in_saves() {
        let auto = each(json!([{"type": "damage", "damage": "1d6"}]));
        let mut h = Harness::new(sample_wizard()).with_target(sample_goblin()).with_rolls(vec![2]);
        let result = h.run(&auto, "-crit").unwrap();
        let dmg = damage_results(&result)[0];
        assert!(dmg.in_crit);
        assert_eq!(dmg.damage, 4);
        assert!(result.output.field("Goblin").unwrap().value.starts_with("**Damage (CRIT!)**"));

        let auto = each(json!([{
            "type": "save", "stat": "dex", "dc": 30,
            "fail": [{"type": "damage", "damage": "1d6"}], "success": []
        }]));
        let mut h = Harness::new(sample_wizard()).with_target(sample_goblin()).with_rolls(vec![2]);
        let result = h.run(&auto, "-crit").unwrap();
        assert_eq!(result.get_damage(), 2);
    }

    #[test]
    fn test_extra_crit_dice_go_to_the_leftmost_term_once() {
        let auto = each(json!([{"type": "damage", "damage": "1d6 + 1d4"}]));
        let fighter = || {
            sample_fighter().with_options(CharacterOptions {
                extra_crit_dice: 1,
                ..CharacterOptions::default()
            })
        };

        // 3d6 + 2d4, every die showing 2
        let mut h = Harness::new(fighter())
            .with_target(sample_goblin().with_hp(30))
            .with_rolls(vec![2]);
        let result = h.run(&auto, "-crit").unwrap();
        assert_eq!(damage_results(&result)[0].damage, 10);

        // -critdice replaces the character option
        let mut h = Harness::new(fighter())
            .with_target(sample_goblin().with_hp(30))
            .with_rolls(vec![2]);
        let result = h.run(&auto, "-crit -critdice 2").unwrap();
        assert_eq!(damage_results(&result)[0].damage, 12);

        // spells only double
        let mut h = Harness::new(fighter())
            .with_target(sample_goblin().with_hp(30))
            .with_rolls(vec![2]);
        let options = RunOptions::new("tester").with_spell(Spell::new(9, "Ray of Sickness", 1));
        let result = h.run_with_options(&auto, "-crit", options).unwrap();
        assert_eq!(damage_results(&result)[0].damage, 8);

        // no crit, no extra dice
        let mut h = Harness::new(fighter())
            .with_target(sample_goblin().with_hp(30))
            .with_rolls(vec![2]);
        let result = h.run(&auto, "").unwrap();
        assert_eq!(damage_results(&result)[0].damage, 4);
    }

    #[test]
    fn test_crit_on_huge_dice_count_is_narrated() {
        let auto = each(json!([{"type": "damage", "damage": "3000000000d6"}]));
        let mut h = Harness::new(sample_wizard()).with_target(sample_goblin());
        let result = h.run(&auto, "-crit").unwrap();
        assert!(damage_results(&result).is_empty());
        assert!(result
            .output
            .field("Meta")
            .unwrap()
            .value
            .contains("Number too large"));
        assert_eq!(h.target(0).current_hp(), Some(7));

        let result = h.run(&auto, "").unwrap();
        assert!(result.output.field("Meta").unwrap().value.contains("Too many dice"));
    }

    #[test]
    fn test_negative_damage_heals() {
        let auto = each(json!([{"type": "damage", "damage": "-5"}]));
        let mut goblin = sample_goblin();
        goblin.modify_hp(-4, false);
        let mut h = Harness::new(sample_wizard()).with_target(goblin);
        let result = h.run(&auto, "").unwrap();
        assert!(result.output.field("Goblin").unwrap().value.starts_with("**Healing**"));
        assert_eq!(h.target(0).current_hp(), Some(7));
    }

    #[test]
    fn test_d_and_max_arguments() {
        let auto = each(json!([{"type": "damage", "damage": "1d6"}]));
        let mut h = Harness::new(sample_wizard()).with_target(sample_goblin()).with_rolls(vec![1]);
        let result = h.run(&auto, "-d 2 -max").unwrap();
        assert_eq!(damage_results(&result)[0].damage, 8);
    }

    #[test]
    fn test_dtype_transform_is_announced() {
        let auto = each(json!([{"type": "damage", "damage": "1d6[fire]"}]));
        let goblin = sample_goblin().with_immunity("cold");
        let mut h = Harness::new(sample_wizard()).with_target(goblin).with_rolls(vec![4]);
        let result = h.run(&auto, "-dtype fire>cold").unwrap();
        assert_eq!(damage_results(&result)[0].damage, 0);
        assert!(result
            .output
            .field("Meta")
            .unwrap()
            .value
            .contains("**Damage Change**: fire > cold"));
    }

    #[test]
    fn test_roll_variable_against_simple_target_is_skipped() {
        let auto = automation(json!([
            {"type": "roll", "dice": "1d8", "name": "bolt"},
            {"type": "target", "target": "each", "effects": [{"type": "damage", "damage": "{bolt}"}]}
        ]));
        let mut h = Harness::new(sample_wizard()).with_rolls(vec![5]);
        let result = h.run(&auto, "-t Dummy").unwrap();
        let EffectResult::Target(target) = &result.children[1] else {
            panic!("expected a target result");
        };
        assert!(target.iterations[0].results.is_empty());
    }

    #[test]
    fn test_build_str() {
        let mut names = Names::new();
        assert_eq!(Damage::new("2d6[fire]").build_str(&mut names), "2d6[fire] damage");
        assert_eq!(Damage::new("-1d4").build_str(&mut names), "1d4 healing");
        assert_eq!(names.get("lastDamage"), Some(&Value::str("-1d4")));
    }
}
