use super::{build_child_str, run_children, Effect, SummaryContext};
use crate::automation::errors::{quoted, AutomationError};
use crate::automation::results::{AttackResult, EffectResult};
use crate::automation::runtime::AutomationContext;
use crate::automation::utils::{intexpr_str, stringify_intexpr, IntExpr};
use crate::dice::{Advantage, CritType};
use crate::script::Names;
use serde::{Deserialize, Serialize};

/// An attack roll against the current target's AC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attack {
    #[serde(default)]
    pub hit: Vec<Effect>,
    #[serde(default)]
    pub miss: Vec<Effect>,
    #[serde(rename = "attackBonus", default, skip_serializing_if = "Option::is_none")]
    pub attack_bonus: Option<IntExpr>,
    /// Evaluates to -1, 0, 1 or 2; reconciled with the advantage arguments
    /// and effect-granted advantage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adv: Option<IntExpr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Effect>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Miss,
    Hit,
    Crit,
}

impl Attack {
    pub fn new(hit: Vec<Effect>, miss: Vec<Effect>) -> Self {
        Self {
            hit,
            miss,
            attack_bonus: None,
            adv: None,
            meta: Vec::new(),
        }
    }

    pub fn with_attack_bonus(mut self, bonus: impl Into<IntExpr>) -> Self {
        self.attack_bonus = Some(bonus.into());
        self
    }

    pub(super) fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<AttackResult, AutomationError> {
        if ctx.target.is_none() {
            return Err(AutomationError::target(
                "Tried to make an attack without a target! Make sure all Attack effects are inside of a Target effect.",
            ));
        }

        let crit_arg = ctx.args.last_bool("crit", true);
        let mut nocrit = ctx.args.last_bool("nocrit", true);
        let forced_hit = ctx.args.last_bool("hit", true);
        let forced_miss = ctx.args.last_bool("miss", true) && !forced_hit;
        let mut b = ctx.args.join("b", "+", true);
        let hide = ctx.args.last_bool("h", false);
        let mut reroll = ctx.args.last_parsed::<i64>("reroll", false)?;
        let mut criton = ctx.args.last_parsed::<i64>("criton", false)?;
        let ac_arg = ctx.args.last_parsed::<i64>("ac", false)?;
        let force_roll = ctx.args.last_parsed::<i64>("attackroll", true)?;
        let min_val = ctx.args.last_parsed::<i64>("attackmin", false)?;

        if let Some(options) = ctx.caster_options() {
            reroll = reroll.or(options.reroll);
            criton = criton.or(Some(options.crit_on));
        }
        let criton = criton.unwrap_or(ctx.config.default_crit_on);

        let effects_b: Vec<String> = ctx
            .caster_effects()
            .into_iter()
            .filter_map(|e| e.to_hit_bonus.clone())
            .collect();
        if !effects_b.is_empty() {
            let effects_b = effects_b.join("+");
            b = Some(match b {
                Some(b) => format!("{b}+{effects_b}"),
                None => effects_b,
            });
        }

        let explicit = match &self.adv {
            Some(adv) => {
                let invalid = || {
                    AutomationError::automation(format!(
                        "{} cannot be interpreted as an advantage type.",
                        quoted(&adv.source())
                    ))
                };
                let value = ctx.parse_intexpression(adv).map_err(|_| invalid())?;
                Advantage::try_from(value).map_err(|_| invalid())?
            }
            None => Advantage::Normal,
        };
        let adv = self.reconcile_advantage(ctx, explicit);

        if let Some(target) = ctx.target_creature() {
            if target.is_character() && target.options.as_ref().is_some_and(|o| o.ignore_crit) {
                nocrit = true;
            }
        }

        let mut attack_bonus = ctx
            .ab_override
            .or(ctx.caster().spellbook.sab)
            .map(|ab| ab.to_string());
        if let Some(explicit) = &self.attack_bonus {
            let value = ctx.parse_intexpression(explicit).map_err(|_| {
                AutomationError::automation(format!(
                    "{} cannot be interpreted as an attack bonus.",
                    quoted(&explicit.source())
                ))
            })?;
            attack_bonus = Some(value.to_string());
        }
        let attack_bonus = match attack_bonus {
            Some(ab) => ab,
            None => b.take().ok_or_else(|| {
                AutomationError::NoAttackBonus(
                    "No spell attack bonus found. Use the `-b` argument to specify one!".into(),
                )
            })?,
        };

        ctx.set_metavar("lastAttackDidHit", false);
        ctx.set_metavar("lastAttackDidCrit", false);
        ctx.set_metavar("lastAttackRollTotal", 0);
        ctx.set_metavar("lastAttackNaturalRoll", 0);
        ctx.set_metavar("lastAttackHadAdvantage", i64::from(adv));

        let ac = ac_arg.or_else(|| ctx.target_ac());
        let mut to_hit_roll = None;

        let outcome = if forced_hit {
            ctx.queue("**To Hit**: Automatic hit!");
            if crit_arg && !nocrit {
                Outcome::Crit
            } else {
                Outcome::Hit
            }
        } else if forced_miss {
            ctx.queue("**To Hit**: Automatic miss!");
            Outcome::Miss
        } else {
            let d20 = match force_roll {
                Some(forced) => forced.to_string(),
                None => adv.d20_notation(reroll, min_val),
            };
            let mut message = match ac {
                Some(ac) => format!("**To Hit (AC {ac})**:"),
                None => "**To Hit**:".to_string(),
            };
            if force_roll.is_some() {
                message.push_str(" Forced Roll!");
            }
            let notation = match &b {
                Some(b) => format!("{d20}+{attack_bonus}+{b}"),
                None => format!("{d20}+{attack_bonus}"),
            };
            let roll = ctx.roll_str(&notation)?;
            let natural = roll.natural();

            let outcome = if natural >= criton || roll.crit == CritType::Crit {
                if nocrit {
                    Outcome::Hit
                } else {
                    Outcome::Crit
                }
            } else if natural == 1 || roll.crit == CritType::Fail {
                Outcome::Miss
            } else if ac.is_some_and(|ac| roll.total < ac) {
                Outcome::Miss
            } else if crit_arg && !nocrit {
                Outcome::Crit
            } else {
                Outcome::Hit
            };

            ctx.set_metavar("lastAttackRollTotal", roll.total);
            ctx.set_metavar("lastAttackNaturalRoll", natural);

            let line = format!("{message} {}", roll.result());
            if !hide {
                ctx.queue(line);
            } else {
                let shown = match (ac, outcome) {
                    (Some(_), Outcome::Miss) => "MISS".to_string(),
                    (Some(_), Outcome::Crit) => "CRIT".to_string(),
                    (Some(_), Outcome::Hit) => "HIT".to_string(),
                    (None, _) => roll.total.to_string(),
                };
                ctx.queue(format!("**To Hit**: {d20}... = `{shown}`"));
                ctx.pm_invoker(line);
            }
            to_hit_roll = Some(roll);
            outcome
        };

        let children = ctx.scoped(|ctx| {
            ctx.in_save = false;
            match outcome {
                Outcome::Crit => {
                    ctx.in_crit = true;
                    ctx.set_metavar("lastAttackDidCrit", true);
                    self.on_hit(ctx)
                }
                Outcome::Hit => self.on_hit(ctx),
                Outcome::Miss => {
                    ctx.queue("**Miss!**");
                    run_children(&self.miss, ctx)
                }
            }
        })?;

        Ok(AttackResult {
            attack_bonus: Some(attack_bonus),
            ac,
            to_hit_roll,
            adv,
            did_hit: outcome != Outcome::Miss,
            did_crit: outcome == Outcome::Crit,
            children,
        })
    }

    fn on_hit(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<Vec<EffectResult>, AutomationError> {
        ctx.set_metavar("lastAttackDidHit", true);
        run_children(&self.hit, ctx)
    }

    /// `-adv`/`-dis`/`-eadv` merged with the caster's granted advantage and
    /// the node's own `adv`.
    fn reconcile_advantage(
        &self,
        ctx: &mut AutomationContext<'_>,
        explicit: Advantage,
    ) -> Advantage {
        let mut adv = ctx.args.last_bool("adv", true);
        let mut dis = ctx.args.last_bool("dis", true);
        let mut elven = ctx.args.last_bool("eadv", true);
        let granted = ctx.caster_effects().into_iter().filter_map(|e| e.attack_advantage);
        for granted in granted.chain(std::iter::once(explicit)) {
            match granted {
                Advantage::Advantage => adv = true,
                Advantage::Disadvantage => dis = true,
                Advantage::Elven => elven = true,
                Advantage::Normal => {}
            }
        }
        Advantage::reconcile(adv, dis, elven)
    }

    pub(super) fn build_str(&self, sctx: &SummaryContext<'_>, names: &mut Names) -> String {
        let bonus = match &self.attack_bonus {
            Some(expr) => stringify_intexpr(names, &expr.source()),
            None => sctx.caster.spellbook.sab,
        };
        let mut out = format!("Attack: {} to hit", intexpr_str(bonus, true));
        if let Some(adv) = &self.adv {
            let adv = stringify_intexpr(names, &adv.source())
                .and_then(|v| Advantage::try_from(v).ok());
            match adv {
                Some(Advantage::Advantage) => out.push_str(", with advantage"),
                Some(Advantage::Elven) => out.push_str(", with Elven Accuracy"),
                Some(Advantage::Disadvantage) => out.push_str(", with disadvantage"),
                _ => {}
            }
        }
        let hit = build_child_str(&self.hit, sctx, names);
        let miss = build_child_str(&self.miss, sctx, names);
        if !hit.is_empty() {
            out.push_str(&format!(". Hit: {hit}"));
        }
        if !miss.is_empty() {
            out.push_str(&format!(". Miss: {miss}"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use crate::automation::errors::AutomationError;
    use crate::automation::results::EffectResult;
    use crate::dice::Advantage;
    use crate::testing::{automation, sample_goblin, sample_wizard, Harness};
    use serde_json::json;

    fn first_attack(
        result: &crate::automation::AutomationResult,
    ) -> &crate::automation::results::AttackResult {
        let EffectResult::Target(target) = &result.children[0] else {
            panic!("expected a target result");
        };
        match &target.iterations[0].results[0] {
            EffectResult::Attack(attack) => attack,
            other => panic!("expected an attack, got {other:?}"),
        }
    }

    fn spell_attack() -> crate::automation::Automation {
        automation(json!([{
            "type": "target",
            "target": "each",
            "effects": [{
                "type": "attack",
                "hit": [{"type": "damage", "damage": "1d6[fire]"}],
                "miss": []
            }]
        }]))
    }

    #[test]
    fn test_attack_hits_against_ac() {
        let mut h = Harness::new(sample_wizard())
            .with_target(sample_goblin())
            .with_rolls(vec![12, 4]);
        let result = h.run(&spell_attack(), "").unwrap();
        let attack = first_attack(&result);
        assert!(attack.did_hit);
        assert!(!attack.did_crit);
        assert_eq!(attack.ac, Some(15));
        assert_eq!(attack.attack_bonus.as_deref(), Some("6"));
        assert_eq!(h.target(0).current_hp(), Some(3));
        let field = result.output.field("Goblin").unwrap();
        assert!(field.value.starts_with("**To Hit (AC 15)**: 1d20 (12) + 6 = `18`"));
    }

    #[test]
    fn test_attack_misses_below_ac() {
        let mut h = Harness::new(sample_wizard()).with_target(sample_goblin()).with_rolls(vec![5]);
        let result = h.run(&spell_attack(), "").unwrap();
        let attack = first_attack(&result);
        assert!(!attack.did_hit);
        assert!(attack.children.is_empty());
        assert_eq!(h.target(0).current_hp(), Some(7));
        assert!(result.output.field("Goblin").unwrap().value.contains("**Miss!**"));
    }

    #[test]
    fn test_natural_twenty_crits_unless_nocrit() {
        let mut h = Harness::new(sample_wizard())
            .with_target(sample_goblin())
            .with_rolls(vec![20, 1]);
        let result = h.run(&spell_attack(), "").unwrap();
        assert!(first_attack(&result).did_crit);

        let mut h = Harness::new(sample_wizard())
            .with_target(sample_goblin())
            .with_rolls(vec![20, 1]);
        let result = h.run(&spell_attack(), "-nocrit").unwrap();
        let attack = first_attack(&result);
        assert!(attack.did_hit);
        assert!(!attack.did_crit);
    }

    #[test]
    fn test_forced_outcomes() {
        let mut h = Harness::new(sample_wizard()).with_target(sample_goblin()).with_rolls(vec![1]);
        let result = h.run(&spell_attack(), "-hit").unwrap();
        let attack = first_attack(&result);
        assert!(attack.did_hit);
        assert!(attack.to_hit_roll.is_none());
        assert!(result.output.field("Goblin").unwrap().value.contains("Automatic hit!"));

        let mut h = Harness::new(sample_wizard()).with_target(sample_goblin()).with_rolls(vec![20]);
        let result = h.run(&spell_attack(), "-miss").unwrap();
        assert!(!first_attack(&result).did_hit);
    }

    #[test]
    fn test_hidden_attack_reports_outcome_only() {
        let mut h = Harness::new(sample_wizard())
            .with_target(sample_goblin())
            .with_rolls(vec![12, 4]);
        let result = h.run(&spell_attack(), "-h").unwrap();
        let field = result.output.field("Goblin").unwrap();
        assert!(field.value.starts_with("**To Hit**: 1d20... = `HIT`"));
        assert!(result.output.private_messages["user"][0]
            .starts_with("**To Hit (AC 15)**: 1d20 (12)"));
    }

    #[test]
    fn test_attack_without_bonus_fails() {
        let mut caster = sample_goblin();
        caster.name = "Bandit".into();
        let mut h = Harness::new(caster).with_target(sample_goblin()).with_rolls(vec![12]);
        let result = h.run(&spell_attack(), "").unwrap();
        let meta = result.output.field("Meta").unwrap();
        assert!(meta.value.contains("No spell attack bonus found"));

        // -b stands in for the missing bonus
        let mut caster = sample_goblin();
        caster.name = "Bandit".into();
        let mut h = Harness::new(caster).with_target(sample_goblin()).with_rolls(vec![12, 2]);
        let result = h.run(&spell_attack(), "-b 4").unwrap();
        assert_eq!(first_attack(&result).attack_bonus.as_deref(), Some("4"));
    }

    #[test]
    fn test_node_advantage_is_reconciled_with_arguments() {
        let auto = automation(json!([{
            "type": "target",
            "target": "each",
            "effects": [{"type": "attack", "attackBonus": "3", "adv": 1, "hit": [], "miss": []}]
        }]));

        let mut h = Harness::new(sample_wizard())
            .with_target(sample_goblin())
            .with_rolls(vec![3, 14]);
        let result = h.run(&auto, "").unwrap();
        let attack = first_attack(&result);
        assert_eq!(attack.adv, Advantage::Advantage);
        assert!(attack.did_hit);

        // advantage and disadvantage cancel out
        let mut h = Harness::new(sample_wizard())
            .with_target(sample_goblin())
            .with_rolls(vec![3, 14]);
        let result = h.run(&auto, "-dis").unwrap();
        let attack = first_attack(&result);
        assert_eq!(attack.adv, Advantage::Normal);
        assert!(!attack.did_hit);

        let mut h = Harness::new(sample_wizard())
            .with_target(sample_goblin())
            .with_rolls(vec![3, 14]);
        let result = h.run(&auto, "-eadv").unwrap();
        assert_eq!(first_attack(&result).adv, Advantage::Elven);
    }

    #[test]
    fn test_attack_outside_target_is_an_error() {
        let auto = automation(json!([{"type": "attack", "hit": [], "miss": []}]));
        let mut h = Harness::new(sample_wizard()).with_rolls(vec![10]);
        let err = h.run(&auto, "").unwrap_err();
        assert!(matches!(err, AutomationError::Target(_)));
        assert!(err.to_string().starts_with("Tried to make an attack without a target!"));
    }

    #[test]
    fn test_build_str() {
        let auto = automation(json!([{
            "type": "target",
            "target": "each",
            "effects": [{
                "type": "attack",
                "attackBonus": "3",
                "adv": 1,
                "hit": [{"type": "damage", "damage": "1d8"}],
                "miss": []
            }]
        }]));
        let h = Harness::new(sample_wizard());
        assert_eq!(
            auto.build_str(h.caster(), &h.compendium),
            "Attack: +3 to hit, with advantage. Hit: 1d8 damage."
        );
    }
}
