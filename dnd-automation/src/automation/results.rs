//! Outcome tree produced by a run, mirroring the effect tree.

use super::runtime::AutomationOutput;
use crate::dice::{Advantage, RollResult};
use crate::initiative::InitiativeEffect;
use crate::script::Value;
use crate::world::{Ability, TargetRef};

/// Result of one effect node.
#[derive(Debug, Clone, PartialEq)]
pub enum EffectResult {
    Target(TargetResult),
    Attack(AttackResult),
    Save(SaveResult),
    Check(CheckResult),
    Damage(DamageResult),
    TempHp(TempHpResult),
    IEffect(IEffectResult),
    RemoveIEffect(RemoveIEffectResult),
    Roll(RollEffectResult),
    Text(TextResult),
    SetVariable(SetVariableResult),
    Condition(ConditionResult),
    UseCounter(UseCounterResult),
    CastSpell(CastSpellResult),
}

impl EffectResult {
    /// Nested results, in execution order.
    pub fn children(&self) -> Vec<&EffectResult> {
        match self {
            EffectResult::Target(r) => r.iterations.iter().flat_map(|i| i.results.iter()).collect(),
            EffectResult::Attack(r) => r.children.iter().collect(),
            EffectResult::Save(r) => r.children.iter().collect(),
            EffectResult::Check(r) => r.children.iter().collect(),
            EffectResult::Condition(r) => r.children.iter().collect(),
            EffectResult::CastSpell(r) => r.children.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Damage dealt anywhere in this subtree. Healing counts as negative.
    pub fn get_damage(&self) -> i64 {
        match self {
            EffectResult::Damage(r) => r.damage,
            other => other.children().into_iter().map(EffectResult::get_damage).sum(),
        }
    }

    /// Dice rolled by this node itself.
    pub fn own_rolls(&self) -> Vec<&RollResult> {
        match self {
            EffectResult::Attack(r) => r.to_hit_roll.iter().collect(),
            EffectResult::Save(r) => r.save_roll.iter().collect(),
            EffectResult::Check(r) => r.contest_roll.iter().chain(r.check_roll.iter()).collect(),
            EffectResult::Damage(r) => r.damage_roll.iter().collect(),
            EffectResult::TempHp(r) => r.amount_roll.iter().collect(),
            EffectResult::Roll(r) => vec![&r.roll],
            _ => Vec::new(),
        }
    }

    /// Every roll in this subtree, depth first.
    pub fn rolls(&self) -> Vec<&RollResult> {
        let mut out = self.own_rolls();
        for child in self.children() {
            out.extend(child.rolls());
        }
        out
    }
}

/// One pass over one target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetIteration {
    pub target: TargetRef,
    pub is_simple: bool,
    /// Index within the targets this node resolved.
    pub target_index: usize,
    /// 1-based repeat number (`-rr`).
    pub target_iteration: u32,
    pub results: Vec<EffectResult>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TargetResult {
    pub iterations: Vec<TargetIteration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttackResult {
    /// The bonus as rolled, after `-b` and effect bonuses.
    pub attack_bonus: Option<String>,
    pub ac: Option<i64>,
    pub to_hit_roll: Option<RollResult>,
    pub adv: Advantage,
    pub did_hit: bool,
    pub did_crit: bool,
    pub children: Vec<EffectResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaveResult {
    pub dc: i64,
    pub ability: Ability,
    pub save_roll: Option<RollResult>,
    pub adv: Advantage,
    pub did_save: bool,
    pub children: Vec<EffectResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    /// `None` against a simple target.
    pub skill_key: Option<String>,
    pub skill_name: String,
    pub check_roll: Option<RollResult>,
    pub dc: Option<i64>,
    /// `None` when no outcome could be decided.
    pub did_succeed: Option<bool>,
    pub children: Vec<EffectResult>,
    pub contest_skill_key: Option<String>,
    pub contest_skill_name: Option<String>,
    pub contest_roll: Option<RollResult>,
    pub contest_did_tie: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DamageResult {
    pub damage: i64,
    /// `None` when rolling was skipped.
    pub damage_roll: Option<RollResult>,
    pub in_crit: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TempHpResult {
    pub amount: i64,
    pub amount_roll: Option<RollResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IEffectResult {
    pub effect: InitiativeEffect,
    pub conc_conflict: Vec<InitiativeEffect>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoveIEffectResult {
    pub removed_effect: InitiativeEffect,
    pub removed_parent: Option<InitiativeEffect>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollEffectResult {
    pub result: i64,
    pub roll: RollResult,
    pub simplified: RollResult,
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextResult {
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetVariableResult {
    pub value: Value,
    pub did_error: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConditionResult {
    pub did_true: bool,
    pub did_false: bool,
    pub did_error: bool,
    pub children: Vec<EffectResult>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UseCounterResult {
    /// `None` if no counter was used.
    pub counter_name: Option<String>,
    pub counter_remaining: i64,
    pub used_amount: i64,
    pub requested_amount: i64,
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CastSpellResult {
    pub success: bool,
    pub spell_id: Option<i64>,
    pub spell_name: Option<String>,
    pub level_override: Option<i64>,
    pub dc_override: Option<i64>,
    pub attack_bonus_override: Option<i64>,
    pub casting_mod_override: Option<i64>,
    pub children: Vec<EffectResult>,
}

/// Root of the result tree plus the rendered output.
#[derive(Debug, Clone, PartialEq)]
pub struct AutomationResult {
    pub children: Vec<EffectResult>,
    pub is_spell: bool,
    /// The caster's resources changed and should be saved.
    pub caster_needs_commit: bool,
    pub output: AutomationOutput,
}

impl AutomationResult {
    pub fn get_damage(&self) -> i64 {
        self.children.iter().map(EffectResult::get_damage).sum()
    }

    /// Every dice roll made during the run, depth first.
    pub fn rolls(&self) -> Vec<&RollResult> {
        self.children.iter().flat_map(EffectResult::rolls).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dice::{roll_with, DiceSource};

    struct Sixes;

    impl DiceSource for Sixes {
        fn roll_die(&mut self, sides: u32) -> i64 {
            (sides as i64).min(6)
        }
    }

    fn damage(amount: i64) -> EffectResult {
        EffectResult::Damage(DamageResult {
            damage: amount,
            damage_roll: roll_with(&amount.to_string(), &mut Sixes).ok(),
            in_crit: false,
        })
    }

    #[test]
    fn test_get_damage_sums_subtree() {
        let attack = EffectResult::Attack(AttackResult {
            attack_bonus: Some("5".into()),
            ac: Some(12),
            to_hit_roll: roll_with("1d20+5", &mut Sixes).ok(),
            adv: Advantage::Normal,
            did_hit: true,
            did_crit: false,
            children: vec![damage(7), damage(-2)],
        });
        let target = EffectResult::Target(TargetResult {
            iterations: vec![
                TargetIteration {
                    target: TargetRef::Nobody,
                    is_simple: true,
                    target_index: 0,
                    target_iteration: 1,
                    results: vec![attack.clone()],
                },
                TargetIteration {
                    target: TargetRef::Nobody,
                    is_simple: true,
                    target_index: 0,
                    target_iteration: 2,
                    results: vec![damage(3)],
                },
            ],
        });
        assert_eq!(attack.get_damage(), 5);
        assert_eq!(target.get_damage(), 8);
    }

    #[test]
    fn test_rolls_depth_first() {
        let attack = EffectResult::Attack(AttackResult {
            attack_bonus: Some("5".into()),
            ac: None,
            to_hit_roll: roll_with("1d20+5", &mut Sixes).ok(),
            adv: Advantage::Normal,
            did_hit: true,
            did_crit: false,
            children: vec![damage(4)],
        });
        let totals: Vec<i64> = attack.rolls().iter().map(|r| r.total).collect();
        assert_eq!(totals, vec![11, 4]);
    }
}
