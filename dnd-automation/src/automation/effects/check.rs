use super::{build_child_str, run_children, Effect, SummaryContext};
use crate::automation::errors::{quoted, AutomationError};
use crate::automation::results::{CheckResult, EffectResult};
use crate::automation::runtime::AutomationContext;
use crate::automation::utils::{intexpr_str, maybe_mod, natural_join, stringify_intexpr, IntExpr};
use crate::dice::Advantage;
use crate::script::{Names, Value};
use crate::world::{camel_to_title, skill_ability, Creature, SkillValue};
use serde::{Deserialize, Serialize};

/// One skill key or several; the creature rolls its best.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SkillList {
    One(String),
    Many(Vec<String>),
}

impl SkillList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            SkillList::One(s) => vec![s.clone()],
            SkillList::Many(v) => v.clone(),
        }
    }
}

impl From<&str> for SkillList {
    fn from(s: &str) -> Self {
        SkillList::One(s.to_string())
    }
}

/// What a tied contest counts as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContestTie {
    #[default]
    Fail,
    Success,
    /// Neither branch runs.
    Neither,
}

/// An ability check by the current target, against a DC or a contest roll
/// by the caster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub ability: SkillList,
    #[serde(rename = "contestAbility", default, skip_serializing_if = "Option::is_none")]
    pub contest_ability: Option<SkillList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc: Option<IntExpr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success: Vec<Effect>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fail: Vec<Effect>,
    #[serde(rename = "contestTie", default, skip_serializing_if = "Option::is_none")]
    pub contest_tie: Option<ContestTie>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adv: Option<IntExpr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Effect>,
}

/// Modifiers that apply to one side's check roll.
struct CheckModifiers {
    bonus: Vec<String>,
    adv: Advantage,
    min_check: Option<i64>,
}

impl Check {
    pub fn new(ability: impl Into<SkillList>) -> Self {
        Self {
            ability: ability.into(),
            contest_ability: None,
            dc: None,
            success: Vec::new(),
            fail: Vec::new(),
            contest_tie: None,
            adv: None,
            meta: Vec::new(),
        }
    }

    pub(super) fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<CheckResult, AutomationError> {
        if ctx.target.is_none() {
            return Err(AutomationError::target(
                "Tried to make a check without a target! Make sure all Check effects are inside of a Target effect.",
            ));
        }
        if self.dc.is_some() && self.contest_ability.is_some() {
            return Err(AutomationError::automation(
                "Cannot specify both a check's DC and a contest ability.",
            ));
        }

        let explicit_adv = match &self.adv {
            Some(adv) => Some(ctx.parse_intexpression(adv).map_err(|_| {
                AutomationError::automation(format!(
                    "{} cannot be interpreted as an advantage type.",
                    quoted(&adv.source())
                ))
            })?),
            None => None,
        };

        let mut ability_list = ctx.args.get("ability", false);
        if ability_list.is_empty() {
            ability_list = self.ability.to_vec();
        }
        let auto_pass = ctx.args.last_bool("cpass", true);
        let auto_fail = ctx.args.last_bool("cfail", true);
        let target_mods = CheckModifiers {
            bonus: ctx.args.get("cb", true),
            adv: Advantage::reconcile(
                ctx.args.last_bool("cadv", true) || explicit_adv == Some(1),
                ctx.args.last_bool("cdis", true) || explicit_adv == Some(-1),
                false,
            ),
            min_check: ctx.args.last_parsed::<i64>("mc", true)?,
        };
        let hide = ctx.args.last_bool("h", false);

        if ability_list.is_empty() {
            return Err(AutomationError::automation("No ability passed to Check node!"));
        }
        let invalid: Vec<&str> = ability_list
            .iter()
            .filter(|a| skill_ability(a).is_none())
            .map(String::as_str)
            .collect();
        if !invalid.is_empty() {
            return Err(AutomationError::automation(format!(
                "Invalid skill names in check node: {}",
                invalid.join(", ")
            )));
        }

        let mut contest_list = ctx.args.get("selfability", false);
        if contest_list.is_empty() {
            contest_list = self.contest_ability.as_ref().map(SkillList::to_vec).unwrap_or_default();
        }
        let self_mods = CheckModifiers {
            bonus: ctx.args.get("selfcb", true),
            adv: Advantage::reconcile(
                ctx.args.last_bool("selfcadv", true) || explicit_adv == Some(1),
                ctx.args.last_bool("selfcdis", true) || explicit_adv == Some(-1),
                false,
            ),
            min_check: ctx.args.last_parsed::<i64>("selfmc", true)?,
        };

        let titles: Vec<String> = ability_list.iter().map(|a| camel_to_title(a)).collect();
        let mut skill_name = natural_join(&titles, "or");
        ctx.set_metavar("lastCheckRollTotal", 0);
        ctx.set_metavar("lastCheckNaturalRoll", 0);
        ctx.set_metavar("lastCheckAbility", skill_name.clone());
        ctx.set_metavar("lastCheckDidPass", Value::None);
        ctx.set_metavar("lastContestRollTotal", Value::None);
        ctx.set_metavar("lastContestNaturalRoll", Value::None);
        ctx.set_metavar("lastContestAbility", Value::None);
        ctx.set_metavar("lastContestDidTie", false);

        let mut check_dc = match &self.dc {
            Some(dc) => Some(ctx.parse_intexpression(dc).map_err(|_| {
                AutomationError::automation(format!(
                    "{} cannot be interpreted as a DC.",
                    quoted(&dc.source())
                ))
            })?),
            None => None,
        };
        if let Some(arg) = ctx.args.last("cdc", false) {
            check_dc = Some(maybe_mod(&arg, Some(check_dc.unwrap_or(0)))?);
        }
        if let Some(dc) = check_dc {
            ctx.meta_queue(format!("**Check DC**: {dc}"));
        }
        ctx.set_metavar("lastCheckDC", check_dc);

        let mut contest_skill_key = None;
        let mut contest_skill_name = None;
        let mut contest_roll = None;
        let mut contest_out = String::new();
        if self.contest_ability.is_some() {
            let (skill, key) = highest_skill(ctx.caster(), &contest_list).ok_or_else(|| {
                AutomationError::automation(format!(
                    "Invalid skill names in check node: {}",
                    contest_list.join(", ")
                ))
            })?;
            let name = camel_to_title(&key);
            let dice = check_dice(ctx, ctx.caster(), &skill, &key, self_mods);
            let roll = ctx.roll_str(&dice)?;
            ctx.set_metavar("lastContestRollTotal", roll.total);
            ctx.set_metavar("lastContestNaturalRoll", roll.natural());
            ctx.set_metavar("lastContestAbility", name.clone());
            contest_out = format!("**{name} Contest ({})**: {}", ctx.caster().name, roll.result());
            contest_skill_key = Some(key);
            contest_skill_name = Some(name);
            contest_roll = Some(roll);
        }

        let mut skill_key = None;
        let mut check_roll = None;
        let mut contest_did_tie = false;
        let is_success = if auto_pass {
            ctx.queue(format!("**{skill_name} Check:** Automatic success!"));
            Some(true)
        } else if auto_fail {
            ctx.queue(format!("**{skill_name} Check:** Automatic failure!"));
            Some(false)
        } else if let Some(target) = ctx.target_creature() {
            let target_name = target.name.clone();
            let (skill, key) = highest_skill(target, &ability_list)
                .ok_or_else(|| AutomationError::automation("No ability passed to Check node!"))?;
            skill_name = camel_to_title(&key);
            let dice = check_dice(ctx, target, &skill, &key, target_mods);
            let roll = ctx.roll_str(&dice)?;
            ctx.set_metavar("lastCheckRollTotal", roll.total);
            ctx.set_metavar("lastCheckNaturalRoll", roll.natural());
            ctx.set_metavar("lastCheckAbility", skill_name.clone());

            let mut success_str = "";
            let mut display_name = String::new();
            let mut is_success = None;
            if let Some(dc) = check_dc {
                is_success = Some(roll.total >= dc);
                success_str = if roll.total >= dc { "; Success!" } else { "; Failure!" };
            } else if let Some(contest) = &contest_roll {
                display_name = format!(" ({target_name})");
                if roll.total > contest.total {
                    is_success = Some(true);
                    success_str = "; Win!";
                    contest_out.push_str("; Lose!");
                } else if roll.total == contest.total {
                    success_str = "; Tie!";
                    contest_out.push_str("; Tie!");
                    ctx.set_metavar("lastContestDidTie", true);
                    contest_did_tie = true;
                    is_success = match self.contest_tie.unwrap_or_default() {
                        ContestTie::Fail => Some(false),
                        ContestTie::Success => Some(true),
                        ContestTie::Neither => None,
                    };
                } else {
                    is_success = Some(false);
                    success_str = "; Lose!";
                    contest_out.push_str("; Win!");
                }
                ctx.queue(std::mem::take(&mut contest_out));
            }

            let out = format!(
                "**{skill_name} Check{display_name}**: {}{success_str}",
                roll.result()
            );
            if hide {
                ctx.pm_invoker(out);
                ctx.queue(format!("**{skill_name} Check**: 1d20...{success_str}"));
            } else {
                ctx.queue(out);
            }
            skill_key = Some(key);
            check_roll = Some(roll);
            is_success
        } else {
            ctx.meta_queue(format!("{skill_name} Check"));
            Some(true)
        };

        let children = match is_success {
            Some(passed) => self.on_result(ctx, passed)?,
            None => Vec::new(),
        };

        Ok(CheckResult {
            skill_key,
            skill_name,
            check_roll,
            dc: check_dc,
            did_succeed: is_success,
            children,
            contest_skill_key,
            contest_skill_name,
            contest_roll,
            contest_did_tie,
        })
    }

    fn on_result(
        &self,
        ctx: &mut AutomationContext<'_>,
        passed: bool,
    ) -> Result<Vec<EffectResult>, AutomationError> {
        ctx.set_metavar("lastCheckDidPass", passed);
        if passed {
            run_children(&self.success, ctx)
        } else {
            run_children(&self.fail, ctx)
        }
    }

    pub(super) fn build_str(&self, sctx: &SummaryContext<'_>, names: &mut Names) -> String {
        let skill_name = skill_names(&self.ability);
        let mut out = if let Some(dc) = &self.dc {
            let dc = stringify_intexpr(names, &dc.source());
            format!("DC {} {skill_name} Check", intexpr_str(dc, false))
        } else if let Some(contest) = &self.contest_ability {
            format!("{skill_name} Check vs. caster's {} Check", skill_names(contest))
        } else {
            return format!("{skill_name} Check");
        };

        if let Some(adv) = &self.adv {
            match stringify_intexpr(names, &adv.source()) {
                Some(1) => out.push_str(", with advantage"),
                Some(-1) => out.push_str(", with disadvantage"),
                _ => {}
            }
        }
        let fail = build_child_str(&self.fail, sctx, names);
        if !fail.is_empty() {
            out.push_str(&format!(". Fail: {fail}"));
        }
        let success = build_child_str(&self.success, sctx, names);
        if !success.is_empty() {
            out.push_str(&format!(". Success: {success}"));
        }
        out
    }
}

fn skill_names(list: &SkillList) -> String {
    let titles: Vec<String> = list.to_vec().iter().map(|a| camel_to_title(a)).collect();
    natural_join(&titles, "or")
}

/// The creature's best skill among `keys`; the first listed wins ties.
fn highest_skill(creature: &Creature, keys: &[String]) -> Option<(SkillValue, String)> {
    let mut best: Option<(SkillValue, String)> = None;
    for key in keys {
        let Some(skill) = creature.skill(key) else {
            continue;
        };
        if best.as_ref().map_or(true, |(b, _)| skill.value > b.value) {
            best = Some((skill, key.clone()));
        }
    }
    best
}

/// The check roll for one creature: reliable talent and rerolls from its
/// options, bonuses and advantage from its active effects.
fn check_dice(
    ctx: &AutomationContext<'_>,
    creature: &Creature,
    skill: &SkillValue,
    skill_key: &str,
    mods: CheckModifiers,
) -> String {
    let CheckModifiers {
        mut bonus,
        mut adv,
        mut min_check,
    } = mods;

    let mut reroll = None;
    if let Some(options) = creature.options.as_ref().filter(|_| creature.is_character()) {
        if options.talent && skill.prof >= 1.0 && min_check.unwrap_or(0) == 0 {
            min_check = Some(10);
        }
        reroll = options.reroll;
    }

    if creature.is_combatant() && ctx.allow_target_ieffects {
        let base_key = skill_ability(skill_key).map(|a| a.key()).unwrap_or(skill_key);
        let effects: Vec<_> = creature.effects().iter().map(|e| &e.effects).collect();
        bonus.extend(effects.iter().filter_map(|e| e.check_bonus.clone()));
        let has = |set: &std::collections::BTreeSet<String>| {
            set.contains(skill_key) || set.contains(base_key)
        };
        let effect_adv = effects.iter().any(|e| has(&e.check_adv));
        let effect_dis = effects.iter().any(|e| has(&e.check_dis));
        adv = Advantage::reconcile(
            adv == Advantage::Advantage || effect_adv,
            adv == Advantage::Disadvantage || effect_dis,
            false,
        );
    }

    let mut dice = skill.d20(adv, reroll, min_check);
    if !bonus.is_empty() {
        dice = format!("{dice}+{}", bonus.join("+"));
    }
    dice
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::AutomationResult;
    use crate::testing::{automation, sample_fighter, sample_goblin, sample_wizard, Harness};
    use serde_json::json;

    fn first_check(result: &AutomationResult) -> &CheckResult {
        let EffectResult::Target(target) = &result.children[0] else {
            panic!("expected a target result");
        };
        match &target.iterations[0].results[0] {
            EffectResult::Check(check) => check,
            other => panic!("expected a check, got {other:?}"),
        }
    }

    #[test]
    fn test_highest_skill_prefers_first_on_ties() {
        let goblin = sample_goblin();
        let (_, key) = highest_skill(&goblin, &["acrobatics".into(), "stealth".into()]).unwrap();
        assert_eq!(key, "stealth");
        let (_, key) = highest_skill(&goblin, &["acrobatics".into(), "dexterity".into()]).unwrap();
        assert_eq!(key, "acrobatics");
    }

    #[test]
    fn test_check_against_dc() {
        let auto = automation(json!([{
            "type": "target",
            "target": "each",
            "effects": [{
                "type": "check",
                "ability": ["athletics", "acrobatics"],
                "dc": 12,
                "fail": [{"type": "text", "text": "Knocked prone."}]
            }]
        }]));
        let mut h = Harness::new(sample_wizard()).with_target(sample_goblin()).with_rolls(vec![9]);
        let result = h.run(&auto, "").unwrap();
        let check = first_check(&result);
        // goblin: athletics -1, acrobatics +2
        assert_eq!(check.skill_key.as_deref(), Some("acrobatics"));
        assert_eq!(check.did_succeed, Some(false));
        assert_eq!(check.check_roll.as_ref().unwrap().total, 11);
        assert!(result.output.field("Meta").unwrap().value.contains("**Check DC**: 12"));
    }

    #[test]
    fn test_contest_tie_defaults_to_fail() {
        let auto = automation(json!([{
            "type": "target",
            "target": "each",
            "effects": [{
                "type": "check",
                "ability": "athletics",
                "contestAbility": "athletics",
                "success": [{"type": "text", "text": "Escaped."}],
                "fail": [{"type": "text", "text": "Still grappled."}]
            }]
        }]));
        // fighter athletics +5, goblin athletics -1
        let mut h = Harness::new(sample_fighter())
            .with_target(sample_goblin())
            .with_rolls(vec![4, 10]);
        let result = h.run(&auto, "").unwrap();
        let check = first_check(&result);
        assert!(check.contest_did_tie);
        assert_eq!(check.did_succeed, Some(false));
        let field = &result.output.field("Goblin").unwrap().value;
        assert!(field.contains("**Athletics Contest (Roland)**"));
        assert!(field.contains("**Athletics Check (Goblin)**"));
    }

    #[test]
    fn test_dc_and_contest_are_exclusive() {
        let auto = automation(json!([{
            "type": "target",
            "target": "each",
            "effects": [{"type": "check", "ability": "athletics", "contestAbility": "athletics", "dc": 10}]
        }]));
        let mut h = Harness::new(sample_wizard()).with_target(sample_goblin());
        let result = h.run(&auto, "").unwrap();
        assert!(result
            .output
            .field("Meta")
            .unwrap()
            .value
            .contains("Cannot specify both a check's DC and a contest ability."));
    }

    #[test]
    fn test_invalid_skill_names() {
        let auto = automation(json!([{
            "type": "target",
            "target": "each",
            "effects": [{"type": "check", "ability": "juggling"}]
        }]));
        let mut h = Harness::new(sample_wizard()).with_target(sample_goblin());
        let result = h.run(&auto, "").unwrap();
        assert!(result
            .output
            .field("Meta")
            .unwrap()
            .value
            .contains("Invalid skill names in check node: juggling"));
    }

    #[test]
    fn test_build_str() {
        let auto = automation(json!([
            {"type": "target", "target": "each", "effects": [
                {"type": "check", "ability": ["sleightOfHand", "stealth"], "dc": 15}
            ]},
            {"type": "target", "target": "each", "effects": [
                {"type": "check", "ability": "athletics", "contestAbility": ["athletics", "acrobatics"], "adv": -1}
            ]}
        ]));
        let h = Harness::new(sample_wizard());
        assert_eq!(
            auto.build_str(h.caster(), &h.compendium),
            "DC 15 Sleight Of Hand or Stealth Check, Athletics Check vs. caster's Athletics or Acrobatics Check, with disadvantage."
        );
    }
}
