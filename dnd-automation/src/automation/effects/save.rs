use super::{build_child_str, run_children, Effect, SummaryContext};
use crate::automation::errors::{quoted, AutomationError};
use crate::automation::results::{EffectResult, SaveResult};
use crate::automation::runtime::AutomationContext;
use crate::automation::utils::{intexpr_str, maybe_mod, stringify_intexpr, IntExpr};
use crate::dice::Advantage;
use crate::script::Names;
use crate::world::{camel_to_title, Ability};
use serde::{Deserialize, Serialize};

/// A saving throw made by the current target against the caster's DC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Save {
    /// Ability name or prefix, e.g. `dex`.
    pub stat: String,
    #[serde(default)]
    pub fail: Vec<Effect>,
    #[serde(default)]
    pub success: Vec<Effect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc: Option<IntExpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adv: Option<Advantage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Effect>,
}

impl Save {
    pub fn new(stat: impl Into<String>, fail: Vec<Effect>, success: Vec<Effect>) -> Self {
        Self {
            stat: stat.into(),
            fail,
            success,
            dc: None,
            adv: None,
            meta: Vec::new(),
        }
    }

    pub fn with_dc(mut self, dc: impl Into<IntExpr>) -> Self {
        self.dc = Some(dc.into());
        self
    }

    pub(super) fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<SaveResult, AutomationError> {
        if ctx.target.is_none() {
            return Err(AutomationError::target(
                "Tried to make a save without a target! Make sure all Save effects are inside of a Target effect.",
            ));
        }

        let save = ctx.args.last("save", false).unwrap_or_else(|| self.stat.clone());
        let sb = ctx.args.get("sb", true);
        let auto_pass = ctx.args.last_bool("pass", true);
        let auto_fail = ctx.args.last_bool("fail", true);
        let hide = ctx.args.last_bool("h", false);

        let node_dc = match &self.dc {
            Some(dc) => Some(ctx.parse_intexpression(dc).map_err(|_| {
                AutomationError::automation(format!(
                    "{} cannot be interpreted as a DC.",
                    quoted(&dc.source())
                ))
            })?),
            None => None,
        };

        // -dc > node dc > cast override > spellbook
        let mut dc = ctx.caster().spellbook.dc;
        if let Some(node_dc) = node_dc.filter(|d| *d != 0) {
            dc = Some(node_dc);
        } else if ctx.dc_override.is_some() {
            dc = ctx.dc_override;
        }
        if let Some(arg) = ctx.args.last("dc", false) {
            dc = Some(maybe_mod(&arg, dc)?);
        }
        let dc = dc.ok_or_else(|| {
            AutomationError::NoSpellDc(
                "No spell save DC found. Use the `-dc` argument to specify one!".into(),
            )
        })?;

        let ability = Ability::from_save_fuzzy(&save)
            .ok_or_else(|| AutomationError::InvalidSaveType("Invalid save type.".into()))?;

        let abbr = ability.abbreviation().to_lowercase();
        let effects = ctx.target_effects();
        let effect_adv = effects.iter().any(|e| e.save_adv.contains(&abbr));
        let effect_dis = effects.iter().any(|e| e.save_dis.contains(&abbr));
        let adv = Advantage::reconcile(
            ctx.args.last_bool("sadv", true)
                || effect_adv
                || self.adv == Some(Advantage::Advantage),
            ctx.args.last_bool("sdis", true)
                || effect_dis
                || self.adv == Some(Advantage::Disadvantage),
            false,
        );

        ctx.set_metavar("lastSaveRollTotal", 0);
        ctx.set_metavar("lastSaveNaturalRoll", 0);
        ctx.set_metavar("lastSaveDC", dc);
        ctx.set_metavar("lastSaveAbility", camel_to_title(ability.key()));
        ctx.meta_queue(format!("**DC**: {dc}"));

        let mut save_roll = None;
        let blurb = format!("{} Save", ability.abbreviation());
        let is_success = if ctx.target_is_simple() {
            // nothing to roll for; narrate and assume the worst
            ctx.meta_queue(blurb);
            false
        } else if auto_pass {
            ctx.queue(format!("**{blurb}:** Automatic success!"));
            true
        } else if auto_fail {
            ctx.queue(format!("**{blurb}:** Automatic failure!"));
            false
        } else {
            let dice = ctx.target_save_dice(ability, adv, sb)?;
            let roll = ctx.roll_str(&dice)?;
            let is_success = roll.total >= dc;
            ctx.set_metavar("lastSaveRollTotal", roll.total);
            ctx.set_metavar("lastSaveNaturalRoll", roll.natural());

            let success_str = if is_success { "; Success!" } else { "; Failure!" };
            let out = format!("**{blurb}**: {}{success_str}", roll.result());
            if hide {
                ctx.pm_invoker(out);
                ctx.queue(format!("**{blurb}**: 1d20...{success_str}"));
            } else {
                ctx.queue(out);
            }
            save_roll = Some(roll);
            is_success
        };

        let children = ctx.scoped(|ctx| {
            ctx.in_save = true;
            self.on_result(ctx, is_success)
        })?;

        Ok(SaveResult {
            dc,
            ability,
            save_roll,
            adv,
            did_save: is_success,
            children,
        })
    }

    fn on_result(
        &self,
        ctx: &mut AutomationContext<'_>,
        passed: bool,
    ) -> Result<Vec<EffectResult>, AutomationError> {
        ctx.set_metavar("lastSaveDidPass", passed);
        if passed {
            run_children(&self.success, ctx)
        } else {
            run_children(&self.fail, ctx)
        }
    }

    pub(super) fn build_str(&self, sctx: &SummaryContext<'_>, names: &mut Names) -> String {
        let dc = match &self.dc {
            Some(dc) => stringify_intexpr(names, &dc.source()),
            None => sctx.caster.spellbook.dc,
        };
        let stat: String = self.stat.chars().take(3).collect();
        let mut out = format!("DC {} {} Save", intexpr_str(dc, false), stat.to_uppercase());
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

#[cfg(test)]
mod tests {
    use crate::automation::results::{EffectResult, SaveResult};
    use crate::automation::AutomationResult;
    use crate::testing::{automation, sample_goblin, sample_wizard, Harness};
    use serde_json::json;

    fn first_save(result: &AutomationResult) -> &SaveResult {
        let EffectResult::Target(target) = &result.children[0] else {
            panic!("expected a target result");
        };
        match &target.iterations[0].results[0] {
            EffectResult::Save(save) => save,
            other => panic!("expected a save, got {other:?}"),
        }
    }

    fn dex_save() -> crate::automation::Automation {
        automation(json!([{
            "type": "target",
            "target": "each",
            "effects": [{
                "type": "save",
                "stat": "dex",
                "fail": [{"type": "damage", "damage": "2d6"}],
                "success": [{"type": "damage", "damage": "(2d6)/2"}]
            }]
        }]))
    }

    #[test]
    fn test_failed_save_runs_fail_branch() {
        let mut h = Harness::new(sample_wizard())
            .with_target(sample_goblin())
            .with_rolls(vec![5, 2]);
        let result = h.run(&dex_save(), "").unwrap();
        let save = first_save(&result);
        assert_eq!(save.dc, 14);
        assert!(!save.did_save);
        assert_eq!(result.get_damage(), 4);
        assert!(result.output.field("Meta").unwrap().value.contains("**DC**: 14"));
        assert!(result.output.field("Goblin").unwrap().value.contains("; Failure!"));
    }

    #[test]
    fn test_dc_argument_modifies_base() {
        let mut h = Harness::new(sample_wizard())
            .with_target(sample_goblin())
            .with_rolls(vec![12, 2]);
        let result = h.run(&dex_save(), "-dc +2").unwrap();
        let save = first_save(&result);
        assert_eq!(save.dc, 16);
        // 12 + 2 dex misses 16
        assert!(!save.did_save);

        let mut h = Harness::new(sample_wizard())
            .with_target(sample_goblin())
            .with_rolls(vec![12, 2]);
        let result = h.run(&dex_save(), "-dc 10").unwrap();
        assert!(first_save(&result).did_save);
    }

    #[test]
    fn test_auto_pass_and_simple_targets() {
        let mut h = Harness::new(sample_wizard())
            .with_target(sample_goblin())
            .with_rolls(vec![1, 2]);
        let result = h.run(&dex_save(), "-pass").unwrap();
        let save = first_save(&result);
        assert!(save.did_save);
        assert!(save.save_roll.is_none());

        let mut h = Harness::new(sample_wizard()).with_rolls(vec![2]);
        let result = h.run(&dex_save(), "-t Dummy").unwrap();
        let save = first_save(&result);
        assert!(!save.did_save);
        assert!(result.output.field("Meta").unwrap().value.contains("DEX Save"));
    }

    #[test]
    fn test_invalid_stat_is_reported() {
        let auto = automation(json!([{
            "type": "target",
            "target": "each",
            "effects": [{"type": "save", "stat": "luck", "fail": [], "success": []}]
        }]));
        let mut h = Harness::new(sample_wizard()).with_target(sample_goblin());
        let result = h.run(&auto, "").unwrap();
        assert!(result.output.field("Meta").unwrap().value.contains("Invalid save type."));
    }

    #[test]
    fn test_build_str() {
        let h = Harness::new(sample_wizard());
        assert_eq!(
            dex_save().build_str(h.caster(), &h.compendium),
            "DC 14 DEX Save. Fail: 2d6 damage. Success: (2d6)/2 damage."
        );
    }
}
