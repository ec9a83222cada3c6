use super::{build_child_str, run_children, Effect, SummaryContext};
use crate::automation::errors::AutomationError;
use crate::automation::results::{EffectResult, TargetIteration, TargetResult};
use crate::automation::runtime::AutomationContext;
use crate::script::Names;
use crate::world::TargetRef;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

/// Which targets a [`Target`] node runs its effects against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetSelector {
    /// 1-based position in the caller's target list.
    Index(i64),
    Keyword(TargetKeyword),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKeyword {
    All,
    Each,
    #[serde(rename = "self")]
    Caster,
    Parent,
    Children,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    HpAsc,
    HpDesc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub target: TargetSelector,
    pub effects: Vec<Effect>,
    #[serde(rename = "sortBy", default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<SortBy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Effect>,
}

const ACTION_ONLY: &str =
    "You can only use the `self`, `parent`, or `children` target on an IEffect button.";
const BUTTON_ONLY: &str = "You can only use the `self`, `each`, or numbered targets on an action.";

impl Target {
    pub fn new(target: TargetSelector, effects: Vec<Effect>) -> Self {
        Self {
            target,
            effects,
            sort_by: None,
            meta: Vec::new(),
        }
    }

    pub(super) fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<TargetResult, AutomationError> {
        let iterations = ctx.scoped(|ctx| {
            let mut iterations = match self.target {
                TargetSelector::Keyword(TargetKeyword::All | TargetKeyword::Each) => {
                    self.run_all(ctx)?
                }
                TargetSelector::Keyword(TargetKeyword::Caster) => {
                    let caster = ctx.caster_id();
                    self.run_one(ctx, TargetRef::Creature(caster), 0)?
                }
                TargetSelector::Keyword(TargetKeyword::Parent) => self.run_parent(ctx)?,
                TargetSelector::Keyword(TargetKeyword::Children) => self.run_children_target(ctx)?,
                TargetSelector::Index(index) => self.run_indexed(ctx, index)?,
            };
            // nothing to aim at: still run once so narration reaches Meta
            if iterations.is_empty() {
                iterations = self.run_one(ctx, TargetRef::Nobody, 0)?;
            }
            Ok(iterations)
        })?;
        Ok(TargetResult { iterations })
    }

    fn run_all(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<Vec<TargetIteration>, AutomationError> {
        if ctx.ieffect.is_some() {
            return Err(AutomationError::target(ACTION_ONLY));
        }
        let mut out = Vec::new();
        let targets = self.sorted_targets(ctx, ctx.targets.clone());
        for (index, target) in targets.into_iter().enumerate() {
            out.extend(self.run_one(ctx, target, index)?);
        }
        Ok(out)
    }

    /// The Nth target as the caller listed them; `sortBy` does not apply.
    fn run_indexed(
        &self,
        ctx: &mut AutomationContext<'_>,
        index: i64,
    ) -> Result<Vec<TargetIteration>, AutomationError> {
        if ctx.ieffect.is_some() {
            return Err(AutomationError::target(ACTION_ONLY));
        }
        let found = usize::try_from(index - 1)
            .ok()
            .and_then(|i| ctx.targets.get(i).cloned());
        match found {
            Some(target) => self.run_one(ctx, target, 0),
            None => Ok(Vec::new()),
        }
    }

    fn run_parent(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<Vec<TargetIteration>, AutomationError> {
        let ieffect = ctx.ieffect.ok_or_else(|| AutomationError::target(BUTTON_ONLY))?;
        let parent = ctx
            .encounter
            .get_effect(ieffect)
            .and_then(|e| e.parent)
            .filter(|p| ctx.encounter.get_effect(*p).is_some());
        match parent {
            Some(parent) => self.run_one(ctx, TargetRef::Creature(parent.combatant_id), 0),
            None => Ok(Vec::new()),
        }
    }

    fn run_children_target(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<Vec<TargetIteration>, AutomationError> {
        let ieffect = ctx.ieffect.ok_or_else(|| AutomationError::target(BUTTON_ONLY))?;
        let mut targets = Vec::new();
        for child in ctx.encounter.effect_children(ieffect) {
            if ctx.encounter.get_effect(child).is_none() {
                continue;
            }
            let target = TargetRef::Creature(child.combatant_id);
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        let mut out = Vec::new();
        for (index, target) in self.sorted_targets(ctx, targets).into_iter().enumerate() {
            out.extend(self.run_one(ctx, target, index)?);
        }
        Ok(out)
    }

    /// Targets with unknown HP sort last either way.
    fn sorted_targets(
        &self,
        ctx: &AutomationContext<'_>,
        mut targets: Vec<TargetRef>,
    ) -> Vec<TargetRef> {
        let hp_of = |t: &TargetRef| match t {
            TargetRef::Creature(id) => ctx.encounter.get(*id).and_then(|c| c.current_hp()),
            _ => None,
        };
        match self.sort_by {
            Some(SortBy::HpAsc) => targets.sort_by_key(|t| hp_of(t).unwrap_or(i64::MAX)),
            Some(SortBy::HpDesc) => targets.sort_by_key(|t| Reverse(hp_of(t).unwrap_or(i64::MIN))),
            None => {}
        }
        targets
    }

    fn run_one(
        &self,
        ctx: &mut AutomationContext<'_>,
        target: TargetRef,
        target_index: usize,
    ) -> Result<Vec<TargetIteration>, AutomationError> {
        ctx.set_target(target.clone());
        ctx.set_metavar("targetIndex", target_index as i64);
        ctx.set_metavar("targetNumber", target_index as i64 + 1);
        let is_simple = ctx.target_is_simple();

        Ok(self
            .run_effects(ctx, &target)?
            .into_iter()
            .enumerate()
            .map(|(i, results)| TargetIteration {
                target: target.clone(),
                is_simple,
                target_index,
                target_iteration: i as u32 + 1,
                results,
            })
            .collect())
    }

    /// Run the effects once per `-rr` iteration, closing the target's field.
    fn run_effects(
        &self,
        ctx: &mut AutomationContext<'_>,
        target: &TargetRef,
    ) -> Result<Vec<Vec<EffectResult>>, AutomationError> {
        let name = ctx.target_name();
        ctx.args.set_context(name.as_deref());
        let max_rr = i64::from(ctx.config.max_repeat_rolls);
        let rr = ctx.args.last_parsed::<i64>("rr", false)?.unwrap_or(1).min(max_rr);
        let in_target = *target != TargetRef::Nobody;
        let title = name.unwrap_or_default();

        ctx.set_metavar("targetIteration", 1);
        let mut results = Vec::new();

        if rr <= 1 {
            results.push(run_children(&self.effects, ctx)?);
            ctx.push_embed_field(&title, false, !in_target);
            return Ok(results);
        }

        let mut total_damage = 0;
        for iteration in 1..=rr {
            let iter_title = match self.effects.as_slice() {
                [only] => format!("{} {iteration}", only.kind_name()),
                _ => format!("Iteration {iteration}"),
            };
            ctx.set_metavar("targetIteration", iteration);
            if in_target {
                ctx.queue(format!("\n**__{iter_title}__**"));
            }
            let iteration_results = run_children(&self.effects, ctx)?;
            total_damage += iteration_results.iter().map(EffectResult::get_damage).sum::<i64>();
            results.push(iteration_results);
            if !in_target {
                ctx.push_embed_field(&iter_title, false, false);
            }
        }

        if in_target {
            if total_damage != 0 {
                ctx.queue(format!("\n**__Total Damage__**: {total_damage}"));
            }
            ctx.push_embed_field(&title, false, false);
        } else if total_damage != 0 {
            ctx.queue(total_damage.to_string());
            ctx.push_embed_field("Total Damage", true, false);
        }
        Ok(results)
    }

    pub(super) fn build_str(&self, sctx: &SummaryContext<'_>, names: &mut Names) -> String {
        build_child_str(&self.effects, sctx, names)
    }
}
