//! The effect tree: one node type per file, joined in the [`Effect`] enum.
//!
//! Every consumer (serialization, execution, preflight, summary strings)
//! matches exhaustively on [`Effect`], so adding a node type means adding a
//! variant and a file here.

mod attack;
mod castspell;
mod check;
mod condition;
mod counter;
mod damage;
mod ieffect;
mod remove_ieffect;
mod roll;
mod save;
mod target;
mod temphp;
mod text;
mod variable;

pub use attack::Attack;
pub use castspell::CastSpell;
pub use check::{Check, ContestTie, SkillList};
pub use condition::{Condition, ErrorBehaviour};
pub use counter::{
    AbilityReference, CounterErrorBehaviour, CounterTarget, SpellSlotReference, UseCounter,
};
pub use damage::Damage;
pub use ieffect::{
    AttackInteractionTemplate, ButtonInteractionTemplate, IEffect, IEffectEffects,
    InteractionDefaults, PassiveEffectsTemplate,
};
pub use remove_ieffect::{RemoveIEffect, RemoveParent};
pub use roll::Roll;
pub use save::Save;
pub use target::{SortBy, Target, TargetSelector};
pub use temphp::TempHp;
pub use text::{Text, TextSource};
pub use variable::SetVariable;

use super::errors::AutomationError;
use super::results::EffectResult;
use super::runtime::AutomationContext;
use crate::gamedata::{can_access, Compendium, EntitlementProvider, Lookup};
use crate::script::Names;
use crate::world::Creature;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One node of an automation tree, tagged by `type` in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Effect {
    #[serde(rename = "target")]
    Target(Target),
    #[serde(rename = "attack")]
    Attack(Attack),
    #[serde(rename = "save")]
    Save(Save),
    #[serde(rename = "check")]
    Check(Check),
    #[serde(rename = "damage")]
    Damage(Damage),
    #[serde(rename = "temphp")]
    TempHp(TempHp),
    #[serde(rename = "ieffect2", alias = "ieffect")]
    IEffect(IEffect),
    #[serde(rename = "remove_ieffect")]
    RemoveIEffect(RemoveIEffect),
    #[serde(rename = "roll")]
    Roll(Roll),
    #[serde(rename = "text")]
    Text(Text),
    #[serde(rename = "variable")]
    SetVariable(SetVariable),
    #[serde(rename = "condition")]
    Condition(Condition),
    #[serde(rename = "counter")]
    UseCounter(UseCounter),
    #[serde(rename = "spell")]
    CastSpell(CastSpell),
}

impl Effect {
    /// The `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Effect::Target(_) => "target",
            Effect::Attack(_) => "attack",
            Effect::Save(_) => "save",
            Effect::Check(_) => "check",
            Effect::Damage(_) => "damage",
            Effect::TempHp(_) => "temphp",
            Effect::IEffect(_) => "ieffect2",
            Effect::RemoveIEffect(_) => "remove_ieffect",
            Effect::Roll(_) => "roll",
            Effect::Text(_) => "text",
            Effect::SetVariable(_) => "variable",
            Effect::Condition(_) => "condition",
            Effect::UseCounter(_) => "counter",
            Effect::CastSpell(_) => "spell",
        }
    }

    /// Display name of the node kind, used to title repeated iterations.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Effect::Target(_) => "Target",
            Effect::Attack(_) => "Attack",
            Effect::Save(_) => "Save",
            Effect::Check(_) => "Check",
            Effect::Damage(_) => "Damage",
            Effect::TempHp(_) => "TempHP",
            Effect::IEffect(_) => "IEffect",
            Effect::RemoveIEffect(_) => "RemoveIEffect",
            Effect::Roll(_) => "Roll",
            Effect::Text(_) => "Text",
            Effect::SetVariable(_) => "SetVariable",
            Effect::Condition(_) => "Condition",
            Effect::UseCounter(_) => "UseCounter",
            Effect::CastSpell(_) => "CastSpell",
        }
    }

    /// Legacy pre-processing children, run before the node itself.
    pub fn meta(&self) -> &[Effect] {
        match self {
            Effect::Target(e) => &e.meta,
            Effect::Attack(e) => &e.meta,
            Effect::Save(e) => &e.meta,
            Effect::Check(e) => &e.meta,
            Effect::Damage(e) => &e.meta,
            Effect::TempHp(e) => &e.meta,
            Effect::IEffect(e) => &e.meta,
            Effect::RemoveIEffect(e) => &e.meta,
            Effect::Roll(e) => &e.meta,
            Effect::Text(e) => &e.meta,
            Effect::SetVariable(e) => &e.meta,
            Effect::Condition(e) => &e.meta,
            Effect::UseCounter(e) => &e.meta,
            Effect::CastSpell(e) => &e.meta,
        }
    }

    /// Every nested effect: the meta effects, then the node's own branches.
    pub fn children(&self) -> Vec<&Effect> {
        let own: Vec<&Effect> = match self {
            Effect::Target(e) => e.effects.iter().collect(),
            Effect::Attack(e) => e.hit.iter().chain(&e.miss).collect(),
            Effect::Save(e) => e.fail.iter().chain(&e.success).collect(),
            Effect::Check(e) => e.fail.iter().chain(&e.success).collect(),
            Effect::Condition(e) => e.on_false.iter().chain(&e.on_true).collect(),
            Effect::Damage(_)
            | Effect::TempHp(_)
            | Effect::IEffect(_)
            | Effect::RemoveIEffect(_)
            | Effect::Roll(_)
            | Effect::Text(_)
            | Effect::SetVariable(_)
            | Effect::UseCounter(_)
            | Effect::CastSpell(_) => Vec::new(),
        };
        self.meta().iter().chain(own).collect()
    }

    /// Run this node against the context. `Ok(None)` means the node decided
    /// there was nothing to do.
    pub fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<Option<EffectResult>, AutomationError> {
        debug!(effect = self.type_name(), "Running {}", self.type_name());
        for meta in self.meta() {
            meta.run(ctx)?;
        }
        let result = match self {
            Effect::Target(e) => Some(EffectResult::Target(e.run(ctx)?)),
            Effect::Attack(e) => Some(EffectResult::Attack(e.run(ctx)?)),
            Effect::Save(e) => Some(EffectResult::Save(e.run(ctx)?)),
            Effect::Check(e) => Some(EffectResult::Check(e.run(ctx)?)),
            Effect::Damage(e) => e.run(ctx)?.map(EffectResult::Damage),
            Effect::TempHp(e) => e.run(ctx)?.map(EffectResult::TempHp),
            Effect::IEffect(e) => Some(EffectResult::IEffect(e.run(ctx)?)),
            Effect::RemoveIEffect(e) => Some(EffectResult::RemoveIEffect(e.run(ctx)?)),
            Effect::Roll(e) => Some(EffectResult::Roll(e.run(ctx)?)),
            Effect::Text(e) => e.run(ctx)?.map(EffectResult::Text),
            Effect::SetVariable(e) => Some(EffectResult::SetVariable(e.run(ctx)?)),
            Effect::Condition(e) => Some(EffectResult::Condition(e.run(ctx)?)),
            Effect::UseCounter(e) => Some(EffectResult::UseCounter(e.run(ctx)?)),
            Effect::CastSpell(e) => Some(EffectResult::CastSpell(e.run(ctx)?)),
        };
        Ok(result)
    }

    /// Check entitlements for everything this subtree references, before
    /// anything runs.
    pub fn preflight<'a>(
        &'a self,
        pctx: &'a PreflightContext<'a>,
    ) -> BoxFuture<'a, Result<(), AutomationError>> {
        async move {
            match self {
                Effect::CastSpell(e) => e.preflight(pctx).await?,
                Effect::Text(e) => e.preflight(pctx).await?,
                _ => {}
            }
            for child in self.children() {
                child.preflight(pctx).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Human summary of this node. `names` is the summary evaluator's scope;
    /// nodes bind the variables later nodes would see.
    pub fn build_str(
        &self,
        caster: &Creature,
        compendium: &dyn Compendium,
        names: &mut Names,
    ) -> String {
        for meta in self.meta() {
            meta.build_str(caster, compendium, names);
        }
        let sctx = SummaryContext { caster, compendium };
        match self {
            Effect::Target(e) => e.build_str(&sctx, names),
            Effect::Attack(e) => e.build_str(&sctx, names),
            Effect::Save(e) => e.build_str(&sctx, names),
            Effect::Check(e) => e.build_str(&sctx, names),
            Effect::Damage(e) => e.build_str(names),
            Effect::TempHp(e) => e.build_str(names),
            Effect::IEffect(e) => e.build_str(),
            Effect::RemoveIEffect(e) => e.build_str(),
            Effect::Roll(e) => e.build_str(names),
            Effect::Text(_) => String::new(),
            Effect::SetVariable(e) => e.build_str(names),
            Effect::Condition(e) => e.build_str(&sctx, names),
            Effect::UseCounter(e) => e.build_str(&sctx, names),
            Effect::CastSpell(e) => e.build_str(&sctx),
        }
    }
}

/// Run a list of child effects. Recoverable errors are narrated in Meta and
/// the remaining siblings still run; anything else ends the run.
pub fn run_children(
    effects: &[Effect],
    ctx: &mut AutomationContext<'_>,
) -> Result<Vec<EffectResult>, AutomationError> {
    let mut results = Vec::with_capacity(effects.len());
    for effect in effects {
        match effect.run(ctx) {
            Ok(Some(result)) => results.push(result),
            Ok(None) => {}
            Err(e) if e.is_recoverable() => {
                warn!(effect = effect.type_name(), error = %e, "Effect failed");
                ctx.meta_queue(format!("**Error**: {e}"));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(results)
}

/// What summary builders may consult besides the evaluator scope.
pub(crate) struct SummaryContext<'a> {
    pub caster: &'a Creature,
    pub compendium: &'a dyn Compendium,
}

/// Summaries of `effects`, skipping empty ones, joined with `, `.
pub(crate) fn build_child_str(
    effects: &[Effect],
    sctx: &SummaryContext<'_>,
    names: &mut Names,
) -> String {
    effects
        .iter()
        .map(|e| e.build_str(sctx.caster, sctx.compendium, names))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Preflight
// ============================================================================

/// Read-only state for the entitlement pass that precedes a run.
#[derive(Clone, Copy)]
pub struct PreflightContext<'a> {
    pub compendium: &'a dyn Compendium,
    pub entitlements: &'a dyn EntitlementProvider,
    pub user_id: &'a str,
    /// Set while checking the effects of a spell cast by another node.
    pub in_spell: bool,
}

impl<'a> PreflightContext<'a> {
    pub fn new(
        compendium: &'a dyn Compendium,
        entitlements: &'a dyn EntitlementProvider,
        user_id: &'a str,
    ) -> Self {
        Self {
            compendium,
            entitlements,
            user_id,
            in_spell: false,
        }
    }

    /// Fail with [`AutomationError::RequiresLicense`] unless the user may
    /// use `entity`.
    pub async fn require_access(&self, entity: Lookup<'_>) -> Result<(), AutomationError> {
        let entity_type = entity.entity_type();
        let available = self.entitlements.accessible_entities(self.user_id, entity_type).await;
        debug!(
            entity = entity.name(),
            entity_type,
            linked = available.is_some(),
            "Checking entitlement"
        );
        if can_access(entity.sourced(), available.as_ref()) {
            Ok(())
        } else {
            Err(AutomationError::RequiresLicense {
                name: entity.name().to_string(),
                entity_type: entity_type.to_string(),
            })
        }
    }
}

/// Serde helper for `#[serde(skip_serializing_if)]`.
pub(crate) fn is_false(b: &bool) -> bool {
    !*b
}
