use super::{is_false, Effect, SummaryContext};
use crate::automation::errors::AutomationError;
use crate::automation::results::UseCounterResult;
use crate::automation::runtime::AutomationContext;
use crate::automation::utils::{intexpr_str, stringify_intexpr, IntExpr};
use crate::gamedata::{Compendium, Entity};
use crate::script::{Names, Value};
use crate::world::{Creature, CounterError, EntityKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// A compendium entity, referenced by id and type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityReference {
    pub id: i64,
    #[serde(rename = "typeId")]
    pub type_id: i64,
}

impl AbilityReference {
    pub fn key(&self) -> EntityKey {
        EntityKey {
            type_id: self.type_id,
            id: self.id,
        }
    }

    fn name(&self, compendium: &dyn Compendium) -> String {
        compendium
            .lookup(self.key())
            .map(|e| e.name().to_string())
            .unwrap_or_else(|| "Unknown Ability".to_string())
    }
}

impl From<EntityKey> for AbilityReference {
    fn from(key: EntityKey) -> Self {
        Self {
            id: key.id,
            type_id: key.type_id,
        }
    }
}

/// Spell slots of one level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpellSlotReference {
    pub slot: IntExpr,
}

/// The resource a [`UseCounter`] spends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CounterTarget {
    /// A custom counter, by name.
    Name(String),
    SpellSlot(SpellSlotReference),
    /// The counter best matching a feature or limited use.
    Ability(AbilityReference),
}

impl From<&str> for CounterTarget {
    fn from(name: &str) -> Self {
        CounterTarget::Name(name.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterErrorBehaviour {
    /// Narrate the failure and carry on.
    #[default]
    Warn,
    /// End the run.
    Raise,
}

/// Spend (or, with a negative amount, restore) a counter or spell slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UseCounter {
    pub counter: CounterTarget,
    pub amount: IntExpr,
    /// Clip to the counter's bounds instead of failing.
    #[serde(rename = "allowOverflow", default, skip_serializing_if = "is_false")]
    pub allow_overflow: bool,
    #[serde(rename = "errorBehaviour", default)]
    pub error_behaviour: CounterErrorBehaviour,
    /// Ignore `-amt`.
    #[serde(rename = "fixedValue", default, skip_serializing_if = "is_false")]
    pub fixed_value: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Effect>,
}

impl UseCounter {
    pub fn new(counter: impl Into<CounterTarget>, amount: impl Into<IntExpr>) -> Self {
        Self {
            counter: counter.into(),
            amount: amount.into(),
            allow_overflow: false,
            error_behaviour: CounterErrorBehaviour::default(),
            fixed_value: false,
            meta: Vec::new(),
        }
    }

    pub fn with_overflow(mut self) -> Self {
        self.allow_overflow = true;
        self
    }

    pub fn with_error_behaviour(mut self, behaviour: CounterErrorBehaviour) -> Self {
        self.error_behaviour = behaviour;
        self
    }

    pub(super) fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<UseCounterResult, AutomationError> {
        ctx.set_metavar("lastCounterName", Value::None);
        ctx.set_metavar("lastCounterRemaining", 0);
        ctx.set_metavar("lastCounterUsedAmount", 0);
        ctx.set_metavar("lastCounterRequestedAmount", 0);

        let amt = ctx.args.last_parsed::<i64>("amt", true).ok().flatten();
        let ignore = ctx.args.last_bool("i", false);

        let amount = match amt.filter(|a| !self.fixed_value && *a != 0) {
            Some(amt) => amt,
            None => ctx.parse_intexpression(&self.amount).map_err(|_| {
                AutomationError::automation(format!(
                    "'{}' cannot be interpreted as an amount (in Use Counter)",
                    self.amount
                ))
            })?,
        };
        ctx.set_metavar("lastCounterRequestedAmount", amount);

        let result = match self.use_counter(ctx, amount, ignore) {
            Ok(result) => result,
            Err(e) => {
                debug!(error = %e, "Could not use counter");
                if self.error_behaviour == CounterErrorBehaviour::Raise {
                    return Err(AutomationError::StopExecution(format!(
                        "Could not use counter: {e}"
                    )));
                }
                ctx.meta_queue(format!("**Warning**: Could not use counter - {e}"));
                UseCounterResult {
                    requested_amount: amount,
                    skipped: true,
                    ..Default::default()
                }
            }
        };

        ctx.set_metavar("lastCounterName", Value::from(result.counter_name.clone()));
        ctx.set_metavar("lastCounterRemaining", result.counter_remaining);
        ctx.set_metavar("lastCounterUsedAmount", result.used_amount);
        Ok(result)
    }

    fn use_counter(
        &self,
        ctx: &mut AutomationContext<'_>,
        amount: i64,
        ignore: bool,
    ) -> Result<UseCounterResult, AutomationError> {
        let name = match &self.counter {
            CounterTarget::SpellSlot(slot) => return self.use_spell_slot(ctx, slot, amount, ignore),
            CounterTarget::Name(name) => name.clone(),
            CounterTarget::Ability(reference) => reference.name(ctx.compendium),
        };
        if ignore {
            return Ok(UseCounterResult {
                counter_name: Some(name),
                requested_amount: amount,
                skipped: true,
                ..Default::default()
            });
        }

        if !ctx.caster().is_character() {
            return Err(AutomationError::NoCounterFound(
                "The caster does not have custom counters.".to_string(),
            ));
        }
        let index = match &self.counter {
            CounterTarget::Ability(reference) => {
                discover_counter(*reference, ctx.caster(), ctx.compendium)?
            }
            _ => ctx.caster().counter_index(&name).ok_or_else(|| {
                AutomationError::NoCounterFound(format!(
                    "No counter with the name '{name}' was found."
                ))
            })?,
        };
        self.use_custom_counter(ctx, index, amount)
    }

    fn use_spell_slot(
        &self,
        ctx: &mut AutomationContext<'_>,
        slot: &SpellSlotReference,
        amount: i64,
        ignore: bool,
    ) -> Result<UseCounterResult, AutomationError> {
        let slot_level = ctx.parse_intexpression(&slot.slot)?;
        let level = ctx.args.last_parsed::<i64>("l", false)?.unwrap_or(slot_level);
        let nopact = ctx.args.last_bool("nopact", false);
        if ignore {
            return Ok(UseCounterResult {
                counter_name: Some(level.to_string()),
                requested_amount: amount,
                skipped: true,
                ..Default::default()
            });
        }

        let slot_level = u8::try_from(level).map_err(|_| CounterError::InvalidSpellLevel)?;
        ctx.caster_needs_commit = true;
        let spellbook = &mut ctx.caster_mut().spellbook;
        let old_value = spellbook.get_slots(slot_level);
        let target_value = old_value - amount;
        let new_value = if self.allow_overflow {
            target_value.min(spellbook.get_max_slots(slot_level)).max(0)
        } else {
            target_value
        };

        spellbook.set_slots(slot_level, new_value, !nopact)?;
        let slots_str = spellbook.slots_str(slot_level);
        ctx.spell_level_override = Some(level);

        let delta = new_value - old_value;
        let overflow = (new_value - target_value).abs();
        ctx.postflight_queue_field("Spell Slots", usage_str(slots_str, delta, overflow), false);

        Ok(UseCounterResult {
            counter_name: Some(level.to_string()),
            counter_remaining: new_value,
            used_amount: old_value - new_value,
            requested_amount: amount,
            skipped: false,
        })
    }

    fn use_custom_counter(
        &self,
        ctx: &mut AutomationContext<'_>,
        index: usize,
        amount: i64,
    ) -> Result<UseCounterResult, AutomationError> {
        ctx.caster_needs_commit = true;
        let caster = ctx.caster();
        let bounds = caster.counter_bounds(index);
        let names = caster.names();

        let counter = &mut ctx.caster_mut().counters[index];
        let old_value = counter.value;
        let target_value = old_value - amount;
        let final_value = counter.set_with_bounds(target_value, !self.allow_overflow, bounds)?;
        let name = counter.name.clone();
        let display = counter.display(&names);

        let delta = final_value - old_value;
        let overflow = (final_value - target_value).abs();
        ctx.postflight_queue_field(name.clone(), usage_str(display, delta, overflow), false);

        Ok(UseCounterResult {
            counter_name: Some(name),
            counter_remaining: final_value,
            used_amount: -delta,
            requested_amount: amount,
            skipped: false,
        })
    }

    pub(super) fn build_str(&self, sctx: &SummaryContext<'_>, names: &mut Names) -> String {
        let amount = stringify_intexpr(names, &self.amount.source());
        let amount_value = Value::from(amount);

        let label = counter_label(&self.counter, sctx.compendium);
        names.insert("lastCounterName".into(), Value::str(label));
        names.insert("lastCounterRequestedAmount".into(), amount_value.clone());
        names.insert("lastCounterUsedAmount".into(), amount_value);

        let plural = amount.map_or(true, |a| a.abs() != 1);
        let charges = if plural { "charges" } else { "charge" };
        let counter_name = match &self.counter {
            CounterTarget::Name(name) => format!("{charges} of {name}"),
            CounterTarget::SpellSlot(slot) => {
                let level = intexpr_str(stringify_intexpr(names, &slot.slot.source()), false);
                let slots = if plural { "slots" } else { "slot" };
                format!("level {level} spell {slots}")
            }
            CounterTarget::Ability(reference) => {
                format!("{charges} of {}", reference.name(sctx.compendium))
            }
        };

        match amount {
            Some(a) if a < 0 => format!("restores {} {counter_name}", -a),
            _ => format!("uses {} {counter_name}", intexpr_str(amount, false)),
        }
    }
}

/// `lastCounterName` for a counter that was not actually used.
fn counter_label(counter: &CounterTarget, compendium: &dyn Compendium) -> String {
    match counter {
        CounterTarget::Name(name) => name.clone(),
        CounterTarget::SpellSlot(slot) => slot.slot.source(),
        CounterTarget::Ability(reference) => reference.name(compendium),
    }
}

/// `3/5 (-1)`, plus an overflow line.
fn usage_str(display: String, delta: i64, overflow: i64) -> String {
    let mut out = display;
    if delta != 0 {
        out.push_str(&format!(" ({delta:+})"));
    }
    if overflow != 0 {
        out.push_str(&format!("\n({overflow} overflow)"));
    }
    out
}

/// Find the caster's counter that best matches a feature or limited use.
///
/// In order: a counter synced from the limited use itself, one named after
/// it, one granted by the feature, one named after the feature or a limited
/// use it grants, one granted by a feature sharing the feature's root (the
/// shallowest wins), and finally one named after a parent feature or a
/// limited use a parent grants.
fn discover_counter(
    reference: AbilityReference,
    caster: &Creature,
    compendium: &dyn Compendium,
) -> Result<usize, AutomationError> {
    let not_found = |msg: String| AutomationError::NoCounterFound(msg);
    let mut entity = compendium
        .lookup_entity(reference.key())
        .ok_or_else(|| not_found("Invalid ability specified in AbilityReference!".to_string()))?;
    if !entity.has_counter_info() {
        return Err(not_found(format!("{} has no custom counter information.", entity.name)));
    }

    let by_name = |name: &str| caster.counters.iter().position(|c| c.name == name);

    if entity.is_limited_use() {
        if let Some(i) = caster.counters.iter().position(|c| c.live_id == Some(entity.key)) {
            return Ok(i);
        }
        if let Some(i) = by_name(&entity.name) {
            return Ok(i);
        }
        entity = entity
            .parent
            .and_then(|p| compendium.lookup_entity(p))
            .ok_or_else(|| {
                not_found(format!(
                    "Could not find an appropriate counter for {}.",
                    entity.name
                ))
            })?;
    }

    if let Some(i) = caster.counters.iter().position(|c| c.source_feature == Some(entity.key)) {
        return Ok(i);
    }
    if let Some(i) = by_name(&entity.name) {
        return Ok(i);
    }
    if let Some(i) = granted_counter(entity, caster, compendium) {
        return Ok(i);
    }

    if let Some((root, _)) = compendium.root_of(entity.key) {
        let shared_root = caster
            .counters
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let (cc_root, depth) = compendium.root_of(c.source_feature?)?;
                (cc_root.key == root.key).then_some((i, depth))
            })
            .min_by_key(|(_, depth)| *depth);
        if let Some((i, _)) = shared_root {
            return Ok(i);
        }
    }

    let mut seen = BTreeSet::from([entity.key]);
    let mut current = entity;
    while let Some(parent) = current.parent.and_then(|p| compendium.lookup_entity(p)) {
        if !seen.insert(parent.key) {
            break;
        }
        if let Some(i) = by_name(&parent.name) {
            return Ok(i);
        }
        if let Some(i) = granted_counter(parent, caster, compendium) {
            return Ok(i);
        }
        current = parent;
    }

    Err(not_found(format!("Could not find an appropriate counter for {}.", entity.name)))
}

/// A counter named after a limited use `entity` grants.
fn granted_counter(
    entity: &Entity,
    caster: &Creature,
    compendium: &dyn Compendium,
) -> Option<usize> {
    entity
        .limited_use
        .iter()
        .filter_map(|key| compendium.lookup_entity(*key))
        .find_map(|lu| caster.counters.iter().position(|c| c.name == lu.name))
}
