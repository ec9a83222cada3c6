//! D&D 5e creatures and the encounter they live in.
//!
//! Creatures expose the stat block automation reads (abilities, skills,
//! saves, AC, hit points, resistances, spellbook, custom counters). Creatures
//! taking part in initiative also carry combatant state with their active
//! effects. The [`Encounter`] owns every creature and is the arena automation
//! mutates.

use crate::dice::Advantage;
use crate::initiative::{EffectId, EffectRef, InitiativeEffect};
use crate::resistance::{Resistance, Resistances};
use crate::script::{self, Names, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for creatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CreatureId(pub Uuid);

impl CreatureId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CreatureId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CreatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A compendium key: (type id, entity id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub type_id: i64,
    pub id: i64,
}

// ============================================================================
// Ability Scores
// ============================================================================

/// The six ability scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ability {
    Strength,
    Dexterity,
    Constitution,
    Intelligence,
    Wisdom,
    Charisma,
}

impl Ability {
    pub fn abbreviation(&self) -> &'static str {
        match self {
            Ability::Strength => "STR",
            Ability::Dexterity => "DEX",
            Ability::Constitution => "CON",
            Ability::Intelligence => "INT",
            Ability::Wisdom => "WIS",
            Ability::Charisma => "CHA",
        }
    }

    /// Lowercase key used for skill lookups and script names.
    pub fn key(&self) -> &'static str {
        match self {
            Ability::Strength => "strength",
            Ability::Dexterity => "dexterity",
            Ability::Constitution => "constitution",
            Ability::Intelligence => "intelligence",
            Ability::Wisdom => "wisdom",
            Ability::Charisma => "charisma",
        }
    }

    /// Key of the matching saving throw, e.g. `strengthSave`.
    pub fn save_key(&self) -> &'static str {
        match self {
            Ability::Strength => "strengthSave",
            Ability::Dexterity => "dexteritySave",
            Ability::Constitution => "constitutionSave",
            Ability::Intelligence => "intelligenceSave",
            Ability::Wisdom => "wisdomSave",
            Ability::Charisma => "charismaSave",
        }
    }

    pub fn all() -> [Ability; 6] {
        [
            Ability::Strength,
            Ability::Dexterity,
            Ability::Constitution,
            Ability::Intelligence,
            Ability::Wisdom,
            Ability::Charisma,
        ]
    }

    /// Case-insensitive substring match against the save keys (`"dex"`,
    /// `"wisdom"`, `"conSave"`).
    pub fn from_save_fuzzy(name: &str) -> Option<Ability> {
        let needle = name.to_lowercase();
        Ability::all()
            .into_iter()
            .find(|a| a.save_key().to_lowercase().contains(&needle))
    }

    /// Match a three-letter abbreviation, case-insensitively.
    pub fn from_abbreviation(abbr: &str) -> Option<Ability> {
        Ability::all()
            .into_iter()
            .find(|a| a.abbreviation().eq_ignore_ascii_case(abbr))
    }
}

impl fmt::Display for Ability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.abbreviation())
    }
}

/// Ability scores container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityScores {
    pub strength: i64,
    pub dexterity: i64,
    pub constitution: i64,
    pub intelligence: i64,
    pub wisdom: i64,
    pub charisma: i64,
}

impl AbilityScores {
    pub fn new(str: i64, dex: i64, con: i64, int: i64, wis: i64, cha: i64) -> Self {
        Self {
            strength: str,
            dexterity: dex,
            constitution: con,
            intelligence: int,
            wisdom: wis,
            charisma: cha,
        }
    }

    pub fn get(&self, ability: Ability) -> i64 {
        match ability {
            Ability::Strength => self.strength,
            Ability::Dexterity => self.dexterity,
            Ability::Constitution => self.constitution,
            Ability::Intelligence => self.intelligence,
            Ability::Wisdom => self.wisdom,
            Ability::Charisma => self.charisma,
        }
    }

    pub fn modifier(&self, ability: Ability) -> i64 {
        // D&D 5e: score 8-9 = -1, 10-11 = 0, 12-13 = +1, etc.
        (self.get(ability) - 10).div_euclid(2)
    }
}

impl Default for AbilityScores {
    fn default() -> Self {
        Self::new(10, 10, 10, 10, 10, 10)
    }
}

// ============================================================================
// Skills and Saves
// ============================================================================

/// Skill keys and the ability each one is based on. Ability checks and
/// initiative are skills too.
pub const SKILL_MAP: &[(&str, Ability)] = &[
    ("acrobatics", Ability::Dexterity),
    ("animalHandling", Ability::Wisdom),
    ("arcana", Ability::Intelligence),
    ("athletics", Ability::Strength),
    ("deception", Ability::Charisma),
    ("history", Ability::Intelligence),
    ("initiative", Ability::Dexterity),
    ("insight", Ability::Wisdom),
    ("intimidation", Ability::Charisma),
    ("investigation", Ability::Intelligence),
    ("medicine", Ability::Wisdom),
    ("nature", Ability::Intelligence),
    ("perception", Ability::Wisdom),
    ("performance", Ability::Charisma),
    ("persuasion", Ability::Charisma),
    ("religion", Ability::Intelligence),
    ("sleightOfHand", Ability::Dexterity),
    ("stealth", Ability::Dexterity),
    ("survival", Ability::Wisdom),
    ("strength", Ability::Strength),
    ("dexterity", Ability::Dexterity),
    ("constitution", Ability::Constitution),
    ("intelligence", Ability::Intelligence),
    ("wisdom", Ability::Wisdom),
    ("charisma", Ability::Charisma),
];

/// Ability a skill key is based on.
pub fn skill_ability(skill: &str) -> Option<Ability> {
    SKILL_MAP.iter().find(|(k, _)| *k == skill).map(|(_, a)| *a)
}

/// `sleightOfHand` -> `Sleight Of Hand`.
pub fn camel_to_title(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if i == 0 {
            out.extend(c.to_uppercase());
        } else if c.is_uppercase() {
            out.push(' ');
            out.push(c);
        } else {
            out.push(c);
        }
    }
    out
}

/// A skill or save bonus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SkillValue {
    pub value: i64,
    /// 0, 0.5 (half), 1 (proficient) or 2 (expertise).
    #[serde(default)]
    pub prof: f64,
    #[serde(default)]
    pub bonus: i64,
    /// `Some(true)` for innate advantage, `Some(false)` for disadvantage.
    #[serde(default)]
    pub adv: Option<bool>,
}

impl SkillValue {
    pub fn new(value: i64) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }

    pub fn proficient(value: i64, prof: f64) -> Self {
        Self {
            value,
            prof,
            ..Default::default()
        }
    }

    /// Merge an outside advantage state with this skill's own.
    pub fn advantage(&self, base: Advantage) -> Advantage {
        let own = Advantage::from_bool(self.adv);
        match (base, self.adv) {
            (Advantage::Normal, _) => own,
            (base, None) => base,
            (base, Some(_)) if base.combine(own) == base => base,
            _ => Advantage::Normal,
        }
    }

    /// The d20 roll for this skill, e.g. `2d20kh1+5`.
    pub fn d20(&self, base: Advantage, reroll: Option<i64>, min_val: Option<i64>) -> String {
        self.d20_with_mod(base, reroll, min_val, self.value)
    }

    pub fn d20_with_mod(
        &self,
        base: Advantage,
        reroll: Option<i64>,
        min_val: Option<i64>,
        modifier: i64,
    ) -> String {
        format!("{}{:+}", self.advantage(base).d20_notation(reroll, min_val), modifier)
    }
}

// ============================================================================
// Hit Points
// ============================================================================

/// Hit points tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitPoints {
    pub current: i64,
    pub maximum: i64,
    #[serde(default)]
    pub temporary: i64,
}

impl HitPoints {
    pub fn new(maximum: i64) -> Self {
        Self {
            current: maximum,
            maximum,
            temporary: 0,
        }
    }

    /// Apply a signed change. Negative deltas are absorbed by temp HP first.
    /// Healing stops at `max_hp` unless `overflow` is set. HP has no lower
    /// bound.
    pub fn modify(&mut self, delta: i64, max_hp: i64, overflow: bool) {
        let mut delta = delta;
        if delta < 0 {
            let absorbed = self.temporary.min(-delta);
            self.temporary -= absorbed;
            delta += absorbed;
        }
        if overflow || delta <= 0 {
            self.current += delta;
        } else {
            self.current = (self.current + delta).min(max_hp.max(self.current));
        }
    }

    pub fn set_temp(&mut self, value: i64) {
        self.temporary = value.max(0);
    }
}

// ============================================================================
// Spellcasting
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CounterError {
    #[error("{0}")]
    OutOfBounds(String),
    #[error("Spell level must be between 1 and 9.")]
    InvalidSpellLevel,
    #[error("{0} has no maximum to reset to.")]
    NoReset(String),
}

impl CounterError {
    fn out_of_bounds() -> Self {
        CounterError::OutOfBounds("The new value is out of bounds.".to_string())
    }
}

/// English ordinal, `1` -> `1st`.
pub fn ordinal(n: i64) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

const FILLED: char = '\u{25c9}';
const EMPTY: char = '\u{3007}';

fn bubbles(filled: i64, total: i64) -> String {
    let filled = filled.max(0) as usize;
    let empty = (total.max(0) as usize).saturating_sub(filled);
    format!(
        "{}{}",
        FILLED.to_string().repeat(filled),
        EMPTY.to_string().repeat(empty)
    )
}

/// Spell slots and casting statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Spellbook {
    #[serde(default)]
    pub slots: BTreeMap<u8, i64>,
    #[serde(default)]
    pub max_slots: BTreeMap<u8, i64>,
    #[serde(default)]
    pub pact_slot_level: Option<u8>,
    #[serde(default)]
    pub num_pact_slots: Option<i64>,
    #[serde(default)]
    pub max_pact_slots: Option<i64>,
    pub dc: Option<i64>,
    pub sab: Option<i64>,
    pub spell_mod: Option<i64>,
    #[serde(default)]
    pub caster_level: i64,
    /// Names of known spells.
    #[serde(default)]
    pub spells: Vec<String>,
}

impl Spellbook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set full slots for a level.
    pub fn with_slots(mut self, level: u8, max: i64) -> Self {
        self.slots.insert(level, max);
        self.max_slots.insert(level, max);
        self
    }

    pub fn with_pact_slots(mut self, level: u8, max: i64) -> Self {
        let total = self.get_max_slots(level) + max;
        self.slots.insert(level, total);
        self.max_slots.insert(level, total);
        self.pact_slot_level = Some(level);
        self.num_pact_slots = Some(max);
        self.max_pact_slots = Some(max);
        self
    }

    pub fn with_casting(mut self, dc: i64, sab: i64, spell_mod: i64, caster_level: i64) -> Self {
        self.dc = Some(dc);
        self.sab = Some(sab);
        self.spell_mod = Some(spell_mod);
        self.caster_level = caster_level;
        self
    }

    /// Remaining slots of a level. Cantrips are always castable.
    pub fn get_slots(&self, level: u8) -> i64 {
        if level == 0 {
            return 1;
        }
        self.slots.get(&level).copied().unwrap_or(0)
    }

    pub fn get_max_slots(&self, level: u8) -> i64 {
        self.max_slots.get(&level).copied().unwrap_or(0)
    }

    /// Set remaining slots of a level. Out-of-range values are refused.
    ///
    /// When `level` is the pact slot level, pact slots are spent first (or,
    /// with `pact` unset, kept as long as there are enough slots).
    pub fn set_slots(&mut self, level: u8, value: i64, pact: bool) -> Result<(), CounterError> {
        if !(1..=9).contains(&level) {
            return Err(CounterError::InvalidSpellLevel);
        }
        let max = self.get_max_slots(level);
        if value < 0 {
            return Err(CounterError::OutOfBounds(format!(
                "You do not have enough remaining level {level} spell slots."
            )));
        }
        if value > max {
            return Err(CounterError::OutOfBounds(format!(
                "You may not have this many level {level} spell slots (max {max})."
            )));
        }

        let delta = value - self.get_slots(level);
        self.slots.insert(level, value);

        if self.pact_slot_level == Some(level) {
            if let (Some(num_pact), Some(max_pact)) = (self.num_pact_slots, self.max_pact_slots) {
                let non_pact = self.get_max_slots(level) - max_pact;
                let new_pact = if pact {
                    // spend pact slots first, regain them first
                    (num_pact + delta).clamp(0, max_pact)
                } else {
                    // only touch pact slots when the non-pact ones cannot cover the change
                    num_pact.min(value).max(value - non_pact).clamp(0, max_pact)
                };
                self.num_pact_slots = Some(new_pact);
            }
        }
        Ok(())
    }

    /// `1st ◉◉〇`
    pub fn slots_str(&self, level: u8) -> String {
        format!(
            "{} {}",
            ordinal(level as i64),
            bubbles(self.get_slots(level), self.get_max_slots(level))
        )
    }
}

// ============================================================================
// Custom Counters
// ============================================================================

pub const COUNTER_MIN_SENTINEL: i64 = -(1 << 31);
pub const COUNTER_MAX_SENTINEL: i64 = (1 << 31) - 1;

/// A counter bound: a literal or an expression over the owner's stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CounterBound {
    Literal(i64),
    Expr(String),
}

impl CounterBound {
    fn resolve(&self, names: &Names) -> Option<i64> {
        match self {
            CounterBound::Literal(n) => Some(*n),
            CounterBound::Expr(expr) => match expr.trim().parse() {
                Ok(n) => Some(n),
                Err(_) => script::evaluate(expr, names).and_then(|v| v.to_int()).ok(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DisplayType {
    #[default]
    Default,
    Bubble,
}

/// A consumable resource such as Ki or Bardic Inspiration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomCounter {
    pub name: String,
    pub value: i64,
    #[serde(default)]
    pub min: Option<CounterBound>,
    #[serde(default)]
    pub max: Option<CounterBound>,
    #[serde(default)]
    pub reset_on: Option<String>,
    #[serde(default)]
    pub display_type: DisplayType,
    /// Limited-use entity this counter mirrors.
    #[serde(default)]
    pub live_id: Option<EntityKey>,
    /// Feature that granted this counter.
    #[serde(default)]
    pub source_feature: Option<EntityKey>,
}

impl CustomCounter {
    pub fn new(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            value,
            min: None,
            max: None,
            reset_on: None,
            display_type: DisplayType::Default,
            live_id: None,
            source_feature: None,
        }
    }

    pub fn with_bounds(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.min = min.map(CounterBound::Literal);
        self.max = max.map(CounterBound::Literal);
        self
    }

    pub fn with_bubbles(mut self) -> Self {
        self.display_type = DisplayType::Bubble;
        self
    }

    pub fn with_source_feature(mut self, key: EntityKey) -> Self {
        self.source_feature = Some(key);
        self
    }

    pub fn with_live_id(mut self, key: EntityKey) -> Self {
        self.live_id = Some(key);
        self
    }

    /// Resolved (min, max); a missing bound is a sentinel.
    pub fn bounds(&self, names: &Names) -> (i64, i64) {
        let min = self
            .min
            .as_ref()
            .and_then(|b| b.resolve(names))
            .unwrap_or(COUNTER_MIN_SENTINEL);
        let max = self
            .max
            .as_ref()
            .and_then(|b| b.resolve(names))
            .unwrap_or(COUNTER_MAX_SENTINEL);
        (min, max)
    }

    /// Set the value against literal bounds. See [`CustomCounter::set_with_bounds`].
    pub fn set(&mut self, new_value: i64, strict: bool) -> Result<i64, CounterError> {
        let bounds = self.bounds(&Names::new());
        self.set_with_bounds(new_value, strict, bounds)
    }

    /// Clip `new_value` into bounds and store it, or with `strict` refuse
    /// out-of-bounds values without touching the stored value.
    pub fn set_with_bounds(
        &mut self,
        new_value: i64,
        strict: bool,
        (min, max): (i64, i64),
    ) -> Result<i64, CounterError> {
        if strict && !(min..=max).contains(&new_value) {
            return Err(CounterError::out_of_bounds());
        }
        self.value = new_value.max(min).min(max);
        Ok(self.value)
    }

    /// Refill to the maximum, returning the new value.
    pub fn reset(&mut self, names: &Names) -> Result<i64, CounterError> {
        let (min, max) = self.bounds(names);
        if max == COUNTER_MAX_SENTINEL {
            return Err(CounterError::NoReset(self.name.clone()));
        }
        self.set_with_bounds(max, false, (min, max))
    }

    /// `◉◉〇`, `3/5`, or `3`.
    pub fn display(&self, names: &Names) -> String {
        let max = self.max.as_ref().and_then(|b| b.resolve(names));
        match (self.display_type, max) {
            (DisplayType::Bubble, Some(max)) => bubbles(self.value, max),
            (_, Some(max)) => format!("{}/{}", self.value, max),
            (_, None) => self.value.to_string(),
        }
    }
}

impl fmt::Display for CustomCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display(&Names::new()))
    }
}

// ============================================================================
// Creatures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CreatureKind {
    Character,
    #[default]
    Monster,
}

/// Per-character roll options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterOptions {
    /// Reroll d20s showing this value once (halfling luck).
    pub reroll: Option<i64>,
    /// Natural roll needed to crit.
    pub crit_on: i64,
    /// Extra damage dice on a critical hit.
    pub extra_crit_dice: i64,
    /// Reliable talent: proficient checks roll at least 10.
    pub talent: bool,
    /// Treat critical hits against this character as normal hits.
    pub ignore_crit: bool,
}

impl Default for CharacterOptions {
    fn default() -> Self {
        Self {
            reroll: None,
            crit_on: 20,
            extra_crit_dice: 0,
            talent: false,
            ignore_crit: false,
        }
    }
}

/// State only creatures in initiative carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CombatantState {
    #[serde(default)]
    pub effects: Vec<InitiativeEffect>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub controller_id: Option<String>,
    #[serde(default)]
    pub initiative: i64,
}

/// Anything with a stat block: a player character or a monster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creature {
    pub id: CreatureId,
    pub name: String,
    #[serde(default)]
    pub kind: CreatureKind,
    #[serde(default)]
    pub level: i64,
    #[serde(default)]
    pub abilities: AbilityScores,
    #[serde(default)]
    pub proficiency_bonus: i64,
    /// Skill overrides; unlisted skills fall back to the ability modifier.
    #[serde(default)]
    pub skills: BTreeMap<String, SkillValue>,
    /// Save overrides keyed like `strengthSave`.
    #[serde(default)]
    pub saves: BTreeMap<String, SkillValue>,
    #[serde(default)]
    pub ac: Option<i64>,
    #[serde(default)]
    pub hp: Option<HitPoints>,
    #[serde(default)]
    pub resistances: Resistances,
    #[serde(default)]
    pub spellbook: Spellbook,
    #[serde(default)]
    pub counters: Vec<CustomCounter>,
    /// Present for player characters.
    #[serde(default)]
    pub options: Option<CharacterOptions>,
    /// Present while in initiative.
    #[serde(default)]
    pub combatant: Option<CombatantState>,
}

impl Creature {
    pub fn new(name: impl Into<String>, kind: CreatureKind) -> Self {
        Self {
            id: CreatureId::new(),
            name: name.into(),
            kind,
            level: 1,
            abilities: AbilityScores::default(),
            proficiency_bonus: 2,
            skills: BTreeMap::new(),
            saves: BTreeMap::new(),
            ac: None,
            hp: None,
            resistances: Resistances::default(),
            spellbook: Spellbook::default(),
            counters: Vec::new(),
            options: if kind == CreatureKind::Character {
                Some(CharacterOptions::default())
            } else {
                None
            },
            combatant: None,
        }
    }

    pub fn with_abilities(mut self, abilities: AbilityScores) -> Self {
        self.abilities = abilities;
        self
    }

    pub fn with_level(mut self, level: i64, proficiency_bonus: i64) -> Self {
        self.level = level;
        self.proficiency_bonus = proficiency_bonus;
        self
    }

    pub fn with_ac(mut self, ac: i64) -> Self {
        self.ac = Some(ac);
        self
    }

    pub fn with_hp(mut self, max: i64) -> Self {
        self.hp = Some(HitPoints::new(max));
        self
    }

    pub fn with_skill(mut self, skill: &str, value: SkillValue) -> Self {
        self.skills.insert(skill.to_string(), value);
        self
    }

    pub fn with_save(mut self, ability: Ability, value: SkillValue) -> Self {
        self.saves.insert(ability.save_key().to_string(), value);
        self
    }

    pub fn with_resistance(mut self, dtype: &str) -> Self {
        self.resistances.resist.push(Resistance::from_str_spec(dtype));
        self
    }

    pub fn with_immunity(mut self, dtype: &str) -> Self {
        self.resistances.immune.push(Resistance::from_str_spec(dtype));
        self
    }

    pub fn with_vulnerability(mut self, dtype: &str) -> Self {
        self.resistances.vuln.push(Resistance::from_str_spec(dtype));
        self
    }

    pub fn with_spellbook(mut self, spellbook: Spellbook) -> Self {
        self.spellbook = spellbook;
        self
    }

    pub fn with_counter(mut self, counter: CustomCounter) -> Self {
        self.counters.push(counter);
        self
    }

    pub fn with_options(mut self, options: CharacterOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Put this creature into initiative.
    pub fn in_combat(mut self) -> Self {
        self.combatant.get_or_insert_with(CombatantState::default);
        self
    }

    /// A combatant whose HP is only shown to its controller.
    pub fn private(mut self, controller_id: impl Into<String>) -> Self {
        let state = self.combatant.get_or_insert_with(CombatantState::default);
        state.is_private = true;
        state.controller_id = Some(controller_id.into());
        self
    }

    pub fn is_character(&self) -> bool {
        self.kind == CreatureKind::Character
    }

    pub fn is_combatant(&self) -> bool {
        self.combatant.is_some()
    }

    pub fn is_private(&self) -> bool {
        self.combatant.as_ref().is_some_and(|c| c.is_private)
    }

    pub fn controller_id(&self) -> Option<&str> {
        self.combatant.as_ref().and_then(|c| c.controller_id.as_deref())
    }

    // ---------- active effects ----------

    pub fn effects(&self) -> &[InitiativeEffect] {
        self.combatant.as_ref().map(|c| c.effects.as_slice()).unwrap_or(&[])
    }

    pub fn effect(&self, id: EffectId) -> Option<&InitiativeEffect> {
        self.effects().iter().find(|e| e.id == id)
    }

    pub fn effect_mut(&mut self, id: EffectId) -> Option<&mut InitiativeEffect> {
        self.combatant
            .as_mut()
            .and_then(|c| c.effects.iter_mut().find(|e| e.id == id))
    }

    pub fn is_concentrating(&self) -> bool {
        self.effects().iter().any(|e| e.concentration)
    }

    // ---------- derived stats ----------

    /// AC before active effects.
    pub fn base_ac(&self) -> Option<i64> {
        self.ac
    }

    /// AC after active effects: the highest `ac_value` replaces the base,
    /// then every `ac_bonus` is added.
    pub fn effective_ac(&self) -> Option<i64> {
        let set = self.effects().iter().filter_map(|e| e.effects.ac_value).max();
        let base = set.or(self.ac)?;
        Some(base + self.effects().iter().filter_map(|e| e.effects.ac_bonus).sum::<i64>())
    }

    pub fn base_max_hp(&self) -> Option<i64> {
        self.hp.as_ref().map(|hp| hp.maximum)
    }

    pub fn max_hp(&self) -> Option<i64> {
        let set = self.effects().iter().filter_map(|e| e.effects.max_hp_value).max();
        let base = set.or(self.base_max_hp())?;
        Some(base + self.effects().iter().filter_map(|e| e.effects.max_hp_bonus).sum::<i64>())
    }

    pub fn current_hp(&self) -> Option<i64> {
        self.hp.as_ref().map(|hp| hp.current)
    }

    pub fn temp_hp(&self) -> i64 {
        self.hp.as_ref().map(|hp| hp.temporary).unwrap_or(0)
    }

    /// Resistances including those granted by active effects.
    pub fn effective_resistances(&self) -> Resistances {
        let mut out = self.resistances.clone();
        for effect in self.effects() {
            out.resist.extend(effect.effects.resistances.iter().cloned());
            out.immune.extend(effect.effects.immunities.iter().cloned());
            out.vuln.extend(effect.effects.vulnerabilities.iter().cloned());
        }
        out
    }

    /// Apply a signed HP change and return the new HP string.
    pub fn modify_hp(&mut self, delta: i64, overflow: bool) -> Option<String> {
        let max = self.max_hp()?;
        self.hp.as_mut()?.modify(delta, max, overflow);
        Some(self.hp_str(false))
    }

    pub fn set_temp_hp(&mut self, value: i64) {
        if let Some(hp) = self.hp.as_mut() {
            hp.set_temp(value);
        }
    }

    /// `12/20 (+5 temp)`, or a health status for private combatants unless
    /// `private` is set.
    pub fn hp_str(&self, private: bool) -> String {
        let (Some(hp), Some(max)) = (self.current_hp(), self.max_hp()) else {
            return "<None>".to_string();
        };
        if self.is_private() && !private {
            return format!("<{}>", health_status(hp, max));
        }
        let temp = self.temp_hp();
        if temp > 0 {
            format!("<{hp}/{max} HP; {temp} temp>")
        } else {
            format!("<{hp}/{max} HP>")
        }
    }

    // ---------- skills ----------

    pub fn skill(&self, skill: &str) -> Option<SkillValue> {
        if let Some(value) = self.skills.get(skill) {
            return Some(value.clone());
        }
        skill_ability(skill).map(|a| SkillValue::new(self.abilities.modifier(a)))
    }

    pub fn save(&self, ability: Ability) -> SkillValue {
        self.saves
            .get(ability.save_key())
            .cloned()
            .unwrap_or_else(|| SkillValue::new(self.abilities.modifier(ability)))
    }

    // ---------- counters ----------

    /// Counter by name, case-insensitive.
    pub fn counter_index(&self, name: &str) -> Option<usize> {
        self.counters
            .iter()
            .position(|c| c.name == name)
            .or_else(|| self.counters.iter().position(|c| c.name.eq_ignore_ascii_case(name)))
    }

    /// Resolved counter bounds, with expressions evaluated against this creature.
    pub fn counter_bounds(&self, index: usize) -> (i64, i64) {
        match self.counters.get(index) {
            Some(counter) => counter.bounds(&self.names()),
            None => (COUNTER_MIN_SENTINEL, COUNTER_MAX_SENTINEL),
        }
    }

    // ---------- scripting ----------

    /// Names this creature contributes to expressions when casting.
    pub fn names(&self) -> Names {
        let mut names = Names::new();
        for ability in Ability::all() {
            names.insert(ability.key().to_string(), Value::Int(self.abilities.get(ability)));
            let modifier = self.abilities.modifier(ability);
            names.insert(format!("{}Mod", ability.key()), Value::Int(modifier));
            names.insert(ability.save_key().to_string(), Value::Int(self.save(ability).value));
        }
        names.insert("name".into(), Value::str(self.name.clone()));
        names.insert("level".into(), Value::Int(self.level));
        names.insert("proficiencyBonus".into(), Value::Int(self.proficiency_bonus));
        names.insert("armor".into(), Value::from(self.effective_ac()));
        names.insert("hp".into(), Value::from(self.current_hp()));
        names.insert("spell".into(), Value::from(self.spellbook.spell_mod));
        for counter in &self.counters {
            if is_identifier(&counter.name) {
                names.entry(counter.name.clone()).or_insert(Value::Int(counter.value));
            }
        }
        names
    }

    /// This creature as a script value (`caster`, `target`).
    pub fn to_value(&self) -> Value {
        let mut stats = BTreeMap::new();
        let mut saves = BTreeMap::new();
        for ability in Ability::all() {
            stats.insert(ability.key().to_string(), Value::Int(self.abilities.get(ability)));
            saves.insert(ability.key().to_string(), Value::Int(self.save(ability).value));
        }
        let mut skills = BTreeMap::new();
        for (skill, _) in SKILL_MAP {
            if let Some(value) = self.skill(skill) {
                skills.insert(skill.to_string(), Value::Int(value.value));
            }
        }
        let mut spellbook = BTreeMap::new();
        spellbook.insert("dc".into(), Value::from(self.spellbook.dc));
        spellbook.insert("sab".into(), Value::from(self.spellbook.sab));
        spellbook.insert("spell_mod".into(), Value::from(self.spellbook.spell_mod));
        spellbook.insert("caster_level".into(), Value::Int(self.spellbook.caster_level));

        let mut map = BTreeMap::new();
        map.insert("name".into(), Value::str(self.name.clone()));
        map.insert("level".into(), Value::Int(self.level));
        map.insert("hp".into(), Value::from(self.current_hp()));
        map.insert("max_hp".into(), Value::from(self.max_hp()));
        map.insert("temp_hp".into(), Value::Int(self.temp_hp()));
        map.insert("ac".into(), Value::from(self.effective_ac()));
        map.insert("prof_bonus".into(), Value::Int(self.proficiency_bonus));
        map.insert("stats".into(), Value::Map(stats));
        map.insert("saves".into(), Value::Map(saves));
        map.insert("skills".into(), Value::Map(skills));
        map.insert("spellbook".into(), Value::Map(spellbook));
        map.insert(
            "resistances".into(),
            Value::List(
                self.effective_resistances()
                    .resist
                    .iter()
                    .map(|r| Value::str(r.to_string()))
                    .collect(),
            ),
        );
        map.insert(
            "effects".into(),
            Value::List(self.effects().iter().map(|e| Value::str(e.name.clone())).collect()),
        );
        map.insert("is_combatant".into(), Value::Bool(self.is_combatant()));
        Value::Map(map)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn health_status(hp: i64, max: i64) -> &'static str {
    if max <= 0 || hp <= 0 {
        return "Dead";
    }
    let ratio = hp as f64 / max as f64;
    if ratio >= 1.0 {
        "Healthy"
    } else if ratio > 0.5 {
        "Injured"
    } else if ratio > 0.15 {
        "Bloodied"
    } else {
        "Critical"
    }
}

// ============================================================================
// Encounter
// ============================================================================

/// Where automation may aim: a creature, a narrative-only name, or nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRef {
    Creature(CreatureId),
    Named(String),
    Nobody,
}

/// The arena owning every creature automation can touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Encounter {
    #[serde(default)]
    pub round_num: i64,
    pub creatures: Vec<Creature>,
}

impl Encounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, creature: Creature) -> CreatureId {
        let id = creature.id;
        self.creatures.push(creature);
        id
    }

    pub fn get(&self, id: CreatureId) -> Option<&Creature> {
        self.creatures.iter().find(|c| c.id == id)
    }

    pub fn get_mut(&mut self, id: CreatureId) -> Option<&mut Creature> {
        self.creatures.iter_mut().find(|c| c.id == id)
    }

    /// Creature by name, case-insensitive.
    pub fn find_by_name(&self, name: &str) -> Option<CreatureId> {
        self.creatures
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|c| c.id)
    }

    /// The creature called `name`, or a narrative-only target when nobody
    /// in the encounter answers to it.
    pub fn resolve_target(&self, name: &str) -> TargetRef {
        match self.find_by_name(name) {
            Some(id) => TargetRef::Creature(id),
            None => TargetRef::Named(name.to_string()),
        }
    }

    pub fn get_effect(&self, r: EffectRef) -> Option<&InitiativeEffect> {
        self.get(r.combatant_id)?.effect(r.effect_id)
    }

    pub fn get_effect_mut(&mut self, r: EffectRef) -> Option<&mut InitiativeEffect> {
        self.get_mut(r.combatant_id)?.effect_mut(r.effect_id)
    }

    /// Find an effect on a creature by name. Strict lookups need an exact
    /// (case-insensitive) match; otherwise a prefix or substring will do.
    pub fn get_effect_by_name(
        &self,
        creature: CreatureId,
        name: &str,
        strict: bool,
    ) -> Option<EffectRef> {
        let effects = self.get(creature)?.effects();
        let lower = name.to_lowercase();
        let found = effects
            .iter()
            .find(|e| e.name.to_lowercase() == lower)
            .or_else(|| {
                if strict {
                    None
                } else {
                    effects
                        .iter()
                        .find(|e| e.name.to_lowercase().starts_with(&lower))
                        .or_else(|| effects.iter().find(|e| e.name.to_lowercase().contains(&lower)))
                }
            })?;
        Some(found.reference())
    }

    /// Add an effect to a combatant. A concentration effect first ends the
    /// combatant's other concentration effects, which are returned.
    pub fn add_effect(&mut self, mut effect: InitiativeEffect) -> Vec<InitiativeEffect> {
        let owner = effect.combatant_id;
        let mut dropped = Vec::new();
        if effect.concentration {
            let conc: Vec<EffectRef> = self
                .get(owner)
                .map(|c| {
                    c.effects()
                        .iter()
                        .filter(|e| e.concentration)
                        .map(|e| e.reference())
                        .collect()
                })
                .unwrap_or_default();
            for r in conc {
                dropped.extend(self.remove_effect(r));
            }
        }

        let reference = effect.reference();
        if let Some(parent) = effect.parent {
            match self.get_effect_mut(parent) {
                Some(p) => {
                    if !p.children.contains(&reference) {
                        p.children.push(reference);
                    }
                }
                None => effect.parent = None,
            }
        }

        if let Some(creature) = self.get_mut(owner) {
            creature
                .combatant
                .get_or_insert_with(CombatantState::default)
                .effects
                .push(effect);
        }
        dropped
    }

    /// Remove an effect and, recursively, its children. Returns every
    /// removed effect, the requested one first.
    pub fn remove_effect(&mut self, r: EffectRef) -> Vec<InitiativeEffect> {
        let Some(creature) = self.get_mut(r.combatant_id) else {
            return Vec::new();
        };
        let Some(state) = creature.combatant.as_mut() else {
            return Vec::new();
        };
        let Some(pos) = state.effects.iter().position(|e| e.id == r.effect_id) else {
            return Vec::new();
        };
        let effect = state.effects.remove(pos);

        if let Some(parent) = effect.parent.and_then(|p| self.get_effect_mut(p)) {
            parent.children.retain(|c| *c != r);
        }

        let children = effect.children.clone();
        let mut removed = vec![effect];
        for child in children {
            removed.extend(self.remove_effect(child));
        }
        removed
    }

    /// Point `child` at a new parent effect.
    pub fn set_parent(&mut self, child: EffectRef, parent: Option<EffectRef>) {
        let old = self.get_effect(child).and_then(|e| e.parent);
        if let Some(old_parent) = old.and_then(|p| self.get_effect_mut(p)) {
            old_parent.children.retain(|c| *c != child);
        }
        if let Some(p) = parent.and_then(|p| self.get_effect_mut(p)) {
            if !p.children.contains(&child) {
                p.children.push(child);
            }
        }
        if let Some(effect) = self.get_effect_mut(child) {
            effect.parent = parent;
        }
    }

    pub fn effect_children(&self, r: EffectRef) -> Vec<EffectRef> {
        self.get_effect(r).map(|e| e.children.clone()).unwrap_or_default()
    }
}
