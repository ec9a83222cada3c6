//! Read-only game data: spells, features and who may use them.
//!
//! Automation looks entities up through the [`Compendium`] trait. Access to
//! licensed content is decided by [`can_access`] against the entity ids an
//! [`EntitlementProvider`] reports for the invoking user.

use crate::automation::Automation;
use crate::world::EntityKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const SPELL_TYPE_ID: i64 = 1118725998;
pub const CLASS_FEATURE_TYPE_ID: i64 = 12168134;
pub const LIMITED_USE_TYPE_ID: i64 = 222216831;

/// Schools of magic in D&D.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpellSchool {
    Abjuration,
    Conjuration,
    Divination,
    Enchantment,
    Evocation,
    Illusion,
    Necromancy,
    Transmutation,
}

lazy_static::lazy_static! {
    static ref SCHOOL_ABBREVIATIONS: HashMap<&'static str, SpellSchool> = {
        let mut m = HashMap::new();
        m.insert("a", SpellSchool::Abjuration);
        m.insert("c", SpellSchool::Conjuration);
        m.insert("d", SpellSchool::Divination);
        m.insert("en", SpellSchool::Enchantment);
        m.insert("ev", SpellSchool::Evocation);
        m.insert("i", SpellSchool::Illusion);
        m.insert("n", SpellSchool::Necromancy);
        m.insert("t", SpellSchool::Transmutation);
        m
    };
}

impl SpellSchool {
    pub fn name(&self) -> &'static str {
        match self {
            SpellSchool::Abjuration => "Abjuration",
            SpellSchool::Conjuration => "Conjuration",
            SpellSchool::Divination => "Divination",
            SpellSchool::Enchantment => "Enchantment",
            SpellSchool::Evocation => "Evocation",
            SpellSchool::Illusion => "Illusion",
            SpellSchool::Necromancy => "Necromancy",
            SpellSchool::Transmutation => "Transmutation",
        }
    }

    /// Parse a school from its abbreviation (`"EV"`) or full name.
    pub fn parse(s: &str) -> Option<SpellSchool> {
        let lower = s.trim().to_lowercase();
        SCHOOL_ABBREVIATIONS.get(lower.as_str()).copied().or_else(|| {
            SCHOOL_ABBREVIATIONS
                .values()
                .copied()
                .find(|school| school.name().eq_ignore_ascii_case(&lower))
        })
    }
}

// ============================================================================
// Sourcing
// ============================================================================

/// Where an entity comes from and whether it needs a license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sourced {
    pub source: String,
    pub page: Option<i64>,
    pub homebrew: bool,
    pub is_free: bool,
    /// Entity id checked against the user's entitlements.
    pub entitlement_entity_id: Option<i64>,
}

impl Default for Sourced {
    fn default() -> Self {
        Self {
            source: "SRD".to_string(),
            page: None,
            homebrew: false,
            is_free: true,
            entitlement_entity_id: None,
        }
    }
}

impl Sourced {
    /// Content behind a license.
    pub fn licensed(source: impl Into<String>, entitlement_entity_id: i64) -> Self {
        Self {
            source: source.into(),
            page: None,
            homebrew: false,
            is_free: false,
            entitlement_entity_id: Some(entitlement_entity_id),
        }
    }

    /// `PHB 196`
    pub fn source_str(&self) -> String {
        match self.page {
            Some(page) => format!("{} {page}", self.source),
            None => self.source.clone(),
        }
    }
}

/// Free and homebrew content is always accessible; anything else needs its
/// entitlement id among `available`.
pub fn can_access(sourced: &Sourced, available: Option<&BTreeSet<i64>>) -> bool {
    sourced.is_free
        || sourced.homebrew
        || matches!(
            (available, sourced.entitlement_entity_id),
            (Some(ids), Some(id)) if ids.contains(&id)
        )
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spell {
    pub id: i64,
    pub name: String,
    pub level: u8,
    #[serde(default)]
    pub school: Option<SpellSchool>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub higherlevels: Option<String>,
    #[serde(default)]
    pub concentration: bool,
    #[serde(default)]
    pub automation: Option<Automation>,
    #[serde(default)]
    pub sourced: Sourced,
}

impl Spell {
    pub fn new(id: i64, name: impl Into<String>, level: u8) -> Self {
        Self {
            id,
            name: name.into(),
            level,
            school: None,
            description: String::new(),
            higherlevels: None,
            concentration: false,
            automation: None,
            sourced: Sourced::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_higher_levels(mut self, text: impl Into<String>) -> Self {
        self.higherlevels = Some(text.into());
        self
    }

    pub fn with_automation(mut self, automation: Automation) -> Self {
        self.automation = Some(automation);
        self
    }

    pub fn with_sourced(mut self, sourced: Sourced) -> Self {
        self.sourced = sourced;
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey {
            type_id: SPELL_TYPE_ID,
            id: self.id,
        }
    }
}

/// A feature, a limited use granted by a feature, or any other describable
/// entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Limited uses this entity grants.
    #[serde(default)]
    pub limited_use: Vec<EntityKey>,
    /// The feature that grants this one (or this limited use).
    #[serde(default)]
    pub parent: Option<EntityKey>,
    #[serde(default)]
    pub sourced: Sourced,
}

impl Entity {
    pub fn new(key: EntityKey, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            description: None,
            limited_use: Vec::new(),
            parent: None,
            sourced: Sourced::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parent(mut self, parent: EntityKey) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn granting(mut self, limited_use: EntityKey) -> Self {
        self.limited_use.push(limited_use);
        self
    }

    pub fn with_sourced(mut self, sourced: Sourced) -> Self {
        self.sourced = sourced;
        self
    }

    pub fn is_limited_use(&self) -> bool {
        self.key.type_id == LIMITED_USE_TYPE_ID
    }

    /// Whether this entity takes part in counter discovery.
    pub fn has_counter_info(&self) -> bool {
        self.is_limited_use() || !self.limited_use.is_empty() || self.parent.is_some()
    }
}

/// A looked-up entity of any kind.
#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    Spell(&'a Spell),
    Entity(&'a Entity),
}

impl<'a> Lookup<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            Lookup::Spell(s) => &s.name,
            Lookup::Entity(e) => &e.name,
        }
    }

    pub fn description(&self) -> Option<&'a str> {
        match self {
            Lookup::Spell(s) => Some(&s.description),
            Lookup::Entity(e) => e.description.as_deref(),
        }
    }

    pub fn sourced(&self) -> &'a Sourced {
        match self {
            Lookup::Spell(s) => &s.sourced,
            Lookup::Entity(e) => &e.sourced,
        }
    }

    /// Entitlement type name used when asking for access.
    pub fn entity_type(&self) -> &'static str {
        match self {
            Lookup::Spell(_) => "spell",
            Lookup::Entity(e) if e.is_limited_use() => "limited-use",
            Lookup::Entity(_) => "class-feature",
        }
    }
}

// ============================================================================
// Compendium
// ============================================================================

pub trait Compendium: Send + Sync {
    fn lookup_spell(&self, id: i64) -> Option<&Spell>;

    fn lookup_entity(&self, key: EntityKey) -> Option<&Entity>;

    /// Spells and other entities through one key space.
    fn lookup(&self, key: EntityKey) -> Option<Lookup<'_>> {
        if key.type_id == SPELL_TYPE_ID {
            return self.lookup_spell(key.id).map(Lookup::Spell);
        }
        self.lookup_entity(key).map(Lookup::Entity)
    }

    /// The topmost ancestor of an entity and how many steps away it is.
    fn root_of(&self, key: EntityKey) -> Option<(&Entity, usize)> {
        let mut current = self.lookup_entity(key)?;
        let mut seen = BTreeSet::from([current.key]);
        let mut depth = 0;
        while let Some(parent) = current.parent.and_then(|p| self.lookup_entity(p)) {
            if !seen.insert(parent.key) {
                break;
            }
            current = parent;
            depth += 1;
        }
        Some((current, depth))
    }
}

/// An in-memory compendium.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticCompendium {
    #[serde(default)]
    pub spells: BTreeMap<i64, Spell>,
    #[serde(default, with = "entity_list")]
    pub entities: BTreeMap<EntityKey, Entity>,
}

impl StaticCompendium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spell(mut self, spell: Spell) -> Self {
        self.spells.insert(spell.id, spell);
        self
    }

    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entities.insert(entity.key, entity);
        self
    }

    pub fn add_spell(&mut self, spell: Spell) {
        self.spells.insert(spell.id, spell);
    }

    pub fn add_entity(&mut self, entity: Entity) {
        self.entities.insert(entity.key, entity);
    }
}

impl Compendium for StaticCompendium {
    fn lookup_spell(&self, id: i64) -> Option<&Spell> {
        self.spells.get(&id)
    }

    fn lookup_entity(&self, key: EntityKey) -> Option<&Entity> {
        self.entities.get(&key)
    }
}

/// JSON maps need string keys; entities are stored as a list instead.
mod entity_list {
    use super::Entity;
    use crate::world::EntityKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<EntityKey, Entity>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        map.values().collect::<Vec<_>>().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<EntityKey, Entity>, D::Error> {
        let list = Vec::<Entity>::deserialize(d)?;
        Ok(list.into_iter().map(|e| (e.key, e)).collect())
    }
}

// ============================================================================
// Entitlements
// ============================================================================

/// Reports which licensed entities a user owns.
#[async_trait]
pub trait EntitlementProvider: Send + Sync {
    /// Entity ids of `entity_type` the user may access, or `None` if the
    /// user has no linked account.
    async fn accessible_entities(&self, user_id: &str, entity_type: &str) -> Option<BTreeSet<i64>>;
}

/// A user with no linked account: only free content is accessible.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEntitlements;

#[async_trait]
impl EntitlementProvider for NoEntitlements {
    async fn accessible_entities(
        &self,
        _user_id: &str,
        _entity_type: &str,
    ) -> Option<BTreeSet<i64>> {
        None
    }
}

/// Fixed entitlements per user and entity type.
#[derive(Debug, Clone, Default)]
pub struct StaticEntitlements {
    owned: HashMap<(String, String), BTreeSet<i64>>,
}

impl StaticEntitlements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, user_id: &str, entity_type: &str, id: i64) -> Self {
        self.owned
            .entry((user_id.to_string(), entity_type.to_string()))
            .or_default()
            .insert(id);
        self
    }
}

#[async_trait]
impl EntitlementProvider for StaticEntitlements {
    async fn accessible_entities(&self, user_id: &str, entity_type: &str) -> Option<BTreeSet<i64>> {
        let linked = self.owned.keys().any(|(user, _)| user == user_id);
        if !linked {
            return None;
        }
        Some(
            self.owned
                .get(&(user_id.to_string(), entity_type.to_string()))
                .cloned()
                .unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(type_id: i64, id: i64) -> EntityKey {
        EntityKey { type_id, id }
    }

    #[test]
    fn test_school_parse() {
        assert_eq!(SpellSchool::parse("EV"), Some(SpellSchool::Evocation));
        assert_eq!(SpellSchool::parse("necromancy"), Some(SpellSchool::Necromancy));
        assert_eq!(SpellSchool::parse("x"), None);
    }

    #[test]
    fn test_can_access() {
        let free = Sourced::default();
        let licensed = Sourced::licensed("XGtE", 42);
        let homebrew = Sourced {
            homebrew: true,
            is_free: false,
            ..Default::default()
        };
        assert!(can_access(&free, None));
        assert!(can_access(&homebrew, None));
        assert!(!can_access(&licensed, None));
        assert!(!can_access(&licensed, Some(&BTreeSet::from([1]))));
        assert!(can_access(&licensed, Some(&BTreeSet::from([42]))));
        assert_eq!(Sourced { page: Some(196), ..licensed }.source_str(), "XGtE 196");
    }

    #[test]
    fn test_lookup_and_root() {
        let class = key(CLASS_FEATURE_TYPE_ID, 1);
        let feature = key(CLASS_FEATURE_TYPE_ID, 2);
        let option = key(CLASS_FEATURE_TYPE_ID, 3);
        let compendium = StaticCompendium::new()
            .with_entity(Entity::new(class, "Monk"))
            .with_entity(Entity::new(feature, "Ki").with_parent(class))
            .with_entity(Entity::new(option, "Flurry of Blows").with_parent(feature))
            .with_spell(Spell::new(7, "Fire Bolt", 0));

        let (root, depth) = compendium.root_of(option).unwrap();
        assert_eq!(root.name, "Monk");
        assert_eq!(depth, 2);
        assert_eq!(compendium.lookup(key(SPELL_TYPE_ID, 7)).unwrap().name(), "Fire Bolt");
        assert_eq!(compendium.lookup(feature).unwrap().entity_type(), "class-feature");
        assert!(compendium.lookup(key(SPELL_TYPE_ID, 8)).is_none());
    }

    #[test]
    fn test_compendium_serde() {
        let compendium = StaticCompendium::new()
            .with_entity(Entity::new(key(LIMITED_USE_TYPE_ID, 5), "Channel Divinity"))
            .with_spell(
                Spell::new(1, "Bless", 1).with_description("You bless up to three creatures."),
            );
        let json = serde_json::to_string(&compendium).unwrap();
        let back: StaticCompendium = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entities.len(), 1);
        assert!(back.entities[&key(LIMITED_USE_TYPE_ID, 5)].is_limited_use());
        assert_eq!(back.spells[&1].name, "Bless");
    }

    #[tokio::test]
    async fn test_static_entitlements() {
        let provider = StaticEntitlements::new().grant("user-1", "spell", 42);
        assert_eq!(
            provider.accessible_entities("user-1", "spell").await,
            Some(BTreeSet::from([42]))
        );
        assert_eq!(
            provider.accessible_entities("user-1", "class-feature").await,
            Some(BTreeSet::new())
        );
        assert_eq!(provider.accessible_entities("user-2", "spell").await, None);
        assert_eq!(NoEntitlements.accessible_entities("user-1", "spell").await, None);
    }
}
