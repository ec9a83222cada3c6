//! Initiative effects: duration-tracked statuses on combatants.
//!
//! An [`InitiativeEffect`] bundles passive bonuses ([`PassiveEffects`]),
//! extra attacks and buttons that run automation. Effects can be linked into
//! parent/child chains (a concentration spell and the effects it created);
//! the links are [`EffectRef`]s resolved through the
//! [`Encounter`](crate::world::Encounter).

use crate::automation::Automation;
use crate::dice::Advantage;
use crate::resistance::Resistance;
use crate::world::{camel_to_title, Ability, CreatureId, Encounter, SKILL_MAP};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EffectId(pub Uuid);

impl EffectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EffectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an effect lives: the owning combatant and the effect id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EffectRef {
    pub combatant_id: CreatureId,
    pub effect_id: EffectId,
}

// ============================================================================
// Passive Effects
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PassiveEffectError {
    #[error("{0} is not a valid stat")]
    InvalidStat(String),
    #[error("`{0}` is not a valid skill")]
    InvalidSkill(String),
    #[error("`{0}` could be multiple skills: {1}. Please use a more precise skill key.")]
    AmbiguousSkill(String, String),
}

/// Bonuses an effect grants its combatant while active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PassiveEffects {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attack_advantage: Option<Advantage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_hit_bonus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub damage_bonus: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub magical_damage: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub silvered_damage: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resistances: Vec<Resistance>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub immunities: Vec<Resistance>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vulnerabilities: Vec<Resistance>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ignored_resistances: Vec<Resistance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ac_value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ac_bonus: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_hp_value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_hp_bonus: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_bonus: Option<String>,
    /// Ability abbreviations (`str`, `dex`, ...).
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub save_adv: BTreeSet<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub save_dis: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_bonus: Option<String>,
    /// Skill keys (`perception`, `strength`, ...).
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub check_adv: BTreeSet<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub check_dis: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dc_bonus: Option<i64>,
}

impl PassiveEffects {
    pub fn is_empty(&self) -> bool {
        *self == PassiveEffects::default()
    }
}

fn all_stats() -> BTreeSet<String> {
    Ability::all().iter().map(|a| a.abbreviation().to_lowercase()).collect()
}

fn all_skills() -> BTreeSet<String> {
    SKILL_MAP.iter().map(|(k, _)| k.to_string()).collect()
}

/// Turn `["dex", "wisdom"]` or `["all"]` into ability abbreviations.
pub fn resolve_save_advs<S: AsRef<str>>(
    values: &[S],
) -> Result<BTreeSet<String>, PassiveEffectError> {
    let stats = all_stats();
    let mut out = BTreeSet::new();
    for value in values {
        let value = value.as_ref();
        if value.eq_ignore_ascii_case("all") || value == "True" {
            return Ok(stats);
        }
        let abbr: String = value.chars().take(3).collect::<String>().to_lowercase();
        if !stats.contains(&abbr) {
            return Err(PassiveEffectError::InvalidStat(value.to_string()));
        }
        out.insert(abbr);
    }
    Ok(out)
}

/// Turn skill prefixes or `["all"]` into skill keys.
pub fn resolve_check_advs<S: AsRef<str>>(
    values: &[S],
) -> Result<BTreeSet<String>, PassiveEffectError> {
    let mut out = BTreeSet::new();
    for value in values {
        let value = value.as_ref();
        if value.eq_ignore_ascii_case("all") || value == "True" {
            return Ok(all_skills());
        }
        let lower = value.to_lowercase();
        let options: Vec<&str> = SKILL_MAP
            .iter()
            .map(|(k, _)| *k)
            .filter(|k| k.to_lowercase().starts_with(&lower))
            .collect();
        match options.as_slice() {
            [] => return Err(PassiveEffectError::InvalidSkill(value.to_string())),
            [one] => {
                out.insert(one.to_string());
            }
            many => {
                // an exact key wins over its prefixes (`strength` vs nothing else)
                match many.iter().find(|k| k.eq_ignore_ascii_case(value)) {
                    Some(exact) => {
                        out.insert(exact.to_string());
                    }
                    None => {
                        return Err(PassiveEffectError::AmbiguousSkill(
                            value.to_string(),
                            many.join(", "),
                        ))
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Split `["18", "+2", "-1"]` into (largest set value, summed bonus).
pub fn resolve_value_or_bonus<S: AsRef<str>>(values: &[S]) -> (Option<i64>, Option<i64>) {
    let mut set_value: Option<i64> = None;
    let mut bonus: Option<i64> = None;
    for value in values {
        let value = value.as_ref().trim();
        let Ok(n) = value.parse::<i64>() else {
            continue;
        };
        if value.starts_with(['+', '-']) {
            bonus = Some(bonus.unwrap_or(0) + n);
        } else {
            set_value = Some(set_value.unwrap_or(0).max(n));
        }
    }
    (set_value, bonus)
}

fn stat_list(
    values: &BTreeSet<String>,
    all: &BTreeSet<String>,
    verbose: impl Fn(&str) -> String,
) -> String {
    if values.is_superset(all) {
        return "All".to_string();
    }
    values.iter().map(|v| verbose(v)).collect::<Vec<_>>().join(", ")
}

fn verbose_stat(abbr: &str) -> String {
    Ability::from_abbreviation(abbr)
        .map(|a| camel_to_title(a.key()))
        .unwrap_or_else(|| abbr.to_string())
}

impl fmt::Display for PassiveEffects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = |title: &str, values: &[Resistance]| {
            format!(
                "{title}: {}",
                values.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ")
            )
        };
        let mut out = Vec::new();
        match self.attack_advantage {
            Some(Advantage::Advantage) => out.push("Attack Advantage".to_string()),
            Some(Advantage::Disadvantage) => out.push("Attack Disadvantage".to_string()),
            Some(Advantage::Elven) => out.push("Attack Advantage: Elven Accuracy".to_string()),
            _ => {}
        }
        if let Some(b) = &self.to_hit_bonus {
            out.push(format!("Attack Bonus: {b}"));
        }
        if let Some(b) = &self.damage_bonus {
            out.push(format!("Damage Bonus: {b}"));
        }
        if self.magical_damage {
            out.push("Magical Damage".to_string());
        }
        if self.silvered_damage {
            out.push("Silvered Damage".to_string());
        }
        if !self.resistances.is_empty() {
            out.push(list("Resistance", &self.resistances));
        }
        if !self.immunities.is_empty() {
            out.push(list("Immunity", &self.immunities));
        }
        if !self.vulnerabilities.is_empty() {
            out.push(list("Vulnerability", &self.vulnerabilities));
        }
        if !self.ignored_resistances.is_empty() {
            out.push(list("Neutral", &self.ignored_resistances));
        }
        if let Some(v) = self.ac_value {
            out.push(format!("AC: {v}"));
        }
        if let Some(v) = self.ac_bonus {
            out.push(format!("AC Bonus: {v}"));
        }
        if let Some(v) = self.max_hp_value {
            out.push(format!("Max HP: {v}"));
        }
        if let Some(v) = self.max_hp_bonus {
            out.push(format!("Max HP Bonus: {v}"));
        }
        if let Some(b) = &self.save_bonus {
            out.push(format!("Save Bonus: {b}"));
        }
        if !self.save_adv.is_empty() {
            let stats = stat_list(&self.save_adv, &all_stats(), verbose_stat);
            out.push(format!("Save Advantage: {stats}"));
        }
        if !self.save_dis.is_empty() {
            let stats = stat_list(&self.save_dis, &all_stats(), verbose_stat);
            out.push(format!("Save Disadvantage: {stats}"));
        }
        if let Some(b) = &self.check_bonus {
            out.push(format!("Check Bonus: {b}"));
        }
        if !self.check_adv.is_empty() {
            let skills = stat_list(&self.check_adv, &all_skills(), camel_to_title);
            out.push(format!("Check Advantage: {skills}"));
        }
        if !self.check_dis.is_empty() {
            let skills = stat_list(&self.check_dis, &all_skills(), camel_to_title);
            out.push(format!("Check Disadvantage: {skills}"));
        }
        if let Some(v) = self.dc_bonus {
            out.push(format!("DC Bonus: {v}"));
        }
        write!(f, "{}", out.join("; "))
    }
}

// ============================================================================
// Interactions
// ============================================================================

/// An attack granted by an effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectAttack {
    pub name: String,
    pub automation: Automation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verb: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackInteraction {
    pub attack: EffectAttack,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_default_dc: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_default_attack_bonus: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_default_casting_mod: Option<i64>,
}

/// A button on the combatant's turn that runs automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonInteraction {
    pub label: String,
    pub automation: Automation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_default_dc: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_default_attack_bonus: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_default_casting_mod: Option<i64>,
}

// ============================================================================
// Initiative Effect
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiativeEffect {
    pub id: EffectId,
    pub combatant_id: CreatureId,
    pub name: String,
    #[serde(default)]
    pub effects: PassiveEffects,
    #[serde(default)]
    pub attacks: Vec<AttackInteraction>,
    #[serde(default)]
    pub buttons: Vec<ButtonInteraction>,
    /// Rounds the effect lasts; `None` is indefinite.
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub end_round: Option<i64>,
    #[serde(default)]
    pub end_on_turn_end: bool,
    #[serde(default)]
    pub concentration: bool,
    #[serde(default)]
    pub children: Vec<EffectRef>,
    #[serde(default)]
    pub parent: Option<EffectRef>,
    #[serde(default)]
    pub desc: Option<String>,
    /// Combatant whose turns tick this effect, when not its owner.
    #[serde(default)]
    pub tick_on: Option<CreatureId>,
}

impl InitiativeEffect {
    pub fn new(combatant_id: CreatureId, name: impl Into<String>, effects: PassiveEffects) -> Self {
        Self {
            id: EffectId::new(),
            combatant_id,
            name: name.into(),
            effects,
            attacks: Vec::new(),
            buttons: Vec::new(),
            duration: None,
            end_round: None,
            end_on_turn_end: false,
            concentration: false,
            children: Vec::new(),
            parent: None,
            desc: None,
            tick_on: None,
        }
    }

    pub fn with_concentration(mut self) -> Self {
        self.concentration = true;
        self
    }

    pub fn with_parent(mut self, parent: EffectRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    pub fn with_button(mut self, button: ButtonInteraction) -> Self {
        self.buttons.push(button);
        self
    }

    /// Set the duration in rounds. Negative durations are indefinite.
    pub fn with_duration(
        mut self,
        duration: Option<i64>,
        round_num: i64,
        end_on_turn_end: bool,
    ) -> Self {
        let duration = duration.filter(|d| *d >= 0);
        self.duration = duration;
        self.end_on_turn_end = end_on_turn_end;
        self.end_round = duration.map(|d| round_num + d - end_on_turn_end as i64);
        self
    }

    pub fn reference(&self) -> EffectRef {
        EffectRef {
            combatant_id: self.combatant_id,
            effect_id: self.id,
        }
    }

    fn duration_str(&self) -> String {
        let Some(remaining) = self.duration else {
            return String::new();
        };
        if remaining <= 1 {
            return if self.end_on_turn_end {
                "[until end of turn]".to_string()
            } else {
                "[until start of next turn]".to_string()
            };
        }
        let (divisor, unit) = match remaining {
            r if r > 5_256_000 => (5_256_000, "year"),
            r if r > 438_000 => (438_000, "month"),
            r if r > 100_800 => (100_800, "week"),
            r if r > 14_400 => (14_400, "day"),
            r if r > 600 => (600, "hour"),
            r if r > 10 => (10, "minute"),
            _ => (1, "round"),
        };
        if divisor == 1 {
            format!("[{remaining} {unit}s]")
        } else {
            let rounded = (remaining as f64 / divisor as f64 * 10.0).round() / 10.0;
            format!("[{rounded:.1} {unit}s]")
        }
    }

    fn parenthetical_str(&self, encounter: Option<&Encounter>) -> String {
        let mut text = Vec::new();
        if !self.effects.is_empty() {
            text.push(self.effects.to_string());
        }
        for attack in &self.attacks {
            text.push(format!("Attack: {}", attack.attack.name));
        }
        for button in &self.buttons {
            text.push(button.label.clone());
        }
        if let Some(parent) = self.parent.and_then(|p| encounter?.get_effect(p)) {
            text.push(format!("Parent: {}", parent.name));
        }
        if text.is_empty() {
            String::new()
        } else {
            format!("({})", text.join("; "))
        }
    }

    /// `Bless [10 rounds] (Attack Bonus: 1d4) <C>`, optionally followed by
    /// the description.
    pub fn get_str(&self, encounter: Option<&Encounter>, description: bool) -> String {
        let mut out = vec![self.name.clone()];
        let duration = self.duration_str();
        if !duration.is_empty() {
            out.push(duration);
        }
        let parenthetical = self.parenthetical_str(encounter);
        if !parenthetical.is_empty() {
            out.push(parenthetical);
        }
        if self.concentration {
            out.push("<C>".to_string());
        }
        if description {
            if let Some(desc) = &self.desc {
                out.push(format!("\n - {desc}"));
            }
        }
        out.join(" ").trim().to_string()
    }
}

impl fmt::Display for InitiativeEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get_str(None, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{Creature, CreatureKind};

    #[test]
    fn test_resolve_save_advs() {
        let advs = resolve_save_advs(&["dex", "Wisdom"]).unwrap();
        assert_eq!(advs, ["dex".to_string(), "wis".to_string()].into());
        assert_eq!(resolve_save_advs(&["all"]).unwrap().len(), 6);
        assert_eq!(
            resolve_save_advs(&["luck"]).unwrap_err(),
            PassiveEffectError::InvalidStat("luck".into())
        );
    }

    #[test]
    fn test_resolve_check_advs() {
        let advs = resolve_check_advs(&["perc", "stealth"]).unwrap();
        assert!(advs.contains("perception"));
        assert!(advs.contains("stealth"));
        assert!(matches!(
            resolve_check_advs(&["in"]),
            Err(PassiveEffectError::AmbiguousSkill(_, _))
        ));
        assert!(matches!(
            resolve_check_advs(&["flying"]),
            Err(PassiveEffectError::InvalidSkill(_))
        ));
    }

    #[test]
    fn test_value_or_bonus() {
        assert_eq!(resolve_value_or_bonus(&["18", "+2", "-1", "15"]), (Some(18), Some(1)));
        assert_eq!(resolve_value_or_bonus(&["abc"]), (None, None));
    }

    #[test]
    fn test_passive_effects_str() {
        let effects = PassiveEffects {
            attack_advantage: Some(Advantage::Advantage),
            to_hit_bonus: Some("1d4".into()),
            save_dis: all_stats(),
            resistances: vec![Resistance::simple("fire")],
            ..Default::default()
        };
        assert_eq!(
            effects.to_string(),
            "Attack Advantage; Attack Bonus: 1d4; Resistance: fire; Save Disadvantage: All"
        );
    }

    #[test]
    fn test_effect_get_str() {
        let owner = CreatureId::new();
        let bless = InitiativeEffect::new(
            owner,
            "Bless",
            PassiveEffects {
                to_hit_bonus: Some("1d4".into()),
                ..Default::default()
            },
        )
        .with_duration(Some(10), 1, false)
        .with_concentration()
        .with_desc("Blessed.");
        assert_eq!(bless.get_str(None, false), "Bless [10 rounds] (Attack Bonus: 1d4) <C>");
        assert_eq!(bless.end_round, Some(11));
        assert!(bless.to_string().ends_with("\n - Blessed."));

        let hour = InitiativeEffect::new(owner, "Mage Armor", PassiveEffects::default())
            .with_duration(Some(4800), 1, false);
        assert_eq!(hour.get_str(None, false), "Mage Armor [8.0 hours]");

        let short = InitiativeEffect::new(owner, "Dodge", PassiveEffects::default())
            .with_duration(Some(1), 1, true);
        assert_eq!(short.get_str(None, false), "Dodge [until end of turn]");
        assert_eq!(short.end_round, Some(1));
    }

    #[test]
    fn test_parent_in_parenthetical() {
        let mut encounter = Encounter::new();
        let caster = encounter.add(Creature::new("Warlock", CreatureKind::Character).in_combat());
        let target = encounter.add(Creature::new("Orc", CreatureKind::Monster).in_combat());
        let hex =
            InitiativeEffect::new(caster, "Hex", PassiveEffects::default()).with_concentration();
        let hex_ref = hex.reference();
        encounter.add_effect(hex);
        let hexed =
            InitiativeEffect::new(target, "Hexed", PassiveEffects::default()).with_parent(hex_ref);
        assert_eq!(hexed.get_str(Some(&encounter), false), "Hexed (Parent: Hex)");
    }

    #[test]
    fn test_passive_effects_serde_skips_empty() {
        let effects = PassiveEffects {
            ac_bonus: Some(2),
            ..Default::default()
        };
        let json = serde_json::to_string(&effects).unwrap();
        assert_eq!(json, r#"{"ac_bonus":2}"#);
        let back: PassiveEffects = serde_json::from_str(&json).unwrap();
        assert_eq!(back, effects);
    }
}
