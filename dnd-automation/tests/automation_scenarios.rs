//! End-to-end automation runs against a small encounter.
//!
//! Every roll is scripted, so outcomes are exact.
//! Run with: `cargo test -p dnd-automation --test automation_scenarios`

mod common;

use dnd_automation::automation::results::{CastSpellResult, SaveResult, TargetResult};
use dnd_automation::gamedata::{Sourced, StaticEntitlements};
use dnd_automation::persist::SavedEncounter;
use dnd_automation::testing::{
    automation, sample_goblin, sample_wizard, Harness, ScriptedDice,
};
use dnd_automation::world::CustomCounter;
use dnd_automation::{
    ArgBag, AutomationConfig, AutomationContext, AutomationError, AutomationResult, EffectResult,
    NoEntitlements, RunOptions, TargetRef,
};
use serde_json::json;

fn target_result(result: &AutomationResult, index: usize) -> &TargetResult {
    match &result.children[index] {
        EffectResult::Target(target) => target,
        other => panic!("expected a target result, got {other:?}"),
    }
}

fn first_save(result: &EffectResult) -> &SaveResult {
    match result {
        EffectResult::Save(save) => save,
        other => panic!("expected a save, got {other:?}"),
    }
}

fn first_cast(result: &AutomationResult) -> &CastSpellResult {
    match &result.children[0] {
        EffectResult::CastSpell(cast) => cast,
        other => panic!("expected a cast, got {other:?}"),
    }
}

fn named_goblin(name: &str) -> dnd_automation::Creature {
    let mut goblin = sample_goblin();
    goblin.name = name.to_string();
    goblin
}

// =============================================================================
// Attacks
// =============================================================================

#[test]
fn test_attack_hit_is_visible_to_later_nodes() {
    common::init_tracing();
    let auto = automation(json!([
        {"type": "target", "target": "each", "effects": [{
            "type": "attack",
            "attackBonus": "5",
            "hit": [{"type": "damage", "damage": "1d6[piercing]"}],
            "miss": []
        }]},
        {"type": "text", "text": "{lastAttackDidHit} {lastAttackDidCrit}"}
    ]));
    // d20 shows 12: 12 + 5 against AC 15
    let mut h = Harness::new(sample_wizard())
        .with_target(sample_goblin())
        .with_rolls(vec![12, 4]);
    let result = h.run(&auto, "").unwrap();

    assert_eq!(result.output.field("Effect").unwrap().value, "True False");
    assert_eq!(result.get_damage(), 4);
    assert_eq!(h.target(0).current_hp(), Some(3));
    assert!(!result.is_spell);
}

#[test]
fn test_attack_miss_skips_hit_branch() {
    let auto = automation(json!([
        {"type": "target", "target": "each", "effects": [{
            "type": "attack",
            "attackBonus": "2",
            "hit": [{"type": "damage", "damage": "1d6"}],
            "miss": [{"type": "text", "text": "The arrow clatters away."}]
        }]},
        {"type": "text", "text": "{lastAttackDidHit}", "title": "Hit?"}
    ]));
    let mut h = Harness::new(sample_wizard())
        .with_target(sample_goblin())
        .with_rolls(vec![9]);
    let result = h.run(&auto, "").unwrap();

    assert_eq!(result.get_damage(), 0);
    assert_eq!(result.output.field("Hit?").unwrap().value, "False");
    assert_eq!(h.target(0).current_hp(), Some(7));
}

// =============================================================================
// Damage and resistance
// =============================================================================

#[test]
fn test_resistance_halves_only_the_resistant_target() {
    let auto = automation(json!([
        {"type": "target", "target": "all", "effects": [{"type": "damage", "damage": "2d6[fire]"}]}
    ]));
    let mut h = Harness::new(sample_wizard())
        .with_target(named_goblin("Ash Goblin").with_resistance("fire"))
        .with_target(named_goblin("Bog Goblin"))
        .with_rolls(vec![3]);
    let result = h.run(&auto, "").unwrap();

    assert_eq!(result.get_damage(), 9);
    assert_eq!(h.target(0).current_hp(), Some(4));
    assert_eq!(h.target(1).current_hp(), Some(1));
}

#[test]
fn test_repeat_rolls_run_every_target_twice() {
    let auto = automation(json!([
        {"type": "target", "target": "each", "effects": [{"type": "damage", "damage": "1"}]}
    ]));
    let mut h = Harness::new(sample_wizard())
        .with_target(named_goblin("Goblin A"))
        .with_target(named_goblin("Goblin B"))
        .with_target(named_goblin("Goblin C"));
    let result = h.run(&auto, "-rr 2").unwrap();

    let target = target_result(&result, 0);
    assert_eq!(target.iterations.len(), 6);
    assert_eq!(
        target.iterations.iter().map(|i| i.target_iteration).collect::<Vec<_>>(),
        vec![1, 2, 1, 2, 1, 2]
    );
    assert_eq!(result.get_damage(), 6);
    for index in 0..3 {
        assert_eq!(h.target(index).current_hp(), Some(5));
    }
    assert!(result
        .output
        .field("Goblin B")
        .unwrap()
        .value
        .contains("**__Total Damage__**: 2"));
}

#[test]
fn test_repeat_rolls_are_capped_by_config() {
    let auto = automation(json!([
        {"type": "target", "target": "each", "effects": [{"type": "damage", "damage": "1"}]}
    ]));
    let config = AutomationConfig {
        max_repeat_rolls: 3,
        ..AutomationConfig::default()
    };
    let mut h = Harness::new(sample_wizard())
        .with_target(sample_goblin())
        .with_config(config);
    let result = h.run(&auto, "-rr 50").unwrap();
    assert_eq!(target_result(&result, 0).iterations.len(), 3);
    assert_eq!(h.target(0).current_hp(), Some(4));
}

// =============================================================================
// Saves
// =============================================================================

#[test]
fn test_dc_argument_modifies_node_dc() {
    let auto = automation(json!([
        {"type": "target", "target": "each", "effects": [{
            "type": "save", "stat": "dex", "dc": "10", "fail": [], "success": []
        }]}
    ]));
    // 11 + 2 dex meets 12
    let mut h = Harness::new(sample_wizard())
        .with_target(sample_goblin())
        .with_rolls(vec![11]);
    let result = h.run(&auto, "-dc +2").unwrap();

    let save = first_save(&target_result(&result, 0).iterations[0].results[0]);
    assert_eq!(save.dc, 12);
    assert!(save.did_save);
}

#[test]
fn test_upcast_save_spell_adds_higher_level_dice() {
    let mut h = Harness::new(sample_wizard())
        .with_target(sample_goblin().with_hp(30))
        .with_compendium(common::compendium())
        .with_rolls(vec![1, 2]);
    let auto = automation(json!([{"type": "spell", "id": 2, "level": 3}]));
    let result = h.run(&auto, "").unwrap();

    let cast = first_cast(&result);
    assert!(cast.success);
    assert_eq!(cast.level_override, Some(3));
    // 3d6 + 2d6 at 2 each
    assert_eq!(result.get_damage(), 10);
    assert_eq!(h.target(0).current_hp(), Some(20));
    assert!(result
        .output
        .field("Effect")
        .unwrap()
        .value
        .starts_with("**At Higher Levels**: The damage increases"));
}

// =============================================================================
// Counters
// =============================================================================

#[test]
fn test_spent_counter_warns_and_stays_empty() {
    let wizard =
        sample_wizard().with_counter(CustomCounter::new("Ki", 0).with_bounds(Some(0), Some(3)));
    let auto = automation(json!([
        {"type": "counter", "counter": "Ki", "amount": "1"},
        {"type": "text", "text": "Still going"}
    ]));
    let mut h = Harness::new(wizard);
    let result = h.run(&auto, "").unwrap();

    assert!(result.output.field("Meta").unwrap().value.contains("**Warning**"));
    assert_eq!(result.output.field("Effect").unwrap().value, "Still going");
    assert_eq!(h.caster().counters[0].value, 0);
}

// =============================================================================
// Spells
// =============================================================================

#[test]
fn test_spell_cannot_cast_another_spell() {
    let mut compendium = common::compendium();
    compendium.add_spell(
        dnd_automation::gamedata::Spell::new(3, "Chain Casting", 2)
            .with_automation(automation(json!([{"type": "spell", "id": 1}]))),
    );
    let mut h = Harness::new(sample_wizard())
        .with_target(sample_goblin())
        .with_compendium(compendium);
    let result = h.run(&automation(json!([{"type": "spell", "id": 3}])), "").unwrap();

    let outer = first_cast(&result);
    assert!(outer.success);
    let EffectResult::CastSpell(inner) = &outer.children[0] else {
        panic!("expected the nested cast");
    };
    assert!(!inner.success);
    assert!(result
        .output
        .field("Meta")
        .unwrap()
        .value
        .contains("Unable to cast another spell inside a spell."));
    assert_eq!(h.target(0).current_hp(), Some(7));
}

#[tokio::test]
async fn test_licensed_spell_needs_entitlement() {
    common::init_tracing();
    let mut compendium = common::compendium();
    compendium.add_spell(common::fire_bolt().with_sourced(Sourced::licensed("PHB", 1)));

    let mut encounter = dnd_automation::Encounter::new();
    let wizard = encounter.add(sample_wizard());
    let goblin = encounter.add(sample_goblin());
    let config = AutomationConfig::default();
    let auto = automation(json!([{"type": "spell", "id": 1}]));

    // unlinked users are refused before anything rolls
    let mut dice = ScriptedDice::new(vec![15, 6]);
    let mut ctx = AutomationContext::new(
        &mut encounter,
        &compendium,
        &mut dice,
        &config,
        wizard,
        vec![TargetRef::Creature(goblin)],
        ArgBag::new(),
        RunOptions::new("user"),
    )
    .unwrap();
    let err = auto.run(&mut ctx, &NoEntitlements).await.unwrap_err();
    assert!(matches!(err, AutomationError::RequiresLicense { .. }));
    assert!(!err.is_recoverable());
    assert_eq!(encounter.get(goblin).unwrap().current_hp(), Some(7));

    let owned = StaticEntitlements::new().grant("user", "spell", 1);
    let mut ctx = AutomationContext::new(
        &mut encounter,
        &compendium,
        &mut dice,
        &config,
        wizard,
        vec![TargetRef::Creature(goblin)],
        ArgBag::new(),
        RunOptions::new("user"),
    )
    .unwrap();
    let result = auto.run(&mut ctx, &owned).await.unwrap();
    // 15 + 6 hits AC 15, 1d10 shows 6
    assert_eq!(result.get_damage(), 6);
    assert_eq!(encounter.get(goblin).unwrap().current_hp(), Some(1));
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn test_damage_survives_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ambush.json");
    let auto = automation(json!([
        {"type": "target", "target": "all", "effects": [{"type": "damage", "damage": "5"}]}
    ]));
    let mut h = Harness::new(sample_wizard()).with_target(sample_goblin());
    h.run(&auto, "").unwrap();

    SavedEncounter::new("Ambush", h.encounter.clone())
        .save_json(&path)
        .await
        .unwrap();
    let loaded = SavedEncounter::load_json(&path).await.unwrap();
    let goblin = loaded.encounter.find_by_name("Goblin").unwrap();
    assert_eq!(loaded.encounter.get(goblin).unwrap().current_hp(), Some(2));
}
