//! Stored automation JSON: parsing, re-serializing, and running what was
//! loaded.

mod common;

use dnd_automation::automation::effects::{IEffectEffects, TargetSelector};
use dnd_automation::gamedata::StaticCompendium;
use dnd_automation::persist::{load_compendium, save_compendium};
use dnd_automation::testing::{sample_goblin, sample_wizard, Harness};
use dnd_automation::{Automation, Effect};
use serde_json::json;

/// Hex: a bonus-action curse with a button to move it.
fn hex() -> serde_json::Value {
    json!([
        {"type": "target", "target": "each", "effects": [{
            "type": "ieffect2",
            "name": "Hexed",
            "duration": "60 * 10",
            "conc": true,
            "desc": "Takes an extra 1d6 necrotic from the caster's attacks.",
            "effects": {"check_dis": ["strength"]},
            "save_as": "hex"
        }]},
        {"type": "target", "target": "self", "effects": [{
            "type": "ieffect2",
            "name": "Hex",
            "parent": "hex",
            "effects": {"damage_bonus": "1d6[necrotic]"},
            "buttons": [{
                "label": "Move Hex",
                "automation": [{"type": "remove_ieffect", "removeParent": "always"}],
                "verb": "moves their hex",
                "defaultDC": "spell_dc"
            }]
        }]}
    ])
}

/// A maneuver: spend a die, roll it, then a contested shove.
fn trip_attack() -> serde_json::Value {
    json!([
        {"type": "counter", "counter": {"id": 75, "typeId": 12168134}, "amount": 1, "errorBehaviour": "raise"},
        {"type": "roll", "dice": "1d8", "name": "sup", "displayName": "Superiority Die"},
        {"type": "target", "target": 1, "sortBy": "hp_asc", "effects": [
            {"type": "check", "ability": ["athletics", "acrobatics"], "contestAbility": "athletics",
             "contestTie": "neither", "fail": [{"type": "text", "text": "Knocked prone!"}], "success": []},
            {"type": "condition", "condition": "lastCheckDidPass == False", "errorBehaviour": "neither",
             "onTrue": [{"type": "variable", "name": "tripped", "value": "1"}], "onFalse": []}
        ]}
    ])
}

/// A homebrew feature: a saving throw, a ward of temp HP, then a free cast.
fn warding_bond() -> serde_json::Value {
    json!([
        {"type": "target", "target": "each", "effects": [{
            "type": "save", "stat": "wis", "dc": "8 + proficiencyBonus + wisdomMod", "adv": -1,
            "fail": [{"type": "damage", "damage": "2d8[psychic]"}],
            "success": [],
            "meta": [{"type": "roll", "dice": "1d4", "name": "bane"}]
        }]},
        {"type": "target", "target": "self", "effects": [{
            "type": "temphp", "amount": "1d8 + {spell}",
            "higher": {"2": "1d8", "3": "2d8"},
            "cantripScale": false
        }]},
        {"type": "spell", "id": 2, "level": 3, "dc": "15", "attackBonus": "7", "castingMod": "4", "parent": "bond"}
    ])
}

fn stored_spell(spell: dnd_automation::gamedata::Spell) -> serde_json::Value {
    serde_json::to_value(spell.automation.unwrap()).unwrap()
}

#[test]
fn test_stored_trees_survive_a_round_trip() {
    let stored = [
        hex(),
        trip_attack(),
        warding_bond(),
        stored_spell(common::fire_bolt()),
        stored_spell(common::burning_hands()),
    ];
    for stored in stored {
        let parsed: Automation = serde_json::from_value(stored).unwrap();
        let written = serde_json::to_value(&parsed).unwrap();
        let reparsed: Automation = serde_json::from_value(written).unwrap();
        assert_eq!(reparsed, parsed);
    }
}

#[test]
fn test_save_temphp_and_spell_keep_their_fields() {
    let parsed: Automation = serde_json::from_value(warding_bond()).unwrap();
    let written = serde_json::to_value(&parsed).unwrap();

    let save = &written[0]["effects"][0];
    assert_eq!(save["type"], "save");
    assert_eq!(save["dc"], "8 + proficiencyBonus + wisdomMod");
    assert_eq!(save["adv"], -1);
    assert_eq!(save["meta"][0]["name"], "bane");

    let temphp = &written[1]["effects"][0];
    assert_eq!(temphp["type"], "temphp");
    assert_eq!(temphp["amount"], "1d8 + {spell}");
    assert_eq!(temphp["higher"]["3"], "2d8");
    assert_eq!(temphp["cantripScale"], false);

    let Effect::CastSpell(cast) = &parsed.effects()[2] else {
        panic!("expected a spell");
    };
    assert_eq!(cast.id, 2);
    assert_eq!(cast.level, Some(3));
    assert_eq!(cast.parent.as_deref(), Some("bond"));
    assert_eq!(written[2]["type"], "spell");
    assert_eq!(written[2]["attackBonus"], "7");
    assert_eq!(written[2]["castingMod"], "4");
}

#[test]
fn test_hex_shape() {
    let parsed: Automation = serde_json::from_value(hex()).unwrap();
    let Effect::Target(self_target) = &parsed.effects()[1] else {
        panic!("expected a target");
    };
    assert!(matches!(self_target.target, TargetSelector::Keyword(_)));
    let Effect::IEffect(ieffect) = &self_target.effects[0] else {
        panic!("expected an ieffect");
    };
    assert_eq!(ieffect.parent.as_deref(), Some("hex"));
    assert_eq!(ieffect.buttons[0].label, "Move Hex");
    assert!(ieffect.buttons[0].defaults.default_dc.is_some());
    assert!(matches!(ieffect.effects, IEffectEffects::Template(_)));

    // defaults are written back flat, next to the label
    let written = serde_json::to_value(&parsed).unwrap();
    assert_eq!(written[1]["effects"][0]["buttons"][0]["defaultDC"], "spell_dc");
    assert_eq!(written[1]["effects"][0]["type"], "ieffect2");
}

#[test]
fn test_legacy_ieffect_forms() {
    let parsed: Automation = serde_json::from_value(json!([
        {"type": "ieffect", "name": "Shield", "duration": 1, "effects": "-ac +5"}
    ]))
    .unwrap();
    let Effect::IEffect(ieffect) = &parsed.effects()[0] else {
        panic!("expected an ieffect");
    };
    assert_eq!(ieffect.effects, IEffectEffects::Legacy("-ac +5".into()));
    assert_eq!(serde_json::to_value(&parsed).unwrap()[0]["type"], "ieffect2");
}

#[test]
fn test_malformed_trees_are_rejected() {
    let unknown_type = json!([{"type": "teleport", "to": "moon"}]);
    assert!(serde_json::from_value::<Automation>(unknown_type).is_err());

    let missing_branch = json!([{"type": "condition", "condition": "True", "onTrue": []}]);
    assert!(serde_json::from_value::<Automation>(missing_branch).is_err());

    let unknown_passive = json!([
        {"type": "ieffect2", "name": "Odd", "effects": {"fly_speed": 30}}
    ]);
    assert!(serde_json::from_value::<Automation>(unknown_passive).is_err());
}

#[test]
fn test_loaded_tree_runs() {
    let stored = r#"[
        {"type": "target", "target": "all", "effects": [
            {"type": "temphp", "amount": "5"},
            {"type": "damage", "damage": "8"}
        ]}
    ]"#;
    let auto: Automation = serde_json::from_str(stored).unwrap();
    let mut h = Harness::new(sample_wizard()).with_target(sample_goblin());
    let result = h.run(&auto, "").unwrap();
    assert_eq!(result.get_damage(), 8);
    // 5 soaked by temp HP
    assert_eq!(h.target(0).current_hp(), Some(4));
}

#[tokio::test]
async fn test_compendium_file_keeps_automation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spells.json");
    save_compendium(&common::compendium(), &path).await.unwrap();

    let loaded: StaticCompendium = load_compendium(&path).await.unwrap();
    assert_eq!(loaded.spells[&1], common::fire_bolt());
    assert_eq!(loaded.spells[&2].automation, common::burning_hands().automation);
}
