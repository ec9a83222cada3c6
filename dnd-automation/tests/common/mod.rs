//! Shared setup for the integration tests.

#![allow(dead_code)]

use dnd_automation::gamedata::{Spell, StaticCompendium};
use dnd_automation::testing::automation;
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Route `tracing` output through the test writer. Set `RUST_LOG=debug` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Level 0 spell attack: 1d10 fire on a hit.
pub fn fire_bolt() -> Spell {
    Spell::new(1, "Fire Bolt", 0)
        .with_description("You hurl a mote of fire at a creature or object within range.")
        .with_automation(automation(json!([{
            "type": "target",
            "target": "each",
            "effects": [{
                "type": "attack",
                "hit": [{"type": "damage", "damage": "1d10[fire]"}],
                "miss": []
            }]
        }])))
}

/// Level 1 DEX save for half, scaling a die per slot.
pub fn burning_hands() -> Spell {
    Spell::new(2, "Burning Hands", 1)
        .with_higher_levels("The damage increases by 1d6 for each slot level above 1st.")
        .with_automation(automation(json!([{
            "type": "target",
            "target": "all",
            "effects": [{
                "type": "save",
                "stat": "dex",
                "fail": [{"type": "damage", "damage": "3d6[fire]", "higher": {"2": "1d6[fire]", "3": "2d6[fire]"}}],
                "success": [{"type": "damage", "damage": "(3d6[fire])/2"}]
            }]
        }])))
}

pub fn compendium() -> StaticCompendium {
    StaticCompendium::new().with_spell(fire_bolt()).with_spell(burning_hands())
}
