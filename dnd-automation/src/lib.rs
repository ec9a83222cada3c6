//! D&D 5e automation engine.
//!
//! This crate provides:
//! - Data-driven effect trees for attacks, saves, checks, damage and spells
//! - An execution context that resolves them against an encounter
//! - Dice, a small expression language, and the resistance pipeline they need
//! - Encounter and compendium persistence
//!
//! # Quick Start
//!
//! ```ignore
//! use dnd_automation::{
//!     ArgBag, Automation, AutomationConfig, AutomationContext, NoEntitlements, RandomDice,
//!     RunOptions, TargetRef,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let automation: Automation = serde_json::from_str(FIRE_BOLT)?;
//!     let mut dice = RandomDice::new();
//!     let config = AutomationConfig::default();
//!
//!     let mut ctx = AutomationContext::new(
//!         &mut encounter,
//!         &compendium,
//!         &mut dice,
//!         &config,
//!         wizard,
//!         vec![TargetRef::Creature(goblin)],
//!         ArgBag::parse("adv"),
//!         RunOptions::new("user"),
//!     )?;
//!     let result = automation.run(&mut ctx, &NoEntitlements).await?;
//!     println!("{}", result.output.to_text());
//!     Ok(())
//! }
//! ```

pub mod args;
pub mod automation;
pub mod config;
pub mod dice;
pub mod gamedata;
pub mod initiative;
pub mod persist;
pub mod resistance;
pub mod script;
pub mod testing;
pub mod world;

// Primary public API
pub use args::ArgBag;
pub use automation::{
    Automation, AutomationContext, AutomationError, AutomationOutput, AutomationResult, Effect,
    EffectResult, InteractionRun, RunOptions,
};
pub use config::AutomationConfig;
pub use dice::{Advantage, DiceSource, RandomDice};
pub use gamedata::{Compendium, EntitlementProvider, NoEntitlements, StaticCompendium};
pub use world::{Creature, CreatureId, Encounter, TargetRef};
