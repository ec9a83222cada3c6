//! Encounter and compendium persistence.
//!
//! Automation mutates creatures in place and leaves saving to the caller.
//! This module is that caller-side `commit()`: JSON files on disk, written
//! and read with `tokio::fs`.

use crate::gamedata::StaticCompendium;
use crate::world::Encounter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Current save file version.
const SAVE_VERSION: u32 = 1;

/// An encounter as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedEncounter {
    /// Save format version for compatibility checking.
    pub version: u32,

    /// Seconds since the Unix epoch when the save was made.
    pub saved_at: String,

    pub metadata: EncounterMetadata,

    pub encounter: Encounter,
}

/// What a save holds, readable without loading the whole encounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncounterMetadata {
    pub name: String,
    pub round_num: i64,
    pub creature_names: Vec<String>,
}

impl SavedEncounter {
    pub fn new(name: impl Into<String>, encounter: Encounter) -> Self {
        let metadata = EncounterMetadata {
            name: name.into(),
            round_num: encounter.round_num,
            creature_names: encounter.creatures.iter().map(|c| c.name.clone()).collect(),
        };
        Self {
            version: SAVE_VERSION,
            saved_at: timestamp(),
            metadata,
            encounter,
        }
    }

    /// Save to a JSON file.
    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content).await?;
        debug!(path = %path.as_ref().display(), "Saved encounter");
        Ok(())
    }

    /// Load from a JSON file.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let content = fs::read_to_string(path).await?;
        let saved: Self = serde_json::from_str(&content)?;
        check_version(saved.version)?;
        Ok(saved)
    }

    /// Read a save's metadata without keeping the encounter.
    pub async fn peek_metadata(path: impl AsRef<Path>) -> Result<EncounterMetadata, PersistError> {
        let content = fs::read_to_string(path).await?;

        #[derive(Deserialize)]
        struct Partial {
            version: u32,
            metadata: EncounterMetadata,
        }

        let partial: Partial = serde_json::from_str(&content)?;
        check_version(partial.version)?;
        Ok(partial.metadata)
    }
}

/// Every encounter save in `dir`, newest name first. Unreadable files are
/// skipped.
pub async fn list_saves(dir: impl AsRef<Path>) -> Result<Vec<SaveInfo>, PersistError> {
    let mut saves = Vec::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "json") {
            if let Ok(metadata) = SavedEncounter::peek_metadata(&path).await {
                saves.push(SaveInfo { path, metadata });
            }
        }
    }

    saves.sort_by(|a, b| b.path.cmp(&a.path));
    Ok(saves)
}

/// A save file found by [`list_saves`].
#[derive(Debug, Clone)]
pub struct SaveInfo {
    pub path: PathBuf,
    pub metadata: EncounterMetadata,
}

/// `<dir>/<name>.json` with anything but letters and digits replaced.
pub fn save_path(base_dir: impl AsRef<Path>, name: &str) -> PathBuf {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    base_dir.as_ref().join(format!("{sanitized}.json"))
}

// ============================================================================
// Compendium
// ============================================================================

/// Load spells and entities from a JSON file.
pub async fn load_compendium(path: impl AsRef<Path>) -> Result<StaticCompendium, PersistError> {
    let content = fs::read_to_string(path.as_ref()).await?;
    let compendium: StaticCompendium = serde_json::from_str(&content)?;
    debug!(
        path = %path.as_ref().display(),
        spells = compendium.spells.len(),
        entities = compendium.entities.len(),
        "Loaded compendium"
    );
    Ok(compendium)
}

pub async fn save_compendium(
    compendium: &StaticCompendium,
    path: impl AsRef<Path>,
) -> Result<(), PersistError> {
    let content = serde_json::to_string_pretty(compendium)?;
    fs::write(path, content).await?;
    Ok(())
}

fn check_version(found: u32) -> Result<(), PersistError> {
    if found != SAVE_VERSION {
        return Err(PersistError::VersionMismatch {
            expected: SAVE_VERSION,
            found,
        });
    }
    Ok(())
}

fn timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    now.as_secs().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gamedata::Spell;
    use crate::testing::{sample_goblin, sample_wizard};
    use crate::world::CustomCounter;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_encounter_round_trip() {
        let dir = tempdir().unwrap();
        let path = save_path(dir.path(), "Goblin Ambush!");
        assert!(path.ends_with("Goblin_Ambush_.json"));

        let mut encounter = Encounter::new();
        encounter.round_num = 3;
        encounter.add(
            sample_wizard().with_counter(CustomCounter::new("Ki", 2).with_bounds(Some(0), Some(5))),
        );
        let goblin = encounter.add(sample_goblin().in_combat());
        if let Some(g) = encounter.get_mut(goblin) {
            g.modify_hp(-4, false);
        }

        SavedEncounter::new("Goblin Ambush!", encounter.clone())
            .save_json(&path)
            .await
            .unwrap();
        let loaded = SavedEncounter::load_json(&path).await.unwrap();
        assert_eq!(loaded.encounter, encounter);
        assert_eq!(loaded.metadata.creature_names, vec!["Merlin", "Goblin"]);

        let metadata = SavedEncounter::peek_metadata(&path).await.unwrap();
        assert_eq!(metadata.round_num, 3);

        let saves = list_saves(dir.path()).await.unwrap();
        assert_eq!(saves.len(), 1);
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.json");
        let mut saved = SavedEncounter::new("old", Encounter::new());
        saved.version = 99;
        saved.save_json(&path).await.unwrap();
        assert!(matches!(
            SavedEncounter::load_json(&path).await,
            Err(PersistError::VersionMismatch { expected: 1, found: 99 })
        ));
    }

    #[tokio::test]
    async fn test_compendium_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("compendium.json");
        let compendium = StaticCompendium::new().with_spell(Spell::new(1, "Fire Bolt", 0));
        save_compendium(&compendium, &path).await.unwrap();
        let loaded = load_compendium(&path).await.unwrap();
        assert_eq!(loaded.spells[&1].name, "Fire Bolt");
    }
}
