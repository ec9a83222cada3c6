//! Engine limits and defaults.

use serde::{Deserialize, Serialize};

/// Limits applied while running automation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// Upper bound on `-rr` repeats for a single target.
    pub max_repeat_rolls: u32,
    /// Text nodes longer than this are trimmed with an ellipsis.
    pub text_max_len: usize,
    /// Initiative effect descriptions are cut at this length.
    pub effect_desc_max_len: usize,
    /// Output fields are chunked at this many characters.
    pub field_max_len: usize,
    /// Most dice a single roll may throw.
    pub max_dice: u32,
    /// Natural roll that scores a critical hit when a creature has no override.
    pub default_crit_on: i64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            max_repeat_rolls: 25,
            text_max_len: 1020,
            effect_desc_max_len: 500,
            field_max_len: 1024,
            max_dice: crate::dice::DEFAULT_MAX_DICE,
            default_crit_on: 20,
        }
    }
}

impl AutomationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the repeat cap for `-rr`.
    pub fn with_max_repeat_rolls(mut self, max: u32) -> Self {
        self.max_repeat_rolls = max.max(1);
        self
    }

    /// Set the text trim length.
    pub fn with_text_max_len(mut self, len: usize) -> Self {
        self.text_max_len = len;
        self
    }

    pub fn with_effect_desc_max_len(mut self, len: usize) -> Self {
        self.effect_desc_max_len = len;
        self
    }

    pub fn with_field_max_len(mut self, len: usize) -> Self {
        self.field_max_len = len.max(16);
        self
    }

    /// Set the dice budget per roll.
    pub fn with_max_dice(mut self, max: u32) -> Self {
        self.max_dice = max;
        self
    }
}
