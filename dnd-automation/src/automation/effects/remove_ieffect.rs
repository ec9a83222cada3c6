use super::Effect;
use crate::automation::errors::AutomationError;
use crate::automation::results::RemoveIEffectResult;
use crate::automation::runtime::AutomationContext;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoveParent {
    Always,
    IfNoChildren,
}

/// Remove the effect whose button triggered this run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoveIEffect {
    #[serde(rename = "removeParent", default, skip_serializing_if = "Option::is_none")]
    pub remove_parent: Option<RemoveParent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Effect>,
}

impl RemoveIEffect {
    pub fn new(remove_parent: Option<RemoveParent>) -> Self {
        Self {
            remove_parent,
            meta: Vec::new(),
        }
    }

    pub(super) fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<RemoveIEffectResult, AutomationError> {
        let missing = || {
            AutomationError::automation(
                "Tried to remove an IEffect without an active IEffect context!",
            )
        };
        let ieffect = ctx.ieffect.ok_or_else(missing)?;
        let parent = ctx.encounter.get_effect(ieffect).ok_or_else(missing)?.parent;

        let removed_effect = ctx
            .encounter
            .remove_effect(ieffect)
            .into_iter()
            .next()
            .ok_or_else(missing)?;
        ctx.meta_queue(format!("**Removed Effect**: {}", removed_effect.name));

        let removed_parent = match (self.remove_parent, parent) {
            (Some(mode), Some(parent)) => self.remove_parent_effect(ctx, mode, parent),
            _ => None,
        };

        Ok(RemoveIEffectResult {
            removed_effect,
            removed_parent,
        })
    }

    fn remove_parent_effect(
        &self,
        ctx: &mut AutomationContext<'_>,
        mode: RemoveParent,
        parent: crate::initiative::EffectRef,
    ) -> Option<crate::initiative::InitiativeEffect> {
        let has_children = ctx
            .encounter
            .effect_children(parent)
            .into_iter()
            .any(|c| ctx.encounter.get_effect(c).is_some());
        let remove = match mode {
            RemoveParent::Always => true,
            RemoveParent::IfNoChildren => !has_children,
        };
        if !remove {
            return None;
        }
        let removed = ctx.encounter.remove_effect(parent).into_iter().next()?;
        ctx.meta_queue(format!("**Removed Effect**: {}", removed.name));
        Some(removed)
    }

    pub(super) fn build_str(&self) -> String {
        "Removes triggering effect".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::results::EffectResult;
    use crate::automation::RunOptions;
    use crate::initiative::{InitiativeEffect, PassiveEffects};
    use crate::testing::{automation, sample_goblin, sample_wizard, Harness};
    use serde_json::json;

    fn setup() -> (Harness, crate::initiative::EffectRef, crate::initiative::EffectRef) {
        let mut h =
            Harness::new(sample_wizard().in_combat()).with_target(sample_goblin().in_combat());
        let caster = h.caster;
        let goblin = h.targets[0];
        let hex =
            InitiativeEffect::new(caster, "Hex", PassiveEffects::default()).with_concentration();
        let hex_ref = hex.reference();
        h.encounter.add_effect(hex);
        let hexed =
            InitiativeEffect::new(goblin, "Hexed", PassiveEffects::default()).with_parent(hex_ref);
        let hexed_ref = hexed.reference();
        h.encounter.add_effect(hexed);
        (h, hex_ref, hexed_ref)
    }

    #[test]
    fn test_removes_triggering_effect_and_parent() {
        let (mut h, hex_ref, hexed_ref) = setup();
        let auto = automation(json!([
            {"type": "remove_ieffect", "removeParent": "if_no_children"}
        ]));
        let options = RunOptions::new("user").from_ieffect_button(hexed_ref);
        let result = h.run_with_options(&auto, "", options).unwrap();
        let EffectResult::RemoveIEffect(removed) = &result.children[0] else {
            panic!("expected a removal");
        };
        assert_eq!(removed.removed_effect.name, "Hexed");
        assert_eq!(removed.removed_parent.as_ref().map(|e| e.name.as_str()), Some("Hex"));
        assert!(h.encounter.get_effect(hex_ref).is_none());
        assert!(h.encounter.get_effect(hexed_ref).is_none());
        let meta = &result.output.field("Meta").unwrap().value;
        assert!(meta.contains("**Removed Effect**: Hexed"));
        assert!(meta.contains("**Removed Effect**: Hex"));
    }

    #[test]
    fn test_parent_kept_without_mode() {
        let (mut h, hex_ref, hexed_ref) = setup();
        let auto = automation(json!([{"type": "remove_ieffect"}]));
        let options = RunOptions::new("user").from_ieffect_button(hexed_ref);
        h.run_with_options(&auto, "", options).unwrap();
        assert!(h.encounter.get_effect(hex_ref).is_some());
        assert!(h.encounter.get_effect(hexed_ref).is_none());
    }

    #[test]
    fn test_requires_ieffect_context() {
        let auto = automation(json!([{"type": "remove_ieffect"}]));
        let mut h = Harness::new(sample_wizard());
        assert!(h.run(&auto, "").is_err());
    }
}
