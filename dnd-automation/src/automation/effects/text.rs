use super::{AbilityReference, Effect, PreflightContext};
use crate::automation::errors::AutomationError;
use crate::automation::results::TextResult;
use crate::automation::runtime::AutomationContext;
use crate::automation::utils::trim_with_ellipsis;
use serde::{Deserialize, Serialize};

/// Literal annotated text, or the description of a compendium entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextSource {
    Literal(String),
    Entity(AbilityReference),
}

impl From<&str> for TextSource {
    fn from(s: &str) -> Self {
        TextSource::Literal(s.to_string())
    }
}

/// Narrate text in its own field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Text {
    pub text: TextSource,
    /// Field title; entity references default to the entity's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Effect>,
}

impl Text {
    pub fn new(text: impl Into<TextSource>) -> Self {
        Self {
            text: text.into(),
            title: None,
            meta: Vec::new(),
        }
    }

    pub(super) async fn preflight(
        &self,
        pctx: &PreflightContext<'_>,
    ) -> Result<(), AutomationError> {
        if let TextSource::Entity(reference) = &self.text {
            if let Some(entity) = pctx.compendium.lookup(reference.key()) {
                pctx.require_access(entity).await?;
            }
        }
        Ok(())
    }

    pub(super) fn run(
        &self,
        ctx: &mut AutomationContext<'_>,
    ) -> Result<Option<TextResult>, AutomationError> {
        let hide = ctx.args.last_bool("h", false);

        let (title, text) = match &self.text {
            TextSource::Literal(text) if text.is_empty() => return Ok(None),
            TextSource::Literal(text) => (
                self.title.clone().unwrap_or_else(|| "Effect".to_string()),
                ctx.parse_annostr(text)?,
            ),
            TextSource::Entity(reference) => {
                let entity = ctx
                    .compendium
                    .lookup(reference.key())
                    .ok_or_else(|| {
                        AutomationError::automation("Invalid entity reference in Text effect.")
                    })?;
                let description = entity.description().unwrap_or_default().to_string();
                (self.title.clone().unwrap_or_else(|| entity.name().to_string()), description)
            }
        };
        if text.is_empty() {
            return Ok(None);
        }

        let text = trim_with_ellipsis(&text, ctx.config.text_max_len);
        if hide {
            ctx.pm_invoker(text.clone());
        } else {
            ctx.effect_queue_titled(title, text.clone());
        }
        Ok(Some(TextResult { text: Some(text) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::PreflightContext;
    use crate::gamedata::{Entity, Sourced, StaticEntitlements, CLASS_FEATURE_TYPE_ID};
    use crate::testing::{automation, sample_wizard, Harness};
    use crate::world::EntityKey;
    use serde_json::json;

    #[test]
    fn test_literal_text_is_trimmed_and_hidden() {
        let long = "a".repeat(1100);
        let auto = automation(json!([{"type": "text", "text": long}]));
        let mut h = Harness::new(sample_wizard());
        let result = h.run(&auto, "").unwrap();
        let value = &result.output.field("Effect").unwrap().value;
        assert_eq!(value.chars().count(), 1023);
        assert!(value.ends_with("..."));

        let auto = automation(json!([{"type": "text", "text": "secret", "title": "Note"}]));
        let result = h.run(&auto, "-h").unwrap();
        assert!(result.output.field("Note").is_none());
        assert_eq!(result.output.private_messages["user"], vec!["secret".to_string()]);
    }

    #[test]
    fn test_entity_description() {
        let key = EntityKey {
            type_id: CLASS_FEATURE_TYPE_ID,
            id: 75,
        };
        let mut h = Harness::new(sample_wizard());
        h.compendium.add_entity(
            Entity::new(key, "Arcane Recovery").with_description("Regain some slots."),
        );
        let auto = automation(json!([
            {"type": "text", "text": {"id": 75, "typeId": CLASS_FEATURE_TYPE_ID}}
        ]));
        let result = h.run(&auto, "").unwrap();
        assert_eq!(result.output.field("Arcane Recovery").unwrap().value, "Regain some slots.");
    }

    #[tokio::test]
    async fn test_preflight_checks_entitlement() {
        let key = EntityKey {
            type_id: CLASS_FEATURE_TYPE_ID,
            id: 76,
        };
        let mut h = Harness::new(sample_wizard());
        h.compendium.add_entity(
            Entity::new(key, "Licensed Feature")
                .with_description("...")
                .with_sourced(Sourced::licensed("TCoE", 76)),
        );
        let text = Text::new(TextSource::Entity(AbilityReference::from(key)));

        let none = StaticEntitlements::new();
        let pctx = PreflightContext::new(&h.compendium, &none, "user");
        assert!(matches!(
            text.preflight(&pctx).await,
            Err(AutomationError::RequiresLicense { .. })
        ));

        let owned = StaticEntitlements::new().grant("user", "class-feature", 76);
        let pctx = PreflightContext::new(&h.compendium, &owned, "user");
        assert!(text.preflight(&pctx).await.is_ok());
    }
}
