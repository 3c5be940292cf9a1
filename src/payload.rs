use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

use crate::event::EnhancedEvent;
use crate::template::{Template, TemplateError};

/// A single projection rule from the configuration document: `key` names the
/// output field, `value` is a template rendered against the event.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Selector {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum SelectorError {
    #[error("key must not be empty")]
    EmptyKey,
    #[error("value must not be empty")]
    EmptyValue,
    #[error("value template is not valid: {0}")]
    Template(#[from] TemplateError),
}

impl Selector {
    pub fn validate(&self) -> Result<(), SelectorError> {
        if self.key.is_empty() {
            return Err(SelectorError::EmptyKey);
        }
        if self.value.is_empty() {
            return Err(SelectorError::EmptyValue);
        }
        Template::parse(&self.value)?;
        Ok(())
    }
}

/// Projects events onto a string-to-string document driven by selectors.
///
/// Projection is all-or-nothing: if any selector fails to render, the whole
/// projection is abandoned and the caller falls back to
/// [`relevant_fields`], so the downstream always sees a coherent document.
pub struct PayloadProjector {
    selectors: Vec<(String, Template)>,
}

impl PayloadProjector {
    pub fn new(selectors: &[Selector]) -> Result<Self, SelectorError> {
        let mut compiled = Vec::with_capacity(selectors.len());
        for selector in selectors {
            selector.validate()?;
            compiled.push((selector.key.clone(), Template::parse(&selector.value)?));
        }
        Ok(PayloadProjector {
            selectors: compiled,
        })
    }

    pub fn project(
        &self,
        event: &EnhancedEvent,
    ) -> Result<BTreeMap<String, String>, TemplateError> {
        let root = serde_json::to_value(event).unwrap_or_default();
        let mut payload = BTreeMap::new();
        for (key, template) in &self.selectors {
            payload.insert(key.clone(), template.render(&root)?);
        }
        Ok(payload)
    }
}

/// The fallback projection: the handful of fields operators reach for first.
pub fn relevant_fields(event: &EnhancedEvent) -> BTreeMap<String, String> {
    let field = |value: &Option<String>| value.clone().unwrap_or_default();
    BTreeMap::from([
        ("cluster".to_string(), event.cluster_name.clone()),
        (
            "kind".to_string(),
            field(&event.event.involved_object.kind),
        ),
        (
            "namespace".to_string(),
            field(&event.event.metadata.namespace),
        ),
        ("reason".to_string(), field(&event.event.reason)),
        ("message".to_string(), field(&event.event.message)),
        ("type".to_string(), field(&event.event.type_)),
        (
            "component".to_string(),
            event
                .event
                .source
                .as_ref()
                .and_then(|s| s.component.clone())
                .unwrap_or_default(),
        ),
        ("occurred".to_string(), event.first_occurrence_rfc3339()),
        (
            "count".to_string(),
            event.event.count.unwrap_or_default().to_string(),
        ),
    ])
}
