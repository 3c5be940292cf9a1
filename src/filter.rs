use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::event::EnhancedEvent;

/// Ceiling on the compiled size of a single filter pattern. Patterns that
/// blow past this (catastrophically large counted repetitions and the like)
/// fail validation instead of bloating every match.
const PATTERN_SIZE_LIMIT: usize = 10 * (1 << 10);

/// Raw filter as it appears in the configuration document.
///
/// Every field is an optional regular expression matched against the
/// corresponding event field. An empty field is a wildcard. Patterns use
/// substring semantics; anchor explicitly for whole-string matches.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FilterSpec {
    pub kind: String,
    pub namespace: String,
    pub reason: String,
    pub message: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub component: String,
}

impl FilterSpec {
    /// Compiles all non-empty patterns, rejecting invalid or oversized
    /// expressions.
    pub fn compile(&self) -> Result<Filter, regex::Error> {
        Ok(Filter {
            kind: compile_pattern(&self.kind)?,
            namespace: compile_pattern(&self.namespace)?,
            reason: compile_pattern(&self.reason)?,
            message: compile_pattern(&self.message)?,
            type_: compile_pattern(&self.type_)?,
            component: compile_pattern(&self.component)?,
        })
    }

    pub fn validate(&self) -> Result<(), regex::Error> {
        self.compile().map(|_| ())
    }
}

fn compile_pattern(pattern: &str) -> Result<Option<Regex>, regex::Error> {
    if pattern.is_empty() {
        return Ok(None);
    }
    RegexBuilder::new(pattern)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
        .map(Some)
}

/// A compiled filter. An event matches iff every present pattern finds a
/// match within its event field.
pub struct Filter {
    kind: Option<Regex>,
    namespace: Option<Regex>,
    reason: Option<Regex>,
    message: Option<Regex>,
    type_: Option<Regex>,
    component: Option<Regex>,
}

impl Filter {
    pub fn matches(&self, event: &EnhancedEvent) -> bool {
        let source_component = event
            .event
            .source
            .as_ref()
            .and_then(|s| s.component.as_deref());

        field_matches(&self.kind, event.event.involved_object.kind.as_deref())
            && field_matches(&self.namespace, event.event.metadata.namespace.as_deref())
            && field_matches(&self.reason, event.event.reason.as_deref())
            && field_matches(&self.message, event.event.message.as_deref())
            && field_matches(&self.type_, event.event.type_.as_deref())
            && field_matches(&self.component, source_component)
    }
}

fn field_matches(pattern: &Option<Regex>, value: Option<&str>) -> bool {
    match pattern {
        Some(regex) => regex.is_match(value.unwrap_or_default()),
        None => true,
    }
}

/// Returns true if any filter matches the event. Used by the processor when
/// at least one filter is configured; an empty filter set means no filtering.
pub fn any_matches(filters: &[Filter], event: &EnhancedEvent) -> bool {
    filters.iter().any(|f| f.matches(event))
}
