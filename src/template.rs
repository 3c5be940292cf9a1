use serde_json::{Map, Value};
use thiserror::Error;

/// A selector value template: literal text interleaved with field
/// references written as `{{ .Field.Subfield }}`.
///
/// References are resolved against the JSON form of the event, the same
/// document the full-event payload serializes to. Path segments resolve
/// case-insensitively so that the schema's field names (`.InvolvedObject`,
/// `.Type`) find their JSON keys (`involvedObject`, `type`), and top-level
/// metadata fields (`.Name`, `.Namespace`, `.UID`, `.ResourceVersion`) fall
/// through to the `metadata` object.
///
/// Only field references are supported; pipelines, conditionals and other
/// actions are rejected at parse time.
#[derive(Clone, Debug, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Literal(String),
    Field(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum TemplateError {
    #[error("unclosed action in template")]
    UnclosedAction,
    #[error("empty action in template")]
    EmptyAction,
    #[error("unsupported action {0:?}: only field references are allowed")]
    UnsupportedAction(String),
    #[error("invalid field reference {0:?}")]
    InvalidFieldReference(String),
    #[error("no field {0:?} in event")]
    MissingField(String),
    #[error("field {0:?} is nil")]
    NilField(String),
    #[error("field {0:?} does not render to a scalar value")]
    NotScalar(String),
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or(TemplateError::UnclosedAction)?;
            segments.push(parse_action(&after[..end])?);
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Template { segments })
    }

    pub fn render(&self, root: &Value) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(path) => out.push_str(&resolve(root, path)?),
            }
        }
        Ok(out)
    }
}

fn parse_action(action: &str) -> Result<Segment, TemplateError> {
    let trimmed = action.trim();
    if trimmed.is_empty() {
        return Err(TemplateError::EmptyAction);
    }
    let reference = trimmed
        .strip_prefix('.')
        .ok_or_else(|| TemplateError::UnsupportedAction(trimmed.to_string()))?;
    if reference.is_empty() {
        // A bare `{{ . }}` would splat the whole document; not a field.
        return Err(TemplateError::UnsupportedAction(trimmed.to_string()));
    }

    let mut path = Vec::new();
    for segment in reference.split('.') {
        let valid = !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(TemplateError::InvalidFieldReference(trimmed.to_string()));
        }
        path.push(segment.to_string());
    }
    Ok(Segment::Field(path))
}

fn resolve(root: &Value, path: &[String]) -> Result<String, TemplateError> {
    let mut current = root;
    for (depth, segment) in path.iter().enumerate() {
        let dotted = || format!(".{}", path[..=depth].join("."));
        if current.is_null() {
            return Err(TemplateError::NilField(dotted()));
        }
        let object = current
            .as_object()
            .ok_or_else(|| TemplateError::MissingField(dotted()))?;

        let mut next = lookup(object, segment);
        if next.is_none() && depth == 0 {
            // Top-level metadata fields are addressable directly, the way the
            // schema exposes `.Name` or `.Namespace` on the event itself.
            next = object
                .get("metadata")
                .and_then(Value::as_object)
                .and_then(|meta| lookup(meta, segment));
        }
        current = next.ok_or_else(|| TemplateError::MissingField(dotted()))?;
    }

    let dotted = || format!(".{}", path.join("."));
    match current {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Err(TemplateError::NilField(dotted())),
        Value::Object(_) | Value::Array(_) => Err(TemplateError::NotScalar(dotted())),
    }
}

fn lookup<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    object.get(name).or_else(|| {
        object
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}
