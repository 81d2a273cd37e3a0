//! Declarative configuration binding.
//!
//! Each device kind lists its fields as a `&[FieldSpec]`; [`bind`] resolves any
//! such schema against any [`ConfigSource`] section.

use std::collections::HashMap;

use super::ConfigSource;
use crate::channel::ChannelId;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Number,
    Text,
    TextList,
}

/// One configurable field: where it comes from and how to read it
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub key: &'static str,
    pub kind: FieldKind,
    /// Multiplier applied to numeric fields (e.g. seconds to milliseconds)
    pub scale: Option<f64>,
    pub mandatory: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, key: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            key,
            kind,
            scale: None,
            mandatory: true,
        }
    }

    pub const fn optional(name: &'static str, key: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            key,
            kind,
            scale: None,
            mandatory: false,
        }
    }

    pub const fn scaled(mut self, factor: f64) -> Self {
        self.scale = Some(factor);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
    TextList(Vec<String>),
}

/// Result of binding a schema to one section
#[derive(Debug, Clone)]
pub struct BoundConfig {
    section: String,
    fields: HashMap<&'static str, FieldValue>,
}

impl BoundConfig {
    pub fn section(&self) -> &str {
        &self.section
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.fields.get(name) {
            Some(FieldValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.fields.get(name) {
            Some(FieldValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    /// Numeric field rounded to whole milliseconds
    pub fn millis(&self, name: &str) -> Option<i64> {
        self.number(name).map(|n| n.round() as i64)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn text_list(&self, name: &str) -> Option<&[String]> {
        match self.fields.get(name) {
            Some(FieldValue::TextList(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn channel(&self, name: &str) -> Option<ChannelId> {
        self.text(name).map(ChannelId::from)
    }

    pub fn require_channel(&self, name: &str) -> Result<ChannelId, ConfigError> {
        self.channel(name).ok_or_else(|| self.missing(name))
    }

    pub fn require_number(&self, name: &str) -> Result<f64, ConfigError> {
        self.number(name).ok_or_else(|| self.missing(name))
    }

    fn missing(&self, name: &str) -> ConfigError {
        ConfigError::MissingFields {
            section: self.section.clone(),
            fields: vec![name.to_string()],
        }
    }
}

/// Resolve `schema` against `section` of `source`.
///
/// Every missing mandatory field is reported at once; a present field of the
/// wrong type fails immediately.
pub fn bind(
    source: &dyn ConfigSource,
    section: &str,
    schema: &[FieldSpec],
) -> Result<BoundConfig, ConfigError> {
    let mut fields = HashMap::with_capacity(schema.len());
    let mut missing = Vec::new();

    for spec in schema {
        let Some(raw) = source.raw(section, spec.key) else {
            if spec.mandatory {
                missing.push(spec.key.to_string());
            }
            continue;
        };
        let invalid = |reason: &str| ConfigError::InvalidField {
            section: section.to_string(),
            key: spec.key.to_string(),
            reason: reason.to_string(),
        };
        let value = match spec.kind {
            FieldKind::Bool => FieldValue::Bool(raw.as_bool().ok_or_else(|| invalid("expected a boolean"))?),
            FieldKind::Number => {
                let n = raw.as_f64().ok_or_else(|| invalid("expected a number"))?;
                FieldValue::Number(n * spec.scale.unwrap_or(1.0))
            }
            FieldKind::Text => FieldValue::Text(
                raw.as_str()
                    .ok_or_else(|| invalid("expected a string"))?
                    .to_string(),
            ),
            FieldKind::TextList => {
                let items = raw.as_array().ok_or_else(|| invalid("expected a list"))?;
                let list = items
                    .iter()
                    .map(|i| i.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| invalid("expected a list of strings"))?;
                FieldValue::TextList(list)
            }
        };
        fields.insert(spec.name, value);
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingFields {
            section: section.to_string(),
            fields: missing,
        });
    }

    Ok(BoundConfig {
        section: section.to_string(),
        fields,
    })
}
