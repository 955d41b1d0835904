// src/config/redact.rs

//! Printable view of a configuration with secrets masked.

use toml::Value;

use crate::config::model::ConfigFile;
use crate::errors::{AgentError, Result};

/// Mask a secret, keeping the last four characters when it is long enough.
pub fn obfuscate_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 4 {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("***************{tail}")
    } else {
        "(OMITTED)".to_string()
    }
}

impl ConfigFile {
    /// TOML rendering of the effective configuration, with every key listed
    /// in `[logging].obfuscate_keys` masked.
    ///
    /// Keys match either by bare name (`bucket`) or dotted path
    /// (`s3.bucket`), case-insensitively.
    pub fn redacted_summary(&self) -> Result<String> {
        let mut value = Value::try_from(self)
            .map_err(|e| AgentError::ConfigError(format!("serializing configuration: {e}")))?;

        let keys: Vec<String> = self
            .logging
            .obfuscate_keys
            .iter()
            .map(|k| k.to_ascii_lowercase())
            .collect();

        if let Value::Table(sections) = &mut value {
            for (section, body) in sections.iter_mut() {
                let Value::Table(fields) = body else { continue };
                for (field, v) in fields.iter_mut() {
                    let dotted = format!("{section}.{field}").to_ascii_lowercase();
                    let bare = field.to_ascii_lowercase();
                    if keys.iter().any(|k| *k == dotted || *k == bare) {
                        mask(v);
                    }
                }
            }
        }

        toml::to_string_pretty(&value)
            .map_err(|e| AgentError::ConfigError(format!("rendering configuration: {e}")))
    }
}

fn mask(value: &mut Value) {
    match value {
        Value::String(s) => *s = obfuscate_value(s),
        Value::Array(items) => items.iter_mut().for_each(mask),
        other => *other = Value::String(obfuscate_value(&other.to_string())),
    }
}
