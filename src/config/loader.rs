// src/config/loader.rs

//! Layered configuration loading.
//!
//! A configuration is addressed by a base path. `<base>.toml` is read first
//! (missing means all defaults), then `<base>.properties` is applied on top:
//!
//! ```text
//! # comments start with '#' or '!'
//! executor.hard_kill_after_millis = 60000
//! s3.additional_files_to_backup = logs/*.gc, app/*.hprof
//! ```
//!
//! The last write wins: a properties key overrides the TOML value, and a key
//! repeated in the properties file takes its final value.

use std::fs;
use std::path::{Path, PathBuf};

use toml::{Table, Value};
use tracing::debug;

use crate::config::model::ConfigFile;
use crate::config::validate::validate_config;
use crate::errors::{AgentError, Result};

/// The two files making up a layered configuration.
pub fn layer_paths(base: impl AsRef<Path>) -> (PathBuf, PathBuf) {
    let base = base.as_ref();
    (base.with_extension("toml"), base.with_extension("properties"))
}

/// Load `<base>.toml` and `<base>.properties` without semantic validation.
pub fn load_layered(base: impl AsRef<Path>) -> Result<ConfigFile> {
    let (toml_path, props_path) = layer_paths(base);

    let toml_text = read_optional(&toml_path)?;
    let props_text = read_optional(&props_path)?;

    debug!(
        toml = %toml_path.display(),
        toml_found = toml_text.is_some(),
        properties = %props_path.display(),
        properties_found = props_text.is_some(),
        "loading layered configuration"
    );

    merge_layers(toml_text.as_deref(), props_text.as_deref())
}

/// Load and validate; any violation becomes [`AgentError::InvalidConfig`].
pub fn load_and_validate(base: impl AsRef<Path>) -> Result<ConfigFile> {
    let cfg = load_layered(base)?;
    let violations = validate_config(&cfg);
    if violations.is_empty() {
        Ok(cfg)
    } else {
        Err(AgentError::InvalidConfig(violations))
    }
}

/// Merge the two layers given as text. Either may be absent.
pub fn merge_layers(toml_text: Option<&str>, properties_text: Option<&str>) -> Result<ConfigFile> {
    let mut table: Table = match toml_text {
        Some(text) => toml::from_str(text)?,
        None => Table::new(),
    };

    if let Some(props) = properties_text {
        let template = defaults_table()?;
        for (key, raw) in parse_properties(props) {
            apply_property(&mut table, &template, &key, &raw)?;
        }
    }

    Ok(Value::Table(table).try_into()?)
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The serialized defaults, used to learn the type of each known key.
fn defaults_table() -> Result<Table> {
    match Value::try_from(ConfigFile::default()) {
        Ok(Value::Table(t)) => Ok(t),
        Ok(_) => Err(AgentError::ConfigError(
            "default configuration did not serialize to a table".to_string(),
        )),
        Err(e) => Err(AgentError::ConfigError(format!(
            "serializing default configuration: {e}"
        ))),
    }
}

/// Parse `key = value` / `key: value` lines in file order.
pub(crate) fn parse_properties(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| {
            let idx = line.find(['=', ':'])?;
            let key = line[..idx].trim();
            let value = line[idx + 1..].trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

fn apply_property(table: &mut Table, template: &Table, key: &str, raw: &str) -> Result<()> {
    let Some((section, field)) = key.split_once('.') else {
        return Err(AgentError::ConfigError(format!(
            "property '{key}' must be of the form <section>.<key>"
        )));
    };

    let known = template
        .get(section)
        .and_then(Value::as_table)
        .and_then(|t| t.get(field));
    let value = coerce(raw, known);

    let entry = table
        .entry(section.to_string())
        .or_insert_with(|| Value::Table(Table::new()));
    match entry {
        Value::Table(t) => {
            t.insert(field.to_string(), value);
            Ok(())
        }
        _ => Err(AgentError::ConfigError(format!(
            "property '{key}': [{section}] is not a table in the TOML layer"
        ))),
    }
}

/// Turn a properties string into a TOML value shaped like `template`.
///
/// Values that do not parse as the expected type stay strings so the final
/// deserialization reports a type error naming the key.
fn coerce(raw: &str, template: Option<&Value>) -> Value {
    match template {
        Some(Value::Array(_)) => Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect(),
        ),
        Some(Value::Boolean(_)) => match raw.to_ascii_lowercase().as_str() {
            "true" => Value::Boolean(true),
            "false" => Value::Boolean(false),
            _ => Value::String(raw.to_string()),
        },
        Some(Value::Integer(_)) => raw
            .parse::<i64>()
            .map(Value::Integer)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        Some(_) => Value::String(raw.to_string()),
        None => infer(raw),
    }
}

/// Keys without a default (optional fields) get their type guessed.
fn infer(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Integer(i);
    }
    match raw {
        "true" => Value::Boolean(true),
        "false" => Value::Boolean(false),
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn properties_override_toml() {
        let toml_text = r#"
            [executor]
            task_definition_directory = "/from/toml"
            hard_kill_after_millis = 1000
        "#;
        let props = "executor.hard_kill_after_millis = 2500\n";

        let cfg = merge_layers(Some(toml_text), Some(props)).expect("merge");
        assert_eq!(cfg.executor.task_definition_directory, PathBuf::from("/from/toml"));
        assert_eq!(cfg.executor.hard_kill_after_millis, 2500);
    }

    #[test]
    fn last_property_wins() {
        let props = "cleanup.safe_mode=false\ncleanup.safe_mode=true\n";
        let cfg = merge_layers(None, Some(props)).expect("merge");
        assert!(cfg.cleanup.safe_mode);
    }

    #[test]
    fn list_and_optional_values_are_coerced() {
        let props = "\
# comment
! also a comment
s3.additional_files_to_backup = logs/*.gc, app/out.txt
executor.max_task_threads: 8
history.path = /var/log/history.jsonl
logrotate.rotate_after_bytes = 1048576
";
        let cfg = merge_layers(None, Some(props)).expect("merge");
        assert_eq!(
            cfg.s3.additional_files_to_backup,
            vec!["logs/*.gc".to_string(), "app/out.txt".to_string()]
        );
        assert_eq!(cfg.executor.max_task_threads, Some(8));
        assert_eq!(cfg.history.path, Some(PathBuf::from("/var/log/history.jsonl")));
        assert_eq!(cfg.logrotate.rotate_after_bytes, Some(1_048_576));
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let props = "executor.kill_threads = lots\n";
        assert!(merge_layers(None, Some(props)).is_err());
    }

    #[test]
    fn key_without_section_is_rejected() {
        let err = merge_layers(None, Some("bucket = x\n")).unwrap_err();
        assert!(matches!(err, AgentError::ConfigError(_)));
    }

    #[test]
    fn missing_layers_mean_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_layered(dir.path().join("absent")).expect("load");
        assert_eq!(cfg, ConfigFile::default());
    }

    #[test]
    fn load_and_validate_reports_violations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_and_validate(dir.path().join("absent")).unwrap_err();
        match err {
            AgentError::InvalidConfig(v) => assert!(!v.is_empty()),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
