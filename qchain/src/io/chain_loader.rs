//! Chain document loader: YAML -> schema check -> [`ChainSpec`].

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use jsonschema::validator_for;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::core::chain::ChainSpec;
use crate::core::types::StepSpec;

const CHAIN_SCHEMA: &str = include_str!("../../schemas/chain.schema.json");

/// Fatal, startup-time problems with the chain document.
#[derive(Debug, thiserror::Error)]
pub enum ChainConfigError {
    #[error("chain file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("read chain {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse chain {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("chain {} failed schema validation:\n- {}", .path.display(), .errors.join("\n- "))]
    Schema { path: PathBuf, errors: Vec<String> },

    #[error("chain {} is invalid:\n- {}", .path.display(), .errors.join("\n- "))]
    Invalid { path: PathBuf, errors: Vec<String> },
}

#[derive(Debug, Deserialize)]
struct ChainDocument {
    steps: Vec<StepRecord>,
}

#[derive(Debug, Deserialize)]
struct StepRecord {
    id: String,
    desc: Option<String>,
    command: String,
    #[serde(default)]
    transient: bool,
    #[serde(default)]
    hints: Vec<String>,
    timeout_secs: Option<u64>,
}

impl From<StepRecord> for StepSpec {
    fn from(record: StepRecord) -> Self {
        let desc = record
            .desc
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| record.id.clone());
        StepSpec {
            id: record.id,
            desc,
            command: record.command,
            transient: record.transient,
            hints: record.hints,
            timeout_secs: record.timeout_secs,
        }
    }
}

/// Read and validate the chain document at `path`.
pub fn load_chain(path: &Path) -> Result<ChainSpec, ChainConfigError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(ChainConfigError::NotFound(path.to_path_buf()));
        }
        Err(source) => {
            return Err(ChainConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let chain = parse_chain(path, &raw)?;
    debug!(path = %path.display(), steps = chain.len(), "chain loaded");
    Ok(chain)
}

/// Parse chain YAML. `path` is only used in error messages.
pub fn parse_chain(path: &Path, raw: &str) -> Result<ChainSpec, ChainConfigError> {
    let parse_err = |message: String| ChainConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    let yaml: serde_yaml::Value =
        serde_yaml::from_str(raw).map_err(|e| parse_err(e.to_string()))?;
    let document: Value = serde_json::to_value(yaml).map_err(|e| parse_err(e.to_string()))?;
    validate_schema(path, &document)?;

    let document: ChainDocument =
        serde_json::from_value(document).map_err(|e| parse_err(e.to_string()))?;
    let steps = document.steps.into_iter().map(StepSpec::from).collect();
    ChainSpec::new(steps).map_err(|errors| ChainConfigError::Invalid {
        path: path.to_path_buf(),
        errors,
    })
}

fn validate_schema(path: &Path, document: &Value) -> Result<(), ChainConfigError> {
    let schema_err = |message: String| ChainConfigError::Parse {
        path: PathBuf::from("chain.schema.json"),
        message,
    };
    let schema: Value =
        serde_json::from_str(CHAIN_SCHEMA).map_err(|e| schema_err(e.to_string()))?;
    let compiled = validator_for(&schema).map_err(|e| schema_err(e.to_string()))?;
    let errors: Vec<String> = compiled
        .iter_errors(document)
        .map(|err| err.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(ChainConfigError::Schema {
            path: path.to_path_buf(),
            errors,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<ChainSpec, ChainConfigError> {
        parse_chain(Path::new("chain.yaml"), raw)
    }

    #[test]
    fn parses_steps_in_order_with_defaults() {
        let chain = parse(
            r#"
steps:
  - id: lint
    command: ruff check .
  - id: deps
    desc: install dependencies
    command: pip install -r requirements.txt
    transient: true
    hints: [requirements.txt]
"#,
        )
        .expect("parse");

        let steps = chain.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].id, "lint");
        assert_eq!(steps[0].desc, "lint");
        assert!(!steps[0].transient);
        assert_eq!(steps[1].desc, "install dependencies");
        assert!(steps[1].transient);
        assert_eq!(steps[1].hints, vec!["requirements.txt".to_string()]);
    }

    #[test]
    fn missing_file_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_chain(&temp.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, ChainConfigError::NotFound(_)));
    }

    #[test]
    fn schema_rejects_missing_command_and_unknown_keys() {
        let err = parse("steps:\n  - id: lint\n    comand: ruff\n").unwrap_err();
        match err {
            ChainConfigError::Schema { errors, .. } => assert!(!errors.is_empty()),
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn schema_rejects_empty_document() {
        assert!(matches!(
            parse("").unwrap_err(),
            ChainConfigError::Schema { .. }
        ));
    }

    #[test]
    fn duplicate_ids_are_invalid() {
        let err = parse("steps:\n  - {id: a, command: 'true'}\n  - {id: a, command: 'false'}\n")
            .unwrap_err();
        match err {
            ChainConfigError::Invalid { errors, .. } => {
                assert_eq!(errors, vec!["step #2: duplicate id 'a'".to_string()]);
            }
            other => panic!("expected invalid chain, got {other:?}"),
        }
    }

    #[test]
    fn malformed_yaml_is_parse_error() {
        assert!(matches!(
            parse("steps: [unclosed").unwrap_err(),
            ChainConfigError::Parse { .. }
        ));
    }
}
