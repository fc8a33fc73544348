//! Loads a [`TestPlan`] from a YAML file on disk. Deserialises straight into
//! the wire model used between coordinator and agents — there is no separate
//! YAML-only shape — then runs the same `validate()` the Control API runs on
//! a JSON-submitted plan, so a plan loaded from a file and one posted to
//! `/api/v1/test-runs` are held to identical rules.

use std::path::Path;

use thiserror::Error;

use crate::model::TestPlan;

#[derive(Error, Debug)]
pub enum YamlConfigError {
    #[error("failed to read test plan file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse test plan YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("test plan failed validation: {0}")]
    Invalid(#[from] crate::errors::AppError),
}

/// Reads and parses a YAML test plan, then validates it. Does not consult
/// the message bus or persistence layer — purely a file-to-struct step, so
/// it's equally usable from a CLI flag or a Control API "load from disk"
/// convenience endpoint.
pub fn load_test_plan(path: impl AsRef<Path>) -> Result<TestPlan, YamlConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| YamlConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_test_plan(&raw)
}

pub fn parse_test_plan(raw: &str) -> Result<TestPlan, YamlConfigError> {
    let plan: TestPlan = serde_yaml::from_str(raw)?;
    plan.validate()?;
    Ok(plan)
}
