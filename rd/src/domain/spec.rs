//! Run request submitted by the command surface

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::id::generate_id;

/// Everything needed to start one robot run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    /// Robot identifier, also used to derive generated execution ids
    pub robot_id: String,

    /// Caller-supplied execution id; generated when absent
    #[serde(default)]
    pub execution_id: Option<String>,

    /// Arbitrary parameters; `base64:<file>:<payload>` values become files
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// argv override; the configured robot command is used when absent
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

impl ExecutionSpec {
    pub fn new(robot_id: impl Into<String>) -> Self {
        Self {
            robot_id: robot_id.into(),
            ..Default::default()
        }
    }

    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = Some(id.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(argv.into_iter().map(Into::into).collect());
        self
    }

    /// Fill in a generated execution id if the caller did not supply one
    pub fn resolve_id(&mut self) -> String {
        match &self.execution_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => {
                let id = generate_id("run", &self.robot_id);
                self.execution_id = Some(id.clone());
                id
            }
        }
    }
}
