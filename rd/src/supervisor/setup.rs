//! Run preparation before spawn
//!
//! Creates the per-run working directory, materializes inline base64 file
//! parameters and writes the parameter file the robot reads. Any failure here
//! is fatal to the run and is never retried.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::RobotConfig;
use crate::domain::ExecutionSpec;

/// Prefix marking an inline file parameter: `base64:<file-name>:<payload>`
pub const INLINE_FILE_PREFIX: &str = "base64:";

pub const ENV_EXECUTION_ID: &str = "ROBOTD_EXECUTION_ID";
pub const ENV_PARAMS_FILE: &str = "ROBOTD_PARAMS_FILE";
pub const ENV_RUN_DIR: &str = "ROBOTD_RUN_DIR";

/// Errors preparing a run
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Invalid execution id for a directory name: {0:?}")]
    InvalidExecutionId(String),

    #[error("Parameter {param}: malformed inline file (expected base64:<file-name>:<payload>)")]
    MalformedInlineFile { param: String },

    #[error("Parameter {param}: invalid file name {name:?}")]
    InvalidFileName { param: String, name: String },

    #[error("Parameter {param}: invalid base64 payload: {source}")]
    Decode {
        param: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("No robot command configured")]
    EmptyCommand,

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode parameters: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything the controller needs to spawn the robot
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub run_dir: PathBuf,
    pub params_file: PathBuf,
    /// Parameters as handed to the robot (inline files replaced by paths)
    pub params: BTreeMap<String, String>,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Prepare `<work-dir>/<execution_id>/` for a run
pub fn prepare_run(spec: &ExecutionSpec, execution_id: &str, config: &RobotConfig) -> Result<PreparedRun, SetupError> {
    debug!(%execution_id, robot_id = %spec.robot_id, "prepare_run: called");
    if !is_safe_name(execution_id) {
        return Err(SetupError::InvalidExecutionId(execution_id.to_string()));
    }

    let argv = spec.command.clone().unwrap_or_else(|| config.command.clone());
    if argv.is_empty() || argv[0].trim().is_empty() {
        return Err(SetupError::EmptyCommand);
    }

    let run_dir = config.work_dir.join(execution_id);
    create_dir(&run_dir)?;

    let mut params = BTreeMap::new();
    for (key, value) in &spec.params {
        let resolved = match value.strip_prefix(INLINE_FILE_PREFIX) {
            Some(inline) => materialize_file(key, inline, &run_dir)?.to_string_lossy().into_owned(),
            None => value.clone(),
        };
        params.insert(key.clone(), resolved);
    }

    let params_file = run_dir.join("params.json");
    let encoded = serde_json::to_vec_pretty(&params)?;
    write_file(&params_file, &encoded)?;

    let env = vec![
        (ENV_EXECUTION_ID.to_string(), execution_id.to_string()),
        (ENV_PARAMS_FILE.to_string(), params_file.to_string_lossy().into_owned()),
        (ENV_RUN_DIR.to_string(), run_dir.to_string_lossy().into_owned()),
    ];

    info!(%execution_id, run_dir = %run_dir.display(), param_count = params.len(), "Run prepared");
    Ok(PreparedRun {
        run_dir,
        params_file,
        params,
        argv,
        env,
    })
}

/// Decode `<file-name>:<payload>` into `<run-dir>/files/<file-name>`
fn materialize_file(param: &str, inline: &str, run_dir: &Path) -> Result<PathBuf, SetupError> {
    let (name, payload) = inline.split_once(':').ok_or_else(|| SetupError::MalformedInlineFile {
        param: param.to_string(),
    })?;
    if !is_safe_name(name) {
        return Err(SetupError::InvalidFileName {
            param: param.to_string(),
            name: name.to_string(),
        });
    }

    let bytes = STANDARD.decode(payload.trim()).map_err(|source| SetupError::Decode {
        param: param.to_string(),
        source,
    })?;

    let files_dir = run_dir.join("files");
    create_dir(&files_dir)?;
    let path = files_dir.join(name);
    write_file(&path, &bytes)?;
    debug!(%param, path = %path.display(), size = bytes.len(), "materialize_file: written");
    Ok(std::path::absolute(&path).unwrap_or(path))
}

/// A single path component: no separators, not `.`/`..`, not empty
fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && name != "." && !name.contains("..") && !name.contains(['/', '\\']) && !name.contains('\0')
}

fn create_dir(path: &Path) -> Result<(), SetupError> {
    std::fs::create_dir_all(path).map_err(|source| SetupError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), SetupError> {
    std::fs::write(path, contents).map_err(|source| SetupError::Io {
        path: path.to_path_buf(),
        source,
    })
}
