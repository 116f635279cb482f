//! Development-mode workflow state dumps
//!
//! Diagnostic JSON blobs under `logs/workflows/<name>/<run_id>.json`.
//! Strictly for analysis; nothing load-bearing reads them back.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

/// Where workflow state dumps land, relative to the working directory.
const DUMP_ROOT: &str = "logs/workflows";

fn dump_path(workflow_name: &str, run_id: &str) -> PathBuf {
    Path::new(DUMP_ROOT)
        .join(sanitize(workflow_name))
        .join(format!("{}.json", sanitize(run_id)))
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Write a state blob for later inspection.
pub fn save_workflow_state(workflow_name: &str, run_id: &str, state: &Value) -> io::Result<()> {
    let path = dump_path(workflow_name, run_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, serde_json::to_vec_pretty(state)?)?;
    debug!(path = %path.display(), "wrote workflow state dump");
    Ok(())
}
