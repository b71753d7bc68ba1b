use std::path::Path;

use serde::{Deserialize, Serialize};

use taskd_core::TaskdError;

/// Externally written reset config, e.g. `{"RetryTime": 2}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetCmInfo {
    #[serde(rename = "RetryTime")]
    pub retry_time: i64,
}

/// Read the reset config. `Ok(None)` when the file does not exist.
pub fn read_reset_config(path: &Path) -> Result<Option<ResetCmInfo>, TaskdError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let info: ResetCmInfo = serde_json::from_str(&contents)?;
    if info.retry_time < 0 {
        return Err(TaskdError::Decode(format!(
            "negative RetryTime {} in {:?}",
            info.retry_time, path
        )));
    }
    Ok(Some(info))
}
