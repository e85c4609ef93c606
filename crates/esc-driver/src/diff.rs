use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::warn;

use crate::error::DriverError;
use crate::traits::DiffViewer;

/// Default `DiffViewer`: shells out to `diff` on two temp files holding the
/// pretty-printed JSON, matching the original tool's vim-diff review step
/// for `--review-conversion-result` but made injectable/mockable (spec §6).
/// Falls back to a logged warning if `diff` isn't on `PATH`.
pub struct ShellDiffViewer;

#[async_trait]
impl DiffViewer for ShellDiffViewer {
    async fn show(&self, old: &Value, new: &Value) -> Result<(), DriverError> {
        let old_text = serde_json::to_string_pretty(old).map_err(DriverError::Serialization)?;
        let new_text = serde_json::to_string_pretty(new).map_err(DriverError::Serialization)?;

        let old_file = tempfile_write(&old_text).await?;
        let new_file = tempfile_write(&new_text).await?;

        let output = Command::new("diff")
            .arg("-u")
            .arg(&old_file)
            .arg(&new_file)
            .output()
            .await;

        let _ = tokio::fs::remove_file(&old_file).await;
        let _ = tokio::fs::remove_file(&new_file).await;

        match output {
            Ok(out) => {
                print!("{}", String::from_utf8_lossy(&out.stdout));
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "diff not available; skipping side-by-side review");
                Ok(())
            }
        }
    }
}

async fn tempfile_write(contents: &str) -> Result<std::path::PathBuf, DriverError> {
    let path = std::env::temp_dir().join(format!("ec2-spot-converter-{}.json", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, contents)
        .await
        .map_err(|e| DriverError::Internal(format!("writing diff scratch file: {e}")))?;
    Ok(path)
}

/// No-op `DiffViewer` used in tests and non-interactive runs.
pub struct NullDiffViewer;

#[async_trait]
impl DiffViewer for NullDiffViewer {
    async fn show(&self, _old: &Value, _new: &Value) -> Result<(), DriverError> {
        Ok(())
    }
}
