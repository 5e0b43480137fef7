//! Persistence of the terminal run outcome.

use std::io::Write;
use std::path::{Path, PathBuf};

use shared_types::RunOutcome;

#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    #[error("cannot write result to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait ResultSink: Send + Sync {
    fn persist(&self, outcome: &RunOutcome) -> Result<(), ResultError>;
}

/// Pretty JSON file, replaced atomically via a sibling temp file.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for JsonFileSink {
    fn persist(&self, outcome: &RunOutcome) -> Result<(), ResultError> {
        let io_err = |source| ResultError::Io {
            path: self.path.clone(),
            source,
        };
        let body = serde_json::to_vec_pretty(outcome)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "result.json".to_string());
        let tmp = self.path.with_file_name(format!(".{file_name}.tmp"));

        let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&body).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;

        tracing::info!(path = %self.path.display(), success = outcome.success, "Run outcome written");
        Ok(())
    }
}
