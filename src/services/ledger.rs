use crate::models::ProgressRecord;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("progress file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("progress file {path} is not valid progress JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON file holding the recap and every finished chapter.
#[derive(Debug, Clone)]
pub struct ProgressLedger {
    path: PathBuf,
}

impl ProgressLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The saved record, or a fresh one when nothing has been saved yet.
    pub fn load(&self) -> Result<ProgressRecord, LedgerError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ProgressRecord::default());
            }
            Err(source) => return Err(io_error(&self.path, source)),
        };

        let record: ProgressRecord =
            serde_json::from_str(&raw).map_err(|source| LedgerError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        tracing::info!(
            path = %self.path.display(),
            chapters = record.processed_chapters.len(),
            "Resuming from saved progress file"
        );
        Ok(record)
    }

    /// Rewrites the whole record. Goes through a sibling temp file and a
    /// rename, so an interrupted save leaves the previous record intact.
    pub fn save(&self, record: &ProgressRecord) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }

        let temp_path = self.temp_path();
        let file = fs::File::create(&temp_path).map_err(|e| io_error(&temp_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, record)
            .map_err(|e| io_error(&temp_path, e.into()))?;
        writer.flush().map_err(|e| io_error(&temp_path, e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| io_error(&temp_path, e))?;
        drop(writer);

        fs::rename(&temp_path, &self.path).map_err(|e| io_error(&self.path, e))
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> LedgerError {
    LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}
