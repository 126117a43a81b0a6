use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::{CaptureError, ContainerFormat};

/// `video_<epoch-millis>.<ext>`
pub fn video_file_name(epoch_millis: i64, container: ContainerFormat) -> String {
    format!("video_{}.{}", epoch_millis, container.extension())
}

/// Output file reserved for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFile {
    pub path: PathBuf,
    pub created_at_millis: i64,
}

impl VideoFile {
    /// Name a new file in `dir` after the current wall-clock time, creating `dir` if needed.
    ///
    /// Two calls within the same millisecond produce the same path.
    pub fn create_in(dir: &Path, container: ContainerFormat) -> Result<Self, CaptureError> {
        if !dir.exists() {
            info!("📁 Creating output folder: {:?}", dir);
            std::fs::create_dir_all(dir).map_err(|source| CaptureError::Output {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let created_at_millis = chrono::Utc::now().timestamp_millis();
        Ok(Self {
            path: dir.join(video_file_name(created_at_millis, container)),
            created_at_millis,
        })
    }

    /// Remove whatever was written for a session that never reached Running.
    pub fn discard(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!("🗑️  Discarded {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Nothing to discard at {:?}", self.path)
            }
            Err(e) => warn!("⚠️  Failed to discard {:?}: {}", self.path, e),
        }
    }
}
