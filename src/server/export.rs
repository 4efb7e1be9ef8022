//! Episode export persistence.
//!
//! One JSON file per (subject, episode), written exactly once: the sink
//! refuses to overwrite, which is what makes concurrent sessions safe
//! without coordination — no two tasks ever write the same path.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::frame_info::EpisodeExport;
use crate::SubjectId;

/// Errors raised while persisting an export.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Filesystem failure (including an already-written episode).
    #[error("export io failure: {0}")]
    Io(#[from] std::io::Error),
    /// The bundle could not be serialized.
    #[error("export serialization failure: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only episode file store.
#[derive(Debug)]
pub struct ExportSink {
    root: PathBuf,
}

impl ExportSink {
    /// Creates a sink rooted at `root` (created on first write).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The path an episode file lands at.
    #[must_use]
    pub fn path_for(&self, subject: &SubjectId, episode: u32) -> PathBuf {
        self.root
            .join(subject.as_str())
            .join(format!("episode_{episode:03}.json"))
    }

    /// Persists one episode bundle.
    ///
    /// # Errors
    /// Fails if the file already exists (each episode is written once) or
    /// on serialization/IO problems. Callers log and continue — a failed
    /// export must never take a session down.
    pub fn write(&self, subject: &SubjectId, export: &EpisodeExport) -> Result<PathBuf, ExportError> {
        let path = self.path_for(subject, export.episode);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .inspect_err(|_| {
                warn!(%subject, episode = export.episode, "episode file already exists or is unwritable");
            })?;
        serde_json::to_writer(file, export)?;
        info!(
            %subject,
            episode = export.episode,
            rows = export.rows.len(),
            partial = export.status.is_partial,
            "episode export written"
        );
        Ok(path)
    }

    /// The sink's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::frame_info::SessionStatus;

    fn export(episode: u32) -> EpisodeExport {
        EpisodeExport {
            episode,
            rows: vec![serde_json::Map::from_iter([(
                "frame".to_owned(),
                serde_json::json!(0),
            )])],
            status: SessionStatus::complete(1),
        }
    }

    #[test]
    fn writes_one_file_per_subject_episode() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ExportSink::new(dir.path());
        let subject = SubjectId::new("s1");

        let path = sink.write(&subject, &export(0)).unwrap();
        assert!(path.ends_with("s1/episode_000.json"));
        let text = fs::read_to_string(&path).unwrap();
        let parsed: EpisodeExport = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.rows.len(), 1);

        // Same subject, next episode: a different file.
        sink.write(&subject, &export(1)).unwrap();
        assert!(sink.path_for(&subject, 1).exists());
    }

    #[test]
    fn refuses_to_overwrite_an_episode() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ExportSink::new(dir.path());
        let subject = SubjectId::new("s1");
        sink.write(&subject, &export(0)).unwrap();
        assert!(matches!(
            sink.write(&subject, &export(0)),
            Err(ExportError::Io(_))
        ));
    }
}
