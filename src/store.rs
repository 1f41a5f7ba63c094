//! Durable session records.
//!
//! Each finished session is written as `<session-id>.json` under the
//! sessions directory. Writes go through a temp file and a rename so a
//! crash never leaves a half-written record behind.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::execution::SessionId;
use crate::orchestration::{SessionRecord, SessionReport};
use crate::util::blocking;
use crate::{Error, Result};

/// Directory of JSON session records.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.sessions_dir()?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub async fn save(&self, record: &SessionRecord) -> Result<PathBuf> {
        let contents = serde_json::to_string_pretty(record)?;
        let dir = self.dir.clone();
        let path = self.path_for(&record.session_id);

        blocking(move || {
            if !dir.exists() {
                tracing::debug!("Creating sessions directory: {}", dir.display());
                fs::create_dir_all(&dir)?;
            }
            let temp_path = path.with_extension("json.tmp");
            fs::write(&temp_path, &contents)?;
            fs::rename(&temp_path, &path)?;
            tracing::debug!("Session saved: {}", path.display());
            Ok(path)
        })
        .await
    }

    pub async fn load(&self, id: &SessionId) -> Result<SessionRecord> {
        let path = self.path_for(id);
        blocking(move || Self::read(&path)).await
    }

    /// Load a record by full id or unique id prefix.
    pub async fn find(&self, prefix: &str) -> Result<SessionRecord> {
        let reports = self.list().await?;
        let matches: Vec<&SessionReport> = reports
            .iter()
            .filter(|r| r.session_id.to_string().starts_with(prefix))
            .collect();
        match matches.as_slice() {
            [one] => self.load(&one.session_id).await,
            [] => Err(Error::Validation(format!("no session matches '{}'", prefix))),
            _ => Err(Error::Validation(format!(
                "'{}' matches {} sessions",
                prefix,
                matches.len()
            ))),
        }
    }

    /// Reports of every stored session, newest first.
    ///
    /// Unreadable files are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<SessionReport>> {
        let dir = self.dir.clone();
        blocking(move || {
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut reports = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match Self::read(&path) {
                    Ok(record) => reports.push(record.report),
                    Err(e) => {
                        tracing::warn!("Skipping unreadable session {}: {}", path.display(), e)
                    }
                }
            }
            reports.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            Ok(reports)
        })
        .await
    }

    /// Most recent session, if any.
    pub async fn latest(&self) -> Result<Option<SessionRecord>> {
        match self.list().await?.first() {
            Some(report) => Ok(Some(self.load(&report.session_id).await?)),
            None => Ok(None),
        }
    }

    fn read(path: &Path) -> Result<SessionRecord> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}
