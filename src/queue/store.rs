//! Job persistence.

use super::{Job, QueueError};
use crate::utils::write_atomic;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Durable storage of job records, keyed by job id.
pub trait JobStore: Send + Sync {
    fn save(&self, job: &Job) -> Result<(), QueueError>;
    fn load_all(&self) -> Result<Vec<Job>, QueueError>;
}

/// Keeps serialized records in memory, for tests and throwaway queues.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryStore {
    fn save(&self, job: &Job) -> Result<(), QueueError> {
        let record = serde_json::to_string(job)?;
        let mut records = self.records.lock().unwrap();
        records.insert(job.id.clone(), record);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Job>, QueueError> {
        let records = self.records.lock().unwrap();
        records
            .values()
            .map(|r| serde_json::from_str(r).map_err(QueueError::from))
            .collect()
    }
}

/// One json file per job under a directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: PathBuf) -> Result<Self, QueueError> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

impl JobStore for FileStore {
    fn save(&self, job: &Job) -> Result<(), QueueError> {
        let data = serde_json::to_vec_pretty(job)?;
        write_atomic(&self.dir.join(format!("{}.json", job.id)), &data)?;
        Ok(())
    }

    /// Records that no longer deserialize are moved under `quarantine/` and
    /// left out, so one bad file cannot block the rest of the queue.
    fn load_all(&self) -> Result<Vec<Job>, QueueError> {
        let mut jobs = Vec::new();
        let mut quarantined = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            let data = fs::read(&path)?;
            match serde_json::from_slice(&data) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    let to = self.quarantine(&path)?;
                    log::warn!(
                        "unreadable job record {} moved to {}: {}",
                        path.display(),
                        to.display(),
                        e
                    );
                    quarantined += 1;
                }
            }
        }
        if quarantined != 0 {
            log::warn!(
                "job store: {} records loaded, {} quarantined",
                jobs.len(),
                quarantined
            );
        }
        Ok(jobs)
    }
}

impl FileStore {
    pub fn quarantine_dir(&self) -> PathBuf {
        self.dir.join("quarantine")
    }

    fn quarantine(&self, path: &Path) -> Result<PathBuf, QueueError> {
        let dir = self.quarantine_dir();
        fs::create_dir_all(&dir)?;
        let name = path.file_name().unwrap_or_default();
        let to = dir.join(name);
        fs::rename(path, &to)?;
        Ok(to)
    }
}
