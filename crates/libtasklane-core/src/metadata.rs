use chrono::{DateTime, Utc};

use crate::error::TasklaneError;
use crate::store::{Database, QUEUE_LEN_KEY};
use crate::types::SyncBaseline;

const LAST_SYNC_KEY: &str = "last_sync";

/// Process-wide sync facts and per-uid baselines
#[derive(Debug, Clone)]
pub struct SyncMetadata {
    db: Database,
}

impl SyncMetadata {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, TasklaneError> {
        if key == QUEUE_LEN_KEY {
            return Ok(None);
        }
        match self.db.metadata.get(key)? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), TasklaneError> {
        if key == QUEUE_LEN_KEY {
            return Err(TasklaneError::InvalidArgs(format!("metadata key '{}' is reserved", key)));
        }
        self.db.metadata.insert(key, value.as_bytes())?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<Option<String>, TasklaneError> {
        if key == QUEUE_LEN_KEY {
            return Ok(None);
        }
        Ok(self
            .db
            .metadata
            .remove(key)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// All string entries, sorted by key
    pub fn list(&self) -> Result<Vec<(String, String)>, TasklaneError> {
        let mut entries = Vec::new();
        for result in self.db.metadata.iter() {
            let (key, value) = result?;
            let key = String::from_utf8_lossy(&key).into_owned();
            if key == QUEUE_LEN_KEY {
                continue;
            }
            entries.push((key, String::from_utf8_lossy(&value).into_owned()));
        }
        Ok(entries)
    }

    pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>, TasklaneError> {
        self.timestamp(LAST_SYNC_KEY)
    }

    pub fn set_last_sync(&self, ts: DateTime<Utc>) -> Result<(), TasklaneError> {
        self.set(LAST_SYNC_KEY, &ts.to_rfc3339())
    }

    /// Last successful pull from one backend
    pub fn last_sync_for(&self, backend: &str) -> Result<Option<DateTime<Utc>>, TasklaneError> {
        self.timestamp(&backend_key(backend))
    }

    pub fn set_last_sync_for(&self, backend: &str, ts: DateTime<Utc>) -> Result<(), TasklaneError> {
        self.set(&backend_key(backend), &ts.to_rfc3339())
    }

    pub fn baseline(&self, uid: &str) -> Result<Option<SyncBaseline>, TasklaneError> {
        match self.db.baselines.get(uid.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_baseline(&self, uid: &str, baseline: &SyncBaseline) -> Result<(), TasklaneError> {
        self.db.baselines.insert(uid.as_bytes(), serde_json::to_vec(baseline)?)?;
        Ok(())
    }

    pub fn remove_baseline(&self, uid: &str) -> Result<(), TasklaneError> {
        self.db.baselines.remove(uid.as_bytes())?;
        Ok(())
    }

    fn timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>, TasklaneError> {
        match self.get(key)? {
            Some(value) => {
                let ts = DateTime::parse_from_rfc3339(&value).map_err(|e| {
                    TasklaneError::Internal(format!("bad timestamp in metadata '{}': {}", key, e))
                })?;
                Ok(Some(ts.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }
}

fn backend_key(backend: &str) -> String {
    format!("{}/{}", LAST_SYNC_KEY, backend)
}
