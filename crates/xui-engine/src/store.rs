//! Inbound record stores
//!
//! The synthesizer only needs two things from persistence: a pass that
//! disables clients past their expiry or quota, and a full snapshot of
//! inbound records with their client usage attached.

use crate::error::StoreError;
use crate::model::InboundRecord;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::PathBuf;
use tracing::info;

/// Persistence collaborator (abstracted for testing)
#[async_trait]
pub trait InboundStore: Send + Sync {
    /// Disable clients that crossed their expiry time or traffic quota.
    /// Returns the number of clients disabled.
    async fn disable_invalid_clients(&self) -> Result<usize, StoreError>;

    /// All inbound records, in storage order, with client usage attached
    async fn all_inbounds(&self) -> Result<Vec<InboundRecord>, StoreError>;
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Flip `enable` off for every exhausted client. Returns how many changed.
pub fn disable_exhausted(records: &mut [InboundRecord], now_ms: i64) -> usize {
    let mut disabled = 0;
    for record in records.iter_mut() {
        for client in record.client_stats.iter_mut() {
            if client.enable && client.is_exhausted(now_ms) {
                client.enable = false;
                disabled += 1;
                info!(
                    inbound = %record.tag,
                    client = %client.email,
                    "client disabled: expired or over traffic limit"
                );
            }
        }
    }
    disabled
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<InboundRecord>>,
}

impl MemoryStore {
    pub fn new(records: Vec<InboundRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    /// Replace all records
    pub fn replace(&self, records: Vec<InboundRecord>) {
        *self.records.write() = records;
    }

    /// Edit records in place
    pub fn update<F: FnOnce(&mut Vec<InboundRecord>)>(&self, f: F) {
        f(&mut self.records.write());
    }
}

#[async_trait]
impl InboundStore for MemoryStore {
    async fn disable_invalid_clients(&self) -> Result<usize, StoreError> {
        Ok(disable_exhausted(&mut self.records.write(), now_millis()))
    }

    async fn all_inbounds(&self) -> Result<Vec<InboundRecord>, StoreError> {
        Ok(self.records.read().clone())
    }
}

/// Store backed by a JSON array of inbound records on disk
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Vec<InboundRecord>, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, records: &[InboundRecord]) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl InboundStore for JsonFileStore {
    async fn disable_invalid_clients(&self) -> Result<usize, StoreError> {
        let mut records = self.load().await?;
        let disabled = disable_exhausted(&mut records, now_millis());
        if disabled > 0 {
            self.save(&records).await?;
        }
        Ok(disabled)
    }

    async fn all_inbounds(&self) -> Result<Vec<InboundRecord>, StoreError> {
        self.load().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClientTraffic, Protocol};

    fn record_with_clients() -> InboundRecord {
        let mut record = InboundRecord::new("in1", 443, Protocol::Vmess);
        let mut over_quota = ClientTraffic::new("heavy", true);
        over_quota.total = 1_000;
        over_quota.up = 700;
        over_quota.down = 300;
        let mut expired = ClientTraffic::new("old", true);
        expired.expiry_time = 1;
        let fresh = ClientTraffic::new("fresh", true);
        record.client_stats = vec![over_quota, expired, fresh];
        record
    }

    #[test]
    fn test_disable_exhausted_flags_only_invalid_clients() {
        let mut records = vec![record_with_clients()];
        assert_eq!(disable_exhausted(&mut records, 10), 2);

        let enabled: Vec<bool> = records[0].client_stats.iter().map(|c| c.enable).collect();
        assert_eq!(enabled, vec![false, false, true]);

        // Already disabled clients are not counted again.
        assert_eq!(disable_exhausted(&mut records, 10), 0);
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new(vec![record_with_clients()]);
        assert_eq!(store.disable_invalid_clients().await.unwrap(), 2);

        let records = store.all_inbounds().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].client_stats[0].enable);

        store.update(|records| records[0].port = 8443);
        assert_eq!(store.all_inbounds().await.unwrap()[0].port, 8443);
    }

    #[test]
    fn test_memory_store_replace() {
        let store = MemoryStore::default();
        store.replace(vec![record_with_clients(), InboundRecord::new("in2", 80, Protocol::Http)]);

        let records = tokio_test::block_on(store.all_inbounds()).unwrap();
        let tags: Vec<&str> = records.iter().map(|r| r.tag.as_str()).collect();
        assert_eq!(tags, vec!["in1", "in2"]);
    }

    #[tokio::test]
    async fn test_json_file_store_persists_disabled_clients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbounds.json");
        std::fs::write(&path, serde_json::to_string(&vec![record_with_clients()]).unwrap())
            .unwrap();

        let store = JsonFileStore::new(&path);
        assert_eq!(store.disable_invalid_clients().await.unwrap(), 2);

        let reopened = JsonFileStore::new(&path);
        let records = reopened.all_inbounds().await.unwrap();
        assert!(!records[0].client_stats[1].enable);
        assert!(records[0].client_stats[2].enable);
    }

    #[tokio::test]
    async fn test_json_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("absent.json"));
        assert!(store.all_inbounds().await.unwrap().is_empty());
        assert_eq!(store.disable_invalid_clients().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_json_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbounds.json");
        std::fs::write(&path, "[{\"tag\": 1}]").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(matches!(store.all_inbounds().await, Err(StoreError::Decode(_))));
    }
}
