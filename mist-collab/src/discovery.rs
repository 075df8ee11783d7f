//! Host announcement and discovery through an external key-value directory.
//!
//! The directory itself (a DHT, a rendezvous service, ...) is out of scope.
//! This module defines the record format and the `put` / `get` contract.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::session::unix_millis;

/// Record kind published for coordinator hosts.
pub const HOST_RECORD_KIND: &str = "MistSession";

/// A published host entry, keyed by its hex-encoded public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub public_key: String,
    pub kind: String,
    /// Milliseconds since the Unix epoch at announcement time
    pub timestamp: u64,
}

impl HostRecord {
    pub fn new(public_key: &[u8]) -> Self {
        Self {
            public_key: hex_key(public_key),
            kind: HOST_RECORD_KIND.to_string(),
            timestamp: unix_millis(),
        }
    }

    pub fn key(&self) -> &str {
        &self.public_key
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// External key-value directory.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn put(&self, record: HostRecord) -> Result<(), DirectoryError>;

    async fn get(&self, key: &str) -> Result<Option<HostRecord>, DirectoryError>;
}

/// Publish this host's public key.
pub async fn announce_host<D>(public_key: &[u8], directory: &D) -> Result<HostRecord, DirectoryError>
where
    D: SessionDirectory + ?Sized,
{
    let record = HostRecord::new(public_key);
    directory.put(record.clone()).await?;
    log::info!("Announced host {}", record.key());
    Ok(record)
}

/// Look up a host by public key.
pub async fn discover_host<D>(public_key: &[u8], directory: &D) -> Result<Option<HostRecord>, DirectoryError>
where
    D: SessionDirectory + ?Sized,
{
    directory.get(&hex_key(public_key)).await
}

/// Directory held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    records: RwLock<HashMap<String, HostRecord>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl SessionDirectory for InMemoryDirectory {
    async fn put(&self, record: HostRecord) -> Result<(), DirectoryError> {
        self.records
            .write()
            .await
            .insert(record.public_key.clone(), record);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<HostRecord>, DirectoryError> {
        Ok(self.records.read().await.get(key).cloned())
    }
}

fn hex_key(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
