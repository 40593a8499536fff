//! The per-call state threaded through `OpState`, read and written by every
//! bridge op. One instance lives for exactly one `ExecutionContext` call
//! (§4.6); it is installed at Bootstrap and harvested at Harvest.

use std::{collections::HashMap, sync::Arc, time::Instant};

use net_policy::{DnsResolver, PolicyEngine};
use serde::Serialize;

use crate::{module_loader::ModuleLoader, vfs::Vfs};

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub level: String,
    pub message: String,
    pub timestamp_ms: u64,
}

/// Async key-value store consulted by the guest's KV bridge. Supplied by the
/// engine's embedder, analogous to `package_store::BlobStore` — a contract
/// the core consumes rather than implements (spec §6).
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> anyhow::Result<()>;
    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()>;
    async fn clear(&self, namespace: &str) -> anyhow::Result<()>;
    async fn has(&self, namespace: &str, key: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Default)]
pub struct ResponseState {
    pub status_code: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Option<Vec<u8>>,
    pub ended: bool,
    /// Flipped by `send`/`end`/`sendFile` — the terminal `res` methods.
    /// Drives §4.6 Harvest's "synthesize a default 200 {} response only if
    /// the handler did not terminate the response."
    pub responded: bool,
}

impl ResponseState {
    pub fn new() -> Self {
        Self {
            status_code: 200,
            headers: HashMap::new(),
            body: None,
            ended: false,
            responded: false,
        }
    }
}

/// Everything a bridge op needs: the VFS mount, the policy snapshot, the
/// key-value namespace, captured logs, and the response under construction.
pub struct ExecutionState {
    pub vfs: Arc<Vfs>,
    pub policy: Arc<PolicyEngine>,
    pub dns: Arc<dyn DnsResolver>,
    pub kv: Arc<dyn KvStore>,
    pub kv_namespace: String,
    pub logs: Vec<LogEntry>,
    pub response: ResponseState,
    pub deadline: Instant,
    pub loader: Arc<ModuleLoader>,
    pub function_id: String,
    pub package_hash: String,
}

impl ExecutionState {
    pub fn push_log(&mut self, level: impl Into<String>, message: impl Into<String>) {
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.logs.push(LogEntry {
            level: level.into(),
            message: message.into(),
            timestamp_ms,
        });
    }
}
