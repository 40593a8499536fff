//! Shared fixtures for the end-to-end scenario tests in this directory
//! (spec §8's S1-S5). Builds a real [`Engine`] backed by in-memory stand-ins
//! for the metadata store, blob store, and KV store — the three collaborator
//! traits §6 calls out as embedder-supplied.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::Write,
    sync::{Arc, Mutex},
    time::Duration,
};

use net_policy::{DnsResolver, NetworkRule, StaticDnsResolver};
use package_store::BlobStore;
use runtime_core::{
    bridge::KvStore,
    engine::{Engine, FunctionMetadata, MetadataStore},
    EngineConfig,
};
use sha2::{Digest, Sha256};

pub fn make_tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *contents).unwrap();
    }
    let tar_bytes = builder.into_inner().unwrap();
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub struct FixedBlobStore {
    archive: Vec<u8>,
}

impl FixedBlobStore {
    pub fn new(archive: Vec<u8>) -> Self {
        Self { archive }
    }
}

#[async_trait::async_trait]
impl BlobStore for FixedBlobStore {
    async fn fetch(&self, _package_path: &str) -> anyhow::Result<Vec<u8>> {
        Ok(self.archive.clone())
    }
}

#[derive(Default)]
pub struct StubMetadataStore {
    pub functions: HashMap<String, FunctionMetadata>,
    pub env: HashMap<String, HashMap<String, String>>,
    pub global_rules: Vec<NetworkRule>,
    pub project_rules: HashMap<String, Vec<NetworkRule>>,
}

impl StubMetadataStore {
    pub fn with_function(mut self, metadata: FunctionMetadata) -> Self {
        self.functions.insert(metadata.function_id.clone(), metadata);
        self
    }

    pub fn with_global_rules(mut self, rules: Vec<NetworkRule>) -> Self {
        self.global_rules = rules;
        self
    }
}

#[async_trait::async_trait]
impl MetadataStore for StubMetadataStore {
    async fn function_metadata(&self, function_id: &str) -> anyhow::Result<Option<FunctionMetadata>> {
        Ok(self.functions.get(function_id).cloned())
    }

    async fn env_vars(&self, function_id: &str) -> anyhow::Result<HashMap<String, String>> {
        Ok(self.env.get(function_id).cloned().unwrap_or_default())
    }

    async fn global_network_rules(&self) -> anyhow::Result<Vec<NetworkRule>> {
        Ok(self.global_rules.clone())
    }

    async fn project_network_rules(&self, project_id: &str) -> anyhow::Result<Vec<NetworkRule>> {
        Ok(self.project_rules.get(project_id).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryKv {
    data: Mutex<HashMap<(String, String), Vec<u8>>>,
}

#[async_trait::async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().get(&(namespace.to_string(), key.to_string())).cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.data.lock().unwrap().insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
        self.data.lock().unwrap().remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    async fn clear(&self, namespace: &str) -> anyhow::Result<()> {
        self.data.lock().unwrap().retain(|(ns, _), _| ns != namespace);
        Ok(())
    }

    async fn has(&self, namespace: &str, key: &str) -> anyhow::Result<bool> {
        Ok(self.data.lock().unwrap().contains_key(&(namespace.to_string(), key.to_string())))
    }
}

/// A scenario's entry source plus its derived, already-consistent package
/// metadata, ready to drop into a [`StubMetadataStore`].
pub struct Scenario {
    pub archive: Vec<u8>,
    pub package_hash: String,
}

impl Scenario {
    pub fn single_file(contents: &[u8]) -> Self {
        Self::files(&[("index.js", contents)])
    }

    pub fn files(files: &[(&str, &[u8])]) -> Self {
        let archive = make_tar_gz(files);
        let package_hash = sha256_hex(&archive);
        Self { archive, package_hash }
    }

    pub fn function_metadata(&self, function_id: &str, project_id: &str) -> FunctionMetadata {
        FunctionMetadata {
            function_id: function_id.to_string(),
            version: 1,
            package_hash: self.package_hash.clone(),
            file_size: self.archive.len() as u64,
            package_path: format!("{function_id}.tar.gz"),
            project_id: project_id.to_string(),
            is_active: true,
        }
    }
}

pub fn small_test_config() -> EngineConfig {
    EngineConfig {
        base_size: 1,
        max_isolates: 2,
        memory_limit_per_isolate: 64 * 1024 * 1024,
        function_timeout: Duration::from_secs(5),
        module_cache_max: 64,
        idle_timeout: Duration::from_secs(30),
        invalidation_debounce: Duration::from_millis(50),
        package_cache_root: std::env::temp_dir()
            .join(format!("runtime-core-itest-{}", std::process::id()))
            .to_string_lossy()
            .to_string(),
    }
}

pub async fn build_engine(
    config: EngineConfig,
    metadata_store: StubMetadataStore,
    archive: Vec<u8>,
) -> (Arc<Engine<StubMetadataStore, FixedBlobStore, InMemoryKv>>, Arc<StaticDnsResolver>) {
    let dns = Arc::new(StaticDnsResolver::new(Vec::<(String, Vec<std::net::IpAddr>)>::new()));
    let engine = Engine::new(
        config,
        Arc::new(metadata_store),
        Arc::new(FixedBlobStore::new(archive)),
        Arc::new(InMemoryKv::default()),
        dns.clone(),
        None,
    )
    .await;
    (engine, dns)
}

pub fn base_request(method: &str, path: &str) -> runtime_core::RequestEnvelope {
    runtime_core::RequestEnvelope {
        method: method.to_string(),
        url: path.to_string(),
        path: path.to_string(),
        query: HashMap::new(),
        params: HashMap::new(),
        headers: HashMap::new(),
        body: serde_json::Value::Null,
        ip: "127.0.0.1".to_string(),
        hostname: "localhost".to_string(),
        protocol: "http".to_string(),
    }
}
