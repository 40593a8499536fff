//! Engine Facade, §4.8: the one entry point embedders call, wiring the pool,
//! module loader, package provider, and invalidation listener together.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_lru::AsyncLru;
use net_policy::{DnsResolver, NetworkRule, PolicyEngine};
use package_store::{BlobStore, PackageMetadata, PackageStore};
use rt_errors::RuntimeError;

use crate::{
    bridge::KvStore,
    config::EngineConfig,
    context::{ContextInputs, ExecutionContext, RequestEnvelope, ResponseEnvelope},
    invalidation::{CacheInvalidationListener, InvalidationPayload, NotificationSource},
    module_loader::ModuleLoader,
    pool::IsolatePool,
    vfs::Vfs,
};

/// One row of `(function_id, version, package_hash, file_size, package_path,
/// project_id, is_active)`, §6 "Metadata store".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionMetadata {
    pub function_id: String,
    pub version: i64,
    pub package_hash: String,
    pub file_size: u64,
    pub package_path: String,
    pub project_id: String,
    pub is_active: bool,
}

/// Read-only access to the configuration database's function/env/policy
/// rows. Consumed, never implemented, by this crate (§6).
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    async fn function_metadata(&self, function_id: &str) -> anyhow::Result<Option<FunctionMetadata>>;
    async fn env_vars(&self, function_id: &str) -> anyhow::Result<HashMap<String, String>>;
    async fn global_network_rules(&self) -> anyhow::Result<Vec<NetworkRule>>;
    async fn project_network_rules(&self, project_id: &str) -> anyhow::Result<Vec<NetworkRule>>;
}

/// The cached result of step 1 of §4.8's `execute` algorithm: metadata, env,
/// and policy, invalidated wholesale by the listener's callback.
struct Snapshot {
    metadata: FunctionMetadata,
    env: HashMap<String, String>,
    policy: Arc<PolicyEngine>,
}

#[derive(Debug)]
struct FunctionNotFoundMarker(String);

impl std::fmt::Display for FunctionNotFoundMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no active function row for {}", self.0)
    }
}
impl std::error::Error for FunctionNotFoundMarker {}

async fn build_snapshot(metadata_store: &(dyn MetadataStore), function_id: &str) -> anyhow::Result<Snapshot> {
    let metadata = metadata_store
        .function_metadata(function_id)
        .await?
        .filter(|m| m.is_active)
        .ok_or_else(|| FunctionNotFoundMarker(function_id.to_string()))?;

    let env = metadata_store.env_vars(function_id).await?;
    let global_rules = metadata_store.global_network_rules().await?;
    let project_rules = metadata_store.project_network_rules(&metadata.project_id).await?;
    let policy = Arc::new(PolicyEngine::new(global_rules, project_rules));

    Ok(Snapshot { metadata, env, policy })
}

fn invalidate(snapshots: &AsyncLru<String, Snapshot>, loader: &ModuleLoader, payload: InvalidationPayload) {
    match payload.table.as_str() {
        "function_environment_variables" => {
            if let Some(function_id) = payload.function_id {
                snapshots.remove(&function_id);
                loader.invalidate_function(&function_id);
            }
        },
        // Rule-set changes affect every function's merged policy, since any
        // function's snapshot may draw on either list; clearing the whole
        // cache is simpler and cheap relative to how rarely rules change.
        "project_network_policies" | "global_network_policies" => snapshots.clear(),
        _ => {},
    }
}

/// Runs `step` bounded by the time left until `deadline_at`, mapping an
/// elapsed budget to `RuntimeError::Timeout` the same as a handler that
/// overruns its own slice of the call.
async fn remaining<T, F, Fut>(deadline_at: Instant, step: F) -> Result<T, RuntimeError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, RuntimeError>>,
{
    let budget = deadline_at.saturating_duration_since(Instant::now());
    match tokio::time::timeout(budget, step()).await {
        Ok(result) => result,
        Err(_elapsed) => Err(RuntimeError::Timeout),
    }
}

/// Wires the isolate pool, module loader, package store, and invalidation
/// listener behind the single `execute` entry point, §4.8.
pub struct Engine<M, B, K> {
    config: EngineConfig,
    pool: Arc<IsolatePool>,
    loader: Arc<ModuleLoader>,
    packages: Arc<PackageStore<B>>,
    snapshots: AsyncLru<String, Snapshot>,
    metadata_store: Arc<M>,
    kv: Arc<K>,
    dns: Arc<dyn DnsResolver>,
    listener: Option<CacheInvalidationListener>,
}

impl<M, B, K> Engine<M, B, K>
where
    M: MetadataStore + 'static,
    B: BlobStore + 'static,
    K: KvStore + 'static,
{
    /// Builds the pool, module loader, and package store, and starts the
    /// invalidation listener if `invalidation_source` is given.
    pub async fn new(
        config: EngineConfig,
        metadata_store: Arc<M>,
        blob_store: Arc<B>,
        kv: Arc<K>,
        dns: Arc<dyn DnsResolver>,
        invalidation_source: Option<Box<dyn NotificationSource>>,
    ) -> Arc<Self> {
        let pool = IsolatePool::new(&config).await;
        let loader = Arc::new(ModuleLoader::new(config.module_cache_max));
        let packages = Arc::new(PackageStore::new(config.package_cache_root.clone(), blob_store));
        let snapshots: AsyncLru<String, Snapshot> = AsyncLru::new(config.module_cache_max, "engine_snapshots");

        let listener = invalidation_source.map(|source| {
            let snapshots = snapshots.clone();
            let loader = loader.clone();
            CacheInvalidationListener::spawn(source, config.invalidation_debounce, move |payload| {
                invalidate(&snapshots, &loader, payload);
            })
        });

        Arc::new(Self {
            config,
            pool,
            loader,
            packages,
            snapshots,
            metadata_store,
            kv,
            dns,
            listener,
        })
    }

    /// Implements §4.8's five-step `execute` algorithm. Every step shares a
    /// single `deadline_at` computed from `function_timeout` up front, so
    /// snapshot resolution, package fetch, pool acquire, and the call itself
    /// together bound the total wall-clock (§8 Property 9), rather than each
    /// getting its own independent `function_timeout` budget.
    pub async fn execute(&self, function_id: &str, request: RequestEnvelope) -> Result<ResponseEnvelope, RuntimeError> {
        let deadline_at = Instant::now() + self.config.function_timeout;

        let snapshot = remaining(deadline_at, || self.resolve_snapshot(function_id)).await?;

        let package_metadata = PackageMetadata {
            function_id: snapshot.metadata.function_id.clone(),
            version: snapshot.metadata.version,
            package_hash: snapshot.metadata.package_hash.clone(),
            file_size: snapshot.metadata.file_size,
            package_path: snapshot.metadata.package_path.clone(),
        };
        let resolved = remaining(deadline_at, || self.packages.get(&package_metadata)).await?;
        let vfs = Arc::new(Vfs::mount(resolved.package_dir));

        let leased = self.pool.acquire(deadline_at).await?;
        let ctx = ExecutionContext::new(leased);

        let inputs = ContextInputs {
            vfs,
            env: snapshot.env.clone(),
            policy: snapshot.policy.clone(),
            dns: self.dns.clone(),
            kv: self.kv.clone(),
            kv_namespace: snapshot.metadata.project_id.clone(),
            loader: self.loader.clone(),
            function_id: snapshot.metadata.function_id.clone(),
            package_hash: snapshot.metadata.package_hash.clone(),
        };

        ctx.run(inputs, request, deadline_at).await
    }

    async fn resolve_snapshot(&self, function_id: &str) -> Result<Arc<Snapshot>, RuntimeError> {
        let metadata_store = self.metadata_store.clone();
        let key = function_id.to_string();
        let owned_function_id = function_id.to_string();
        self.snapshots
            .get_or_try_compute(key, move || async move {
                build_snapshot(metadata_store.as_ref(), &owned_function_id).await
            })
            .await
            .map_err(|e| match e.downcast::<FunctionNotFoundMarker>() {
                Ok(marker) => RuntimeError::FunctionNotFound {
                    function_id: marker.0,
                },
                Err(e) => RuntimeError::internal(e.to_string()),
            })
    }

    pub fn pool_metrics(&self) -> crate::pool::PoolMetrics {
        self.pool.metrics()
    }

    pub async fn shutdown(&self, grace: Duration) {
        if let Some(listener) = &self.listener {
            listener.stop();
        }
        self.pool.shutdown(grace).await;
    }
}
