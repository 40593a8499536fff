//! Engine-wide tunables. `EngineConfig` loads from a TOML file
//! (`from_toml_str`) or `RUNTIME__`-prefixed environment variables
//! (`from_env`), envy-style, the grounding codebase's `knobs.rs` convention
//! of env-overridable constants with sane defaults baked in, expressed here
//! through `serde` rather than a hand-rolled parser.

use std::time::Duration;

use serde::Deserialize;

fn millis<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Duration::from_millis(u64::deserialize(de)?))
}

fn secs<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Duration::from_secs(u64::deserialize(de)?))
}

/// Resource caps and timing knobs from spec §5 "Resource caps".
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Isolates created eagerly at pool start.
    pub base_size: usize,
    /// Ceiling the pool grows to on demand.
    pub max_isolates: usize,
    /// V8 heap ceiling per isolate, in bytes.
    pub memory_limit_per_isolate: usize,
    /// Wall-clock deadline for one `execute` call.
    #[serde(deserialize_with = "millis")]
    pub function_timeout: Duration,
    /// Entry cap for the cross-execution module cache.
    pub module_cache_max: usize,
    /// How long an idle isolate survives before being reaped down to
    /// `base_size`.
    #[serde(deserialize_with = "secs")]
    pub idle_timeout: Duration,
    /// Debounce window for cache-invalidation notifications (§4.7).
    #[serde(deserialize_with = "millis")]
    pub invalidation_debounce: Duration,
    /// Local on-disk root for the package cache.
    pub package_cache_root: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_size: 4,
            max_isolates: 64,
            memory_limit_per_isolate: 64 * 1024 * 1024,
            function_timeout: Duration::from_millis(10_000),
            module_cache_max: 512,
            idle_timeout: Duration::from_secs(300),
            invalidation_debounce: Duration::from_millis(100),
            package_cache_root: "/tmp/runtime-package-cache".to_string(),
        }
    }
}

impl EngineConfig {
    /// Loads from `RUNTIME__`-prefixed env vars (e.g.
    /// `RUNTIME__FUNCTION_TIMEOUT` in milliseconds), falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        envy::prefixed("RUNTIME__").from_env::<Self>().unwrap_or_else(|error| {
            tracing::warn!(%error, "invalid RUNTIME__ environment configuration, using defaults");
            Self::default()
        })
    }

    /// Loads from a TOML document, e.g. the contents of a mounted config
    /// file. Fields absent from the document take their default value.
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(input)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        // SAFETY: test-only, single-threaded access to process env, no
        // other test in this crate reads these specific variables.
        for var in [
            "RUNTIME__BASE_SIZE",
            "RUNTIME__MAX_ISOLATES",
            "RUNTIME__MEMORY_LIMIT_PER_ISOLATE",
            "RUNTIME__FUNCTION_TIMEOUT",
        ] {
            std::env::remove_var(var);
        }
        let config = EngineConfig::from_env();
        assert!(config.base_size > 0);
        assert!(config.max_isolates >= config.base_size);
        assert!(config.memory_limit_per_isolate > 0);
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("RUNTIME__BASE_SIZE", "8");
        std::env::set_var("RUNTIME__FUNCTION_TIMEOUT", "5000");
        let config = EngineConfig::from_env();
        assert_eq!(config.base_size, 8);
        assert_eq!(config.function_timeout, Duration::from_millis(5000));
        std::env::remove_var("RUNTIME__BASE_SIZE");
        std::env::remove_var("RUNTIME__FUNCTION_TIMEOUT");
    }

    #[test]
    fn toml_overrides_apply() {
        let config = EngineConfig::from_toml_str(
            r#"
            base_size = 2
            max_isolates = 4
            idle_timeout = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.base_size, 2);
        assert_eq!(config.max_isolates, 4);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.function_timeout, Duration::from_millis(10_000));
    }
}
