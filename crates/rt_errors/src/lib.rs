//! The closed error taxonomy surfaced by the execution core to its callers.
//!
//! Internal plumbing works in `anyhow::Result<T>`, the same as the grounding
//! codebase; at the point a failure's classification becomes known it is
//! attached via `.context(RuntimeError::...)`. The engine facade is
//! responsible for downgrading any error that escapes unclassified to
//! [`RuntimeError::Internal`].

use std::fmt;

/// Coarse classification used for metrics/logging tags. Mirrors the shape of
/// the grounding codebase's `ErrorCode`, narrowed to this system's taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    FunctionNotFound,
    PackageIntegrityError,
    ResourceExhausted,
    Timeout,
    MemoryLimit,
    NetworkPolicyDenied,
    ModuleNotFound,
    ParseError,
    EvaluationError,
    HandlerError,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FunctionNotFound => "FunctionNotFound",
            Self::PackageIntegrityError => "PackageIntegrityError",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::Timeout => "Timeout",
            Self::MemoryLimit => "MemoryLimit",
            Self::NetworkPolicyDenied => "NetworkPolicyDenied",
            Self::ModuleNotFound => "ModuleNotFound",
            Self::ParseError => "ParseError",
            Self::EvaluationError => "EvaluationError",
            Self::HandlerError => "HandlerError",
            Self::Internal => "InternalError",
        };
        f.write_str(s)
    }
}

/// The taxonomy from spec §7, each variant a terminal outcome of
/// `Engine::execute`.
#[derive(thiserror::Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("no active function for id {function_id}")]
    FunctionNotFound { function_id: String },

    #[error("package integrity check failed: {reason}")]
    PackageIntegrityError { reason: String },

    #[error("isolate pool exhausted before a slot became available")]
    ResourceExhausted,

    #[error("call exceeded its deadline")]
    Timeout,

    #[error("isolate exceeded its heap limit")]
    MemoryLimit,

    #[error("network policy denied connection to {host}")]
    NetworkPolicyDenied { host: String },

    #[error("module not found: {specifier} (from {from})")]
    ModuleNotFound { specifier: String, from: String },

    #[error("failed to parse module {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("error evaluating module {path}: {message}")]
    EvaluationError { path: String, message: String },

    #[error("unhandled exception in handler: {message}")]
    HandlerError {
        message: String,
        stack: Option<String>,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RuntimeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::FunctionNotFound { .. } => ErrorCode::FunctionNotFound,
            Self::PackageIntegrityError { .. } => ErrorCode::PackageIntegrityError,
            Self::ResourceExhausted => ErrorCode::ResourceExhausted,
            Self::Timeout => ErrorCode::Timeout,
            Self::MemoryLimit => ErrorCode::MemoryLimit,
            Self::NetworkPolicyDenied { .. } => ErrorCode::NetworkPolicyDenied,
            Self::ModuleNotFound { .. } => ErrorCode::ModuleNotFound,
            Self::ParseError { .. } => ErrorCode::ParseError,
            Self::EvaluationError { .. } => ErrorCode::EvaluationError,
            Self::HandlerError { .. } => ErrorCode::HandlerError,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Whether hitting this error means the isolate that produced it can no
    /// longer be trusted and must be discarded rather than returned to the
    /// pool. See spec §7 "Propagation policy".
    pub fn forces_corrupted_isolate(&self) -> bool {
        matches!(self, Self::Timeout | Self::MemoryLimit | Self::Internal { .. })
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Walks an `anyhow::Error` chain looking for a [`RuntimeError`] attached via
/// `.context(..)`, the same pattern the grounding codebase uses for
/// `ErrorMetadata`. Falls back to `RuntimeError::Internal` with the error's
/// `Display` if none is found.
pub fn classify(err: &anyhow::Error) -> RuntimeError {
    for cause in err.chain() {
        if let Some(known) = cause.downcast_ref::<RuntimeError>() {
            return known.clone();
        }
    }
    RuntimeError::internal(err.to_string())
}
