use crate::error_code::StandardErrorCode;
use std::time::Duration;
use thiserror::Error;

/// Structured error context attached to request-scoped failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Target of the originating request (e.g. "ec2.describe-instances")
    pub target: Option<String>,
    /// Fingerprint of the originating request
    pub fingerprint: Option<String>,
    /// Additional free-form detail (e.g. the rendered parameters)
    pub details: Option<String>,
    /// Component that produced the error (e.g. "concurrency", "cli_transport")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Fill unset fields from `other`, keeping what is already present.
    fn merge(&mut self, other: ErrorContext) {
        if self.target.is_none() {
            self.target = other.target;
        }
        if self.fingerprint.is_none() {
            self.fingerprint = other.fingerprint;
        }
        if self.details.is_none() {
            self.details = other.details;
        }
        if self.source.is_none() {
            self.source = other.source;
        }
    }
}

/// Unified error type for the execution engine.
///
/// `Clone` is required: a deduplicated execution hands the very same outcome
/// to every waiter.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Remote error [{code}] ({standard_code}): {message}{}", format_context(.context))]
    Remote {
        /// Provider-specific code, never rewritten
        code: String,
        message: String,
        standard_code: StandardErrorCode,
        retryable: bool,
        context: ErrorContext,
    },

    #[error("Timed out after {}ms waiting for {operation}{}", .after.as_millis(), format_context(.context))]
    Timeout {
        operation: String,
        after: Duration,
        context: ErrorContext,
    },

    #[error("Cancelled{}", format_context(.context))]
    Cancelled { context: ErrorContext },

    #[error("Cache tier '{tier}' I/O error: {message}")]
    CacheIo { tier: String, message: String },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error ({kind:?}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref target) = ctx.target {
        parts.push(format!("target: {}", target));
    }
    if let Some(ref fp) = ctx.fingerprint {
        parts.push(format!("fingerprint: {}", fp));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Build a remote error, classifying the provider code.
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let standard_code = StandardErrorCode::from_provider_code(&code);
        Error::Remote {
            retryable: standard_code.retryable(),
            standard_code,
            code,
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Build a remote error when only a standard classification is known.
    pub fn remote_classified(standard_code: StandardErrorCode, message: impl Into<String>) -> Self {
        Error::Remote {
            code: standard_code.name().to_string(),
            message: message.into(),
            retryable: standard_code.retryable(),
            standard_code,
            context: ErrorContext::new(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            after,
            context: ErrorContext::new(),
        }
    }

    pub fn cancelled(source: impl Into<String>) -> Self {
        Error::Cancelled {
            context: ErrorContext::new().with_source(source),
        }
    }

    pub fn cache_io(tier: impl Into<String>, message: impl Into<String>) -> Self {
        Error::CacheIo {
            tier: tier.into(),
            message: message.into(),
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Attach request context. Fields already set on the error win.
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        match &mut self {
            Error::Remote { context, .. }
            | Error::Timeout { context, .. }
            | Error::Cancelled { context }
            | Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => context.merge(ctx),
            _ => {}
        }
        self
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Remote { context, .. }
            | Error::Timeout { context, .. }
            | Error::Cancelled { context }
            | Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Whether repeating the call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Remote { retryable, .. } => *retryable,
            Error::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn standard_code(&self) -> StandardErrorCode {
        match self {
            Error::Remote { standard_code, .. } => *standard_code,
            Error::Timeout { .. } => StandardErrorCode::Timeout,
            Error::Cancelled { .. } => StandardErrorCode::Cancelled,
            Error::Validation { .. } => StandardErrorCode::InvalidRequest,
            _ => StandardErrorCode::Unknown,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::configuration(format!("invalid YAML: {}", e))
    }
}
