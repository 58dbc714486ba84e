use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Config path or cache key involved in the error (e.g., "namespaces.profile.ttl_secs", "event-detail:42")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected bound, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "store", "coordinator", "snapshot")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
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
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the cache engine.
///
/// `Clone` so that a single coalesced failure can be delivered to every
/// caller that joined the same in-flight fetch.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Transient fetch error: {message}{}", format_context(.context))]
    TransientFetch {
        message: String,
        context: ErrorContext,
    },

    #[error("Authentication error: {message}")]
    Auth { message: String },

    #[error("Not found: {key}")]
    NotFound { key: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Secure store error: {message}")]
    SecureStore { message: String },

    #[error("Persistence error: {message}{}", format_context(.context))]
    Persistence {
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
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

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Configuration {
            message: e.to_string(),
            context: ErrorContext::new().with_source("config"),
        }
    }
}

impl Error {
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::TransientFetch {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth {
            message: msg.into(),
        }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Create a new persistence error with structured context
    pub fn persistence_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Persistence {
            message: msg.into(),
            context,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientFetch { .. })
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::TransientFetch { context, .. }
            | Error::Persistence { context, .. }
            | Error::Configuration { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }
}
