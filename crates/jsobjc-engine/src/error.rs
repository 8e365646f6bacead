//! Bridge error taxonomy

use jsobjc_sdk::JsError;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors raised by the bridge.
///
/// Every variant crosses into script as a thrown error object; see
/// [`crate::exception`] for the conversion.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// Malformed or unresolvable type encoding or struct reference
    #[error("{0}")]
    Metadata(String),

    /// No overload matched the call site
    #[error("No {kind} found that matches {target} invocation (arguments count: {arity}).")]
    Resolution {
        /// "initializer" or "method"
        kind: &'static str,
        /// What was being invoked
        target: String,
        /// Number of arguments supplied
        arity: usize,
    },

    /// Call-site arity does not fit a fixed-arity entry point
    #[error("Actual arguments count: \"{actual}\". Expected: \"{expected}\".")]
    ArgumentCount {
        /// Arguments supplied
        actual: usize,
        /// Arguments accepted, e.g. `1` or `2..3`
        expected: String,
    },

    /// A value cannot be represented in the target native type
    #[error("{0}")]
    Marshal(String),

    /// A native error object returned through an error out-parameter
    #[error("{description}")]
    NativeError {
        /// Error domain
        domain: String,
        /// Error code
        code: i64,
        /// Localized description
        description: String,
    },

    /// The operation was applied to the wrong kind of value
    #[error("{0}")]
    Type(String),

    /// A native exception was raised during dispatch
    #[error("{name}: {reason}")]
    NativeException {
        /// Exception name, e.g. `NSInvalidArgumentException`
        name: String,
        /// Exception reason
        reason: String,
    },

    /// A scripting exception, passed through unchanged
    #[error("{0}")]
    Script(JsError),
}

impl BridgeError {
    /// Build a metadata error naming the offending encoding fragment
    pub fn bad_encoding(fragment: &str, reason: impl AsRef<str>) -> Self {
        BridgeError::Metadata(format!(
            "{} in type encoding \"{}\"",
            reason.as_ref(),
            fragment
        ))
    }

    /// Build an arity error for a fixed expected count
    pub fn argument_count(actual: usize, expected: usize) -> Self {
        BridgeError::ArgumentCount {
            actual,
            expected: expected.to_string(),
        }
    }

    /// The scripting error name this error is thrown as
    pub fn error_name(&self) -> String {
        match self {
            BridgeError::Metadata(_) => "MetadataError".to_string(),
            BridgeError::Resolution { .. } => "ResolutionError".to_string(),
            BridgeError::ArgumentCount { .. } => "ArgumentCountError".to_string(),
            BridgeError::Marshal(_) | BridgeError::NativeError { .. } => "MarshalError".to_string(),
            BridgeError::Type(_) => "TypeError".to_string(),
            BridgeError::NativeException { name, .. } => name.clone(),
            BridgeError::Script(e) => e.name(),
        }
    }
}

impl From<JsError> for BridgeError {
    fn from(e: JsError) -> Self {
        BridgeError::Script(e)
    }
}
