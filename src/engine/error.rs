use std::path::PathBuf;
use thiserror::Error;

/// Failures the workflow distinguishes between.
///
/// Components return `anyhow::Result` and raise these as the root cause, so
/// callers classify a failure with `err.downcast_ref::<KilnError>()`.
#[derive(Debug, Error)]
pub enum KilnError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("integrity check failed for {}: {message}", path.display())]
    Integrity { path: PathBuf, message: String },

    #[error("installation of {tool} failed: {message}")]
    Installation { tool: String, message: String },

    #[error("{tool} requires {dependency}: {message}")]
    MissingDependency {
        tool: String,
        dependency: String,
        message: String,
    },

    #[error("invalid project at {}: {message}", path.display())]
    ProjectStructure { path: PathBuf, message: String },

    #[error("build failed: {message}")]
    Build { message: String },

    #[error("packaging failed: {message}")]
    Packaging { message: String },
}

impl KilnError {
    pub fn network(message: impl Into<String>) -> Self {
        KilnError::Network {
            message: message.into(),
        }
    }

    pub fn installation(tool: &str, message: impl Into<String>) -> Self {
        KilnError::Installation {
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    pub fn build(message: impl Into<String>) -> Self {
        KilnError::Build {
            message: message.into(),
        }
    }

    pub fn packaging(message: impl Into<String>) -> Self {
        KilnError::Packaging {
            message: message.into(),
        }
    }

    /// Whether a retry through the named fallback path could still succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, KilnError::Network { .. } | KilnError::Integrity { .. })
    }
}

/// Finds the `KilnError` anywhere in an error chain.
pub fn classify(err: &anyhow::Error) -> Option<&KilnError> {
    err.chain().find_map(|e| e.downcast_ref::<KilnError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_sees_through_context() {
        let err: anyhow::Result<()> = Err(KilnError::network("connection refused").into());
        let err = err.context("fetching node").unwrap_err();

        let kind = classify(&err).unwrap();
        assert!(matches!(kind, KilnError::Network { .. }));
        assert!(kind.is_recoverable());
    }

    #[test]
    fn fatal_errors_are_not_recoverable() {
        assert!(!KilnError::installation("node", "binary missing").is_recoverable());
        assert!(!KilnError::build("pnpm run build failed").is_recoverable());
    }
}
