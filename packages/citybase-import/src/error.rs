use thiserror::Error;

pub type Result<T> = std::result::Result<T, ImportError>;

#[derive(Error, Debug)]
pub enum ImportError {
    /// Destination-store failure. Transient by assumption: retry policy
    /// belongs to the orchestrator, not to this core.
    #[error("database error: {0}")]
    Database(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Raised by the final drain in strict mode.
    #[error("{0} references remained unresolved after the final drain")]
    UnresolvedReferences(usize),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ImportError {
    pub fn database<E: std::fmt::Display>(e: E) -> Self {
        Self::Database(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub(crate) fn invalid_transition(from: &str, to: &str) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_error_display() {
        let err = ImportError::database("connection refused");
        assert_eq!(err.to_string(), "database error: connection refused");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = ImportError::invalid_transition("init", "draining");
        assert_eq!(
            err.to_string(),
            "invalid state transition: init -> draining"
        );
    }

    #[test]
    fn test_result_propagation() {
        fn inner() -> Result<()> {
            Err(ImportError::UnresolvedReferences(3))
        }

        fn outer() -> Result<()> {
            inner()?;
            Ok(())
        }

        let err = outer().unwrap_err();
        assert!(matches!(err, ImportError::UnresolvedReferences(3)));
    }
}
