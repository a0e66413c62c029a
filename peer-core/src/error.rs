use snafu::Snafu;

/// Failure classes the orchestrator reacts to. Carried inside
/// `anyhow::Error`; use [`classify`] to recover it.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CdcError {
    #[snafu(display("{} {} not found", kind, id))]
    NotFound { kind: &'static str, id: String },

    #[snafu(display("configuration error: {}", message))]
    Configuration { message: String },

    #[snafu(display("transient error: {}", message))]
    Transient { message: String },

    #[snafu(display("giving up after {} consecutive failures: {}", attempts, last))]
    RetriesExhausted { attempts: u32, last: String },

    #[snafu(display("data error: {}", message))]
    Data { message: String },

    #[snafu(display("unknown column {} in table {}", column, table))]
    UnknownColumn { table: String, column: String },
}

impl CdcError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CdcError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        CdcError::Configuration {
            message: message.into(),
        }
    }

    pub fn data(message: impl Into<String>) -> Self {
        CdcError::Data {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        CdcError::Transient {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CdcError::Transient { .. })
    }
}

pub fn classify(err: &anyhow::Error) -> Option<&CdcError> {
    err.chain().find_map(|cause| cause.downcast_ref::<CdcError>())
}

pub fn is_transient(err: &anyhow::Error) -> bool {
    classify(err).is_some_and(CdcError::is_retryable)
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn classification_survives_context() {
        let err: anyhow::Result<()> = Err(CdcError::transient("read timed out").into());
        let err = err.context("fetching events").unwrap_err();
        assert!(is_transient(&err));
        assert!(matches!(classify(&err), Some(CdcError::Transient { .. })));

        let err = anyhow::anyhow!("plain failure");
        assert!(classify(&err).is_none());
        assert!(!is_transient(&err));
    }
}
