//! Typed failures for the two write sinks (vector store and ledger).

use std::fmt;

use reqwest::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkName {
    VectorStore,
    Ledger,
}

impl fmt::Display for SinkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkName::VectorStore => f.write_str("vector_store"),
            SinkName::Ledger => f.write_str("ledger"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkErrorKind {
    /// Connectivity, timeouts, throttling, 5xx: the same write may succeed later.
    Transient,
    /// The sink understood the request and refused it (bad vector, bad schema, auth).
    Rejected,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{sink} write failed ({kind:?}): {message}")]
pub struct SinkError {
    pub sink: SinkName,
    pub kind: SinkErrorKind,
    pub message: String,
}

impl SinkError {
    pub fn transient(sink: SinkName, message: impl Into<String>) -> Self {
        Self {
            sink,
            kind: SinkErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn rejected(sink: SinkName, message: impl Into<String>) -> Self {
        Self {
            sink,
            kind: SinkErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == SinkErrorKind::Transient
    }

    pub fn from_status(sink: SinkName, status: StatusCode, body: &str) -> Self {
        let message = format!(
            "status {status}: {}",
            body.chars().take(500).collect::<String>()
        );
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Self::transient(sink, message)
        } else {
            Self::rejected(sink, message)
        }
    }

    pub fn from_reqwest(sink: SinkName, err: reqwest::Error) -> Self {
        if err.is_builder() || err.is_decode() {
            Self::rejected(sink, err.to_string())
        } else {
            Self::transient(sink, err.to_string())
        }
    }

    pub fn from_sqlx(sink: SinkName, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => Self::rejected(sink, db.to_string()),
            sqlx::Error::Encode(_) | sqlx::Error::ColumnNotFound(_) | sqlx::Error::TypeNotFound { .. } => {
                Self::rejected(sink, err.to_string())
            }
            other => Self::transient(sink, other.to_string()),
        }
    }
}

/// Result of one guarded sink call: a success flag plus the failure, if any.
#[derive(Debug, Clone)]
pub struct SinkOutcome {
    pub ok: bool,
    pub error: Option<SinkError>,
}

impl SinkOutcome {
    pub fn from_result(res: Result<(), SinkError>) -> Self {
        match res {
            Ok(()) => Self {
                ok: true,
                error: None,
            },
            Err(e) => Self {
                ok: false,
                error: Some(e),
            },
        }
    }
}
