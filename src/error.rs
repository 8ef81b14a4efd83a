use std::fmt;

/// Error domains, one per failure taxonomy row in the detection design.
///
/// Most stages never let one of these escape: they log it, bump a counter,
/// and move on. Only `Pipeline::start`, `Pipeline::stop`, and `analyze()`
/// return these to their caller.
#[derive(Debug)]
#[allow(dead_code)]
pub enum NdsError {
    Capture(String),
    Flow(String),
    Model(String),
    Persistence(String),
    PubSub(String),
    Config(String),
    WebSocket(String),
}

impl fmt::Display for NdsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NdsError::Capture(msg) => write!(f, "capture error: {}", msg),
            NdsError::Flow(msg) => write!(f, "flow error: {}", msg),
            NdsError::Model(msg) => write!(f, "model error: {}", msg),
            NdsError::Persistence(msg) => write!(f, "persistence error: {}", msg),
            NdsError::PubSub(msg) => write!(f, "pub/sub error: {}", msg),
            NdsError::Config(msg) => write!(f, "configuration error: {}", msg),
            NdsError::WebSocket(msg) => write!(f, "websocket error: {}", msg),
        }
    }
}

impl std::error::Error for NdsError {}

impl From<std::io::Error> for NdsError {
    fn from(err: std::io::Error) -> Self {
        NdsError::Capture(err.to_string())
    }
}

impl From<sled::Error> for NdsError {
    fn from(err: sled::Error) -> Self {
        NdsError::Persistence(err.to_string())
    }
}

impl From<sled::transaction::TransactionError<NdsError>> for NdsError {
    fn from(err: sled::transaction::TransactionError<NdsError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => NdsError::Persistence(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for NdsError {
    fn from(err: serde_json::Error) -> Self {
        NdsError::Persistence(err.to_string())
    }
}

impl From<ctrlc::Error> for NdsError {
    fn from(err: ctrlc::Error) -> Self {
        NdsError::Config(err.to_string())
    }
}

impl From<&str> for NdsError {
    fn from(msg: &str) -> Self {
        NdsError::Config(msg.to_string())
    }
}

impl From<String> for NdsError {
    fn from(msg: String) -> Self {
        NdsError::Config(msg)
    }
}

impl From<pyo3::PyErr> for NdsError {
    fn from(err: pyo3::PyErr) -> Self {
        NdsError::Model(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NdsError>;
