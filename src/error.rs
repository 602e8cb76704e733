use std::fmt;

/// Errors surfaced across the engine's public entry points.
///
/// Post-response failures (a client write error, an upstream EOF mid-body)
/// are not returned here — they close the session instead, per the error
/// handling design: only pre-response failures (dial, write-request) are
/// reported to the caller as a value.
#[derive(Debug)]
pub enum EngineError {
    Resolve(String),
    Dial(std::io::Error),
    Write(std::io::Error),
    Read(std::io::Error),
    Protocol(String),
    Closed,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Resolve(hostport) => write!(f, "failed to resolve {hostport}"),
            EngineError::Dial(e) => write!(f, "dial error: {e}"),
            EngineError::Write(e) => write!(f, "write error: {e}"),
            EngineError::Read(e) => write!(f, "read error: {e}"),
            EngineError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            EngineError::Closed => write!(f, "session closed"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Read(e)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
