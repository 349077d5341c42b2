use thiserror::Error;

/// Why a raw link could not be turned into an endpoint.
///
/// Callers treat every variant the same way (skip the link); the variants
/// exist so debug logs say what was wrong with it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported scheme")]
    UnknownScheme,

    #[error("missing '{0}' separator")]
    MissingSeparator(char),

    #[error("empty host")]
    EmptyHost,

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("malformed base64 payload")]
    Base64,

    #[error("payload is not valid UTF-8")]
    Utf8,

    #[error("malformed JSON payload: {0}")]
    Json(String),

    #[error("missing field '{0}'")]
    MissingField(&'static str),
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("no free control port after {0} attempts")]
    NoFreePort(usize),

    #[error("engine did not open control port {port} within {timeout_ms}ms")]
    TunnelStartup { port: u16, timeout_ms: u128 },

    #[error("engine exited during startup: {0}")]
    EngineExited(String),

    #[error("transfer through tunnel failed: {0}")]
    TunnelTransfer(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config serialization failed: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProbeError>;
