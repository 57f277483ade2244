use thiserror::Error;

/// Errors surfaced by construction-time and control-plane operations.
///
/// Fast-path outcomes never go through this type: a map miss is `None`,
/// a full map is a status value, a full ring overwrites. Only fatal
/// configuration, arena exhaustion and attach failures are errors.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shared memory exhausted: requested {requested} bytes (size class {class})")]
    OutOfMemory { requested: usize, class: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("attach failed: {0}")]
    Attach(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
