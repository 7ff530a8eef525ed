use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("process '{0}' not found")]
    NotFound(String),

    #[error("process id '{0}' is already in use")]
    AlreadyExists(String),

    #[error("process limit reached ({0} tracked processes)")]
    LimitReached(usize),

    #[error("command is empty")]
    EmptyCommand,

    #[error("failed to start command: {0}")]
    Spawn(String),

    #[error("command aborted by client")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
