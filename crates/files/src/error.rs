use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("path is empty")]
    EmptyPath,

    #[error("path not permitted: {0}")]
    PathTraversal(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid {encoding} content: {message}")]
    BadEncoding { encoding: String, message: String },

    #[error("filesystem error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl FileError {
    /// Map an io error for `path` into the wire taxonomy.
    pub fn classify(path: &std::path::Path, source: std::io::Error) -> Self {
        let path = path.display().to_string();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(path),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            _ => Self::Io { path, source },
        }
    }
}

pub type Result<T> = std::result::Result<T, FileError>;
