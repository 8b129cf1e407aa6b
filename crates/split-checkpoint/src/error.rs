use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Upload/download exhausted its retries, or a referenced volume is gone.
    Transfer,
    /// A named blob does not exist in the store.
    NotFound,
    /// tar (or the stream between tar and the volumes) failed.
    ArchiveTool,
    ManifestCorrupt,
    /// A required external program is missing.
    Precondition,
    Config,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transfer => "transfer_failure",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ArchiveTool => "archive_tool_failure",
            ErrorKind::ManifestCorrupt => "manifest_corrupt",
            ErrorKind::Precondition => "precondition_failure",
            ErrorKind::Config => "config_error",
            ErrorKind::Other => "error",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn transfer<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Transfer, msg)
    }

    pub fn not_found<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn archive_tool<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::ArchiveTool, msg)
    }

    pub fn manifest_corrupt<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::ManifestCorrupt, msg)
    }

    pub fn precondition<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Precondition, msg)
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// Re-tag an error while keeping its message, prefixed with `context`.
    pub fn with_kind(self, kind: ErrorKind, context: &str) -> Self {
        Self {
            kind,
            msg: format!("{context}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
