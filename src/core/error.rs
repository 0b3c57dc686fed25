use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // Versioning
    VersionAlreadyExists,
    PublishVersionNotContinuous,
    CumulativeNoSuitableVersion,
    CumulativeMeetDeleteVersion,
    BeNoSuitableVersion,
    // Lookup
    PushTableNotExist,
    PushRowsetNotFound,
    NotFound,
    // Concurrency
    AlreadyExists,
    TryLockFailed,
    // I/O & format
    IoError,
    ParseError,
    InitFailed,
    Corruption,
    // Fatal
    InternalError,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Error { kind, context: context.into() }
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    pub fn version_already_exists(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::VersionAlreadyExists, context)
    }

    pub fn publish_version_not_continuous(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::PublishVersionNotContinuous, context)
    }

    pub fn cumulative_no_suitable_version(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::CumulativeNoSuitableVersion, context)
    }

    pub fn cumulative_meet_delete_version(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::CumulativeMeetDeleteVersion, context)
    }

    pub fn no_suitable_version(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::BeNoSuitableVersion, context)
    }

    pub fn not_found(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound, context)
    }

    pub fn already_exists(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::AlreadyExists, context)
    }

    pub fn try_lock_failed(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::TryLockFailed, context)
    }

    pub fn io_error(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::IoError, context)
    }

    pub fn corruption(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Corruption, context)
    }

    pub fn internal(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::InternalError, context)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::IoError,
            context: err.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error {
            kind: ErrorKind::ParseError,
            context: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
