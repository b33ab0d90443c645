use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Boxed source error carried inside [`Error`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Backlog,
    Dedup,
    Request,
    Download,
    Parser,
    Pipeline,
    Task,
    Lock,
    Config,
    Io,
    /// A parser broke its contract; retrying cannot help
    Fatal,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Backlog => "backlog",
            ErrorKind::Dedup => "dedup",
            ErrorKind::Request => "request",
            ErrorKind::Download => "download",
            ErrorKind::Parser => "parser",
            ErrorKind::Pipeline => "pipeline",
            ErrorKind::Task => "task",
            ErrorKind::Lock => "lock",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<BoxError>,
}

/// Crate error: a kind plus an optional message and source.
pub struct Error(Box<Inner>);

impl Error {
    pub fn new(kind: ErrorKind, source: impl Into<BoxError>) -> Error {
        Error(Box::new(Inner {
            kind,
            message: None,
            source: Some(source.into()),
        }))
    }

    /// Error without a source, only a message.
    pub fn msg(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error(Box::new(Inner {
            kind,
            message: Some(message.into()),
            source: None,
        }))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn is_parser(&self) -> bool {
        self.0.kind == ErrorKind::Parser
    }

    pub fn is_lock(&self) -> bool {
        self.0.kind == ErrorKind::Lock
    }

    /// Never retried.
    pub fn is_fatal(&self) -> bool {
        self.0.kind == ErrorKind::Fatal
    }

    pub fn parser_not_found(name: &str) -> Self {
        ParserError::NotFound(name.to_string()).into()
    }

    pub fn invalid_yield(desc: impl Into<String>) -> Self {
        ParserError::InvalidYield(desc.into()).into()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.0.kind)
            .field("message", &self.0.message)
            .field("source", &self.0.source)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error", self.0.kind)?;
        if let Some(message) = &self.0.message {
            write!(f, ": {message}")?;
        }
        if let Some(source) = &self.0.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0
            .source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

macro_rules! error_kind_from {
    ($($domain:ty => $kind:ident),* $(,)?) => {
        $(
            impl From<$domain> for Error {
                fn from(err: $domain) -> Self {
                    Error::new(ErrorKind::$kind, err)
                }
            }
        )*
    };
}

error_kind_from! {
    BacklogError => Backlog,
    DedupError => Dedup,
    RequestError => Request,
    DownloadError => Download,
    PipelineError => Pipeline,
    TaskError => Task,
    LockError => Lock,
    ConfigError => Config,
    std::io::Error => Io,
}

impl From<ParserError> for Error {
    fn from(err: ParserError) -> Self {
        let kind = match err {
            ParserError::InvalidYield(_) => ErrorKind::Fatal,
            _ => ErrorKind::Parser,
        };
        Error::new(kind, err)
    }
}

#[derive(Debug, Error)]
pub enum BacklogError {
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] BoxError),
    #[error("lease script failed: {0}")]
    LeaseFailed(#[source] BoxError),
    #[error("write failed: {0}")]
    WriteFailed(#[source] BoxError),
    #[error("read failed: {0}")]
    ReadFailed(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("filter store: {0}")]
    Store(#[source] BoxError),
    #[error("unknown dedup strategy: {0}")]
    UnknownStrategy(String),
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("serialize failed: {0}")]
    Serialize(#[source] BoxError),
    #[error("malformed backlog member: {0}")]
    Malformed(#[source] BoxError),
    #[error("unsupported method: {0}")]
    InvalidMethod(String),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download failed: {0}")]
    DownloadFailed(#[source] BoxError),
    #[error("timed out: {0}")]
    Timeout(#[source] BoxError),
    #[error("unexpected status {0}")]
    InvalidStatus(u16),
}

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("parser not found: {0}")]
    NotFound(String),
    #[error("callback not found: {0}")]
    CallbackNotFound(String),
    #[error("invalid yield: {0}")]
    InvalidYield(String),
    #[error("{0}")]
    ParseError(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{pipeline} rejected {rows} rows for {table}")]
    SaveRejected {
        pipeline: String,
        table: String,
        rows: usize,
    },
    #[error("{pipeline} rejected {rows} updates of {table}")]
    UpdateRejected {
        pipeline: String,
        table: String,
        rows: usize,
    },
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("query failed: {0}")]
    Query(#[source] BoxError),
    #[error("invalid task state: {0}")]
    InvalidState(i64),
    #[error("missing column: {0}")]
    MissingColumn(String),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock store: {0}")]
    Redis(#[source] BoxError),
    #[error("lock already held: {0}")]
    AlreadyHeld(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read failed: {0}")]
    Read(#[source] BoxError),
    #[error("parse failed: {0}")]
    Parse(#[source] BoxError),
    #[error("invalid value: {0}")]
    Invalid(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        RequestError::Serialize(err.into()).into()
    }
}

impl From<deadpool_redis::redis::RedisError> for Error {
    fn from(err: deadpool_redis::redis::RedisError) -> Self {
        BacklogError::ReadFailed(err.into()).into()
    }
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(err: deadpool_redis::PoolError) -> Self {
        BacklogError::ConnectionFailed(err.into()).into()
    }
}

impl From<sea_orm::DbErr> for Error {
    fn from(err: sea_orm::DbErr) -> Self {
        TaskError::Query(err.into()).into()
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DownloadError::Timeout(err.into()).into()
        } else {
            DownloadError::DownloadFailed(err.into()).into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_chains_source() {
        let err = Error::parser_not_found("list_parser");
        assert_eq!(err.to_string(), "parser error: parser not found: list_parser");

        let err = Error::msg(ErrorKind::Task, "no rows");
        assert_eq!(err.to_string(), "task error: no rows");
    }

    #[test]
    fn test_invalid_yield_is_fatal() {
        let err = Error::invalid_yield("integer");
        assert!(err.is_fatal());
        assert!(!err.is_parser());

        let err = Error::from(ParserError::ParseError("bad json".into()));
        assert!(err.is_parser());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_foreign_errors_keep_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out");
        let err = Error::from(io_err);
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.source().is_some());

        let err = Error::from(PipelineError::SaveRejected {
            pipeline: "mysql".into(),
            table: "news".into(),
            rows: 3,
        });
        assert_eq!(err.kind(), ErrorKind::Pipeline);
        assert_eq!(err.to_string(), "pipeline error: mysql rejected 3 rows for news");
    }
}
