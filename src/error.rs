use thiserror::Error as ThisError;

use crate::window::{Boundary, Window};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("counter overflow, window: {window}, url: {url}")]
    Overflow { window: Window, url: String },
    #[error("rollover conflict on {0} boundary")]
    RolloverConflict(Boundary),
    #[error("record error, window: {window}, {source}")]
    Record {
        window: Window,
        #[source]
        source: Box<Error>,
    },
    #[error("unknown window: `{0}`")]
    UnknownWindow(String),
    #[error("unknown history log: `{0}`")]
    UnknownLog(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("unexpected error, {0}")]
    Other(#[source] Box<dyn std::error::Error + Sync + Send + 'static>),
}

impl Error {
    pub fn boxed(self) -> Box<Self> {
        Box::new(self)
    }

    /// True for an `Overflow`, including one wrapped by `Record`.
    #[inline]
    pub fn is_overflow(&self) -> bool {
        match self {
            Error::Overflow { .. } => true,
            Error::Record { source, .. } => source.is_overflow(),
            _ => false,
        }
    }

    /// True for a `Storage` failure, including one wrapped by `Record`.
    #[inline]
    pub fn is_storage(&self) -> bool {
        match self {
            Error::Storage(_) => true,
            Error::Record { source, .. } => source.is_storage(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for Error {
    #[inline]
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Other(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_wrapping_keeps_classification() {
        let overflow = Error::Record {
            window: Window::CurrentDay,
            source: Error::Overflow {
                window: Window::CurrentDay,
                url: "https://example.com/".into(),
            }
            .boxed(),
        };
        assert!(overflow.is_overflow());
        assert!(!overflow.is_storage());

        let storage = Error::Record {
            window: Window::AllTime,
            source: Error::Storage("disk I/O error".into()).boxed(),
        };
        assert!(storage.is_storage());
        assert!(storage.to_string().contains("AllTime"));
    }

    #[test]
    fn sqlite_errors_become_storage() {
        let e: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(e.is_storage());
    }

    #[test]
    fn codec_errors_are_not_storage() {
        let e: Error = bincode::deserialize::<u64>(&[1u8]).unwrap_err().into();
        assert!(matches!(e, Error::Other(_)));
        assert!(!e.is_storage());
        assert!(!e.is_overflow());
    }
}
