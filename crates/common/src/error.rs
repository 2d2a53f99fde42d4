//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Out of memory: {requested} bytes requested")]
    OutOfMemory { requested: usize },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::OutOfMemory { requested: 4096 };
        assert_eq!(format!("{}", err), "Out of memory: 4096 bytes requested");

        let err = Error::Channel("closed".to_string());
        assert!(format!("{}", err).contains("closed"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::other("spawn failed");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
