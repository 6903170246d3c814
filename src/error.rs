//! Error types shared by the router, the server and the script bridge.

use deno_error::JsErrorBox;
use thiserror::Error;

/// Errors raised by host code.
///
/// Setup and call-time errors reach scripts as exceptions through the
/// `From<Error> for JsErrorBox` conversion. Serve-loop errors are only logged.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[source] std::io::Error),

    #[error("listen {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server is already listening")]
    AlreadyListening,

    #[error("listen requires a running tokio runtime")]
    NoRuntime,

    #[error("invalid route {pattern:?}: {source}")]
    Route {
        pattern: String,
        #[source]
        source: matchit::InsertError,
    },

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Body(#[from] BodyError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid header: {0}")]
    Header(String),

    #[error("script error: {0}")]
    Script(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure while draining or decoding a request body.
///
/// Kept separate from [`Error`] so the memoized outcome can be handed out
/// more than once.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BodyError {
    #[error("read request body: {0}")]
    Read(String),

    #[error("decode request body: {0}")]
    Decode(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Error> for JsErrorBox {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidArgument(_) | Error::MissingArgument(_) => {
                JsErrorBox::type_error(err.to_string())
            }
            _ => JsErrorBox::generic(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_names_the_address() {
        let err = Error::Bind {
            address: "localhost:80".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };

        assert!(err.to_string().starts_with("listen localhost:80: "));
    }

    #[test]
    fn body_errors_are_transparent() {
        let err: Error = BodyError::Decode("expected value".to_string()).into();

        assert_eq!(err.to_string(), "decode request body: expected value");
    }
}
