//! Client error types.

use std::sync::Arc;

use kestrel_core::{ErrCode, Response};
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by connections, calls, and the cluster session.
///
/// `Clone` so that a connection's sticky error can be handed to every caller
/// that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("not a directory")]
    NotDir,

    #[error("is a directory")]
    IsDir,

    #[error("no such file or directory")]
    NotFound,

    #[error("old rev given")]
    OldRev,

    #[error("too late")]
    TooLate,

    #[error("redirect to {addr}")]
    Redirect { addr: String },

    #[error("response: {}", remote_message(*code, detail))]
    Remote { code: i32, detail: String },

    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("connection closed")]
    Closed,

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("bad tag")]
    BadTag,

    #[error("no known address")]
    NoAddrs,

    #[error("all tags in use")]
    TagsExhausted,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error means the connection itself is unusable, as
    /// opposed to the remote rejecting one request.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Closed
                | Error::UnexpectedEof
                | Error::Decode(_)
                | Error::FrameTooLarge { .. }
        )
    }

    /// Translate the error fields of a response, if any are set.
    pub fn from_response(resp: &Response) -> Option<Error> {
        let code = resp.err_code?;
        let detail = resp.err_detail.clone().unwrap_or_default();
        let err = match ErrCode::try_from(code) {
            Ok(ErrCode::Notdir) => Error::NotDir,
            Ok(ErrCode::Isdir) => Error::IsDir,
            Ok(ErrCode::Noent) => Error::NotFound,
            Ok(ErrCode::RevMismatch) => Error::OldRev,
            Ok(ErrCode::TooLate) => Error::TooLate,
            Ok(ErrCode::Redirect) => Error::Redirect { addr: detail },
            _ => Error::Remote { code, detail },
        };
        Some(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Decode(e.to_string())
    }
}

fn remote_message(code: i32, detail: &str) -> String {
    let name = match ErrCode::try_from(code) {
        Ok(c) => format!("{c:?}"),
        Err(_) => format!("code {code}"),
    };
    if detail.is_empty() {
        name
    } else {
        format!("{name}: {detail}")
    }
}
