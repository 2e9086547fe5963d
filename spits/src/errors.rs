//! Error types shared across the runtime.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures on a stream endpoint or in the message protocol.
///
/// Peer close, read-deadline expiry and protocol violations are deliberately
/// distinct: callers react differently to each (see the engines and the task
/// manager server).
#[derive(Debug, Error)]
pub enum NetError {
    /// The peer closed the connection (a read returned zero bytes).
    #[error("connection closed by peer")]
    Closed,

    /// The read deadline elapsed before the requested bytes arrived.
    #[error("read deadline exceeded")]
    Timeout,

    /// The peer sent something the protocol does not allow at this point.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Any other socket-level failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures while loading or calling into the user job module.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to load job module {path}: {source}")]
    Load {
        path: PathBuf,
        source: libloading::Error,
    },

    #[error("job module is missing required symbol {0}")]
    MissingSymbol(&'static str),

    #[error("job module returned a null {0} handle")]
    NullHandle(&'static str),

    #[error("job module argument contains a NUL byte")]
    BadArgument(#[from] std::ffi::NulError),
}
