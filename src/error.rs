//! Typed error kinds raised by the core. These are the errors the protocol
//! layer itself can produce; the host binary wraps them in `anyhow` at its
//! boundary (see `main.rs`).

use thiserror::Error;

/// Failures surfaced by the pkt-line codec (C1).
#[derive(Debug, Error)]
pub enum PktLineError {
    #[error("invalid pkt-line length at offset {offset} (buffer is {buf_len} bytes)")]
    InvalidPacket { offset: usize, buf_len: usize },

    #[error("incomplete pkt-line, expected {expected_end} bytes but buffer has {buf_len}")]
    IncompletePacket {
        expected_end: usize,
        buf_len: usize,
    },
}

/// Raised at `Headers` construction when a name isn't a legal RFC 7230 token.
#[derive(Debug, Error)]
#[error("invalid header name: {0:?}")]
pub struct InvalidHeaderName(pub String);

/// Failures from the local filesystem driver's subprocess invocations.
#[derive(Debug, Error)]
#[error("git exited with status {exit_code:?}: {stderr}")]
pub struct DriverExecution {
    pub exit_code: Option<i32>,
    pub stderr: String,
}

/// Raised when a `ProxyDriver` override closure itself fails.
#[derive(Debug, Error)]
#[error("proxy override {method_name} failed: {inner}")]
pub struct ProxyMethodFailure {
    pub method_name: &'static str,
    #[source]
    pub inner: anyhow::Error,
}

/// Raised when an `onError`/`onResponse` observer callback panics or errors;
/// fatal to the request, unlike probe failures which are recovered locally.
#[derive(Debug, Error)]
#[error("dispatch to observer failed (code {code}): {inner}")]
pub struct DispatchFailure {
    pub code: u16,
    #[source]
    pub inner: anyhow::Error,
}

/// Umbrella error for anything that can come out of a driver probe or serve
/// call — the controller only needs to know "it failed", but keeps the
/// underlying cause for logging.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Execution(#[from] DriverExecution),
    #[error(transparent)]
    Proxy(#[from] ProxyMethodFailure),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
