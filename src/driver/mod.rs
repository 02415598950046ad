//! C4 — the pluggable backend interface. Two built-in variants
//! ([`local::LocalDriver`], [`http::HttpDriver`]) plus an override
//! [`proxy::ProxyDriver`] wrapper.

pub mod http;
pub mod local;
pub mod proxy;

use async_trait::async_trait;

use crate::error::DriverError;
use crate::headers::Headers;
use crate::observer::OnceHook;
use crate::request::RequestData;

/// The one-shot hook a driver may use to mutate the outgoing `Headers` once
/// the controller has constructed the final response (used by
/// [`http::HttpDriver`] to copy upstream headers through).
pub type ResponseHook = OnceHook<Headers>;

/// What a driver's `serve` produces: a body, a status code, and an optional
/// status message. Status codes `>= 400` are always treated as a rejection
/// by the response framer regardless of which driver produced them.
#[derive(Debug, Clone)]
pub struct DriverResponse {
    pub body: bytes::Bytes,
    pub status_code: u16,
    pub status_message: Option<String>,
}

impl DriverResponse {
    pub fn ok(body: bytes::Bytes) -> Self {
        Self {
            body,
            status_code: 200,
            status_message: None,
        }
    }
}

/// A pluggable Git repository backend: local filesystem + `git` subprocess,
/// or an upstream HTTP Smart-HTTP server.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Does the repository exist?
    async fn exists(&self, request: &RequestData, hook: &ResponseHook) -> Result<bool, DriverError>;

    /// Is the caller authorized? Default implementation always allows — the
    /// core has no built-in authentication.
    async fn access(&self, _request: &RequestData, _hook: &ResponseHook) -> Result<bool, DriverError> {
        Ok(true)
    }

    /// Is the requested service enabled for this repository?
    async fn enabled(&self, request: &RequestData, hook: &ResponseHook) -> Result<bool, DriverError>;

    /// Produces the response body for an accepted request.
    async fn serve(
        &self,
        request: &RequestData,
        hook: &ResponseHook,
    ) -> Result<DriverResponse, DriverError>;
}
