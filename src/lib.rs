//! Protocol-layer core for a Git Smart-HTTP gateway.
//!
//! Maps `(method, url, content-type)` and a pkt-line request body to a
//! classified [`request::RequestData`], drives it through a pluggable
//! [`driver::Driver`] under [`controller::GatewayController`]'s
//! exists/access/enabled/accept pipeline, and frames the result via
//! [`framer`]. The HTTP server binding itself — accepting sockets, routing a
//! URL to [`controller::GatewayController::serve`] — is left to the host.

pub mod controller;
pub mod driver;
pub mod error;
pub mod framer;
pub mod headers;
pub mod observer;
pub mod pktline;
pub mod request;
