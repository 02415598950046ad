//! C6 — orchestrates the request lifecycle: exists → access → enabled →
//! accept, synthesizing a rejection via the response framer on the first
//! `false`, and owns the sideband message buffer injected into accepted rpc
//! responses.

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{instrument, warn};

use crate::driver::{Driver, DriverResponse, ResponseHook};
use crate::error::{DispatchFailure, DriverError};
use crate::framer::{self, ResponseData};
use crate::observer::Broadcaster;
use crate::pktline;
use crate::request::{RequestData, Status};

/// Owns a driver and the sideband buffer for one gateway. A single instance
/// is shared across concurrent requests; per-request state lives entirely on
/// the `RequestData` passed into `serve`.
pub struct GatewayController<D> {
    driver: D,
    sideband: Mutex<Vec<Bytes>>,
    pub on_error: Broadcaster<DriverError>,
}

impl<D: Driver> GatewayController<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            sideband: Mutex::new(Vec::new()),
            on_error: Broadcaster::new(),
        }
    }

    /// Encodes `msg` as a sideband-2 pkt-line frame and appends it to the
    /// buffer. Ignored unless the request is later accepted for an rpc
    /// (non-advertisement) response.
    pub fn sideband_message(&self, msg: impl AsRef<[u8]>) {
        self.sideband.lock().push(pktline::encode_sideband2(msg.as_ref()));
    }

    fn record_probe_failure(&self, err: DriverError) -> bool {
        warn!(error = %err, "driver probe failed, treating as false");
        self.on_error.notify(&err);
        false
    }

    /// Runs the full `exists → access → enabled → accept` pipeline.
    ///
    /// A request with no classified service can never be accepted or
    /// rejected through the usual 400/401/403 rejections described in §4.6 —
    /// neither probe has anything to ask a driver about — so this is handled
    /// as an immediate 404 ahead of the pipeline, rather than by calling the
    /// public `accept`/`reject` (which stay true no-ops for unknown-service
    /// requests, reserved for direct misuse protection).
    ///
    /// Errs with [`DispatchFailure`] if the driver's `onResponse` callback
    /// itself fails — per spec.md §7 this is fatal to the request, and it's
    /// on the host (see `main.rs`) to turn that into a 500.
    #[instrument(skip(self, request), fields(path = %request.path))]
    pub async fn serve(&self, request: &mut RequestData) -> Result<ResponseData, DispatchFailure> {
        if request.service.is_none() {
            if request.status.is_pending() {
                request.status = Status::Rejected;
            }
            return Ok(framer::rejection(404, None));
        }

        let hook = ResponseHook::new();

        let exists = match self.driver.exists(request, &hook).await {
            Ok(v) => v,
            Err(e) => self.record_probe_failure(e),
        };
        if !exists {
            return Ok(self.reject(request, 404, None));
        }

        let access = match self.driver.access(request, &hook).await {
            Ok(v) => v,
            Err(e) => self.record_probe_failure(e),
        };
        if !access {
            return Ok(self.reject(request, 401, None));
        }

        let enabled = match self.driver.enabled(request, &hook).await {
            Ok(v) => v,
            Err(e) => self.record_probe_failure(e),
        };
        if !enabled {
            return Ok(self.reject(request, 403, None));
        }

        self.accept(request, &hook).await
    }

    /// Invokes the driver and frames its output. No-op (beyond returning an
    /// empty response) if `request.status` isn't `Pending`, or if the
    /// request's service is unclassified.
    pub async fn accept(
        &self,
        request: &mut RequestData,
        hook: &ResponseHook,
    ) -> Result<ResponseData, DispatchFailure> {
        if !request.status.is_pending() {
            return Ok(empty_response());
        }
        request.status = Status::Accepted;

        if request.service.is_none() {
            return Ok(empty_response());
        }

        let driver_response = match self.driver.serve(request, hook).await {
            Ok(response) => response,
            Err(e) => {
                self.on_error.notify(&e);
                DriverResponse {
                    body: Bytes::from(e.to_string()),
                    status_code: 500,
                    status_message: Some(e.to_string()),
                }
            }
        };

        if driver_response.status_code >= 400 {
            request.status = Status::Failure;
        }

        let sideband = self.sideband.lock().clone();
        let mut response = framer::frame(request, driver_response, &sideband)
            .unwrap_or_else(|e| framer::rejection(500, Some(e.to_string())));
        hook.fire(&mut response.headers)
            .map_err(|inner| DispatchFailure { code: 500, inner })?;
        Ok(response)
    }

    /// Builds a rejection response and transitions `status` to `Rejected`.
    /// No-op (beyond returning an empty response) if `request.status` isn't
    /// `Pending`, or if the request's service is unclassified.
    pub fn reject(&self, request: &mut RequestData, code: u16, message: Option<String>) -> ResponseData {
        if !request.status.is_pending() {
            return empty_response();
        }
        if request.service.is_none() {
            return empty_response();
        }
        request.status = Status::Rejected;

        // Values below 400 aren't a rejection at all: raise to 400. Values
        // >= 600 aren't a valid HTTP status: collapse to 500, per spec.md §9.
        let code = if code < 400 {
            400
        } else if code >= 600 {
            500
        } else {
            code
        };
        framer::rejection(code, message)
    }
}

fn empty_response() -> ResponseData {
    ResponseData {
        body: Bytes::new(),
        headers: crate::headers::Headers::new(),
        status_code: 200,
        status_message: "OK".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Headers;
    use crate::request::{Dispatch, Service};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ScriptedDriver {
        exists: bool,
        access: bool,
        enabled: bool,
        body: &'static [u8],
        access_calls: Arc<AtomicUsize>,
        fail_hook: bool,
    }

    impl ScriptedDriver {
        fn accepting(body: &'static [u8]) -> Self {
            Self {
                exists: true,
                access: true,
                enabled: true,
                body,
                access_calls: Arc::new(AtomicUsize::new(0)),
                fail_hook: false,
            }
        }
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        async fn exists(&self, _r: &RequestData, _h: &ResponseHook) -> Result<bool, DriverError> {
            Ok(self.exists)
        }

        async fn access(&self, _r: &RequestData, _h: &ResponseHook) -> Result<bool, DriverError> {
            self.access_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.access)
        }

        async fn enabled(&self, _r: &RequestData, _h: &ResponseHook) -> Result<bool, DriverError> {
            Ok(self.enabled)
        }

        async fn serve(&self, _r: &RequestData, h: &ResponseHook) -> Result<DriverResponse, DriverError> {
            if self.fail_hook {
                h.subscribe(|_| Err(anyhow::anyhow!("listener exploded")));
            }
            Ok(DriverResponse::ok(Bytes::from_static(self.body)))
        }
    }

    fn request(service: Option<Service>) -> RequestData {
        let dispatch = Dispatch {
            is_advertisement: true,
            service,
            path: "repo".to_string(),
        };
        RequestData::new(dispatch, Headers::new(), Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn unknown_service_short_circuits_to_404_without_probing() {
        let access_calls = Arc::new(AtomicUsize::new(0));
        let controller = GatewayController::new(ScriptedDriver {
            access_calls: access_calls.clone(),
            ..ScriptedDriver::accepting(b"001e# service=git-upload-pack\n0000")
        });
        let mut request = request(None);
        let response = controller.serve(&mut request).await.unwrap();
        assert_eq!(response.status_code, 404);
        assert_eq!(access_calls.load(Ordering::SeqCst), 0);
        assert_eq!(request.status, Status::Rejected);
    }

    #[tokio::test]
    async fn pipeline_short_circuits_on_exists_false() {
        let access_calls = Arc::new(AtomicUsize::new(0));
        let controller = GatewayController::new(ScriptedDriver {
            exists: false,
            access_calls: access_calls.clone(),
            ..ScriptedDriver::accepting(b"")
        });
        let mut request = request(Some(Service::UploadPack));
        let response = controller.serve(&mut request).await.unwrap();
        assert_eq!(response.status_code, 404);
        assert_eq!(access_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn accepted_advertisement_returns_200() {
        let controller = GatewayController::new(ScriptedDriver::accepting(
            b"001e# service=git-upload-pack\n0000",
        ));
        let mut request = request(Some(Service::UploadPack));
        let response = controller.serve(&mut request).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(request.status, Status::Accepted);
    }

    #[tokio::test]
    async fn sideband_messages_are_spliced_into_accepted_rpc_body() {
        let controller = GatewayController::new(ScriptedDriver::accepting(b"000dhello\n0000"));
        controller.sideband_message("hi");
        let mut request = request(Some(Service::UploadPack));
        request.is_advertisement = false;
        let response = controller.serve(&mut request).await.unwrap();
        assert!(response.body.starts_with(b"000dhello\n"));
        assert!(response.body.ends_with(b"0000"));
        assert!(response.body.len() > b"000dhello\n0000".len());
    }

    #[tokio::test]
    async fn failing_response_hook_surfaces_as_dispatch_failure() {
        let controller = GatewayController::new(ScriptedDriver {
            fail_hook: true,
            ..ScriptedDriver::accepting(b"001e# service=git-upload-pack\n0000")
        });
        let mut request = request(Some(Service::UploadPack));
        let err = controller.serve(&mut request).await.unwrap_err();
        assert_eq!(err.code, 500);
    }

    #[tokio::test]
    async fn reject_is_a_no_op_once_not_pending() {
        let controller = GatewayController::new(ScriptedDriver::accepting(b""));
        let mut request = request(Some(Service::UploadPack));
        request.status = Status::Accepted;
        let response = controller.reject(&mut request, 403, None);
        assert_eq!(response.status_code, 200);
        assert_eq!(request.status, Status::Accepted);
    }
}
