//! `ProxyDriver` — wraps an inner [`Driver`] and lets a caller override any
//! subset of its probe methods, falling through to the inner driver wherever
//! an override is absent or declines to answer. This replaces the
//! prototype-based "assign a replacement function, fall back to the original"
//! pattern with an explicit wrapper over `Option<Box<dyn Fn>>` overrides.

use async_trait::async_trait;

use crate::driver::{Driver, DriverResponse, ResponseHook};
use crate::error::{DriverError, ProxyMethodFailure};
use crate::request::RequestData;

type Override<T> = Option<Box<dyn Fn(&RequestData) -> Result<Option<T>, anyhow::Error> + Send + Sync>>;

/// Wraps `inner`, substituting the result of any `Some` override in place of
/// the corresponding probe. An override returning `Ok(None)` defers to
/// `inner`; an override returning `Err` fails the whole probe rather than
/// silently falling through.
#[derive(Default)]
pub struct ProxyDriver<D> {
    inner: D,
    exists: Override<bool>,
    access: Override<bool>,
    enabled: Override<bool>,
}

impl<D: Driver> ProxyDriver<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            exists: None,
            access: None,
            enabled: None,
        }
    }

    pub fn override_exists(
        mut self,
        f: impl Fn(&RequestData) -> Result<Option<bool>, anyhow::Error> + Send + Sync + 'static,
    ) -> Self {
        self.exists = Some(Box::new(f));
        self
    }

    pub fn override_access(
        mut self,
        f: impl Fn(&RequestData) -> Result<Option<bool>, anyhow::Error> + Send + Sync + 'static,
    ) -> Self {
        self.access = Some(Box::new(f));
        self
    }

    pub fn override_enabled(
        mut self,
        f: impl Fn(&RequestData) -> Result<Option<bool>, anyhow::Error> + Send + Sync + 'static,
    ) -> Self {
        self.enabled = Some(Box::new(f));
        self
    }

    fn run_override(
        r#override: &Override<bool>,
        method_name: &'static str,
        request: &RequestData,
    ) -> Result<Option<bool>, DriverError> {
        match r#override {
            Some(f) => f(request).map_err(|inner| ProxyMethodFailure { method_name, inner }.into()),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<D: Driver> Driver for ProxyDriver<D> {
    async fn exists(&self, request: &RequestData, hook: &ResponseHook) -> Result<bool, DriverError> {
        match Self::run_override(&self.exists, "exists", request)? {
            Some(value) => Ok(value),
            None => self.inner.exists(request, hook).await,
        }
    }

    async fn access(&self, request: &RequestData, hook: &ResponseHook) -> Result<bool, DriverError> {
        match Self::run_override(&self.access, "access", request)? {
            Some(value) => Ok(value),
            None => self.inner.access(request, hook).await,
        }
    }

    async fn enabled(&self, request: &RequestData, hook: &ResponseHook) -> Result<bool, DriverError> {
        match Self::run_override(&self.enabled, "enabled", request)? {
            Some(value) => Ok(value),
            None => self.inner.enabled(request, hook).await,
        }
    }

    async fn serve(
        &self,
        request: &RequestData,
        hook: &ResponseHook,
    ) -> Result<DriverResponse, DriverError> {
        self.inner.serve(request, hook).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Headers;
    use crate::observer::OnceHook;
    use crate::request::{Dispatch, Service};

    struct AlwaysDriver {
        exists: bool,
        enabled: bool,
    }

    #[async_trait]
    impl Driver for AlwaysDriver {
        async fn exists(&self, _request: &RequestData, _hook: &ResponseHook) -> Result<bool, DriverError> {
            Ok(self.exists)
        }

        async fn enabled(&self, _request: &RequestData, _hook: &ResponseHook) -> Result<bool, DriverError> {
            Ok(self.enabled)
        }

        async fn serve(
            &self,
            _request: &RequestData,
            _hook: &ResponseHook,
        ) -> Result<DriverResponse, DriverError> {
            Ok(DriverResponse::ok(bytes::Bytes::new()))
        }
    }

    fn request() -> RequestData {
        let dispatch = Dispatch {
            is_advertisement: true,
            service: Some(Service::UploadPack),
            path: "repo".to_string(),
        };
        RequestData::new(dispatch, Headers::new(), bytes::Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn override_replaces_inner_result() {
        let driver = ProxyDriver::new(AlwaysDriver {
            exists: false,
            enabled: true,
        })
        .override_exists(|_| Ok(Some(true)));

        let hook = OnceHook::new();
        assert!(driver.exists(&request(), &hook).await.unwrap());
    }

    #[tokio::test]
    async fn none_override_falls_through_to_inner() {
        let driver =
            ProxyDriver::new(AlwaysDriver { exists: true, enabled: false }).override_exists(|_| Ok(None));

        let hook = OnceHook::new();
        assert!(driver.exists(&request(), &hook).await.unwrap());
    }

    #[tokio::test]
    async fn override_error_is_wrapped_as_proxy_failure() {
        let driver = ProxyDriver::new(AlwaysDriver {
            exists: true,
            enabled: true,
        })
        .override_exists(|_| Err(anyhow::anyhow!("boom")));

        let hook = OnceHook::new();
        let err = driver.exists(&request(), &hook).await.unwrap_err();
        assert!(matches!(err, DriverError::Proxy(_)));
    }
}
