//! Tower-service plumbing for the host binding's middleware stack (see
//! `logger.rs`); every inner service the gateway's router wraps reports
//! `Error = Infallible`, so `unwrap_infallible` is how `LoggingMiddleware`
//! pulls the response back out without a match arm that can never run.

use std::convert::Infallible;

pub mod logger;

pub(crate) trait UnwrapInfallible<T> {
    fn unwrap_infallible(self) -> T;
}

impl<T> UnwrapInfallible<T> for Result<T, Infallible> {
    fn unwrap_infallible(self) -> T {
        self.unwrap()
    }
}

impl<T> UnwrapInfallible<T> for Result<T, &Infallible> {
    fn unwrap_infallible(self) -> T {
        self.unwrap()
    }
}
