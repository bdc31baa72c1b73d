//! Transport layer.
//!
//! Only HTTP is served today; the trait keeps process wiring independent of it.

pub mod http;

pub use http::HttpTransport;

use crate::error::DbResult;
use std::future::Future;

/// Trait for server transport implementations.
pub trait Transport: Send + Sync {
    /// Start the transport and begin handling requests.
    ///
    /// This method should block until the transport is shut down.
    fn run(&self) -> impl Future<Output = DbResult<()>> + Send;

    /// Get the name of this transport for logging.
    fn name(&self) -> &'static str;
}
