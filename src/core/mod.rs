//! Core abstractions for portico
//!
//! This module provides the request and response records, the error types
//! and the traits user code implements.

pub mod body;
pub mod boom;
pub mod error;
pub mod request;
pub mod response;
pub mod toolkit;
pub mod traits;

// Re-export commonly used types
pub use body::{Body, PayloadStream};
pub use boom::{Boom, ErrorKind, TimeoutKind};
pub use error::{ErrorContext, ServerError, ServerResult};
pub use request::{AuthInfo, Cancellation, Request, RequestInfo, Stage};
pub use response::{Response, Source};
pub use toolkit::{Bind, Toolkit};
pub use traits::*;
