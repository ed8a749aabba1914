//! HTTP surface: the enforcement middleware and the admission check service.

pub mod enforce;
mod server;
mod service;

pub use enforce::{apply_headers, client_ip, enforce, rejection, IdentifierSource, RateLimitGuard};
pub use server::HttpServer;
pub use service::{router, CheckRequest, CheckResponse};
