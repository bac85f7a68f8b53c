//! HTTP surface: the admission middleware and the demo server around it.

mod middleware;
mod server;

pub use middleware::{rate_limit_middleware, request_info, Principal, FORWARDED_FOR};
pub use server::HttpServer;
