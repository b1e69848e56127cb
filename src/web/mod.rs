//! HTTP surface: the rate limit middleware and the server hosting it.

mod middleware;
mod server;

pub use middleware::{
    rejection_response, RateLimitLayer, RateLimitRejection, RateLimitService, LIMIT_HEADER,
    REMAINING_HEADER, RESET_HEADER,
};
pub use server::HttpServer;
