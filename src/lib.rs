pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod middleware;
pub mod ratelimit;
