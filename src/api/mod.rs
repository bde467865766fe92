pub mod changes;
pub mod client;
pub mod gateway;
pub mod resources;

pub use client::ApiConfig;
pub use gateway::{FetchGateway, GatewayError, HttpFetchGateway, VersionSource};

/// Default user agent sent with every request
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
