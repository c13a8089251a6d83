//! HTTP transport: router and server.

mod routes;
mod server;

pub use routes::{AppState, routes};
pub use server::{ServerConfig, serve};
