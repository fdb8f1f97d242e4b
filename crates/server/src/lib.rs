pub mod auth;
pub mod http;
pub mod hub;
pub mod tls;

pub use http::{AppState, ServerOptions, build_router};
pub use hub::Hub;
