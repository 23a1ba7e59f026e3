// gitmirror-server: smart-HTTP and JSON front end over the mirror engine.

pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod git_http;

pub use app::{build_router, AppState};
pub use config::{LogFormat, ServerConfig};
pub use error::{ErrorCode, ServerError};
