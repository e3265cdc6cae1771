mod error;
mod server;

pub use error::{ProxyError, error_body};
pub use server::{AppState, CONVERSATION_ROUTE, ProxyServer, create_router};
