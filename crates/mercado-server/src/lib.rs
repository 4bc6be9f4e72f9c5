pub mod broadcaster;
pub mod config;
pub mod error;
pub mod registry;
pub mod routes;
pub mod server;
pub mod socket;

pub use broadcaster::{Broadcaster, OpenedConnection};
pub use config::ServerConfig;
pub use error::ServerError;
pub use registry::{ConnectionRegistry, ConnectionState};
pub use server::{bind_listener, build_router, start, AppState, ServerHandle};
