//! What a freshly started process should become.

use mercado_server::ServerConfig;

use crate::mode::{Mode, Role};

/// Outcome of [`plan`].
#[derive(Debug)]
pub enum Launch {
    /// CLUSTER primary: spawn and babysit workers, never bind.
    Supervise,
    /// Bind and serve with this configuration.
    Serve(ServerConfig),
}

/// Decide from mode and role. Only a CLUSTER primary supervises; FORK
/// processes and CLUSTER workers serve, the latter on a shared port.
pub fn plan(mode: Mode, role: Role, base: ServerConfig) -> Launch {
    match (mode, role) {
        (Mode::Cluster, Role::Primary) => Launch::Supervise,
        (Mode::Cluster, Role::Worker) => Launch::Serve(ServerConfig {
            reuse_port: true,
            mode: mode.to_string(),
            role: role.as_str().to_string(),
            ..base
        }),
        // A stray MERCADO_ROLE does not turn a FORK process into a worker.
        (Mode::Fork, _) => Launch::Serve(ServerConfig {
            reuse_port: false,
            mode: mode.to_string(),
            role: "singleton".to_string(),
            ..base
        }),
    }
}
