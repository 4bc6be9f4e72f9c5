use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Per-process listener configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: IpAddr,
    /// `0` picks a free port (tests).
    pub port: u16,
    /// Outbound frames buffered per connection before new ones are dropped.
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    /// Connections silent (no pong) for longer than this are dropped.
    pub client_timeout: Duration,
    /// Bind with SO_REUSEPORT so sibling workers can share the port.
    pub reuse_port: bool,
    /// Topology labels reported by `/info`.
    pub mode: String,
    pub role: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
            reuse_port: false,
            mode: "fork".into(),
            role: "singleton".into(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_3000() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.addr().to_string(), "0.0.0.0:3000");
    }

    #[test]
    fn default_heartbeat_shorter_than_timeout() {
        let cfg = ServerConfig::default();
        assert!(cfg.heartbeat_interval < cfg.client_timeout);
    }

    #[test]
    fn default_does_not_share_port() {
        let cfg = ServerConfig::default();
        assert!(!cfg.reuse_port);
        assert_eq!(cfg.role, "singleton");
    }
}
