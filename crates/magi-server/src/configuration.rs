//! Server settings sourced from `MAGI_SERVER__*` environment variables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: IpAddr,
    pub port: u16,
}

impl Settings {
    pub fn new() -> anyhow::Result<Self> {
        let host = match std::env::var("MAGI_SERVER__HOST") {
            Ok(raw) => raw.parse()?,
            Err(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        };
        let port = match std::env::var("MAGI_SERVER__PORT") {
            Ok(raw) => raw.parse()?,
            Err(_) => 3030,
        };
        Ok(Self { host, port })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
