use std::io;

/// Runtime configuration for a [`TcpServer`](crate::TcpServer).
///
/// Mirrors the keys an embedding application typically reads from its
/// configuration file — the listen ports (`PortCount`, `Port1..PortN`)
/// and the connection pool capacity (`WorkerConnections`) — plus the
/// number of dedicated I/O loops. Parsing a configuration file is the
/// embedding application's business.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// One listener per entry. Port 0 binds an ephemeral port.
    pub ports: Vec<u16>,
    /// Connection pool capacity, per I/O loop.
    pub worker_connections: usize,
    /// Dedicated I/O loop threads. 0 serves connections on the
    /// acceptor's own loop.
    pub io_loops: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            ports: vec![8000],
            worker_connections: 512,
            io_loops: 0,
        }
    }
}

impl ServerConfig {
    pub(crate) fn validate(&self) -> io::Result<()> {
        if self.ports.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "at least one listen port is required",
            ));
        }

        if self.worker_connections == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker_connections must be at least 1",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::ServerConfig;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.ports, vec![8000]);
        assert_eq!(config.worker_connections, 512);
        assert_eq!(config.io_loops, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_ports() {
        let config = ServerConfig {
            ports: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_capacity() {
        let config = ServerConfig {
            worker_connections: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
