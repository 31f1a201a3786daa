//! TCP server for relay connections.
//!
//! Accepts connections, bounds how many are served at once, and hands each
//! one to a connection handler sharing the server's `Broker`.

use crate::broker::Broker;
use crate::config::Config;
use crate::connection::{self, ConnectionSettings};
use crate::credentials::CredentialStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Pending connections queued by the kernel
const LISTEN_BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    broker: Arc<Broker>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, store: Arc<dyn CredentialStore>) -> Self {
        let broker = Broker::new(store, config.call_timeout);
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            broker,
            connection_limit,
        }
    }

    /// Bind the configured address and serve until an error occurs
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let addr: SocketAddr = self.config.listen.parse()?;
        let listener = bind(addr)?;
        info!(address = %addr, "Server listening");
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        let settings = ConnectionSettings::from(&self.config);

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "New connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let broker = Arc::clone(&self.broker);

                    tokio::spawn(async move {
                        if let Err(e) =
                            connection::handle_connection(stream, peer, broker, settings).await
                        {
                            debug!(%peer, error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Get a reference to the broker for testing
    #[cfg(test)]
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}

/// Create a TCP listener with SO_REUSEADDR so restarts can rebind at once
fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}
