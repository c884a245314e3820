//! TCP host: accepts connections and serves a registry over each.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tandem_rpc::{Connection, ConnectionConfig, Server, ServiceRegistry};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Host statistics.
#[derive(Debug, Default)]
pub struct HostStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Accept loop for the demo binary.
pub struct Host {
    max_connections: usize,
    connection: ConnectionConfig,
    registry: Arc<ServiceRegistry>,
    stats: Arc<HostStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Host {
    pub fn new(
        max_connections: usize,
        connection: ConnectionConfig,
        registry: Arc<ServiceRegistry>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            max_connections,
            connection,
            registry,
            stats: Arc::new(HostStats::default()),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Binds `addr` and serves until [`shutdown`](Self::shutdown).
    pub async fn run(&self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let local = listener.local_addr()?;
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Host listening on {}", local);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            if let Err(e) = tcp_stream.set_nodelay(true) {
                                tracing::debug!("Cannot disable Nagle for {}: {}", addr, e);
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let conn = Connection::json(tcp_stream, self.connection.clone());
                            conn.set_dispatcher(Arc::new(Server::new(self.registry.clone())));
                            tracing::info!("[{}] Client connected: {}", conn.name(), addr);

                            let stats = self.stats.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();
                            tokio::spawn(async move {
                                let listen = conn.clone().listen();
                                tokio::pin!(listen);
                                let result = tokio::select! {
                                    result = &mut listen => result,
                                    _ = conn_shutdown.recv() => {
                                        conn.close().await;
                                        listen.await
                                    }
                                };

                                if let Err(e) = result {
                                    tracing::debug!("[{}] Connection error: {}", conn.name(), e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }
                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("[{}] Client disconnected: {}", conn.name(), addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Host shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stops accepting and closes every live connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }
}
