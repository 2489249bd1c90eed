use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use evcs_engine::Engine;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::connection::{LinkSettings, serve_connection};

/// Accepts station connections and hands each one to its own task.
pub struct StationServer {
    listener: TcpListener,
    engine: Arc<Engine>,
    settings: LinkSettings,
}

impl StationServer {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        engine: Arc<Engine>,
        settings: LinkSettings,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(StationServer {
            listener,
            engine,
            settings,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires, then wait for open connections to close.
    pub async fn run(self, shutdown: CancellationToken) -> io::Result<()> {
        info!(addr = %self.listener.local_addr()?, "Station server listening");
        let connections = TaskTracker::new();

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        error!(%error, "Failed to accept station connection");
                        continue;
                    }
                },
            };
            if let Err(error) = stream.set_nodelay(true) {
                debug!(%peer, %error, "Could not disable Nagle");
            }
            debug!(%peer, "Station connecting");

            let engine = self.engine.clone();
            let settings = self.settings.clone();
            let token = shutdown.child_token();
            connections.spawn(async move {
                if let Err(error) = serve_connection(engine, stream, peer, settings, token).await {
                    warn!(%peer, %error, "Station connection failed");
                }
            });
        }

        connections.close();
        connections.wait().await;
        info!("Station server stopped");
        Ok(())
    }
}
