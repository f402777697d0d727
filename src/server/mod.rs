use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    entity::ConnectionId,
    error::RelayError,
    hub::{Hub, HubOptions},
    registry::Registry,
    server::connection::ConnectionReader,
    shutdown::Shutdown,
};

pub mod connection;
pub mod http;

/// Sockets the process serves. A `None` entry point is not started.
#[derive(Debug, Default)]
pub struct Listeners {
    /// Websocket broadcast channel.
    pub broadcast: Option<TcpListener>,
    /// HTTP negotiation API.
    pub negotiation: Option<TcpListener>,
}

pub struct Server {
    hub_options: HubOptions,
    /// Only upgrades requested on this path are accepted.
    ws_path: String,
    registry: Registry,

    /// Broadcasts a shutdown signal to all active connections.
    ///
    /// The initial `shutdown` trigger is provided by the `run` caller. When a
    /// connection task is spawned, it is passed a broadcast receiver handle.
    /// When a graceful shutdown is initiated, the sender is dropped and each
    /// active connection reaches a safe terminal state and completes its task.
    notify_shutdown: broadcast::Sender<()>,
    /// Used as part of the graceful shutdown process to wait for client
    /// connections to complete processing.
    ///
    /// Every connection handler, and the HTTP server task, holds a clone of
    /// `shutdown_complete_tx`. Once all of them are dropped,
    /// `shutdown_complete_rx.recv()` completes with `None` and it is safe to
    /// exit the process.
    shutdown_complete_rx: mpsc::Receiver<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    limit_connections: Arc<Semaphore>,
}

impl Server {
    pub fn new(config: &Config) -> Server {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        Server {
            hub_options: config.hub_options(),
            ws_path: config.ws_path().to_string(),
            registry: Registry::new(config.session_options()),
            notify_shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
            limit_connections: Arc::new(Semaphore::new(config.max_connections())),
        }
    }

    /// Serve until one of the entry points gives up.
    pub async fn run(&mut self, listeners: Listeners) -> crate::Result<()> {
        let http = listeners
            .negotiation
            .map(|listener| self.serve_negotiation(listener));

        match (listeners.broadcast, http) {
            (Some(listener), Some(http)) => {
                let (hub, _hub_task) = Hub::spawn(self.hub_options);
                tokio::select! {
                    res = self.serve_broadcast(listener, hub) => res,
                    res = http => res?,
                }
            }
            (Some(listener), None) => {
                let (hub, _hub_task) = Hub::spawn(self.hub_options);
                self.serve_broadcast(listener, hub).await
            }
            (None, Some(http)) => http.await?,
            (None, None) => Err(RelayError::InvalidConfig(
                "no entry point to serve".to_string(),
            )),
        }
    }

    fn serve_negotiation(&self, listener: TcpListener) -> JoinHandle<crate::Result<()>> {
        let app = http::router(self.registry.clone());
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let shutdown_complete = self.shutdown_complete_tx.clone();
        tokio::spawn(async move {
            info!(addr = ?listener.local_addr().ok(), "serving negotiation api");
            let res = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.recv().await })
                .await;
            if let Err(err) = &res {
                error!(cause = %err, "negotiation api stopped");
            }
            drop(shutdown_complete);
            Ok(res?)
        })
    }

    async fn serve_broadcast(&mut self, listener: TcpListener, hub: Hub) -> crate::Result<()> {
        info!(addr = ?listener.local_addr().ok(), path = %self.ws_path, "accepting inbound connections");

        loop {
            // The permit is moved into the handler task and released when the
            // handler is dropped. We never close the semaphore.
            let permit = match Arc::clone(&self.limit_connections).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };
            // `accept` recovers from transient errors, so an error here is
            // non-recoverable.
            let (socket, peer) = accept(&listener).await?;

            let hub = hub.clone();
            let ws_path = self.ws_path.clone();
            let shutdown = Shutdown::new(self.notify_shutdown.subscribe());
            let shutdown_complete = self.shutdown_complete_tx.clone();
            tokio::spawn(async move {
                // Upgrade off the accept loop so a slow handshake holds up
                // only its own peer.
                let upgrade = accept_hdr_async(socket, |req: &Request, resp: Response| {
                    check_path(&ws_path, req, resp)
                });
                let stream = match upgrade.await {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(%peer, cause = %err, "websocket handshake failed");
                        return;
                    }
                };
                let (writer, reader) = connection::split(stream, peer);
                let id = ConnectionId::new();
                let evicted = CancellationToken::new();
                match hub.register(id, Box::new(writer), evicted.clone()).await {
                    Ok(_) => debug!(%peer, connection = %id, "connection registered"),
                    Err(err) => {
                        warn!(%peer, cause = %err, "hub refused connection");
                        return;
                    }
                }
                let mut handler = Handler {
                    id,
                    reader,
                    hub,
                    shutdown,
                    evicted,
                    _shutdown_complete: shutdown_complete,
                    _permit: permit,
                };
                if let Err(err) = handler.run().await {
                    error!(%peer, cause = ?err, "connection error");
                }
                if let Err(err) = handler.hub.unregister(id).await {
                    debug!(connection = %id, cause = %err, "unregister after hub stopped");
                }
            });
        }
    }
}

fn check_path(path: &str, req: &Request, resp: Response) -> Result<Response, ErrorResponse> {
    if req.uri().path() == path {
        return Ok(resp);
    }
    let mut rejection = ErrorResponse::new(Some(format!("no websocket at {}", req.uri().path())));
    *rejection.status_mut() = StatusCode::NOT_FOUND;
    Err(rejection)
}

/// Accept an inbound connection.
///
/// Errors are handled by backing off and retrying. After the first failure,
/// the task waits for 1 second, and each subsequent failure doubles the wait
/// time. If accepting fails on the 6th try after waiting for 64 seconds, the
/// error is returned.
async fn accept(listener: &TcpListener) -> crate::Result<(TcpStream, SocketAddr)> {
    let mut backoff = 1;

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => return Ok((socket, peer)),
            Err(err) => {
                if backoff > 64 {
                    return Err(err.into());
                }
                warn!(cause = %err, backoff, "accept failed, retrying");
            }
        }

        time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}

/// Run the configured entry points until `shutdown` completes, then stop
/// accepting, cancel every live session and wait for connections to finish.
pub async fn run(config: Config, listeners: Listeners, shutdown: impl Future) {
    let mut server = Server::new(&config);

    tokio::select! {
        res = server.run(listeners) => {
            // Errors from individual connections do not bubble up here; this
            // is the listener or the HTTP server giving up.
            if let Err(err) = res {
                error!(cause = %err, "server stopped");
            }
        }
        _ = shutdown => {
            info!("shutting down");
        }
    }

    let Server {
        registry,
        mut shutdown_complete_rx,
        shutdown_complete_tx,
        notify_shutdown,
        ..
    } = server;

    registry.shutdown();
    // Subscribers see the sender dropped as the shutdown signal.
    drop(notify_shutdown);
    // Drop the final `Sender` so the `Receiver` below can complete.
    drop(shutdown_complete_tx);

    let _ = shutdown_complete_rx.recv().await;
}

/// Receive loop of one websocket connection.
struct Handler {
    id: ConnectionId,
    reader: ConnectionReader,
    hub: Hub,

    /// Listen for shutdown notifications. The handler reads messages until
    /// the peer disconnects **or** a shutdown notification is received.
    shutdown: Shutdown,
    /// Cancelled by the hub when it drops this connection.
    evicted: CancellationToken,

    /// Not used directly. Dropped along with the handler.
    _shutdown_complete: mpsc::Sender<()>,
    /// Returned to the connection limit when the handler is dropped.
    _permit: OwnedSemaphorePermit,
}

impl Handler {
    async fn run(&mut self) -> crate::Result<()> {
        while !self.shutdown.is_shutdown() {
            let frame = tokio::select! {
                res = self.reader.read_frame() => res,
                _ = self.shutdown.recv() => return Ok(()),
                _ = self.evicted.cancelled() => {
                    debug!(connection = %self.id, "evicted by hub");
                    return Ok(());
                }
            };

            let msg = match frame {
                Ok(Some(msg)) => msg,
                // Peer closed the socket.
                Ok(None) => return Ok(()),
                Err(RelayError::MalformedMessage(reason)) => {
                    warn!(peer = %self.reader.peer(), %reason, "dropping malformed message");
                    continue;
                }
                Err(err) => return Err(err),
            };

            if self.evicted.is_cancelled() {
                return Ok(());
            }
            debug!(connection = %self.id, kind = msg.kind(), "publish");
            self.hub.publish(msg).await?;
        }
        Ok(())
    }
}
