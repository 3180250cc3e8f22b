//! The server event loop.
//!
//! One task owns the [`Server`] and applies every event to it in order:
//! accepted and dialed sockets, decoded frames, closed connections and the
//! announce/keepalive timers. Socket I/O happens in the per-connection tasks
//! from [`crate::connection`].

use crate::config::DaemonConfig;
use crate::connection::{self, ChannelLink};
use bmoe_core::{ConnectionId, Endpoint, Frame, Peer, Server};
use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time;

/// Something the event loop has to react to.
#[derive(Debug)]
pub enum DaemonEvent {
    Dialed { stream: TcpStream, endpoint: Endpoint },
    DialFailed { endpoint: Endpoint },
    Frame { connection: ConnectionId, frame: Frame },
    Closed { connection: ConnectionId },
}

/// A bound, not yet running, object exchange server.
pub struct Daemon {
    listener: TcpListener,
    state: EventLoop,
}

/// Everything the event loop owns besides the listener.
struct EventLoop {
    config: DaemonConfig,
    server: Server,
    events_tx: mpsc::UnboundedSender<DaemonEvent>,
    events_rx: mpsc::UnboundedReceiver<DaemonEvent>,
    next_connection: u64,
    stopping: bool,
}

impl Daemon {
    /// Bind the listening socket. Nothing is accepted until [`Daemon::run`].
    pub async fn bind(config: DaemonConfig) -> anyhow::Result<Self> {
        config.validate()?;
        config.endpoints()?;
        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(|e| anyhow::anyhow!("failed to listen on {}: {}", config.listen, e))?;
        let local_addr = listener.local_addr()?;
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| local_addr.to_string());
        let server = Server::new(name, config.router_config());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            listener,
            state: EventLoop {
                config,
                server,
                events_tx,
                events_rx,
                next_connection: 0,
                stopping: false,
            },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Routing-id this server uses in routes and pongs.
    pub fn routing_id(&self) -> &str {
        self.state.server.routing_id()
    }

    /// Serve until `shutdown` completes, then close every connection and
    /// wait (up to the configured grace period) for them to go away.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let endpoints = self.state.config.endpoints()?;
        tracing::info!(
            name = self.state.server.name(),
            routing_id = self.state.server.routing_id(),
            "Listening on {}",
            self.local_addr()?
        );

        let Daemon {
            listener,
            mut state,
        } = self;
        for endpoint in endpoints {
            state.spawn_dial(endpoint, None);
        }

        let announce_every = state.config.announce_interval();
        let keepalive_every = state.config.keepalive_interval();
        let start = time::Instant::now();
        let mut announce = time::interval_at(start + announce_every, announce_every);
        let mut keepalive = time::interval_at(start + keepalive_every, keepalive_every);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => state.on_accepted(stream, addr),
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                },
                Some(event) = state.events_rx.recv() => state.handle(event),
                _ = announce.tick() => {
                    if let Some(delivered) = state.server.announce_neighbors(Instant::now()) {
                        tracing::debug!(servers = delivered.len(), "Announced neighbors");
                    }
                }
                _ = keepalive.tick() => {
                    state.server.keepalive(Instant::now());
                }
                _ = &mut shutdown => break,
            }
        }

        drop(listener);
        state.stop().await;
        Ok(())
    }
}

impl EventLoop {
    async fn stop(mut self) {
        tracing::info!("Stopping");
        self.stopping = true;
        self.server.close_all();
        let count = self.server.peer_count();
        if count > 0 {
            tracing::info!("Waiting for {} connections to close", count);
        }

        let grace = self.config.shutdown_grace();
        let deadline = time::sleep(grace);
        tokio::pin!(deadline);
        while self.server.peer_count() > 0 {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle(event),
                _ = &mut deadline => {
                    tracing::warn!(
                        "Giving up on {} connections after {:?}",
                        self.server.peer_count(),
                        grace
                    );
                    break;
                }
            }
        }
        tracing::info!("Stopped");
    }

    fn handle(&mut self, event: DaemonEvent) {
        let now = Instant::now();
        match event {
            DaemonEvent::Dialed { stream, endpoint } => {
                if self.stopping {
                    return;
                }
                let peer = self.attach(stream, endpoint.to_string());
                self.server.connect(peer, endpoint, now);
            }
            DaemonEvent::DialFailed { endpoint } => {
                if !self.stopping {
                    self.spawn_dial(endpoint, Some(self.config.reconnect_delay()));
                }
            }
            DaemonEvent::Frame { connection, frame } => {
                if let Err(e) = self.server.receive(connection, frame, now) {
                    tracing::warn!(%connection, "Dropping object: {}", e);
                }
            }
            DaemonEvent::Closed { connection } => {
                let endpoint = self.server.disconnect(connection, now);
                if let Some(endpoint) = endpoint {
                    if !self.stopping {
                        let delay = self.config.reconnect_delay();
                        tracing::info!("Reconnecting to {} in {:?}", endpoint, delay);
                        self.spawn_dial(endpoint, Some(delay));
                    }
                }
            }
        }
    }

    fn on_accepted(&mut self, stream: TcpStream, addr: SocketAddr) {
        tracing::debug!("New connection from {}", addr);
        let peer = self.attach(stream, addr.to_string());
        self.server.accept(peer);
    }

    /// Start the socket tasks for `stream` and wrap it in a [`Peer`].
    fn attach(&mut self, stream: TcpStream, name: String) -> Peer {
        self.next_connection += 1;
        let connection = ConnectionId::new(self.next_connection);
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%connection, "Failed to set TCP_NODELAY: {}", e);
        }

        let (reader, writer) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(connection::write_loop(connection, writer, out_rx, done_tx));
        tokio::spawn(connection::read_loop(
            connection,
            reader,
            done_rx,
            self.events_tx.clone(),
        ));

        Peer::new(connection, name, Box::new(ChannelLink::new(out_tx)))
    }

    fn spawn_dial(&self, endpoint: Endpoint, delay: Option<Duration>) {
        tokio::spawn(dial(endpoint, delay, self.events_tx.clone()));
    }
}

async fn dial(
    endpoint: Endpoint,
    delay: Option<Duration>,
    events: mpsc::UnboundedSender<DaemonEvent>,
) {
    if let Some(delay) = delay {
        time::sleep(delay).await;
    }
    let event = match TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await {
        Ok(stream) => {
            tracing::info!("Connected to {}", endpoint);
            DaemonEvent::Dialed { stream, endpoint }
        }
        Err(e) => {
            tracing::warn!("Failed to connect to {}: {}", endpoint, e);
            DaemonEvent::DialFailed { endpoint }
        }
    };
    let _ = events.send(event);
}
