//! Forwarder
//!
//! Owns the listening socket of exactly one rule. `start` binds the port and
//! launches the accept loop and the stats publisher; `stop` cancels both and
//! waits for the accept loop to drop the listener, so the port is free again
//! once it returns. An instance is single-use: after `stop`, create a new one.
//!
//! Example: forward 0.0.0.0:8080 -> 10.0.0.5:80

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::ForwardError;
use super::events::ForwardEventEmitter;
use super::pipe::relay;
use super::rule::ForwardRule;
use super::stats::{run_publisher, ForwardStats, TrafficCounters};
use crate::config::ForwardSettings;

/// Delay before accepting again after a transient accept error
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

enum ForwarderState {
    Idle,
    Running {
        bound_addr: SocketAddr,
        accept_task: JoinHandle<()>,
        publisher_task: JoinHandle<()>,
    },
    Stopped,
}

/// Runtime forwarder for one rule
pub struct Forwarder {
    rule: Arc<ForwardRule>,
    settings: ForwardSettings,
    counters: Arc<TrafficCounters>,
    shutdown: CancellationToken,
    events: ForwardEventEmitter,
    state: Mutex<ForwarderState>,
}

impl Forwarder {
    pub fn new(rule: Arc<ForwardRule>, settings: ForwardSettings, events: ForwardEventEmitter) -> Self {
        Self {
            rule,
            settings,
            counters: Arc::new(TrafficCounters::new()),
            shutdown: CancellationToken::new(),
            events,
            state: Mutex::new(ForwarderState::Idle),
        }
    }

    pub fn rule(&self) -> &Arc<ForwardRule> {
        &self.rule
    }

    pub fn local_port(&self) -> u16 {
        self.rule.local_port()
    }

    /// Bind the rule's local port and start accepting.
    ///
    /// Returns as soon as the socket is bound.
    pub async fn start(&self) -> Result<SocketAddr, ForwardError> {
        let mut state = self.state.lock().await;
        if !matches!(*state, ForwarderState::Idle) {
            return Err(ForwardError::AlreadyStarted);
        }

        let spec = self.rule.spec();
        let listener = TcpListener::bind((self.settings.bind_address.as_str(), spec.local_port))
            .await
            .map_err(|e| ForwardError::bind(spec.local_port, &e))?;
        let bound_addr = listener.local_addr()?;

        info!(
            "Started forward '{}': {} -> {}",
            spec.name,
            bound_addr,
            spec.target()
        );

        let ctx = Arc::new(ConnectionContext {
            rule: self.rule.clone(),
            remote_host: spec.remote_host.clone(),
            remote_port: spec.remote_port,
            buffer_size: self.settings.buffer_size(),
            counters: self.counters.clone(),
            events: self.events.clone(),
            shutdown: self.shutdown.clone(),
            sever_on_stop: self.settings.sever_on_stop,
        });

        let accept_task = tokio::spawn(accept_loop(
            listener,
            spec.name.clone(),
            ctx,
            self.shutdown.clone(),
        ));
        let publisher_task = tokio::spawn(run_publisher(
            self.rule.clone(),
            self.counters.clone(),
            self.settings.publish_interval(),
            self.shutdown.clone(),
            self.events.clone(),
        ));

        *state = ForwarderState::Running {
            bound_addr,
            accept_task,
            publisher_task,
        };
        Ok(bound_addr)
    }

    /// Stop accepting and release the port.
    ///
    /// Idempotent; returns true only for the call that actually stopped the
    /// forwarder. In-flight connections drain unless `sever_on_stop` is set.
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        let (bound_addr, accept_task, publisher_task) =
            match std::mem::replace(&mut *state, ForwarderState::Stopped) {
                ForwarderState::Running {
                    bound_addr,
                    accept_task,
                    publisher_task,
                } => (bound_addr, accept_task, publisher_task),
                other => {
                    *state = other;
                    return false;
                }
            };

        self.shutdown.cancel();
        if let Err(e) = accept_task.await {
            warn!("Accept task for '{}' failed: {}", self.rule.name(), e);
        }
        // Publisher performs its final flush before finishing
        if let Err(e) = publisher_task.await {
            warn!("Stats publisher for '{}' failed: {}", self.rule.name(), e);
        }

        info!("Stopped forward '{}' on {}", self.rule.name(), bound_addr);
        true
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, ForwarderState::Running { .. })
    }

    /// Address the listener is bound to, if running
    pub async fn bound_addr(&self) -> Option<SocketAddr> {
        match *self.state.lock().await {
            ForwarderState::Running { bound_addr, .. } => Some(bound_addr),
            _ => None,
        }
    }

    /// Published stats plus unpublished hot-path activity
    pub fn stats(&self) -> ForwardStats {
        self.counters.load(&self.rule)
    }

    /// Zero internal and published counters; safe whether or not running
    pub fn clear_stats(&self) {
        self.counters.clear(&self.rule);
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        // Never leave an accept loop running behind a discarded instance
        self.shutdown.cancel();
    }
}

/// Shared, read-only inputs of every connection of one forwarder
struct ConnectionContext {
    rule: Arc<ForwardRule>,
    remote_host: String,
    remote_port: u16,
    buffer_size: usize,
    counters: Arc<TrafficCounters>,
    events: ForwardEventEmitter,
    /// Forwarder shutdown; the publisher is gone once this fires
    shutdown: CancellationToken,
    sever_on_stop: bool,
}

impl ConnectionContext {
    fn target(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    fn connection_token(&self) -> CancellationToken {
        if self.sever_on_stop {
            self.shutdown.child_token()
        } else {
            CancellationToken::new()
        }
    }

    /// A connection outliving its forwarder publishes its own close
    fn publish_if_stopped(&self) {
        if self.shutdown.is_cancelled() && self.counters.publish(&self.rule) {
            self.events
                .emit_stats_updated(self.rule.id(), self.rule.stats());
        }
    }
}

/// Source of accepted connections for the accept loop
#[async_trait]
trait Acceptor: Send {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

async fn accept_loop<A: Acceptor + 'static>(
    mut listener: A,
    name: String,
    ctx: Arc<ConnectionContext>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted connection from {} for '{}'", peer_addr, name);
                    ctx.counters.connection_opened();
                    tokio::spawn(handle_connection(stream, peer_addr, ctx.clone()));
                }
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    // Transient (e.g. EMFILE, ECONNABORTED): keep the listener alive
                    warn!("Accept error on '{}': {}", name, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
            },
        }
    }
    debug!("Accept loop for '{}' exited", name);
}

async fn dial(ctx: &ConnectionContext) -> Result<TcpStream, ForwardError> {
    TcpStream::connect((ctx.remote_host.as_str(), ctx.remote_port))
        .await
        .map_err(|e| ForwardError::Dial {
            target: ctx.target(),
            reason: e.to_string(),
        })
}

/// Dial the remote once and relay until either side closes.
/// A failed dial drops the accepted socket; there is no retry.
async fn handle_connection(local: TcpStream, peer_addr: SocketAddr, ctx: Arc<ConnectionContext>) {
    match dial(&ctx).await {
        Ok(remote) => {
            // Disable Nagle's algorithm for low-latency forwarding
            for stream in [&local, &remote] {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
            }

            let (sent, received) = relay(
                local,
                remote,
                ctx.buffer_size,
                ctx.counters.clone(),
                ctx.connection_token(),
            )
            .await;
            debug!(
                "Connection from {} closed ({} bytes sent, {} bytes received)",
                peer_addr, sent, received
            );
        }
        Err(e) => {
            warn!("Dropping connection from {}: {}", peer_addr, e);
            drop(local);
        }
    }
    ctx.counters.connection_closed();
    ctx.publish_if_stopped();
}
