//! Persistent upstream session: one per enabled device.
//!
//! A supervisor task owns the connection lifecycle:
//!
//! ```text
//! Stopped -> Connecting -> Connected -> Reconnecting -> Connecting -> ...
//! ```
//!
//! `Connecting` dials and logs in under a 5 s timeout and backs off 5 s on
//! failure.  `Connected` probes the device every 10 s with a cheap read
//! command.  The probe and all client RPCs go through one serializing lock
//! (the mutex around the transport) so two requests never interleave their
//! replies on the shared socket.

use crate::config::DeviceConfig;
use crate::rewrite;
use crate::status::{StatusKey, StatusMap};
use crate::transport::{ApiTransport, RpcResult, TransportError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One result row from the device.
pub type Row = ros_proto::Attrs;

/// Shared registry of live sessions, keyed by device id.
pub type SessionMap<L> = Arc<RwLock<HashMap<i64, Arc<L>>>>;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
pub const PROBE_INTERVAL: Duration = Duration::from_secs(10);

const PROBE_COMMAND: &str = "/system/resource/print";

// ---------------------------------------------------------------------------
// Command outcome
// ---------------------------------------------------------------------------

/// How a command failed.
///
/// The split drives everything downstream: traps are surfaced to the caller
/// and never retried; transient failures are queued for replay.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The device understood the command and refused it.
    #[error("Trap: {message}")]
    Trap { message: String },
    /// Socket, timeout, DNS, or framing trouble; worth retrying later.
    #[error("{kind}: {detail}")]
    Transient { kind: &'static str, detail: String },
}

impl CommandError {
    pub fn transient(kind: &'static str, detail: impl Into<String>) -> Self {
        CommandError::Transient {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_trap(&self) -> bool {
        matches!(self, CommandError::Trap { .. })
    }
}

impl From<TransportError> for CommandError {
    fn from(e: TransportError) -> Self {
        CommandError::Transient {
            kind: e.kind(),
            detail: e.detail(),
        }
    }
}

// ---------------------------------------------------------------------------
// DeviceLink seam
// ---------------------------------------------------------------------------

/// The surface the session handler and queue processor dispatch through.
///
/// [`UpstreamSession`] is the production implementation; tests substitute
/// stubs to count invocations and script outcomes.
pub trait DeviceLink: Send + Sync + 'static {
    fn is_connected(&self) -> bool;
    /// Record live client activity at the current instant.
    fn touch_live_activity(&self);
    /// Seconds since the last live client sentence (large when never).
    fn live_idle_secs(&self) -> i64;
    fn run_command(
        &self,
        words: Vec<String>,
    ) -> impl std::future::Future<Output = Result<Vec<Row>, CommandError>> + Send;
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Connecting,
    Connected,
    Reconnecting,
}

// ---------------------------------------------------------------------------
// UpstreamSession
// ---------------------------------------------------------------------------

/// The persistent connection to one device.
pub struct UpstreamSession {
    device: DeviceConfig,
    status: StatusMap,
    /// Serializing lock: holds the live transport, or None while down.
    transport: Mutex<Option<ApiTransport>>,
    connected_tx: watch::Sender<bool>,
    state_tx: watch::Sender<SessionState>,
    /// Unix seconds of the last live client sentence; 0 = never.
    last_live_activity: AtomicI64,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl UpstreamSession {
    pub fn new(device: DeviceConfig, status: StatusMap) -> Arc<Self> {
        let (connected_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(SessionState::Stopped);
        Arc::new(UpstreamSession {
            device,
            status,
            transport: Mutex::new(None),
            connected_tx,
            state_tx,
            last_live_activity: AtomicI64::new(0),
            supervisor: Mutex::new(None),
        })
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Spawn the supervisor task.  Idempotent while running.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.supervisor.lock().await;
        if guard.is_some() {
            return;
        }
        let session = Arc::clone(self);
        *guard = Some(tokio::spawn(async move { session.connect_loop().await }));
    }

    /// Cancel the supervisor task and drop the transport.
    ///
    /// An in-flight RPC finishes on its own and is discarded.
    pub async fn stop(&self) {
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        let _ = self.connected_tx.send(false);
        let _ = self.state_tx.send(SessionState::Stopped);
        *self.transport.lock().await = None;
    }

    /// Block until the session reports connected (or it is stopped).
    pub async fn wait_connected(&self) -> bool {
        let mut rx = self.connected_tx.subscribe();
        rx.wait_for(|connected| *connected).await.is_ok()
    }

    async fn connect_loop(self: Arc<Self>) {
        let key = StatusKey::Device(self.device.id);
        loop {
            let _ = self.state_tx.send(SessionState::Connecting);
            self.status
                .set(
                    key,
                    format!(
                        "Connecting to {}:{}...",
                        self.device.host, self.device.port
                    ),
                )
                .await;

            match self.dial().await {
                Ok(transport) => {
                    *self.transport.lock().await = Some(transport);
                    let _ = self.connected_tx.send(true);
                    let _ = self.state_tx.send(SessionState::Connected);
                    self.status
                        .set(key, format!("Connected to {}", self.device.host))
                        .await;
                    info!(
                        device_id = self.device.id,
                        host = %self.device.host,
                        "upstream session established"
                    );

                    self.probe_until_failure().await;

                    let _ = self.state_tx.send(SessionState::Reconnecting);
                    let _ = self.connected_tx.send(false);
                    *self.transport.lock().await = None;
                    self.status
                        .set(
                            key,
                            format!(
                                "Connection to {} lost, retrying in {}s",
                                self.device.host,
                                RECONNECT_BACKOFF.as_secs()
                            ),
                        )
                        .await;
                    warn!(
                        device_id = self.device.id,
                        host = %self.device.host,
                        "upstream connection lost"
                    );
                }
                Err(e) => {
                    let _ = self.connected_tx.send(false);
                    self.status
                        .set(key, format!("Connection error: {}", e))
                        .await;
                    warn!(
                        device_id = self.device.id,
                        host = %self.device.host,
                        error = %e,
                        "upstream connect failed"
                    );
                }
            }

            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    /// Dial and log in under the 5 s timeout.
    async fn dial(&self) -> Result<ApiTransport, TransportError> {
        let attempt = async {
            let mut transport =
                ApiTransport::connect(&self.device.host, self.device.port).await?;
            transport
                .login(&self.device.user, &self.device.password)
                .await?;
            Ok(transport)
        };
        match tokio::time::timeout(DIAL_TIMEOUT, attempt).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Probe every 10 s under the serializing lock; returns on any failure.
    async fn probe_until_failure(&self) {
        loop {
            tokio::time::sleep(PROBE_INTERVAL).await;
            let mut guard = self.transport.lock().await;
            let Some(transport) = guard.as_mut() else {
                return;
            };
            match transport.run(&[PROBE_COMMAND.to_owned()]).await {
                Ok(RpcResult::Rows(_)) => {}
                Ok(RpcResult::Trap { message }) => {
                    warn!(
                        device_id = self.device.id,
                        message = %message,
                        "liveness probe refused by device"
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        device_id = self.device.id,
                        error = %e,
                        "liveness probe failed"
                    );
                    return;
                }
            }
        }
    }

    /// Execute one command on the shared upstream connection.
    ///
    /// Awaits `connected`, applies the request rewrites, then runs the RPC
    /// under the serializing lock.
    pub async fn run_command(&self, mut words: Vec<String>) -> Result<Vec<Row>, CommandError> {
        if words.is_empty() {
            return Err(CommandError::transient(
                "EmptyCommand",
                "empty command received",
            ));
        }

        let mut connected_rx = self.connected_tx.subscribe();
        connected_rx
            .wait_for(|connected| *connected)
            .await
            .map_err(|_| CommandError::transient("ConnectionError", "session stopped"))?;

        rewrite::rewrite_proxy_access(&mut words);
        rewrite::rewrite_local_address(&mut words, &self.device.host);
        if let Some((idx, hostname)) = rewrite::dst_address_hostname(&words) {
            let ip = resolve_ipv4(&hostname).await.map_err(|e| {
                CommandError::transient(
                    "DnsError",
                    format!("could not resolve '{}': {}", hostname, e),
                )
            })?;
            words[idx] = format!("=dst-address={}", ip);
        }

        let request = rewrite::parse_request(&words);
        let wire = rewrite::wire_words(&request);
        debug!(
            device_id = self.device.id,
            command = %request.command_path,
            "dispatching command upstream"
        );

        let mut guard = self.transport.lock().await;
        let Some(transport) = guard.as_mut() else {
            return Err(CommandError::transient(
                "ConnectionError",
                "device not connected",
            ));
        };
        match transport.run(&wire).await {
            Ok(RpcResult::Rows(rows)) => Ok(rewrite::apply_presence_filters(
                rows,
                &request.presence_filters,
            )),
            Ok(RpcResult::Trap { message }) => Err(CommandError::Trap { message }),
            Err(e) => Err(CommandError::from(e)),
        }
    }
}

impl DeviceLink for UpstreamSession {
    fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    fn touch_live_activity(&self) {
        self.last_live_activity
            .store(unix_now(), Ordering::Relaxed);
    }

    fn live_idle_secs(&self) -> i64 {
        unix_now().saturating_sub(self.last_live_activity.load(Ordering::Relaxed))
    }

    fn run_command(
        &self,
        words: Vec<String>,
    ) -> impl std::future::Future<Output = Result<Vec<Row>, CommandError>> + Send {
        UpstreamSession::run_command(self, words)
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Resolve a hostname to its first IPv4 address.
async fn resolve_ipv4(host: &str) -> std::io::Result<std::net::Ipv4Addr> {
    let addrs = tokio::net::lookup_host((host, 0u16)).await?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "no IPv4 address for host",
    ))
}
