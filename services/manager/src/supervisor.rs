//! Device supervisor: lifecycle of the session + listener pair per device.
//!
//! `update_one` stops before starting and waits for the listener task to
//! finish so the local port is free again when the replacement binds.

use crate::config::DeviceConfig;
use crate::proxy;
use crate::queue::CommandQueue;
use crate::status::{StatusKey, StatusMap};
use crate::upstream::{SessionMap, UpstreamSession};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct DeviceSupervisor {
    sessions: SessionMap<UpstreamSession>,
    listeners: Mutex<HashMap<i64, JoinHandle<()>>>,
    queue: Arc<CommandQueue>,
    status: StatusMap,
}

impl DeviceSupervisor {
    pub fn new(queue: Arc<CommandQueue>, status: StatusMap) -> Arc<Self> {
        Arc::new(DeviceSupervisor {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            listeners: Mutex::new(HashMap::new()),
            queue,
            status,
        })
    }

    /// Shared session registry; the queue processor drains against it.
    pub fn sessions(&self) -> SessionMap<UpstreamSession> {
        Arc::clone(&self.sessions)
    }

    pub async fn start_all(&self, devices: Vec<DeviceConfig>) {
        for device in devices.into_iter().filter(|d| d.enabled) {
            self.start_one(device).await;
        }
    }

    /// Start the upstream session and the local listener for one device.
    ///
    /// A listener bind failure is recorded in the status map; the upstream
    /// session keeps running so queued commands still drain.
    pub async fn start_one(&self, device: DeviceConfig) {
        let id = device.id;
        let session = UpstreamSession::new(device.clone(), self.status.clone());
        session.start().await;
        self.sessions.write().await.insert(id, Arc::clone(&session));

        let bind_addr = format!("127.0.0.1:{}", device.proxy_port);
        match TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(device_id = id, addr = %bind_addr, "proxy listener started");
                let handle = tokio::spawn(proxy::serve_device(
                    listener,
                    Arc::new(device),
                    session,
                    Arc::clone(&self.queue),
                ));
                self.listeners.lock().await.insert(id, handle);
            }
            Err(e) => {
                warn!(device_id = id, addr = %bind_addr, error = %e, "proxy listener bind failed");
                self.status
                    .set(
                        StatusKey::Device(id),
                        format!("Failed to start listener on {}: {}", bind_addr, e),
                    )
                    .await;
            }
        }
    }

    /// Stop the listener and session for one device, waiting for the
    /// listener task so the port frees before any restart.
    pub async fn stop_one(&self, id: i64) {
        if let Some(handle) = self.listeners.lock().await.remove(&id) {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(session) = self.sessions.write().await.remove(&id) {
            session.stop().await;
        }
        self.status.set(StatusKey::Device(id), "Stopped").await;
        info!(device_id = id, "device stopped");
    }

    /// Apply a config change: stop, then start again when still enabled.
    pub async fn update_one(&self, device: DeviceConfig) {
        self.stop_one(device.id).await;
        if device.enabled {
            self.start_one(device).await;
        }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<i64> = self.sessions.read().await.keys().copied().collect();
        for id in ids {
            self.stop_one(id).await;
        }
    }
}
