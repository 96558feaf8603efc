//! External interfaces adapter.
//!
//! The operations the administration UI consumes, lifted onto the config
//! store, the supervisor, and the durable queue.  The UI itself (HTTP
//! handlers, templates, sessions) lives outside this crate.

use crate::config::{ConfigError, ConfigStore, DATABASE_URL_KEY, DeviceConfig, NewDevice};
use crate::queue::{CommandQueue, QueueError, QueuedCommand};
use crate::status::{StatusKey, StatusMap};
use crate::supervisor::DeviceSupervisor;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Error type for admin operations.
#[derive(Debug)]
pub enum AdminError {
    Config(ConfigError),
    Queue(QueueError),
    /// `service_config` has no `database_url` entry.
    DsnNotConfigured,
}

impl std::fmt::Display for AdminError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdminError::Config(e) => write!(f, "config store error: {}", e),
            AdminError::Queue(e) => write!(f, "queue error: {}", e),
            AdminError::DsnNotConfigured => {
                write!(f, "no database_url configured in service_config")
            }
        }
    }
}

impl std::error::Error for AdminError {}

impl From<ConfigError> for AdminError {
    fn from(e: ConfigError) -> Self {
        AdminError::Config(e)
    }
}

impl From<QueueError> for AdminError {
    fn from(e: QueueError) -> Self {
        AdminError::Queue(e)
    }
}

// ---------------------------------------------------------------------------
// AdminApi
// ---------------------------------------------------------------------------

pub struct AdminApi {
    store: Arc<Mutex<ConfigStore>>,
    supervisor: Arc<DeviceSupervisor>,
    queue: Arc<CommandQueue>,
    status: StatusMap,
}

impl AdminApi {
    pub fn new(
        store: Arc<Mutex<ConfigStore>>,
        supervisor: Arc<DeviceSupervisor>,
        queue: Arc<CommandQueue>,
        status: StatusMap,
    ) -> Self {
        AdminApi {
            store,
            supervisor,
            queue,
            status,
        }
    }

    /// Persist a new device (proxy port allocated by the store) and start
    /// it when enabled.
    pub async fn add_device(&self, new: NewDevice) -> Result<DeviceConfig, AdminError> {
        let device = self.store.lock().await.insert_device(&new)?;
        if device.enabled {
            self.supervisor.start_one(device.clone()).await;
        }
        Ok(device)
    }

    /// Persist changed device settings and restart its session + listener.
    pub async fn update_device(&self, device: DeviceConfig) -> Result<(), AdminError> {
        self.store.lock().await.update_device(&device)?;
        self.supervisor.update_one(device).await;
        Ok(())
    }

    /// Stop and delete a device; returns false when the id was unknown.
    pub async fn remove_device(&self, id: i64) -> Result<bool, AdminError> {
        self.supervisor.stop_one(id).await;
        let removed = self.store.lock().await.delete_device(id)?;
        self.status.remove(StatusKey::Device(id)).await;
        Ok(removed)
    }

    /// Re-read the DSN from `service_config` and rebuild the queue pool.
    pub async fn reconnect_db(&self) -> Result<(), AdminError> {
        let dsn = self
            .store
            .lock()
            .await
            .service_value(DATABASE_URL_KEY)?
            .ok_or(AdminError::DsnNotConfigured)?;
        match self.queue.reconnect(&dsn).await {
            Ok(()) => {
                self.status.set(StatusKey::Database, "Connected").await;
                Ok(())
            }
            Err(e) => {
                self.status
                    .set(StatusKey::Database, format!("Connection error: {}", e))
                    .await;
                Err(e.into())
            }
        }
    }

    pub async fn clear_queue(&self) -> Result<u64, AdminError> {
        Ok(self.queue.clear_all().await?)
    }

    pub async fn list_queue(
        &self,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<QueuedCommand>, i64), AdminError> {
        Ok(self.queue.list(page, per_page).await?)
    }

    pub async fn get_status(&self) -> BTreeMap<String, String> {
        self.status.snapshot().await
    }

    /// UI credential check against the `users` table.
    pub async fn verify_user(&self, username: &str, password: &str) -> Result<bool, AdminError> {
        Ok(self.store.lock().await.verify_user(username, password)?)
    }
}
