//! Local SQLite configuration store.
//!
//! # Schema
//! - `mikrotik_devices`: one row per managed router (credentials, upstream
//!   address, local proxy port, enabled/netflow flags).
//! - `service_config`: key/value settings; the durable-store DSN lives under
//!   the `database_url` key.
//! - `users`: admin-UI credentials, SHA-256 hex password hashes.
//!
//! # SQLite settings
//! Applied at open: WAL, synchronous=FULL, foreign_keys=ON.  PRAGMA
//! integrity_check runs at open; returns an error if it fails.

use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

/// Default location of the configuration database.
pub const DEFAULT_CONFIG_DB: &str = "/var/lib/mikrotik-manager/config.db";

/// `service_config` key holding the durable-store DSN.
pub const DATABASE_URL_KEY: &str = "database_url";

/// Proxy ports are allocated upward from here.
pub const PROXY_PORT_BASE: u16 = 9000;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One managed device, as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub proxy_port: u16,
    pub netflow_enabled: bool,
    pub enabled: bool,
}

/// Fields for a device being created; `id` and `proxy_port` are assigned by
/// the store.
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub netflow_enabled: bool,
    pub enabled: bool,
}

/// Error type for config store operations.
#[derive(Debug)]
pub enum ConfigError {
    Sqlite(rusqlite::Error),
    IntegrityCheckFailed(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Sqlite(e) => write!(f, "SQLite error: {}", e),
            ConfigError::IntegrityCheckFailed(s) => write!(f, "Integrity check failed: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<rusqlite::Error> for ConfigError {
    fn from(e: rusqlite::Error) -> Self {
        ConfigError::Sqlite(e)
    }
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

/// The local configuration database.
pub struct ConfigStore {
    conn: Connection,
}

impl ConfigStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA foreign_keys=ON;",
        )?;
        let check: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if check != "ok" {
            return Err(ConfigError::IntegrityCheckFailed(check));
        }
        conn.execute_batch(include_str!("config_schema.sql"))?;
        Ok(ConfigStore { conn })
    }

    // -----------------------------------------------------------------------
    // Devices
    // -----------------------------------------------------------------------

    pub fn list_devices(&self) -> Result<Vec<DeviceConfig>, ConfigError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, host, port, user, password, proxy_port, netflow_enabled, enabled
             FROM mikrotik_devices ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], map_device)?;
        let mut devices = Vec::new();
        for r in rows {
            devices.push(r?);
        }
        Ok(devices)
    }

    pub fn list_enabled_devices(&self) -> Result<Vec<DeviceConfig>, ConfigError> {
        Ok(self
            .list_devices()?
            .into_iter()
            .filter(|d| d.enabled)
            .collect())
    }

    pub fn get_device(&self, id: i64) -> Result<Option<DeviceConfig>, ConfigError> {
        let device = self
            .conn
            .query_row(
                "SELECT id, name, host, port, user, password, proxy_port, netflow_enabled, enabled
                 FROM mikrotik_devices WHERE id = ?1",
                params![id],
                map_device,
            )
            .optional()?;
        Ok(device)
    }

    /// Insert a new device, allocating the smallest free proxy port >= 9000.
    pub fn insert_device(&mut self, new: &NewDevice) -> Result<DeviceConfig, ConfigError> {
        let proxy_port = self.next_free_proxy_port()?;
        self.conn.execute(
            "INSERT INTO mikrotik_devices
                 (name, host, port, user, password, proxy_port, netflow_enabled, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.name,
                new.host,
                new.port,
                new.user,
                new.password,
                proxy_port,
                new.netflow_enabled,
                new.enabled,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(DeviceConfig {
            id,
            name: new.name.clone(),
            host: new.host.clone(),
            port: new.port,
            user: new.user.clone(),
            password: new.password.clone(),
            proxy_port,
            netflow_enabled: new.netflow_enabled,
            enabled: new.enabled,
        })
    }

    /// Update an existing device in place; `proxy_port` is kept as stored.
    pub fn update_device(&mut self, dev: &DeviceConfig) -> Result<(), ConfigError> {
        self.conn.execute(
            "UPDATE mikrotik_devices
             SET name = ?2, host = ?3, port = ?4, user = ?5, password = ?6,
                 netflow_enabled = ?7, enabled = ?8
             WHERE id = ?1",
            params![
                dev.id,
                dev.name,
                dev.host,
                dev.port,
                dev.user,
                dev.password,
                dev.netflow_enabled,
                dev.enabled,
            ],
        )?;
        Ok(())
    }

    /// Delete a device row; returns false when the id did not exist.
    pub fn delete_device(&mut self, id: i64) -> Result<bool, ConfigError> {
        let n = self
            .conn
            .execute("DELETE FROM mikrotik_devices WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Smallest proxy port >= 9000 not used by any device (enabled or not).
    pub fn next_free_proxy_port(&self) -> Result<u16, ConfigError> {
        let mut stmt = self
            .conn
            .prepare("SELECT proxy_port FROM mikrotik_devices")?;
        let used: Result<std::collections::HashSet<u16>, rusqlite::Error> =
            stmt.query_map([], |row| row.get::<_, u16>(0))?.collect();
        let used = used?;
        let mut port = PROXY_PORT_BASE;
        while used.contains(&port) {
            port += 1;
        }
        Ok(port)
    }

    // -----------------------------------------------------------------------
    // Service config
    // -----------------------------------------------------------------------

    pub fn service_value(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM service_config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_service_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.conn.execute(
            "INSERT INTO service_config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn service_config(&self) -> Result<HashMap<String, String>, ConfigError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM service_config WHERE value IS NOT NULL")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut map = HashMap::new();
        for r in rows {
            let (k, v) = r?;
            map.insert(k, v);
        }
        Ok(map)
    }

    // -----------------------------------------------------------------------
    // Users (admin-UI credentials)
    // -----------------------------------------------------------------------

    /// Create or update a UI user with the given plaintext password.
    pub fn upsert_user(&mut self, username: &str, password: &str) -> Result<(), ConfigError> {
        self.conn.execute(
            "INSERT INTO users (username, password_hash) VALUES (?1, ?2)
             ON CONFLICT(username) DO UPDATE SET password_hash = excluded.password_hash",
            params![username, hash_password(password)],
        )?;
        Ok(())
    }

    /// Check UI credentials; unknown usernames verify as false.
    pub fn verify_user(&self, username: &str, password: &str) -> Result<bool, ConfigError> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT password_hash FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored.is_some_and(|h| h == hash_password(password)))
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn map_device(row: &rusqlite::Row<'_>) -> Result<DeviceConfig, rusqlite::Error> {
    Ok(DeviceConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        host: row.get(2)?,
        port: row.get(3)?,
        user: row.get(4)?,
        password: row.get(5)?,
        proxy_port: row.get(6)?,
        netflow_enabled: row.get(7)?,
        enabled: row.get(8)?,
    })
}

fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn make_store() -> (ConfigStore, NamedTempFile) {
        let file = NamedTempFile::new().expect("temp file");
        let store = ConfigStore::open(file.path()).expect("open store");
        (store, file)
    }

    fn sample_device(name: &str) -> NewDevice {
        NewDevice {
            name: name.to_owned(),
            host: "10.0.0.1".to_owned(),
            port: 8728,
            user: "admin".to_owned(),
            password: "pw".to_owned(),
            netflow_enabled: false,
            enabled: true,
        }
    }

    #[test]
    fn insert_allocates_ports_from_9000_upward() {
        let (mut store, _file) = make_store();
        let a = store.insert_device(&sample_device("r1")).unwrap();
        let b = store.insert_device(&sample_device("r2")).unwrap();
        assert_eq!(a.proxy_port, 9000);
        assert_eq!(b.proxy_port, 9001);
    }

    #[test]
    fn freed_port_is_reused_before_growing() {
        let (mut store, _file) = make_store();
        let a = store.insert_device(&sample_device("r1")).unwrap();
        let _b = store.insert_device(&sample_device("r2")).unwrap();
        assert!(store.delete_device(a.id).unwrap());
        let c = store.insert_device(&sample_device("r3")).unwrap();
        assert_eq!(c.proxy_port, 9000);
    }

    #[test]
    fn disabled_devices_still_hold_their_port() {
        let (mut store, _file) = make_store();
        let mut a = store.insert_device(&sample_device("r1")).unwrap();
        a.enabled = false;
        store.update_device(&a).unwrap();
        let b = store.insert_device(&sample_device("r2")).unwrap();
        assert_eq!(b.proxy_port, 9001);
        assert_eq!(store.list_enabled_devices().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let (mut store, _file) = make_store();
        store.insert_device(&sample_device("r1")).unwrap();
        assert!(store.insert_device(&sample_device("r1")).is_err());
    }

    #[test]
    fn service_values_round_trip() {
        let (mut store, _file) = make_store();
        assert_eq!(store.service_value("database_url").unwrap(), None);
        store
            .set_service_value("database_url", "postgres://localhost/queue")
            .unwrap();
        store.set_service_value("database_url", "postgres://db/queue").unwrap();
        assert_eq!(
            store.service_value("database_url").unwrap().as_deref(),
            Some("postgres://db/queue")
        );
        assert_eq!(store.service_config().unwrap().len(), 1);
    }

    #[test]
    fn user_verification_uses_the_stored_hash() {
        let (mut store, _file) = make_store();
        store.upsert_user("admin", "secret").unwrap();
        assert!(store.verify_user("admin", "secret").unwrap());
        assert!(!store.verify_user("admin", "wrong").unwrap());
        assert!(!store.verify_user("nobody", "secret").unwrap());
    }
}
