use crate::models::{CleanSession, Subscription};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// Upper bound a statement waits for a locked database.
pub const STATEMENT_TIMEOUT: Duration = Duration::from_secs(1);
const POOL_TIMEOUT: Duration = Duration::from_secs(5);

const SQL_CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS ClientDeviceSubscription (
    Client      VARCHAR(255) NOT NULL,
    Topic       VARCHAR(255) NOT NULL,
    Device      VARCHAR(255) NOT NULL,
    Inactive    BOOLEAN NOT NULL DEFAULT FALSE,
    PRIMARY KEY (Client, Topic)
);
CREATE INDEX IF NOT EXISTS client_index ON ClientDeviceSubscription (Client);
CREATE INDEX IF NOT EXISTS device_index ON ClientDeviceSubscription (Device);

CREATE TABLE IF NOT EXISTS CleanSession (
    Client       VARCHAR(255) NOT NULL,
    CleanSession BOOLEAN,
    PRIMARY KEY (Client)
);
"#;

const SQL_UPSERT_SUBSCRIPTION: &str = "INSERT INTO ClientDeviceSubscription (Client, Topic, Device, Inactive) \
     VALUES (?1, ?2, ?3, FALSE) \
     ON CONFLICT (Client, Topic) DO UPDATE SET Device = excluded.Device, Inactive = FALSE";

const SQL_SELECT_SUBSCRIPTION: &str =
    "SELECT Device, Inactive FROM ClientDeviceSubscription WHERE Client = ?1 AND Topic = ?2";

const SQL_DELETE_SUBSCRIPTION: &str =
    "DELETE FROM ClientDeviceSubscription WHERE Client = ?1 AND Topic = ?2";

const SQL_DELETE_CLIENT: &str = "DELETE FROM ClientDeviceSubscription WHERE Client = ?1";

const SQL_SET_CLIENT_INACTIVE: &str =
    "UPDATE ClientDeviceSubscription SET Inactive = ?2 WHERE Client = ?1";

const SQL_SELECT_CLIENT_DEVICES: &str =
    "SELECT DISTINCT Device FROM ClientDeviceSubscription WHERE Client = ?1 AND Inactive = ?2";

const SQL_DEVICE_HAS_ACTIVE: &str = "SELECT EXISTS (\
     SELECT 1 FROM ClientDeviceSubscription WHERE Device = ?1 AND Inactive = FALSE)";

const SQL_UPSERT_CLEAN_SESSION: &str = "INSERT INTO CleanSession (Client, CleanSession) VALUES (?1, ?2) \
     ON CONFLICT (Client) DO UPDATE SET CleanSession = excluded.CleanSession";

const SQL_SELECT_CLEAN_SESSION: &str = "SELECT CleanSession FROM CleanSession WHERE Client = ?1";

const SQL_SELECT_CLIENT_SUBSCRIPTIONS: &str = "SELECT Client, Topic, Device, Inactive \
     FROM ClientDeviceSubscription WHERE Client = ?1 ORDER BY Topic";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

/// Devices whose derived connectivity changed through one store operation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transitions {
    pub connected: Vec<String>,
    pub disconnected: Vec<String>,
}

impl Transitions {
    pub fn is_empty(&self) -> bool {
        self.connected.is_empty() && self.disconnected.is_empty()
    }
}

/// Persists per-client subscriptions and clean session flags.
///
/// Each mutating operation runs in one immediate transaction together with the
/// check whether the affected devices still have an active subscription, so two
/// clients racing on the same device observe each other's rows.
pub struct DatabaseService {
    pool: Pool<SqliteConnectionManager>,
}

fn init_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(STATEMENT_TIMEOUT)
}

impl DatabaseService {
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(db_path).with_init(init_connection);
        let pool = Pool::builder()
            .connection_timeout(POOL_TIMEOUT)
            .build(manager)?;
        Ok(Self { pool })
    }

    /// Single connection in-memory database; every pooled connection to
    /// `:memory:` would otherwise see its own empty database.
    pub fn in_memory() -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::memory().with_init(init_connection);
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(POOL_TIMEOUT)
            .build(manager)?;
        Ok(Self { pool })
    }

    pub fn initialize_db(&self) -> Result<(), StoreError> {
        info!("Initializing database schema...");
        let conn = self.pool.get()?;
        match conn.execute_batch(SQL_CREATE_TABLES) {
            Ok(()) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    pub fn set_clean_session(&self, client: &str, clean: bool) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(SQL_UPSERT_CLEAN_SESSION, params![client, clean])?;
        Ok(())
    }

    /// Clients without a stored flag count as clean.
    pub fn clean_session(&self, client: &str) -> Result<CleanSession, StoreError> {
        let conn = self.pool.get()?;
        Ok(CleanSession {
            client: client.to_string(),
            clean_session: is_clean_session(&conn, client)?,
        })
    }

    pub fn subscriptions(&self, client: &str) -> Result<Vec<Subscription>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(SQL_SELECT_CLIENT_SUBSCRIPTIONS)?;
        let rows = stmt.query_map(params![client], |row| {
            Ok(Subscription {
                client: row.get(0)?,
                topic: row.get(1)?,
                device: row.get(2)?,
                inactive: row.get(3)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// A device is connected while any client holds an active subscription to it.
    pub fn is_device_connected(&self, device: &str) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        Ok(device_has_active(&conn, device)?)
    }

    pub fn store_subscription(
        &self,
        client: &str,
        topic: &str,
        device: &str,
    ) -> Result<Transitions, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut transitions = Transitions::default();

        let previous: Option<(String, bool)> = tx
            .query_row(SQL_SELECT_SUBSCRIPTION, params![client, topic], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        if matches!(&previous, Some((d, false)) if d == device) {
            return Ok(transitions);
        }

        let was_connected = device_has_active(&tx, device)?;
        tx.execute(SQL_UPSERT_SUBSCRIPTION, params![client, topic, device])?;
        if !was_connected {
            transitions.connected.push(device.to_string());
        }
        if let Some((old_device, false)) = previous {
            if old_device != device && !device_has_active(&tx, &old_device)? {
                transitions.disconnected.push(old_device);
            }
        }

        tx.commit()?;
        Ok(transitions)
    }

    pub fn remove_subscription(&self, client: &str, topic: &str) -> Result<Transitions, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut transitions = Transitions::default();

        let removed: Option<(String, bool)> = tx
            .query_row(SQL_SELECT_SUBSCRIPTION, params![client, topic], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        let Some((device, inactive)) = removed else {
            return Ok(transitions);
        };

        tx.execute(SQL_DELETE_SUBSCRIPTION, params![client, topic])?;
        if !inactive && !device_has_active(&tx, &device)? {
            transitions.disconnected.push(device);
        }

        tx.commit()?;
        Ok(transitions)
    }

    /// Purges (clean session) or deactivates (persistent session) the
    /// client's rows.
    pub fn disconnect_client(&self, client: &str) -> Result<Transitions, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let clean = is_clean_session(&tx, client)?;
        let devices = client_devices(&tx, client, false)?;
        if clean {
            tx.execute(SQL_DELETE_CLIENT, params![client])?;
        } else {
            tx.execute(SQL_SET_CLIENT_INACTIVE, params![client, true])?;
        }
        let transitions = Transitions {
            connected: Vec::new(),
            disconnected: without_active(&tx, devices)?,
        };

        tx.commit()?;
        Ok(transitions)
    }

    /// Reactivates the rows of a returning persistent session. A clean
    /// session starts empty, so leftovers of a previous session are dropped.
    pub fn reconnect_client(&self, client: &str) -> Result<Transitions, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let transitions = if is_clean_session(&tx, client)? {
            let devices = client_devices(&tx, client, false)?;
            tx.execute(SQL_DELETE_CLIENT, params![client])?;
            Transitions {
                connected: Vec::new(),
                disconnected: without_active(&tx, devices)?,
            }
        } else {
            let devices = client_devices(&tx, client, true)?;
            let waking = without_active(&tx, devices)?;
            tx.execute(SQL_SET_CLIENT_INACTIVE, params![client, false])?;
            Transitions {
                connected: waking,
                disconnected: Vec::new(),
            }
        };

        tx.commit()?;
        Ok(transitions)
    }
}

fn is_clean_session(conn: &Connection, client: &str) -> rusqlite::Result<bool> {
    let flag: Option<Option<bool>> = conn
        .query_row(SQL_SELECT_CLEAN_SESSION, params![client], |row| row.get(0))
        .optional()?;
    Ok(flag.flatten().unwrap_or(true))
}

fn device_has_active(conn: &Connection, device: &str) -> rusqlite::Result<bool> {
    conn.query_row(SQL_DEVICE_HAS_ACTIVE, params![device], |row| row.get(0))
}

fn client_devices(conn: &Connection, client: &str, inactive: bool) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(SQL_SELECT_CLIENT_DEVICES)?;
    let rows = stmt.query_map(params![client, inactive], |row| row.get(0))?;
    rows.collect()
}

fn without_active(conn: &Connection, devices: Vec<String>) -> rusqlite::Result<Vec<String>> {
    let mut result = Vec::with_capacity(devices.len());
    for device in devices {
        if !device_has_active(conn, &device)? {
            result.push(device);
        }
    }
    Ok(result)
}
