//! SQLite database for persistent control-plane state
//!
//! Holds the settings key/value space, routing rules with their client
//! records, and the accumulated traffic counters.

use crate::stats::{ClientTraffic, Traffic};
use crate::store::{ClientRecord, RoutingRule, RuleStore, SettingsStore};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Tag that addresses every outbound traffic row at once
pub const ALL_TAGS: &str = "-alltags-";

/// Accumulated traffic of one outbound
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundTrafficRecord {
    pub tag: String,
    pub up: i64,
    pub down: i64,
    pub total: i64,
}

/// Accumulated traffic and entitlement of one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientTrafficRecord {
    pub inbound_id: i64,
    pub email: String,
    pub enabled: bool,
    pub up: i64,
    pub down: i64,
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: settings, routing rules and client records
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS inbounds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tag TEXT NOT NULL UNIQUE,
                enable INTEGER NOT NULL DEFAULT 1,
                listen TEXT NOT NULL DEFAULT '',
                port INTEGER NOT NULL,
                protocol TEXT NOT NULL,
                settings TEXT NOT NULL DEFAULT '',
                stream_settings TEXT NOT NULL DEFAULT '',
                sniffing TEXT NOT NULL DEFAULT '',
                up INTEGER NOT NULL DEFAULT 0,
                down INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS client_traffics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                inbound_id INTEGER NOT NULL,
                email TEXT NOT NULL UNIQUE,
                enable INTEGER NOT NULL DEFAULT 1,
                up INTEGER NOT NULL DEFAULT 0,
                down INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (inbound_id) REFERENCES inbounds(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_client_traffics_inbound ON client_traffics(inbound_id);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Migration v2: outbound traffic counters
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: outbound traffic");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS outbound_traffics (
                tag TEXT PRIMARY KEY,
                up INTEGER NOT NULL DEFAULT 0,
                down INTEGER NOT NULL DEFAULT 0,
                total INTEGER NOT NULL DEFAULT 0
            );

            INSERT INTO schema_migrations (version) VALUES (2);
        "#,
        )?;

        Ok(())
    }

    // ==================== Routing Rules ====================

    /// Insert a routing rule and return its id
    pub fn add_inbound(&self, rule: &RoutingRule) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO inbounds (tag, enable, listen, port, protocol, settings, stream_settings, sniffing)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rule.tag,
                rule.enabled,
                rule.listen,
                rule.port,
                rule.protocol,
                rule.settings,
                rule.stream_settings,
                rule.sniffing
            ],
        )
        .with_context(|| format!("Failed to add inbound '{}'", rule.tag))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_inbound_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE inbounds SET enable = ?1 WHERE id = ?2",
            params![enabled, id],
        )?;
        Ok(rows > 0)
    }

    /// Create or update the record of a client
    pub fn add_client_record(&self, inbound_id: i64, email: &str, enabled: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO client_traffics (inbound_id, email, enable) VALUES (?1, ?2, ?3)
             ON CONFLICT(email) DO UPDATE SET
                inbound_id = excluded.inbound_id,
                enable = excluded.enable",
            params![inbound_id, email, enabled],
        )?;
        Ok(())
    }

    pub fn get_client_traffic(&self, email: &str) -> Result<Option<ClientTrafficRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT inbound_id, email, enable, up, down FROM client_traffics WHERE email = ?1",
            params![email],
            |row| {
                Ok(ClientTrafficRecord {
                    inbound_id: row.get(0)?,
                    email: row.get(1)?,
                    enabled: row.get(2)?,
                    up: row.get(3)?,
                    down: row.get(4)?,
                })
            },
        )
        .optional()
        .context("Failed to get client traffic")
    }

    // ==================== Traffic ====================

    /// Accumulate rule, outbound and client traffic in one transaction.
    ///
    /// Unknown rule tags and emails are ignored.
    pub fn add_all_traffic(&self, traffic: &[Traffic], clients: &[ClientTraffic]) -> Result<()> {
        if traffic.is_empty() && clients.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for t in traffic {
            if t.is_inbound {
                tx.execute(
                    "UPDATE inbounds SET up = up + ?1, down = down + ?2 WHERE tag = ?3",
                    params![t.up, t.down, t.tag],
                )?;
            } else if t.is_outbound {
                tx.execute(
                    "INSERT INTO outbound_traffics (tag, up, down, total) VALUES (?1, ?2, ?3, ?2 + ?3)
                     ON CONFLICT(tag) DO UPDATE SET
                        up = up + excluded.up,
                        down = down + excluded.down,
                        total = total + excluded.total",
                    params![t.tag, t.up, t.down],
                )?;
            }
        }
        for c in clients {
            tx.execute(
                "UPDATE client_traffics SET up = up + ?1, down = down + ?2 WHERE email = ?3",
                params![c.up, c.down, c.email],
            )?;
        }
        tx.commit().context("Failed to persist traffic")?;
        Ok(())
    }

    pub fn outbound_traffic(&self) -> Result<Vec<OutboundTrafficRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT tag, up, down, total FROM outbound_traffics ORDER BY tag")?;

        let rows = stmt
            .query_map([], |row| {
                Ok(OutboundTrafficRecord {
                    tag: row.get(0)?,
                    up: row.get(1)?,
                    down: row.get(2)?,
                    total: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Zero the counters of `tag`, or of every outbound for [`ALL_TAGS`]
    pub fn reset_outbound_traffic(&self, tag: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = if tag == ALL_TAGS {
            conn.execute("UPDATE outbound_traffics SET up = 0, down = 0, total = 0", [])?
        } else {
            conn.execute(
                "UPDATE outbound_traffics SET up = 0, down = 0, total = 0 WHERE tag = ?1",
                params![tag],
            )?
        };
        Ok(rows)
    }
}

impl SettingsStore for Database {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("Failed to read setting '{}'", key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = datetime('now')",
            params![key, value],
        )
        .with_context(|| format!("Failed to write setting '{}'", key))?;
        Ok(())
    }
}

impl RuleStore for Database {
    fn list_enabled_rules(&self) -> Result<Vec<RoutingRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, tag, enable, listen, port, protocol, settings, stream_settings, sniffing
             FROM inbounds WHERE enable = 1 ORDER BY id",
        )?;

        let mut rules = stmt
            .query_map([], |row| {
                Ok(RoutingRule {
                    id: row.get(0)?,
                    tag: row.get(1)?,
                    enabled: row.get(2)?,
                    listen: row.get(3)?,
                    port: row.get(4)?,
                    protocol: row.get(5)?,
                    settings: row.get(6)?,
                    stream_settings: row.get(7)?,
                    sniffing: row.get(8)?,
                    client_records: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = conn.prepare(
            "SELECT email, enable FROM client_traffics WHERE inbound_id = ?1 ORDER BY id",
        )?;
        for rule in &mut rules {
            rule.client_records = records
                .query_map(params![rule.id], |row| {
                    Ok(ClientRecord {
                        email: row.get(0)?,
                        enabled: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
        }

        Ok(rules)
    }
}
