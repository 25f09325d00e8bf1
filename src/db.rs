//! SQLite order store.
//!
//! Uses rusqlite with WAL mode. The order body is kept as JSON next to the
//! flag columns, so a re-fetched order can replace the body without
//! touching `printed`, `read` or `notified`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::error::RepositoryError;
use crate::models::OrderRecord;
use crate::repository::OrderRepository;

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

pub struct SqliteOrderRepository {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteOrderRepository {
    /// Open (or create) the database file, apply pragmas and migrations.
    ///
    /// A file that cannot be opened is deleted and recreated once; the order
    /// cache can always be refilled from the remote source.
    pub fn open(path: &Path) -> Result<Self, RepositoryError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        info!(path = %path.display(), "Opening order database");

        let conn = match open_and_configure(path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!(error = %first_err, "Order database open failed, deleting and retrying once");
                for file in [
                    path.to_path_buf(),
                    path.with_extension("db-wal"),
                    path.with_extension("db-shm"),
                ] {
                    let _ = fs::remove_file(file);
                }
                open_and_configure(path)?
            }
        };
        run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, RepositoryError>,
    ) -> Result<T, RepositoryError> {
        let mut conn = self.conn.lock().map_err(|_| RepositoryError::Poisoned)?;
        f(&mut conn)
    }

    fn set_flag(&self, id: i64, column: &str, value: bool) -> Result<(), RepositoryError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                &format!("UPDATE orders SET {column} = ?1, updated_at = ?2 WHERE id = ?3"),
                params![value, Utc::now().to_rfc3339(), id],
            )?;
            if changed == 0 {
                return Err(RepositoryError::NotFound(id));
            }
            Ok(())
        })
    }

    fn query_orders(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<OrderRecord>, RepositoryError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(args, row_to_order)?;
            let mut orders = Vec::new();
            for row in rows {
                orders.push(decode(row?)?);
            }
            Ok(orders)
        })
    }
}

fn open_and_configure(path: &Path) -> Result<Connection, RepositoryError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<(), RepositoryError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!("Migrating order database from v{current} to v{CURRENT_SCHEMA_VERSION}");
    if current < 1 {
        migrate_v1(conn)?;
    }
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<(), RepositoryError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY,
            number TEXT NOT NULL,
            status TEXT NOT NULL,
            body TEXT NOT NULL,
            printed INTEGER NOT NULL DEFAULT 0,
            read INTEGER NOT NULL DEFAULT 0,
            notified INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_read ON orders(read);
        INSERT INTO schema_version (version) VALUES (1);",
    )?;
    Ok(())
}

const SELECT_ORDER: &str = "SELECT body, printed, read, notified FROM orders";

struct OrderRow {
    body: String,
    printed: bool,
    read: bool,
    notified: bool,
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRow> {
    Ok(OrderRow {
        body: row.get(0)?,
        printed: row.get(1)?,
        read: row.get(2)?,
        notified: row.get(3)?,
    })
}

fn decode(row: OrderRow) -> Result<OrderRecord, RepositoryError> {
    let mut order: OrderRecord = serde_json::from_str(&row.body)?;
    order.printed = row.printed;
    order.read = row.read;
    order.notified = row.notified;
    Ok(order)
}

impl OrderRepository for SqliteOrderRepository {
    fn upsert_orders(&self, orders: &[OrderRecord]) -> Result<usize, RepositoryError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let now = Utc::now().to_rfc3339();
            {
                // Flag columns are set on insert only.
                let mut stmt = tx.prepare(
                    "INSERT INTO orders
                        (id, number, status, body, printed, read, notified, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                     ON CONFLICT(id) DO UPDATE SET
                        number = excluded.number,
                        status = excluded.status,
                        body = excluded.body,
                        updated_at = excluded.updated_at",
                )?;
                for order in orders {
                    let body = serde_json::to_string(order)?;
                    stmt.execute(params![
                        order.id,
                        order.number,
                        order.status,
                        body,
                        order.printed,
                        order.read,
                        order.notified,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(orders.len())
        })
    }

    fn get(&self, id: i64) -> Result<Option<OrderRecord>, RepositoryError> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("{SELECT_ORDER} WHERE id = ?1"),
                    params![id],
                    row_to_order,
                )
                .optional()?)
        })?;
        row.map(decode).transpose()
    }

    fn mark_printed(&self, id: i64) -> Result<(), RepositoryError> {
        self.set_flag(id, "printed", true)
    }

    fn mark_read(&self, id: i64) -> Result<(), RepositoryError> {
        self.set_flag(id, "read", true)
    }

    fn mark_unread(&self, id: i64) -> Result<(), RepositoryError> {
        self.set_flag(id, "read", false)
    }

    fn mark_notified(&self, id: i64) -> Result<(), RepositoryError> {
        self.set_flag(id, "notified", true)
    }

    fn get_unread(&self) -> Result<Vec<OrderRecord>, RepositoryError> {
        self.query_orders(&format!("{SELECT_ORDER} WHERE read = 0 ORDER BY id"), &[])
    }

    fn list_by_status(&self, status: &str) -> Result<Vec<OrderRecord>, RepositoryError> {
        self.query_orders(
            &format!("{SELECT_ORDER} WHERE lower(status) = lower(?1) ORDER BY id"),
            &[&status],
        )
    }
}
