//! SQLite-backed store with a dedicated writer thread and read pool.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::StateStore;
use crate::error::{store_err, store_err_with, Result};

const DEFAULT_READ_POOL_SIZE: usize = 2;

enum WriteCommand {
    Put {
        namespace: String,
        key: String,
        value: String,
        response: oneshot::Sender<Result<()>>,
    },
    Delete {
        namespace: String,
        key: String,
        response: oneshot::Sender<Result<bool>>,
    },
    Flush {
        response: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

struct ReadPool {
    connections: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

impl ReadPool {
    fn new(db_path: &Path, size: usize) -> Result<Self> {
        let mut connections = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(
                db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| store_err_with("Failed to open read connection", e))?;
            conn.busy_timeout(std::time::Duration::from_secs(5))
                .map_err(|e| store_err_with("Failed to set busy timeout", e))?;
            connections.push(Mutex::new(conn));
        }
        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
        })
    }

    fn acquire(&self) -> parking_lot::MutexGuard<'_, Connection> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[idx].lock()
    }
}

struct StoreWriter {
    tx: Sender<WriteCommand>,
    handle: Option<JoinHandle<()>>,
}

impl StoreWriter {
    fn new(db_path: PathBuf) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<WriteCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let handle = thread::Builder::new()
            .name("store-writer".into())
            .spawn(move || match Self::init_db(&db_path) {
                Ok(conn) => {
                    let _ = ready_tx.send(Ok(()));
                    Self::process_commands(&conn, rx);
                }
                Err(e) => {
                    error!(error = %e, "Store writer init failed");
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| store_err_with("Failed to spawn writer thread", e))?;

        ready_rx
            .recv()
            .map_err(|_| store_err("Writer thread died during init"))??;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    fn init_db(db_path: &Path) -> Result<Connection> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| store_err_with("Failed to create db directory", e))?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| store_err_with("Failed to open database", e))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| store_err_with("Failed to enable WAL", e))?;

        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            );
            CREATE INDEX IF NOT EXISTS idx_kv_namespace ON kv(namespace);
            ",
        )
        .map_err(|e| store_err_with("Failed to init schema", e))?;

        Ok(conn)
    }

    fn process_commands(conn: &Connection, rx: Receiver<WriteCommand>) {
        for cmd in rx {
            match cmd {
                WriteCommand::Put {
                    namespace,
                    key,
                    value,
                    response,
                } => {
                    let result = conn
                        .execute(
                            "INSERT INTO kv (namespace, key, value, updated_at)
                               VALUES (?1, ?2, ?3, ?4)
                               ON CONFLICT(namespace, key) DO UPDATE
                               SET value = excluded.value, updated_at = excluded.updated_at",
                            params![namespace, key, value, Utc::now().to_rfc3339()],
                        )
                        .map(|_| ())
                        .map_err(|e| store_err_with("Failed to write entry", e));
                    let _ = response.send(result);
                }
                WriteCommand::Delete {
                    namespace,
                    key,
                    response,
                } => {
                    let result = conn
                        .execute(
                            "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
                            params![namespace, key],
                        )
                        .map(|changed| changed > 0)
                        .map_err(|e| store_err_with("Failed to delete entry", e));
                    let _ = response.send(result);
                }
                WriteCommand::Flush { response } => {
                    let result = conn
                        .query_row("PRAGMA wal_checkpoint(FULL)", [], |_row| Ok(()))
                        .map_err(|e| store_err_with("Failed to checkpoint WAL", e));
                    let _ = response.send(result);
                }
                WriteCommand::Shutdown => {
                    debug!("Store writer received shutdown signal");
                    break;
                }
            }
        }
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        let _ = self.tx.send(WriteCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                warn!("Store writer thread panicked: {:?}", e);
            }
        }
    }
}

struct SqliteStoreInner {
    writer_tx: Sender<WriteCommand>,
    read_pool: ReadPool,
    db_path: PathBuf,
    /// Holds the writer thread handle. Must not be dropped while the store
    /// is alive.
    #[allow(dead_code)]
    writer: StoreWriter,
}

#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<SqliteStoreInner>,
}

impl SqliteStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_read_pool_size(db_path, DEFAULT_READ_POOL_SIZE)
    }

    pub fn with_read_pool_size(db_path: impl AsRef<Path>, pool_size: usize) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        let writer = StoreWriter::new(db_path.clone())?;
        let writer_tx = writer.tx.clone();
        let read_pool = ReadPool::new(&db_path, pool_size.max(1))?;

        Ok(Self {
            inner: Arc::new(SqliteStoreInner {
                writer_tx,
                read_pool,
                db_path,
                writer,
            }),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.inner.db_path
    }

    async fn send_write<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .writer_tx
            .send(build(tx))
            .map_err(|_| store_err("Writer thread disconnected"))?;
        rx.await
            .map_err(|_| store_err("Writer response channel dropped"))?
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn put(&self, namespace: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let value = serde_json::to_string(&value)?;
        let namespace = namespace.to_string();
        let key = key.to_string();
        self.send_write(|response| WriteCommand::Put {
            namespace,
            key,
            value,
            response,
        })
        .await
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let namespace = namespace.to_string();
        let key = key.to_string();
        let inner = Arc::clone(&self.inner);

        tokio::task::spawn_blocking(move || {
            let guard = inner.read_pool.acquire();
            let row: Option<String> = guard
                .query_row(
                    "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                    params![namespace, key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| store_err_with("Failed to read entry", e))?;

            match row {
                Some(raw) => {
                    let value = serde_json::from_str(&raw)
                        .map_err(|e| store_err_with("Corrupt stored value", e))?;
                    Ok(Some(value))
                }
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| store_err_with("Read task failed", e))?
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let namespace = namespace.to_string();
        let key = key.to_string();
        self.send_write(|response| WriteCommand::Delete {
            namespace,
            key,
            response,
        })
        .await
    }

    async fn list(&self, namespace: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let namespace = namespace.to_string();
        let inner = Arc::clone(&self.inner);

        tokio::task::spawn_blocking(move || {
            let guard = inner.read_pool.acquire();
            let mut stmt = guard
                .prepare("SELECT key, value FROM kv WHERE namespace = ?1 ORDER BY key")
                .map_err(|e| store_err_with("Failed to prepare statement", e))?;

            let rows = stmt
                .query_map(params![namespace], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(|e| store_err_with("Failed to list entries", e))?;

            let mut entries = Vec::new();
            for row in rows {
                let (key, raw) = row.map_err(|e| store_err_with("Failed to read row", e))?;
                let value = serde_json::from_str(&raw)
                    .map_err(|e| store_err_with("Corrupt stored value", e))?;
                entries.push((key, value));
            }

            debug!(namespace, count = entries.len(), "Entries listed");
            Ok(entries)
        })
        .await
        .map_err(|e| store_err_with("Read task failed", e))?
    }

    async fn flush(&self) -> Result<()> {
        self.send_write(|response| WriteCommand::Flush { response })
            .await
    }
}
