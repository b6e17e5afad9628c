//! Read connection pool.
//!
//! Every read borrows a [`ReadLease`]: a semaphore permit plus a connection.
//! Connections are clones of the writer's database instance
//! (`Connection::try_clone`), so readers see every committed write without
//! opening the file a second time.
//!
//! Two policies:
//! - [`ReadPolicy::Pooled`]: file-backed stores; an r2d2 pool of cloned
//!   connections, one per concurrent reader
//! - [`ReadPolicy::Shared`]: memory-resident stores; one shared reader
//!   connection, reads serialized behind it

use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use duckdb::Connection;
use r2d2::{Pool, PooledConnection};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

use crate::storage::StorageError;

// =============================================================================
// Constants
// =============================================================================

/// Default number of concurrent readers.
pub const DEFAULT_MAX_CONCURRENT_READS: usize = 8;

/// Default time an idle pooled connection is kept.
pub const DEFAULT_READ_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

// =============================================================================
// Policy
// =============================================================================

/// How read leases map onto connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
    /// One connection per concurrent reader, reused through an idle pool.
    Pooled,
    /// A single reader connection shared by all leases, one at a time.
    Shared,
}

#[derive(Debug, Clone)]
pub struct ReadPoolOptions {
    pub policy: ReadPolicy,
    /// Semaphore capacity; also the pooled connection ceiling.
    pub max_concurrent_reads: usize,
    pub idle_timeout: Duration,
}

impl Default for ReadPoolOptions {
    fn default() -> Self {
        Self {
            policy: ReadPolicy::Pooled,
            max_concurrent_reads: DEFAULT_MAX_CONCURRENT_READS,
            idle_timeout: DEFAULT_READ_IDLE_TIMEOUT,
        }
    }
}

// =============================================================================
// Connections
// =============================================================================

/// A reader connection and whether it should be thrown away on release.
pub struct ReadConnection {
    conn: Connection,
    broken: bool,
}

impl ReadConnection {
    fn new(conn: Connection) -> Self {
        Self {
            conn,
            broken: false,
        }
    }
}

/// Produces reader connections by cloning a seed connection.
struct CloneManager {
    seed: Mutex<Connection>,
}

impl r2d2::ManageConnection for CloneManager {
    type Connection = ReadConnection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<ReadConnection, duckdb::Error> {
        let seed = self.seed.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(ReadConnection::new(seed.try_clone()?))
    }

    fn is_valid(&self, conn: &mut ReadConnection) -> Result<(), duckdb::Error> {
        conn.conn.execute_batch("SELECT 1")
    }

    fn has_broken(&self, conn: &mut ReadConnection) -> bool {
        conn.broken
    }
}

/// Routes r2d2 connection errors into tracing.
#[derive(Debug)]
struct TracingErrorHandler;

impl r2d2::HandleError<duckdb::Error> for TracingErrorHandler {
    fn handle_error(&self, error: duckdb::Error) {
        tracing::warn!(error = %error, "Read connection error");
    }
}

enum Source {
    Pooled(Pool<CloneManager>),
    Shared {
        conn: Arc<AsyncMutex<ReadConnection>>,
        seed: Mutex<Connection>,
    },
}

// =============================================================================
// Pool
// =============================================================================

/// Semaphore-gated read pool.
pub struct ReadPool {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    source: Source,
}

impl ReadPool {
    /// Build a pool whose connections are clones of `seed`.
    pub fn new(seed: Connection, options: ReadPoolOptions) -> Result<Self, StorageError> {
        let max_concurrent = options.max_concurrent_reads.max(1);
        let source = match options.policy {
            ReadPolicy::Pooled => {
                let manager = CloneManager {
                    seed: Mutex::new(seed),
                };
                let pool = Pool::builder()
                    .max_size(max_concurrent as u32)
                    .min_idle(Some(0))
                    .idle_timeout(Some(options.idle_timeout))
                    .test_on_check_out(true)
                    .error_handler(Box::new(TracingErrorHandler))
                    .build(manager)?;
                Source::Pooled(pool)
            }
            ReadPolicy::Shared => {
                let conn = ReadConnection::new(seed.try_clone()?);
                Source::Shared {
                    conn: Arc::new(AsyncMutex::new(conn)),
                    seed: Mutex::new(seed),
                }
            }
        };

        Ok(Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            source,
        })
    }

    pub fn policy(&self) -> ReadPolicy {
        match self.source {
            Source::Pooled(_) => ReadPolicy::Pooled,
            Source::Shared { .. } => ReadPolicy::Shared,
        }
    }

    /// Wait for a free slot and a connection.
    ///
    /// Dropping the returned future gives back whatever was acquired so far.
    pub async fn acquire(&self) -> Result<ReadLease, StorageError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StorageError::Disposed)?;

        let conn = match &self.source {
            Source::Pooled(pool) => {
                let pool = pool.clone();
                let conn = tokio::task::spawn_blocking(move || pool.get()).await??;
                LeasedConnection::Pooled(conn)
            }
            Source::Shared { conn, seed } => {
                let mut guard = Arc::clone(conn).lock_owned().await;
                if guard.broken {
                    let fresh = seed
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .try_clone()?;
                    *guard = ReadConnection::new(fresh);
                    tracing::debug!("Replaced broken shared read connection");
                }
                LeasedConnection::Shared(guard)
            }
        };

        Ok(ReadLease {
            conn,
            _permit: permit,
        })
    }

    /// Reject further acquisitions. Outstanding leases stay valid.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Leases currently held.
    pub fn in_use(&self) -> usize {
        if self.permits.is_closed() {
            return 0;
        }
        self.max_concurrent - self.permits.available_permits()
    }

    /// Connections parked in the idle pool (always 0 for the shared policy).
    pub fn idle_connections(&self) -> u32 {
        match &self.source {
            Source::Pooled(pool) => pool.state().idle_connections,
            Source::Shared { .. } => 0,
        }
    }
}

impl std::fmt::Debug for ReadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadPool")
            .field("policy", &self.policy())
            .field("max_concurrent", &self.max_concurrent)
            .field("in_use", &self.in_use())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Lease
// =============================================================================

enum LeasedConnection {
    Pooled(PooledConnection<CloneManager>),
    Shared(OwnedMutexGuard<ReadConnection>),
}

/// Scoped read access. Dropping it returns the connection, then frees the slot.
pub struct ReadLease {
    // Field order is drop order: connection first, permit last.
    conn: LeasedConnection,
    _permit: OwnedSemaphorePermit,
}

impl ReadLease {
    /// Throw the connection away on release instead of reusing it.
    pub fn discard(&mut self) {
        match &mut self.conn {
            LeasedConnection::Pooled(c) => c.broken = true,
            LeasedConnection::Shared(c) => c.broken = true,
        }
    }
}

impl Deref for ReadLease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.conn {
            LeasedConnection::Pooled(c) => &c.conn,
            LeasedConnection::Shared(c) => &c.conn,
        }
    }
}

impl std::fmt::Debug for ReadLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.conn {
            LeasedConnection::Pooled(_) => "pooled",
            LeasedConnection::Shared(_) => "shared",
        };
        f.debug_struct("ReadLease")
            .field("connection", &kind)
            .finish_non_exhaustive()
    }
}
