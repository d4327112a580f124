//! Per-node TCP connection pool.
//!
//! # Responsibilities
//! - Bound total connections per node (idle + borrowed) with a semaphore
//! - Reuse idle connections LIFO or FIFO, capped at `max_idle`
//! - Validate on borrow / return as the policy asks
//! - Never return a broken connection to the idle set
//! - Close: refuse new borrows, stop the evictor, shut idle sockets down

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::{Endpoint, PoolPolicy};
use crate::node::eviction::{self, EvictionStats};
use crate::node::resp::{encode_command, read_value, RespValue};
use crate::pool::{CacheConnection, Connector, NodePool, PoolError};

/// Single TCP connection with reusable buffers.
pub struct Connection {
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    needs_validation: bool,
}

impl Connection {
    /// Connect, authenticate, and select the database within the connect timeout.
    pub async fn open(endpoint: &Endpoint, policy: &PoolPolicy) -> Result<Self, PoolError> {
        tokio::time::timeout(policy.connect_timeout, Self::handshake(endpoint, policy))
            .await
            .map_err(|_| {
                PoolError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    endpoint, policy.connect_timeout
                ))
            })?
    }

    async fn handshake(endpoint: &Endpoint, policy: &PoolPolicy) -> Result<Self, PoolError> {
        let stream = TcpStream::connect(endpoint.address()).await?;
        // Disable Nagle to keep latency low for small commands.
        stream.set_nodelay(true)?;

        let mut conn = Connection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            needs_validation: false,
        };

        if let Some(password) = &policy.password {
            conn.expect_ok(&[b"AUTH", password.as_bytes()]).await?;
        }
        if policy.database != 0 {
            let db = policy.database.to_string();
            conn.expect_ok(&[b"SELECT", db.as_bytes()]).await?;
        }
        Ok(conn)
    }

    async fn expect_ok(&mut self, args: &[&[u8]]) -> Result<(), PoolError> {
        match self.exec(args).await? {
            reply if reply.is_ok() => Ok(()),
            RespValue::Error(message) => Err(PoolError::Server(String::from_utf8_lossy(&message).into_owned())),
            other => Err(PoolError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    pub async fn exec(&mut self, args: &[&[u8]]) -> Result<RespValue, PoolError> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf).await?;
        stream.flush().await?;

        read_value(&mut self.reader, &mut self.line_buf).await
    }

    /// PING round trip.
    pub async fn ping(&mut self) -> bool {
        matches!(self.exec(&[b"PING"]).await, Ok(RespValue::Simple(ref s)) if s == b"PONG")
    }

    async fn shutdown(mut self) -> std::io::Result<()> {
        self.reader.get_mut().shutdown().await
    }
}

pub(crate) struct IdleConnection {
    pub(crate) conn: Connection,
    pub(crate) permit: Option<OwnedSemaphorePermit>,
    pub(crate) since: Instant,
}

/// Outcome of a slot reservation.
pub(crate) enum Reserved {
    /// Room for a new connection. `None` when the pool is unbounded.
    Permit(Option<OwnedSemaphorePermit>),
    /// A connection went back to the idle set while waiting.
    Returned,
}

pub(crate) struct PoolInner {
    pub(crate) endpoint: Endpoint,
    pub(crate) policy: PoolPolicy,
    pub(crate) idle: Mutex<VecDeque<IdleConnection>>,
    permits: Option<Arc<Semaphore>>,
    returned: Notify,
    closed: AtomicBool,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn lock_idle(&self) -> std::sync::MutexGuard<'_, VecDeque<IdleConnection>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pop_idle(&self) -> Option<IdleConnection> {
        let mut idle = self.lock_idle();
        if self.policy.lifo {
            idle.pop_back()
        } else {
            idle.pop_front()
        }
    }

    /// Reserve a slot for a new connection.
    ///
    /// Without a deadline this fails immediately when the pool is full.
    /// With one it waits for a free slot or a returned connection, up to
    /// the deadline.
    pub(crate) async fn reserve(&self, deadline: Option<time::Instant>) -> Result<Reserved, PoolError> {
        let semaphore = match &self.permits {
            Some(semaphore) => semaphore.clone(),
            None => return Ok(Reserved::Permit(None)),
        };

        let deadline = match deadline {
            Some(deadline) => deadline,
            None => {
                return match semaphore.try_acquire_owned() {
                    Ok(permit) => Ok(Reserved::Permit(Some(permit))),
                    Err(TryAcquireError::Closed) => Err(PoolError::Closed(self.endpoint.clone())),
                    Err(TryAcquireError::NoPermits) => Err(PoolError::Exhausted(self.endpoint.clone())),
                };
            }
        };

        let wait = async {
            tokio::select! {
                permit = semaphore.acquire_owned() => permit.map(|p| Reserved::Permit(Some(p))),
                _ = self.returned.notified() => Ok(Reserved::Returned),
            }
        };
        match time::timeout_at(deadline, wait).await {
            Ok(Ok(reserved)) => Ok(reserved),
            Ok(Err(_)) => Err(PoolError::Closed(self.endpoint.clone())),
            Err(_) => Err(PoolError::Exhausted(self.endpoint.clone())),
        }
    }

    fn return_idle(&self, mut conn: Connection, permit: Option<OwnedSemaphorePermit>) {
        conn.needs_validation = self.policy.test_on_return;
        let mut idle = self.lock_idle();
        if self.is_closed() || idle.len() >= self.policy.max_idle {
            return;
        }
        idle.push_back(IdleConnection {
            conn,
            permit,
            since: Instant::now(),
        });
        drop(idle);
        self.returned.notify_one();
    }
}

/// Connection pool for one node.
#[derive(Clone)]
pub struct TcpNodePool {
    inner: Arc<PoolInner>,
}

impl TcpNodePool {
    /// Create an empty pool. No connection is opened until the first borrow.
    pub fn new(endpoint: Endpoint, policy: PoolPolicy) -> Self {
        let permits = policy.max_total.map(|max| Arc::new(Semaphore::new(max)));
        Self {
            inner: Arc::new(PoolInner {
                endpoint,
                policy,
                idle: Mutex::new(VecDeque::new()),
                permits,
                returned: Notify::new(),
                closed: AtomicBool::new(false),
                evictor: Mutex::new(None),
            }),
        }
    }

    /// Start the background evictor if the policy enables one.
    pub fn start_evictor(&self) {
        let interval = self.inner.policy.time_between_eviction_runs;
        if interval.is_zero() {
            return;
        }
        let handle = eviction::spawn_evictor(Arc::downgrade(&self.inner), interval);
        let mut evictor = self.inner.evictor.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = evictor.replace(handle) {
            previous.abort();
        }
    }

    /// Run one eviction pass now.
    pub async fn evict_now(&self) -> EvictionStats {
        eviction::run_eviction(&self.inner).await
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock_idle().len()
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.inner.policy
    }
}

impl NodePool for TcpNodePool {
    type Connection = PooledConnection;

    fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let policy = &self.inner.policy;
        let deadline = policy
            .block_when_exhausted
            .then(|| time::Instant::now() + policy.max_wait);

        loop {
            if self.inner.is_closed() {
                return Err(PoolError::Closed(self.inner.endpoint.clone()));
            }

            while let Some(mut entry) = self.inner.pop_idle() {
                if policy.test_on_borrow || entry.conn.needs_validation {
                    if !entry.conn.ping().await {
                        tracing::debug!(endpoint = %self.inner.endpoint, "Discarding idle connection that failed validation");
                        continue;
                    }
                    entry.conn.needs_validation = false;
                }
                return Ok(PooledConnection::new(self.inner.clone(), entry.conn, entry.permit));
            }

            match self.inner.reserve(deadline).await? {
                Reserved::Permit(permit) => {
                    let conn = Connection::open(&self.inner.endpoint, policy).await?;
                    return Ok(PooledConnection::new(self.inner.clone(), conn, permit));
                }
                Reserved::Returned => continue,
            }
        }
    }

    async fn close(&self) -> Result<(), PoolError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(semaphore) = &self.inner.permits {
            semaphore.close();
        }
        if let Some(handle) = self
            .inner
            .evictor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        let drained: Vec<IdleConnection> = self.inner.lock_idle().drain(..).collect();
        let mut first_error = None;
        for entry in drained {
            if let Err(e) = entry.conn.shutdown().await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(PoolError::Teardown {
                endpoint: self.inner.endpoint.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// RAII wrapper returning a connection to its pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    permit: Option<OwnedSemaphorePermit>,
    valid: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            pool,
            conn: Some(conn),
            permit,
            valid: true,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.pool.endpoint
    }
}

impl CacheConnection for PooledConnection {
    async fn execute(&mut self, args: &[&[u8]]) -> Result<RespValue, PoolError> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Err(PoolError::Closed(self.pool.endpoint.clone())),
        };
        // Invalid until the reply is fully read. A cancelled or failed
        // command leaves the stream out of sync, so the connection is dropped.
        self.valid = false;
        let response = conn.exec(args).await;
        self.valid = response.is_ok();
        response
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };
        if self.valid {
            self.pool.return_idle(conn, self.permit.take());
        }
    }
}

/// Connector producing [`TcpNodePool`]s.
///
/// Each pool is warmed with `max(min_idle, 1)` connections so an unreachable
/// node fails the build instead of the first command.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for TcpConnector {
    type Pool = TcpNodePool;

    async fn connect(&self, endpoint: &Endpoint, policy: &PoolPolicy) -> Result<TcpNodePool, PoolError> {
        let pool = TcpNodePool::new(endpoint.clone(), policy.clone());

        let mut warm = policy.min_idle.max(1);
        if let Some(max) = policy.max_total {
            warm = warm.min(max);
        }

        let mut borrowed = Vec::with_capacity(warm);
        for _ in 0..warm {
            let conn = pool
                .acquire()
                .await
                .map_err(|e| PoolError::Construction(format!("{}: {}", endpoint, e)))?;
            borrowed.push(conn);
        }
        drop(borrowed);

        pool.start_evictor();
        tracing::debug!(endpoint = %endpoint, warm, "Node pool ready");
        Ok(pool)
    }
}
