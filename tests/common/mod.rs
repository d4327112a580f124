//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use shard_pool::config::{Endpoint, PoolPolicy};
use shard_pool::node::RespValue;
use shard_pool::pool::{CacheConnection, Connector, NodePool, PoolError};

/// Config document listing `nodes`.
pub fn document(nodes: &[&str]) -> String {
    let nodes: Vec<String> = nodes.iter().map(|n| format!("\"{}\"", n)).collect();
    format!("[config]\nnodes = [{}]\n", nodes.join(", "))
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ---------------------------------------------------------------------------
// In-memory connector
// ---------------------------------------------------------------------------

/// Shared record of everything the mock connector did.
#[derive(Default)]
pub struct MockLog {
    connects: AtomicUsize,
    closes: Mutex<Vec<Endpoint>>,
    fail_connect: Mutex<HashSet<Endpoint>>,
    fail_close: Mutex<HashSet<Endpoint>>,
    connect_delay: Mutex<Option<Duration>>,
    acquire_delay: Mutex<Option<Duration>>,
}

impl MockLog {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Endpoints whose close was attempted, in order.
    pub fn closes(&self) -> Vec<Endpoint> {
        self.closes.lock().unwrap().clone()
    }

    pub fn fail_connect(&self, endpoint: Endpoint) {
        self.fail_connect.lock().unwrap().insert(endpoint);
    }

    pub fn fail_close(&self, endpoint: Endpoint) {
        self.fail_close.lock().unwrap().insert(endpoint);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Delay every borrow before it checks whether the pool is closed.
    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.acquire_delay.lock().unwrap() = Some(delay);
    }
}

pub struct MockConnection {
    endpoint: Endpoint,
}

impl CacheConnection for MockConnection {
    /// Reads answer with the address of the node that served them.
    async fn execute(&mut self, args: &[&[u8]]) -> Result<RespValue, PoolError> {
        let name = self.endpoint.to_string().into_bytes();
        Ok(match args.first().copied() {
            Some(b"MGET") => RespValue::Array(Some(
                args[1..].iter().map(|_| RespValue::Bulk(Some(name.clone()))).collect(),
            )),
            Some(b"SET") | Some(b"MSET") => RespValue::Simple(b"OK".to_vec()),
            _ => RespValue::Bulk(Some(name)),
        })
    }
}

pub struct MockPool {
    endpoint: Endpoint,
    closed: AtomicBool,
    log: Arc<MockLog>,
}

impl NodePool for MockPool {
    type Connection = MockConnection;

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn acquire(&self) -> Result<MockConnection, PoolError> {
        let delay = *self.log.acquire_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_closed() {
            return Err(PoolError::Closed(self.endpoint.clone()));
        }
        Ok(MockConnection {
            endpoint: self.endpoint.clone(),
        })
    }

    async fn close(&self) -> Result<(), PoolError> {
        self.closed.store(true, Ordering::SeqCst);
        self.log.closes.lock().unwrap().push(self.endpoint.clone());
        if self.log.fail_close.lock().unwrap().contains(&self.endpoint) {
            return Err(PoolError::Teardown {
                endpoint: self.endpoint.clone(),
                reason: "connection reset".into(),
            });
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockConnector {
    pub log: Arc<MockLog>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connector for MockConnector {
    type Pool = MockPool;

    async fn connect(&self, endpoint: &Endpoint, _policy: &PoolPolicy) -> Result<MockPool, PoolError> {
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.log.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.log.fail_connect.lock().unwrap().contains(endpoint) {
            return Err(PoolError::Construction(format!("{} refused connection", endpoint)));
        }
        Ok(MockPool {
            endpoint: endpoint.clone(),
            closed: AtomicBool::new(false),
            log: self.log.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Mock cache server
// ---------------------------------------------------------------------------

/// What the mock server saw.
#[derive(Default)]
pub struct ServerLog {
    pub accepted: AtomicUsize,
    pub commands: Mutex<Vec<Vec<String>>>,
}

impl ServerLog {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn saw(&self, command: &str) -> bool {
        self.count(command) > 0
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.first().is_some_and(|name| name.eq_ignore_ascii_case(command)))
            .count()
    }
}

/// Start a mock cache server on an ephemeral port.
///
/// Understands PING, AUTH, SELECT, CLIENT ID, GET, SET, DEL and MGET against
/// one shared map. Anything else gets an error reply. Connection ids count
/// up from 1 in accept order.
pub async fn start_mock_server() -> (SocketAddr, Arc<ServerLog>) {
    start_programmable_server(|_| None).await
}

/// Like [`start_mock_server`], but `hook` may answer a command first.
pub async fn start_programmable_server<F>(hook: F) -> (SocketAddr, Arc<ServerLog>)
where
    F: Fn(&[String]) -> Option<String> + Send + Sync + 'static,
{
    spawn_server(hook, |_: &[String]| None).await
}

/// Like [`start_mock_server`], but replies to a command are held back for
/// whatever `delay` returns for it.
pub async fn start_delayed_server<D>(delay: D) -> (SocketAddr, Arc<ServerLog>)
where
    D: Fn(&[String]) -> Option<Duration> + Send + Sync + 'static,
{
    spawn_server(|_: &[String]| None, delay).await
}

async fn spawn_server<F, D>(hook: F, delay: D) -> (SocketAddr, Arc<ServerLog>)
where
    F: Fn(&[String]) -> Option<String> + Send + Sync + 'static,
    D: Fn(&[String]) -> Option<Duration> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = Arc::new(ServerLog::default());
    let store = Arc::new(Mutex::new(HashMap::<String, String>::new()));
    let hook = Arc::new(hook);
    let delay = Arc::new(delay);

    let server_log = log.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            let id = server_log.accepted.fetch_add(1, Ordering::SeqCst) + 1;
            let log = server_log.clone();
            let store = store.clone();
            let hook = hook.clone();
            let delay = delay.clone();
            tokio::spawn(async move {
                let _ = serve(socket, id, log, store, hook, delay).await;
            });
        }
    });

    (addr, log)
}

async fn serve<F, D>(
    socket: TcpStream,
    id: usize,
    log: Arc<ServerLog>,
    store: Arc<Mutex<HashMap<String, String>>>,
    hook: Arc<F>,
    delay: Arc<D>,
) -> std::io::Result<()>
where
    F: Fn(&[String]) -> Option<String>,
    D: Fn(&[String]) -> Option<Duration>,
{
    let mut reader = BufReader::new(socket);
    loop {
        let args = match read_command(&mut reader).await? {
            Some(args) => args,
            None => return Ok(()),
        };
        log.commands.lock().unwrap().push(args.clone());

        let reply = match hook(&args) {
            Some(reply) => reply,
            None => respond(id, &args, &store),
        };
        if let Some(pause) = delay(&args) {
            tokio::time::sleep(pause).await;
        }
        reader.get_mut().write_all(reply.as_bytes()).await?;
    }
}

async fn read_command<R>(reader: &mut R) -> std::io::Result<Option<Vec<String>>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let count: usize = line.trim_start_matches('*').trim().parse().unwrap_or(0);
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await?;
        let len: usize = line.trim_start_matches('$').trim().parse().unwrap_or(0);
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data).await?;
        data.truncate(len);
        args.push(String::from_utf8_lossy(&data).into_owned());
    }
    Ok(Some(args))
}

fn bulk(value: Option<&String>) -> String {
    match value {
        Some(v) => format!("${}\r\n{}\r\n", v.len(), v),
        None => "$-1\r\n".to_string(),
    }
}

fn respond(id: usize, args: &[String], store: &Mutex<HashMap<String, String>>) -> String {
    let name = args.first().map(|s| s.to_ascii_uppercase()).unwrap_or_default();
    let mut store = store.lock().unwrap();
    match (name.as_str(), args.len()) {
        ("PING", _) => "+PONG\r\n".to_string(),
        ("AUTH", 2) | ("SELECT", 2) => "+OK\r\n".to_string(),
        ("CLIENT", 2) if args[1].eq_ignore_ascii_case("ID") => format!(":{}\r\n", id),
        ("GET", 2) => bulk(store.get(&args[1])),
        ("SET", n) if n >= 3 => {
            store.insert(args[1].clone(), args[2].clone());
            "+OK\r\n".to_string()
        }
        ("DEL", n) if n >= 2 => {
            let removed = args[1..].iter().filter(|k| store.remove(*k).is_some()).count();
            format!(":{}\r\n", removed)
        }
        ("MGET", n) if n >= 2 => {
            let mut reply = format!("*{}\r\n", n - 1);
            for key in &args[1..] {
                reply.push_str(&bulk(store.get(key)));
            }
            reply
        }
        _ => format!("-ERR unknown command '{}'\r\n", name),
    }
}

/// Run `f` and fail the test if it does not finish in five seconds.
pub async fn within<T>(f: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("test step timed out")
}
