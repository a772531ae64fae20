//! Worker Client: the controller's handle on a `kb-worker` process.
//!
//! The client spawns the worker lazily on the first call and respawns it on
//! the next call after it exits. Every call carries its own timeout. When the
//! worker exits or its pipe breaks, every outstanding call fails with
//! [`ClientError::WorkerExited`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use knowledge_engine::client::{WorkerClient, WorkerCommand};
//! use knowledge_engine_core::protocol::{Call, NoParams};
//!
//! # async fn demo() -> Result<(), knowledge_engine::client::ClientError> {
//! let client = WorkerClient::new(WorkerCommand::new("kb-worker", "/tmp/kb-data"));
//! let _sub = client.on_event(|event| eprintln!("{}: {}", event.event, event.payload));
//! let kbs = client.call(Call::List(NoParams {}), Duration::from_secs(5)).await?;
//! println!("{}", kbs);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use knowledge_engine_core::protocol::{
    decode_frame, encode_frame, Call, Event, Request, WorkerMessage, DEFAULT_MAX_FRAME_BYTES,
};

use crate::config::{ENV_DATA_ROOT, ENV_ITEM_TIMEOUT_SECS, ENV_LOG};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("worker exited")]
    WorkerExited,

    /// The worker answered `ok: false`.
    #[error("{message}")]
    Remote {
        message: String,
        stack: Option<String>,
    },

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("failed to decode result: {0}")]
    Decode(String),
}

/// How to launch the worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub binary: PathBuf,
    pub data_root: PathBuf,
    pub item_timeout_secs: Option<u64>,
    pub log_level: String,
}

impl WorkerCommand {
    pub fn new(binary: impl Into<PathBuf>, data_root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            data_root: data_root.into(),
            item_timeout_secs: None,
            log_level: "info".to_string(),
        }
    }

    fn spawn(&self) -> Result<Child, ClientError> {
        let mut command = Command::new(&self.binary);
        command
            .env(ENV_DATA_ROOT, &self.data_root)
            .env(ENV_LOG, &self.log_level)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(secs) = self.item_timeout_secs {
            command.env(ENV_ITEM_TIMEOUT_SECS, secs.to_string());
        }
        command.spawn().map_err(ClientError::Spawn)
    }
}

type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    handlers: HashMap<u64, EventHandler>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Returned by [`WorkerClient::on_event`]. The handler stays registered
/// until [`unsubscribe`](Self::unsubscribe) is called or this is dropped.
pub struct EventSubscription {
    listeners: Weak<Mutex<Listeners>>,
    id: u64,
    active: AtomicBool,
}

impl EventSubscription {
    /// Idempotent.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).handlers.remove(&self.id);
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

type PendingMap = Mutex<HashMap<String, oneshot::Sender<Result<Value, ClientError>>>>;

/// One live pipe to a worker.
struct Connection {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Arc<PendingMap>,
    exited: Arc<AtomicBool>,
    max_frame_bytes: usize,
}

impl Connection {
    fn start<R, W>(
        reader: R,
        writer: W,
        child: Option<Child>,
        listeners: Arc<Mutex<Listeners>>,
        max_frame_bytes: usize,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let exited = Arc::new(AtomicBool::new(false));

        tokio::spawn(read_loop(
            reader,
            child,
            pending.clone(),
            exited.clone(),
            listeners,
            max_frame_bytes,
        ));

        Arc::new(Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            exited,
            max_frame_bytes,
        })
    }

    fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    async fn request(&self, request: Request, timeout: Duration) -> Result<Value, ClientError> {
        let frame = encode_frame(&request, self.max_frame_bytes)
            .map_err(|e| ClientError::Encode(e.to_string()))?;
        let id = request.id.clone();

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);
        if self.is_exited() {
            lock(&self.pending).remove(&id);
            return Err(ClientError::WorkerExited);
        }

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&frame).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            debug!(error = %e, "worker pipe closed");
            lock(&self.pending).remove(&id);
            return Err(ClientError::WorkerExited);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::WorkerExited),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(ClientError::Timeout {
                    method: request.method,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

async fn read_loop<R>(
    reader: R,
    child: Option<Child>,
    pending: Arc<PendingMap>,
    exited: Arc<AtomicBool>,
    listeners: Arc<Mutex<Listeners>>,
    max_frame_bytes: usize,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "worker pipe failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match decode_frame::<WorkerMessage>(&line, max_frame_bytes) {
            Ok(WorkerMessage::Event(event)) => {
                let handlers: Vec<EventHandler> = lock(&listeners).handlers.values().cloned().collect();
                for handler in handlers {
                    handler(&event);
                }
            }
            Ok(WorkerMessage::Response(response)) => {
                let waiter = lock(&pending).remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let result = response.into_result().map_err(|e| ClientError::Remote {
                            message: e.message,
                            stack: e.stack,
                        });
                        let _ = tx.send(result);
                    }
                    None => debug!(id = %response.id, "response for unknown or expired call"),
                }
            }
            Err(e) => warn!(error = %e, "undecodable frame from worker"),
        }
    }

    exited.store(true, Ordering::SeqCst);
    let waiters: Vec<_> = lock(&pending).drain().map(|(_, tx)| tx).collect();
    for tx in waiters {
        let _ = tx.send(Err(ClientError::WorkerExited));
    }

    if let Some(mut child) = child {
        match child.wait().await {
            Ok(status) => info!(%status, "worker exited"),
            Err(e) => warn!(error = %e, "failed to reap worker"),
        }
    }
}

/// Owns at most one live worker connection at a time.
pub struct WorkerClient {
    command: Option<WorkerCommand>,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
    listeners: Arc<Mutex<Listeners>>,
    max_frame_bytes: usize,
}

impl WorkerClient {
    /// A client that spawns `command` on first use.
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command: Some(command),
            connection: tokio::sync::Mutex::new(None),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// A client over an existing pipe. Once the pipe closes, calls fail with
    /// [`ClientError::WorkerExited`]; there is nothing to respawn.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let listeners = Arc::new(Mutex::new(Listeners::default()));
        let connection = Connection::start(
            reader,
            writer,
            None,
            listeners.clone(),
            DEFAULT_MAX_FRAME_BYTES,
        );
        Self {
            command: None,
            connection: tokio::sync::Mutex::new(Some(connection)),
            listeners,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub async fn call(&self, call: Call, timeout: Duration) -> Result<Value, ClientError> {
        let request = call
            .into_request(Uuid::new_v4().to_string())
            .map_err(|e| ClientError::Encode(e.to_string()))?;
        self.send(request, timeout).await
    }

    /// [`call`](Self::call), decoding the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        call: Call,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let value = self.call(call, timeout).await?;
        serde_json::from_value(value).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Send an arbitrary method name, bypassing the typed [`Call`] table.
    pub async fn call_method(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let request = Request {
            id: Uuid::new_v4().to_string(),
            method: method.to_string(),
            params,
        };
        self.send(request, timeout).await
    }

    /// Register `handler` for every event the worker pushes, across respawns.
    pub fn on_event<F>(&self, handler: F) -> EventSubscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.handlers.insert(id, Arc::new(handler));
        EventSubscription {
            listeners: Arc::downgrade(&self.listeners),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Drop the current connection. The worker sees its input close and
    /// exits; the next call spawns a new one.
    pub async fn shutdown(&self) {
        self.connection.lock().await.take();
    }

    async fn send(&self, request: Request, timeout: Duration) -> Result<Value, ClientError> {
        let connection = self.connection().await?;
        connection.request(request, timeout).await
    }

    async fn connection(&self) -> Result<Arc<Connection>, ClientError> {
        let mut slot = self.connection.lock().await;
        if let Some(existing) = slot.as_ref() {
            if !existing.is_exited() || self.command.is_none() {
                return Ok(existing.clone());
            }
        }
        let Some(command) = &self.command else {
            return Err(ClientError::WorkerExited);
        };

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            ClientError::Spawn(std::io::Error::other("worker stdin not captured"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ClientError::Spawn(std::io::Error::other("worker stdout not captured"))
        })?;
        info!(binary = %command.binary.display(), pid = child.id().unwrap_or_default(), "spawned worker");

        let connection = Connection::start(
            stdout,
            stdin,
            Some(child),
            self.listeners.clone(),
            self.max_frame_bytes,
        );
        *slot = Some(connection.clone());
        Ok(connection)
    }
}
