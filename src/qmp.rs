use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::mem;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, trace, warn};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::state::VmState;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Events the reader buffers for [`QmpClient::poll_event`] before the
/// channel starts shedding.
const EVENT_BUFFER: usize = 100;

pub type EventCallback = Box<dyn Fn(&QmpEvent) + Send + Sync>;
pub type StateCallback = Box<dyn Fn(VmState) + Send + Sync>;

/// An asynchronous event published by QEMU on the control socket.
#[derive(Debug, Clone)]
pub struct QmpEvent {
    pub name: String,
    pub data: serde_json::Map<String, Value>,
    /// QEMU's own `{seconds, microseconds}` stamp when present, otherwise
    /// the receive time.
    pub timestamp: SystemTime,
}

#[derive(Debug, Deserialize)]
struct QmpMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "return", default)]
    ret: Option<Value>,
    #[serde(default)]
    error: Option<QmpErrorBody>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    timestamp: Option<QmpTimestamp>,
}

#[derive(Debug, Deserialize)]
struct QmpErrorBody {
    class: String,
    desc: String,
}

#[derive(Debug, Deserialize)]
struct QmpTimestamp {
    seconds: i64,
    microseconds: i64,
}

impl QmpTimestamp {
    fn to_system_time(&self) -> SystemTime {
        let seconds = self.seconds.max(0) as u64;
        let micros = self.microseconds.max(0) as u64;
        UNIX_EPOCH + Duration::from_secs(seconds) + Duration::from_micros(micros)
    }
}

/// State shared between the client handle and the reader thread.
struct Shared {
    /// In-flight commands keyed by id. `None` once the connection is closed;
    /// dropping the map fails every waiting caller.
    pending: Mutex<Option<HashMap<String, SyncSender<QmpMessage>>>>,
    on_event: Mutex<Option<EventCallback>>,
    on_state: Mutex<Option<StateCallback>>,
}

/// A QMP connection to one QEMU instance.
///
/// The client multiplexes synchronous request/response commands with the
/// asynchronous event stream over a single Unix socket. Commands are
/// correlated by `cmd-<n>` ids; a dedicated reader thread owns the read side
/// and routes replies to their callers. All methods take `&self` and are
/// safe to call from any thread.
pub struct QmpClient {
    writer: Mutex<Option<UnixStream>>,
    counter: AtomicU64,
    shared: Arc<Shared>,
    events: Mutex<Receiver<QmpEvent>>,
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl QmpClient {
    /// Connects to a QMP server socket, consumes the greeting, starts the
    /// reader, and negotiates capabilities.
    pub fn connect(path: impl AsRef<Path>) -> Result<Arc<QmpClient>> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|err| {
            Error::transport(format!(
                "failed to connect to QMP socket {}: {err}",
                path.display()
            ))
        })?;

        // The greeting must be consumed before the reader exists, and
        // without read-ahead: the server may coalesce the greeting with the
        // next message in one segment, and those bytes belong to the reader.
        let greeting = read_greeting(&stream)?;
        debug!(
            "QMP greeting from {}: version {}",
            path.display(),
            greeting["QMP"]["version"]["qemu"]
        );

        let reader_stream = stream.try_clone().map_err(|err| {
            Error::transport(format!("failed to clone QMP stream: {err}"))
        })?;

        let (event_tx, event_rx) = mpsc::sync_channel(EVENT_BUFFER);
        let shared = Arc::new(Shared {
            pending: Mutex::new(Some(HashMap::new())),
            on_event: Mutex::new(None),
            on_state: Mutex::new(None),
        });

        let client = Arc::new(QmpClient {
            writer: Mutex::new(Some(stream)),
            counter: AtomicU64::new(0),
            shared: Arc::clone(&shared),
            events: Mutex::new(event_rx),
        });

        thread::Builder::new()
            .name("qmp-reader".to_string())
            .spawn(move || read_loop(reader_stream, shared, event_tx))
            .map_err(|err| Error::transport(format!("failed to spawn QMP reader: {err}")))?;

        // Enter command mode. Nothing else may be sent before this reply.
        if let Err(err) = client.execute("qmp_capabilities", None) {
            client.close();
            return Err(err);
        }

        Ok(client)
    }

    /// Sends a command and waits up to 30 seconds for its reply.
    ///
    /// The `return` payload is handed back verbatim; callers decode it as
    /// needed. A server-side `error` object surfaces as [`Error::Qmp`].
    pub fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        self.execute_with_timeout(command, arguments, DEFAULT_COMMAND_TIMEOUT)
    }

    pub fn execute_with_timeout(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let (id, rx) = self.register_pending()?;
        let _guard = PendingGuard {
            shared: self.shared.as_ref(),
            id: &id,
        };

        let line = frame_command(command, arguments, &id);
        self.write_line(&line)?;

        self.await_reply(command, rx, timeout)
    }

    /// Sends a command together with a file descriptor in one `sendmsg`
    /// carrying an `SCM_RIGHTS` control message. The descriptor stays owned
    /// by the caller.
    pub fn execute_with_fd(
        &self,
        command: &str,
        arguments: Option<Value>,
        fd: RawFd,
    ) -> Result<Value> {
        let (id, rx) = self.register_pending()?;
        let _guard = PendingGuard {
            shared: self.shared.as_ref(),
            id: &id,
        };

        let line = frame_command(command, arguments, &id);
        {
            let writer = lock_ignoring_poison(&self.writer);
            let Some(stream) = writer.as_ref() else {
                return Err(Error::transport("connection closed"));
            };
            send_with_fd(stream, line.as_bytes(), fd)
                .map_err(|err| Error::os(format!("sendmsg with SCM_RIGHTS failed: {err}")))?;
        }

        self.await_reply(command, rx, DEFAULT_COMMAND_TIMEOUT)
    }

    /// Next buffered event, if any. The buffer is bounded; when a consumer
    /// lags behind, the newest events are dropped. Consumers that must see
    /// every event should register [`set_event_callback`] instead.
    ///
    /// [`set_event_callback`]: QmpClient::set_event_callback
    pub fn poll_event(&self) -> Option<QmpEvent> {
        lock_ignoring_poison(&self.events).try_recv().ok()
    }

    /// Blocks up to `timeout` for the next buffered event.
    pub fn wait_event(&self, timeout: Duration) -> Option<QmpEvent> {
        lock_ignoring_poison(&self.events).recv_timeout(timeout).ok()
    }

    /// Registers a callback invoked from the reader thread for every event,
    /// after the state mapping has been applied.
    pub fn set_event_callback(&self, callback: impl Fn(&QmpEvent) + Send + Sync + 'static) {
        *lock_ignoring_poison(&self.shared.on_event) = Some(Box::new(callback));
    }

    /// Registers a callback invoked from the reader thread whenever an event
    /// implies a VM state change.
    pub fn set_state_callback(&self, callback: impl Fn(VmState) + Send + Sync + 'static) {
        *lock_ignoring_poison(&self.shared.on_state) = Some(Box::new(callback));
    }

    /// Shuts the connection down. Idempotent; outstanding commands fail
    /// promptly with a transport error.
    pub fn close(&self) {
        let mut writer = lock_ignoring_poison(&self.writer);
        if let Some(stream) = writer.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn is_closed(&self) -> bool {
        lock_ignoring_poison(&self.writer).is_none()
    }

    fn register_pending(&self) -> Result<(String, Receiver<QmpMessage>)> {
        let id = format!("cmd-{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::sync_channel(1);
        let mut pending = lock_ignoring_poison(&self.shared.pending);
        let Some(map) = pending.as_mut() else {
            return Err(Error::transport("connection closed"));
        };
        map.insert(id.clone(), tx);
        Ok((id, rx))
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = lock_ignoring_poison(&self.writer);
        let Some(stream) = writer.as_mut() else {
            return Err(Error::transport("connection closed"));
        };
        stream
            .write_all(line.as_bytes())
            .map_err(|err| Error::transport(format!("failed to write command: {err}")))
    }

    fn await_reply(
        &self,
        command: &str,
        rx: Receiver<QmpMessage>,
        timeout: Duration,
    ) -> Result<Value> {
        match rx.recv_timeout(timeout) {
            Ok(message) => {
                if let Some(error) = message.error {
                    return Err(Error::Qmp {
                        class: error.class,
                        desc: error.desc,
                    });
                }
                Ok(message.ret.unwrap_or(Value::Null))
            }
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout {
                message: format!("command `{command}` timed out after {timeout:?}"),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(Error::transport("connection closed")),
        }
    }
}

impl Drop for QmpClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Removes a pending-table entry on every exit path: reply, timeout, or
/// caller cancellation. Late replies then drop silently in the reader.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = lock_ignoring_poison(&self.shared.pending);
        if let Some(map) = pending.as_mut() {
            map.remove(self.id);
        }
    }
}

fn frame_command(command: &str, arguments: Option<Value>, id: &str) -> String {
    let mut payload = json!({
        "execute": command,
        "id": id,
    });
    if let Some(arguments) = arguments {
        payload["arguments"] = arguments;
    }
    let mut line = payload.to_string();
    line.push('\n');
    line
}

/// Reads the server greeting: exactly one `\n`-terminated line, one byte at
/// a time so no following bytes are consumed.
fn read_greeting(mut stream: &UnixStream) -> Result<Value> {
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        let n = stream
            .read(&mut byte)
            .map_err(|err| Error::transport(format!("failed to read QMP greeting: {err}")))?;
        if n == 0 {
            return Err(Error::transport("connection closed during QMP greeting"));
        }
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
    }

    let greeting: Value = serde_json::from_slice(&buf)
        .map_err(|err| Error::transport(format!("failed to parse QMP greeting: {err}")))?;
    if greeting.get("QMP").is_none() {
        return Err(Error::transport("unexpected QMP greeting"));
    }
    Ok(greeting)
}

fn read_loop(stream: UnixStream, shared: Arc<Shared>, event_tx: SyncSender<QmpEvent>) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                trace!("QMP read loop terminating: {err}");
                break;
            }
        }

        let Ok(message) = serde_json::from_str::<QmpMessage>(&line) else {
            warn!("dropping unparseable QMP line: {}", line.trim_end());
            continue;
        };

        if let Some(id) = message.id.as_deref().filter(|id| !id.is_empty()) {
            let sender = {
                let pending = lock_ignoring_poison(&shared.pending);
                pending.as_ref().and_then(|map| map.get(id).cloned())
            };
            // Unknown ids (timed out or cancelled callers) drop silently;
            // the sink is single-shot and never blocks this thread.
            if let Some(sender) = sender {
                let _ = sender.try_send(message);
            }
        } else if let Some(name) = message.event.filter(|name| !name.is_empty()) {
            let event = QmpEvent {
                timestamp: message
                    .timestamp
                    .as_ref()
                    .map(QmpTimestamp::to_system_time)
                    .unwrap_or_else(SystemTime::now),
                data: message.data.unwrap_or_default(),
                name,
            };

            // State is published before the event is fanned out, so a
            // callback that reads state observes the post-event value.
            if let Some(state) = VmState::from_event(&event.name) {
                let on_state = lock_ignoring_poison(&shared.on_state);
                if let Some(callback) = on_state.as_ref() {
                    callback(state);
                }
            }

            if event_tx.try_send(event.clone()).is_err() {
                trace!("event buffer full, dropping {}", event.name);
            }

            let on_event = lock_ignoring_poison(&shared.on_event);
            if let Some(callback) = on_event.as_ref() {
                callback(&event);
            }
        }
        // Lines with neither id nor event drop silently.
    }

    // Failing the pending map here wakes every outstanding caller with a
    // transport-closed error; the event channel closes with the sender.
    let mut pending = lock_ignoring_poison(&shared.pending);
    *pending = None;
}

fn send_with_fd(stream: &UnixStream, payload: &[u8], fd: RawFd) -> std::io::Result<()> {
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut control = [0u8; 64];

    // Safety: the msghdr points at the iovec and control buffer above, both
    // of which outlive the sendmsg call.
    unsafe {
        let space = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize;
        debug_assert!(space <= control.len());

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);

        let written = libc::sendmsg(stream.as_raw_fd(), &msg, 0);
        if written < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if written as usize != payload.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short sendmsg write",
            ));
        }
    }
    Ok(())
}
