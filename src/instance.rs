use std::fmt;
use std::fs;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::Deserialize;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

use crate::builder::CommandBuilder;
use crate::cancel::CancelToken;
use crate::config::{generate_name, VmConfig};
use crate::error::{Error, Result};
use crate::locate::locate_qemu;
use crate::qmp::{QmpClient, QmpEvent};
use crate::state::VmState;

/// How long a freshly spawned QEMU gets to create its control socket.
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
/// Cadence of liveness polls during socket waits, graceful stops, and waits
/// on attached processes.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Grace period between observing the `Shutdown` state and expecting the
/// process to be gone.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

type StateCallback = Box<dyn Fn(VmState) + Send + Sync>;

/// A supervised QEMU instance: either spawned by this process or attached
/// to an already-running hypervisor.
///
/// Spawned instances own the child's process group and the control socket
/// file; attached instances borrow both and never signal or delete what they
/// do not own (except through an explicit [`force_stop`]).
///
/// The instance is cheap to clone through its interior `Arc` and safe to
/// share across threads.
///
/// [`force_stop`]: Instance::force_stop
pub struct Instance {
    inner: Arc<InstanceInner>,
}

struct InstanceInner {
    name: String,
    socket_path: PathBuf,
    /// True when this process spawned QEMU: it then owns the process group
    /// and created the socket file.
    spawned: bool,
    pid: Mutex<Option<i32>>,
    child: Mutex<Option<Child>>,
    qmp: Mutex<Option<Arc<QmpClient>>>,
    state: RwLock<VmState>,
    on_state: Mutex<Option<StateCallback>>,
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InstanceInner {
    fn set_state(&self, state: VmState) {
        let changed = {
            let mut current = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let old = *current;
            *current = state;
            old != state
        };
        if changed {
            if let Some(callback) = lock_ignoring_poison(&self.on_state).as_ref() {
                callback(state);
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    status: String,
    #[serde(default)]
    running: bool,
}

impl Instance {
    /// Launches a new QEMU process for `config` and connects its control
    /// socket.
    ///
    /// The child runs with its working directory set to `/`, null stdio, and
    /// its own process group so [`force_stop`] can signal every helper it
    /// forks. If the socket does not accept connections within ten seconds,
    /// or the QMP handshake fails, the child is killed and the error
    /// returned.
    ///
    /// [`force_stop`]: Instance::force_stop
    pub fn start(config: &VmConfig) -> Result<Instance> {
        Self::start_with_cancel(config, &CancelToken::new())
    }

    pub fn start_with_cancel(config: &VmConfig, cancel: &CancelToken) -> Result<Instance> {
        config.validate()?;

        let name = if config.name.is_empty() {
            generate_name()
        } else {
            config.name.clone()
        };

        let qemu_path = locate_qemu(&config.arch, config.qemu_path.as_deref())?;
        let socket_dir = config.ensure_socket_dir()?;
        let socket_path = socket_dir.join(format!("{name}.sock"));
        // A previous instance of the same name may have died uncleanly.
        let _ = fs::remove_file(&socket_path);

        let args = CommandBuilder::new(config).build(&name, &socket_path.to_string_lossy());
        debug!("starting {} as `{name}`", qemu_path.display());

        let mut command = Command::new(&qemu_path);
        command
            .args(&args)
            .current_dir("/")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // New process group, so the whole family can be signalled at once.
        unsafe {
            command.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|err| Error::spawn(format!("failed to start QEMU: {err}")))?;
        let pid = child.id() as i32;

        if let Err(err) = wait_for_socket(&socket_path, SOCKET_WAIT_TIMEOUT, cancel) {
            kill_and_reap(pid, &mut child);
            return Err(err);
        }

        let qmp = match QmpClient::connect(&socket_path) {
            Ok(qmp) => qmp,
            Err(err) => {
                kill_and_reap(pid, &mut child);
                return Err(err);
            }
        };

        let inner = Arc::new(InstanceInner {
            name,
            socket_path,
            spawned: true,
            pid: Mutex::new(Some(pid)),
            child: Mutex::new(Some(child)),
            qmp: Mutex::new(Some(Arc::clone(&qmp))),
            state: RwLock::new(VmState::Prelaunch),
            on_state: Mutex::new(None),
        });
        install_state_bridge(&inner, &qmp);

        let instance = Instance { inner };
        // Seed the state; events keep it current if the query races startup.
        if let Err(err) = instance.query_state() {
            debug!("initial query-status failed: {err}");
        }
        Ok(instance)
    }

    /// Attaches to a running instance through its control socket. The
    /// instance name is derived from the socket file name.
    pub fn attach(socket_path: impl AsRef<Path>) -> Result<Instance> {
        let socket_path = socket_path.as_ref();
        fs::metadata(socket_path)
            .map_err(|err| Error::transport(format!("socket not found: {err}")))?;
        let name = name_from_socket(socket_path);
        Self::attach_inner(socket_path.to_path_buf(), name, None)
    }

    /// Attaches to a running instance by pid.
    ///
    /// The control socket is discovered from the process's argument vector:
    /// the first `-chardev socket,...` whose id mentions `monitor` or `qmp`
    /// names the path. A `-name` argument, when present, overrides the
    /// instance name.
    pub fn attach_pid(pid: i32) -> Result<Instance> {
        let argv = process_argv(pid)?;
        let socket = find_socket_from_args(&argv);
        if socket.is_empty() {
            return Err(Error::transport(
                "could not find QMP control socket in process arguments",
            ));
        }
        let socket_path = PathBuf::from(socket);
        fs::metadata(&socket_path)
            .map_err(|err| Error::transport(format!("socket not found: {err}")))?;

        let name =
            name_from_args(&argv).unwrap_or_else(|| name_from_socket(&socket_path));
        Self::attach_inner(socket_path, name, Some(pid))
    }

    fn attach_inner(socket_path: PathBuf, name: String, pid: Option<i32>) -> Result<Instance> {
        let qmp = QmpClient::connect(&socket_path)?;

        let inner = Arc::new(InstanceInner {
            name,
            socket_path,
            spawned: false,
            pid: Mutex::new(pid),
            child: Mutex::new(None),
            qmp: Mutex::new(Some(Arc::clone(&qmp))),
            state: RwLock::new(VmState::Unknown),
            on_state: Mutex::new(None),
        });
        install_state_bridge(&inner, &qmp);

        let instance = Instance { inner };
        if let Err(err) = instance.query_state() {
            debug!("initial query-status failed: {err}");
        }
        Ok(instance)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pid(&self) -> Option<i32> {
        *lock_ignoring_poison(&self.inner.pid)
    }

    pub fn socket_path(&self) -> &Path {
        &self.inner.socket_path
    }

    /// Last observed VM state.
    pub fn state(&self) -> VmState {
        *self
            .inner
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The live transport, for commands this crate does not wrap. `None`
    /// after the instance has been closed.
    pub fn qmp(&self) -> Option<Arc<QmpClient>> {
        lock_ignoring_poison(&self.inner.qmp).clone()
    }

    pub(crate) fn transport(&self) -> Result<Arc<QmpClient>> {
        self.qmp().ok_or(Error::NotConnected)
    }

    /// Registers a callback fired on every observed state change, without
    /// any instance lock held.
    pub fn set_state_callback(&self, callback: impl Fn(VmState) + Send + Sync + 'static) {
        *lock_ignoring_poison(&self.inner.on_state) = Some(Box::new(callback));
    }

    /// Registers a callback fired from the transport's reader thread for
    /// every QMP event.
    pub fn set_event_callback(&self, callback: impl Fn(&QmpEvent) + Send + Sync + 'static) {
        if let Some(qmp) = self.qmp() {
            qmp.set_event_callback(callback);
        }
    }

    /// Next buffered event, if any. See [`QmpClient::poll_event`] for the
    /// buffering contract.
    pub fn poll_event(&self) -> Option<QmpEvent> {
        self.qmp().and_then(|qmp| qmp.poll_event())
    }

    pub fn wait_event(&self, timeout: Duration) -> Option<QmpEvent> {
        self.qmp().and_then(|qmp| qmp.wait_event(timeout))
    }

    /// Queries QEMU for its run state and publishes the result.
    pub fn query_state(&self) -> Result<VmState> {
        let qmp = self.transport()?;
        let reply = qmp.execute("query-status", None)?;
        let status: StatusReply = serde_json::from_value(reply)
            .map_err(|err| Error::transport(format!("malformed query-status reply: {err}")))?;
        debug!(
            "`{}` reports status {} (running={})",
            self.inner.name, status.status, status.running
        );
        let state = VmState::parse(&status.status);
        self.inner.set_state(state);
        Ok(state)
    }

    /// Resumes a paused guest (`cont`).
    pub fn resume(&self) -> Result<()> {
        self.transport()?.execute("cont", None).map(|_| ())
    }

    /// Pauses the guest (`stop`).
    pub fn pause(&self) -> Result<()> {
        self.transport()?.execute("stop", None).map(|_| ())
    }

    /// Hard-resets the guest, like pressing the reset button. The guest gets
    /// no chance to shut down cleanly and the VM keeps running.
    pub fn reset(&self) -> Result<()> {
        self.transport()?.execute("system_reset", None).map(|_| ())
    }

    /// Sends the ACPI power button event and returns immediately. Unlike
    /// [`stop`], this neither waits nor escalates.
    ///
    /// [`stop`]: Instance::stop
    pub fn shutdown(&self) -> Result<()> {
        self.transport()?
            .execute("system_powerdown", None)
            .map(|_| ())
    }

    /// Asks QEMU to exit immediately (`quit`). QEMU may drop the connection
    /// before answering; either way counts as success, and the instance is
    /// cleaned up.
    pub fn quit(&self) -> Result<()> {
        let qmp = self.transport()?;
        let _ = qmp.execute("quit", None);
        self.cleanup();
        Ok(())
    }

    /// Graceful shutdown: sends the ACPI power button event, then waits for
    /// the process to exit or the guest to report `Shutdown` (plus a short
    /// grace period for the process to follow).
    ///
    /// On deadline, cancellation, or a failed powerdown the instance is
    /// force-stopped and the originating error returned. Without a live
    /// transport this degrades to [`force_stop`].
    ///
    /// [`force_stop`]: Instance::force_stop
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        self.stop_with_cancel(timeout, &CancelToken::new())
    }

    pub fn stop_with_cancel(&self, timeout: Duration, cancel: &CancelToken) -> Result<()> {
        let Some(qmp) = self.qmp() else {
            self.force_stop();
            return Ok(());
        };

        if let Err(err) = qmp.execute("system_powerdown", None) {
            self.force_stop();
            return Err(err);
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                self.force_stop();
                return Err(Error::Cancelled);
            }
            thread::sleep(POLL_INTERVAL);

            if !self.is_process_alive() {
                self.cleanup();
                return Ok(());
            }

            if self.state() == VmState::Shutdown {
                // The guest has halted; give the emulator a moment to exit.
                thread::sleep(SHUTDOWN_GRACE);
                if !self.is_process_alive() {
                    self.cleanup();
                    return Ok(());
                }
            }
        }

        self.force_stop();
        Err(Error::Timeout {
            message: format!("graceful shutdown timed out after {timeout:?}"),
        })
    }

    /// Immediately terminates the instance with SIGKILL: the whole process
    /// group for spawned instances, the single pid for attached ones. Never
    /// fails; a process that is already gone is fine.
    pub fn force_stop(&self) {
        let pid = self.pid();
        if self.inner.spawned {
            if let Some(pid) = pid {
                unsafe {
                    libc::kill(-pid, libc::SIGKILL);
                }
            }
            let mut child = lock_ignoring_poison(&self.inner.child);
            if let Some(child) = child.as_mut() {
                let _ = child.kill();
                if let Err(err) = child.wait() {
                    warn!("failed to reap QEMU child: {err}");
                }
            }
        } else if let Some(pid) = pid {
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
        self.cleanup();
    }

    /// Blocks until the process exits. Spawned children are reaped; attached
    /// instances are polled with signal 0.
    pub fn wait(&self) -> Result<()> {
        self.wait_with_cancel(&CancelToken::new())
    }

    pub fn wait_with_cancel(&self, cancel: &CancelToken) -> Result<()> {
        while self.is_process_alive() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            thread::sleep(POLL_INTERVAL);
        }
        self.cleanup();
        Ok(())
    }

    /// Releases the transport and, for spawned instances, the socket file.
    /// Idempotent; the process itself is left alone.
    pub fn close(&self) {
        self.cleanup();
    }

    fn cleanup(&self) {
        {
            let mut qmp = lock_ignoring_poison(&self.inner.qmp);
            if let Some(client) = qmp.take() {
                client.close();
            }
        }
        self.inner.set_state(VmState::Shutdown);
        // Only the creator of the socket file removes it; attached
        // instances must not delete sockets they merely borrowed.
        if self.inner.spawned && !self.inner.socket_path.as_os_str().is_empty() {
            let _ = fs::remove_file(&self.inner.socket_path);
        }
    }

    fn is_process_alive(&self) -> bool {
        {
            let mut child = lock_ignoring_poison(&self.inner.child);
            if let Some(child) = child.as_mut() {
                // try_wait reaps a dead child instead of leaving a zombie
                // that would still answer signal 0.
                return match child.try_wait() {
                    Ok(Some(_)) => false,
                    Ok(None) => true,
                    Err(_) => false,
                };
            }
        }
        match self.pid() {
            Some(pid) => process_alive(pid),
            None => false,
        }
    }
}

impl Clone for Instance {
    fn clone(&self) -> Self {
        Instance {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.inner.name)
            .field("pid", &self.pid())
            .field("socket_path", &self.inner.socket_path)
            .field("spawned", &self.inner.spawned)
            .field("state", &self.state())
            .finish()
    }
}

fn install_state_bridge(inner: &Arc<InstanceInner>, qmp: &QmpClient) {
    let weak: Weak<InstanceInner> = Arc::downgrade(inner);
    qmp.set_state_callback(move |state| {
        if let Some(inner) = weak.upgrade() {
            inner.set_state(state);
        }
    });
}

/// Signal-0 liveness probe. EPERM still means the process exists.
pub(crate) fn process_alive(pid: i32) -> bool {
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn kill_and_reap(pid: i32, child: &mut Child) {
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn wait_for_socket(path: &Path, timeout: Duration, cancel: &CancelToken) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Ok(stream) = UnixStream::connect(path) {
            drop(stream);
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL);
    }
    Err(Error::spawn(format!(
        "timed out waiting for control socket {}",
        path.display()
    )))
}

fn name_from_socket(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    file_name
        .strip_suffix(".sock")
        .map(str::to_string)
        .unwrap_or(file_name)
}

fn process_argv(pid: i32) -> Result<Vec<String>> {
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    let process = system
        .process(Pid::from(pid as usize))
        .ok_or_else(|| Error::os(format!("process {pid} not found")))?;
    Ok(process.cmd().to_vec())
}

/// Extracts the QMP control-socket path from a QEMU argument vector: the
/// first `-chardev socket,...` whose id contains `monitor` or `qmp`. Returns
/// an empty string when no such chardev exists.
fn find_socket_from_args(args: &[String]) -> String {
    for window in args.windows(2) {
        if window[0] != "-chardev" {
            continue;
        }
        let chardev = &window[1];
        let Some(options) = chardev.strip_prefix("socket,") else {
            continue;
        };

        let mut is_monitor = false;
        let mut socket_path = "";
        for part in options.split(',') {
            if let Some(path) = part.strip_prefix("path=") {
                socket_path = path;
            }
            if let Some(id) = part.strip_prefix("id=") {
                if id.contains("monitor") || id.contains("qmp") {
                    is_monitor = true;
                }
            }
        }

        if is_monitor && !socket_path.is_empty() {
            return socket_path.to_string();
        }
    }
    String::new()
}

/// Extracts the guest name from a `-name` argument: `guest=<name>[,...]` or
/// a bare token without `=`.
fn name_from_args(args: &[String]) -> Option<String> {
    for window in args.windows(2) {
        if window[0] != "-name" {
            continue;
        }
        let value = &window[1];
        if let Some(rest) = value.strip_prefix("guest=") {
            let name = rest.split(',').next().unwrap_or(rest);
            if !name.is_empty() {
                return Some(name.to_string());
            }
        } else if !value.contains('=') {
            return Some(value.clone());
        }
        break;
    }
    None
}
