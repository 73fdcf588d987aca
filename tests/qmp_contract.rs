use std::error::Error as StdError;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, UNIX_EPOCH};

use serde_json::{json, Value};
use tempfile::TempDir;

use warden::{CancelToken, Error, Instance, QmpClient, VmConfig, VmState};

const GREETING: &str =
    "{\"QMP\":{\"version\":{\"qemu\":{\"major\":8,\"minor\":2,\"micro\":0}},\"capabilities\":[\"oob\"]}}\n";

type TestResult<T = ()> = Result<T, Box<dyn StdError>>;

/// Binds a socket in a scratch directory and serves exactly one connection
/// with the given behavior.
fn spawn_server<F>(name: &str, handler: F) -> (TempDir, PathBuf, JoinHandle<()>)
where
    F: FnOnce(UnixStream) + Send + 'static,
{
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(format!("{name}.sock"));
    let listener = UnixListener::bind(&path).expect("bind mock socket");
    let handle = thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            handler(stream);
        }
    });
    (dir, path, handle)
}

/// Reads one `\n`-terminated line a byte at a time, so no bytes beyond the
/// line are consumed from the socket.
fn read_line_raw(stream: &mut UnixStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                if buf.is_empty() {
                    return None;
                }
                break;
            }
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                buf.push(byte[0]);
            }
            Err(_) => return None,
        }
    }
    Some(String::from_utf8_lossy(&buf).into_owned())
}

fn parse_command(line: &str) -> (String, String, Value) {
    let value: Value = serde_json::from_str(line).expect("client sends valid JSON");
    let execute = value["execute"].as_str().unwrap_or_default().to_string();
    let id = value["id"].as_str().unwrap_or_default().to_string();
    (execute, id, value)
}

fn read_command(stream: &mut UnixStream) -> Option<(String, String, Value)> {
    read_line_raw(stream).map(|line| parse_command(&line))
}

fn reply(stream: &mut UnixStream, id: &str, ret: Value) {
    let line = format!("{}\n", json!({ "return": ret, "id": id }));
    let _ = stream.write_all(line.as_bytes());
}

fn reply_ok(stream: &mut UnixStream, id: &str) {
    reply(stream, id, json!({}));
}

fn send_event(stream: &mut UnixStream, name: &str, seconds: Option<i64>) {
    let mut event = json!({ "event": name, "data": {} });
    if let Some(seconds) = seconds {
        event["timestamp"] = json!({ "seconds": seconds, "microseconds": 0 });
    }
    let _ = stream.write_all(format!("{event}\n").as_bytes());
}

/// A compliant QMP peer: greeting, capability negotiation, status tracking
/// across stop/cont, events for the transitions, close on quit.
fn standard_session(mut stream: UnixStream) {
    stream.write_all(GREETING.as_bytes()).expect("greeting");
    let mut paused = false;
    while let Some((execute, id, _)) = read_command(&mut stream) {
        match execute.as_str() {
            "query-status" => {
                let status = if paused { "paused" } else { "running" };
                reply(
                    &mut stream,
                    &id,
                    json!({ "status": status, "running": !paused }),
                );
            }
            "stop" => {
                paused = true;
                reply_ok(&mut stream, &id);
                send_event(&mut stream, "STOP", None);
            }
            "cont" => {
                paused = false;
                reply_ok(&mut stream, &id);
                send_event(&mut stream, "RESUME", None);
            }
            "quit" => {
                reply_ok(&mut stream, &id);
                return;
            }
            _ => reply_ok(&mut stream, &id),
        }
    }
}

#[test]
fn handshake_survives_greeting_coalesced_with_the_first_reply() -> TestResult {
    let (_dir, path, handle) = spawn_server("race", |mut stream| {
        // Greeting and the capabilities reply land in one segment. The
        // greeting reader must not swallow any byte of the reply.
        let mut first = Vec::new();
        first.extend_from_slice(GREETING.as_bytes());
        first.extend_from_slice(b"{\"return\":{},\"id\":\"cmd-1\"}\n");
        stream.write_all(&first).expect("coalesced write");

        // Drain the capabilities command, then serve one query.
        let _ = read_line_raw(&mut stream);
        if let Some((execute, id, _)) = read_command(&mut stream) {
            assert_eq!(execute, "query-status");
            reply(&mut stream, &id, json!({ "status": "running", "running": true }));
        }
    });

    let client = QmpClient::connect(&path)?;
    let reply = client.execute("query-status", None)?;
    assert_eq!(reply["status"], "running");

    client.close();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn concurrent_commands_each_receive_their_own_reply() -> TestResult {
    let (_dir, path, handle) = spawn_server("concurrent", |mut stream| {
        stream.write_all(GREETING.as_bytes()).expect("greeting");

        // Capabilities first, sequentially.
        if let Some((_, id, _)) = read_command(&mut stream) {
            reply_ok(&mut stream, &id);
        }

        // Then every command is answered from its own thread after a
        // deterministic pseudo-random delay, echoing the arguments back.
        let writer = Arc::new(Mutex::new(stream.try_clone().expect("clone")));
        let mut workers = Vec::new();
        for n in 0u64.. {
            let Some((_, id, value)) = read_command(&mut stream) else {
                break;
            };
            let writer = Arc::clone(&writer);
            workers.push(thread::spawn(move || {
                thread::sleep(Duration::from_millis((n * 7) % 20));
                let mut stream = writer.lock().unwrap();
                let line = format!(
                    "{}\n",
                    json!({ "return": value["arguments"].clone(), "id": id })
                );
                let _ = stream.write_all(line.as_bytes());
            }));
        }
        for worker in workers {
            let _ = worker.join();
        }
    });

    let client = QmpClient::connect(&path)?;
    let mut callers = Vec::new();
    for n in 0..100u64 {
        let client = Arc::clone(&client);
        callers.push(thread::spawn(move || {
            let reply = client
                .execute_with_timeout(
                    "query-status",
                    Some(json!({ "n": n })),
                    Duration::from_secs(1),
                )
                .expect("command completes within the deadline");
            assert_eq!(reply["n"], n, "reply correlated to the wrong caller");
        }));
    }
    for caller in callers {
        caller.join().unwrap();
    }

    client.close();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn command_timeout_fires_and_late_replies_are_dropped() -> TestResult {
    let (_dir, path, handle) = spawn_server("timeout", |mut stream| {
        stream.write_all(GREETING.as_bytes()).expect("greeting");
        if let Some((_, id, _)) = read_command(&mut stream) {
            reply_ok(&mut stream, &id);
        }

        // Sit on the next command well past the caller's deadline.
        let Some((_, late_id, _)) = read_command(&mut stream) else {
            return;
        };
        thread::sleep(Duration::from_millis(600));
        reply_ok(&mut stream, &late_id);

        // Back to normal service afterwards.
        while let Some((execute, id, _)) = read_command(&mut stream) {
            assert_eq!(execute, "query-status");
            reply(&mut stream, &id, json!({ "status": "running", "running": true }));
        }
    });

    let client = QmpClient::connect(&path)?;

    let issued = Instant::now();
    let result = client.execute_with_timeout("query-status", None, Duration::from_millis(300));
    let elapsed = issued.elapsed();
    match result {
        Err(Error::Timeout { message }) => assert!(message.contains("query-status")),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(300), "returned before the deadline");
    assert!(elapsed < Duration::from_millis(900), "deadline overshot: {elapsed:?}");

    // The late reply for the timed-out id must be discarded without
    // disturbing the next command.
    let reply = client.execute("query-status", None)?;
    assert_eq!(reply["status"], "running");

    client.close();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn pending_commands_fail_promptly_when_the_server_disconnects() -> TestResult {
    let (_dir, path, handle) = spawn_server("disconnect", |mut stream| {
        stream.write_all(GREETING.as_bytes()).expect("greeting");
        if let Some((_, id, _)) = read_command(&mut stream) {
            reply_ok(&mut stream, &id);
        }
        // Read the next command and hang up without answering.
        let _ = read_line_raw(&mut stream);
    });

    let client = QmpClient::connect(&path)?;
    let issued = Instant::now();
    match client.execute_with_timeout("query-status", None, Duration::from_secs(5)) {
        Err(Error::Transport { message }) => assert!(message.contains("connection closed")),
        other => panic!("expected transport error, got {other:?}"),
    }
    assert!(
        issued.elapsed() < Duration::from_secs(2),
        "disconnect was not surfaced promptly"
    );

    handle.join().unwrap();
    Ok(())
}

#[test]
fn qmp_error_replies_carry_class_and_description() -> TestResult {
    let (_dir, path, handle) = spawn_server("error", |mut stream| {
        stream.write_all(GREETING.as_bytes()).expect("greeting");
        if let Some((_, id, _)) = read_command(&mut stream) {
            reply_ok(&mut stream, &id);
        }
        if let Some((_, id, _)) = read_command(&mut stream) {
            let line = format!(
                "{}\n",
                json!({
                    "error": { "class": "DeviceNotFound", "desc": "no such device" },
                    "id": id,
                })
            );
            let _ = stream.write_all(line.as_bytes());
        }
    });

    let client = QmpClient::connect(&path)?;
    match client.execute("device_del", Some(json!({ "id": "ghost" }))) {
        Err(Error::Qmp { class, desc }) => {
            assert_eq!(class, "DeviceNotFound");
            assert_eq!(desc, "no such device");
        }
        other => panic!("expected QMP error, got {other:?}"),
    }

    client.close();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn slow_consumers_lose_the_newest_events() -> TestResult {
    let (_dir, path, handle) = spawn_server("overflow", |mut stream| {
        stream.write_all(GREETING.as_bytes()).expect("greeting");
        if let Some((_, id, _)) = read_command(&mut stream) {
            reply_ok(&mut stream, &id);
        }

        // Flood the fan-out with more events than it buffers, then answer a
        // sync command so the client knows the reader has seen them all.
        for n in 0..150 {
            let event = json!({ "event": "WARDEN_TEST", "data": { "n": n } });
            let _ = stream.write_all(format!("{event}\n").as_bytes());
        }
        while let Some((execute, id, _)) = read_command(&mut stream) {
            assert_eq!(execute, "query-status");
            reply(&mut stream, &id, json!({ "status": "running", "running": true }));
        }
    });

    let client = QmpClient::connect(&path)?;
    client.execute("query-status", None)?;

    let mut received = Vec::new();
    while let Some(event) = client.poll_event() {
        assert_eq!(event.name, "WARDEN_TEST");
        received.push(event.data["n"].as_u64().unwrap());
    }
    // Bounded buffer, drop-newest: the first 100 survive in order.
    assert_eq!(received.len(), 100);
    assert_eq!(received, (0..100).collect::<Vec<_>>());

    client.close();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn events_update_state_before_reaching_callbacks() -> TestResult {
    let (_dir, path, handle) = spawn_server("web01", |mut stream| {
        stream.write_all(GREETING.as_bytes()).expect("greeting");
        for _ in 0..2 {
            // Capabilities, then the attach-time status query.
            if let Some((execute, id, _)) = read_command(&mut stream) {
                if execute == "query-status" {
                    reply(&mut stream, &id, json!({ "status": "running", "running": true }));
                } else {
                    reply_ok(&mut stream, &id);
                }
            }
        }

        // Hold the events until the test has registered its callbacks.
        if let Some((_, id, _)) = read_command(&mut stream) {
            reply_ok(&mut stream, &id);
        }
        for name in ["STOP", "RESUME", "SHUTDOWN"] {
            send_event(&mut stream, name, Some(1_700_000_000));
            thread::sleep(Duration::from_millis(50));
        }

        // Sync point: once this reply arrives, all events were dispatched.
        if let Some((_, id, _)) = read_command(&mut stream) {
            reply(&mut stream, &id, json!({ "status": "shutdown", "running": false }));
        }
    });

    let instance = Instance::attach(&path)?;
    assert_eq!(instance.name(), "web01");
    assert_eq!(instance.state(), VmState::Running);

    let states = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&states);
    instance.set_state_callback(move |state| {
        observed.lock().unwrap().push(state);
    });

    let event_log = Arc::new(Mutex::new(Vec::new()));
    let callback_log = Arc::clone(&event_log);
    let callback_instance = instance.clone();
    instance.set_event_callback(move |event| {
        // The state field must already reflect this event.
        let mapped = VmState::from_event(&event.name);
        let current = callback_instance.state();
        callback_log
            .lock()
            .unwrap()
            .push((event.name.clone(), mapped, current));
    });

    // Go signal for the server, then a second command as the sync point.
    instance.qmp().expect("live transport").execute("trigger-events", None)?;
    instance.query_state()?;

    let callback_states = states.lock().unwrap().clone();
    assert_eq!(
        callback_states,
        vec![VmState::Paused, VmState::Running, VmState::Shutdown],
        "state-change callback sequence"
    );

    for (name, mapped, current) in event_log.lock().unwrap().iter() {
        let mapped = mapped.unwrap_or_else(|| panic!("unexpected event {name}"));
        assert_eq!(*current, mapped, "state lagged behind event {name}");
    }

    // Event timestamps come from the wire when provided.
    let first = instance.poll_event().expect("buffered event");
    assert_eq!(first.name, "STOP");
    assert_eq!(
        first.timestamp,
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    );

    instance.close();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn pause_then_resume_returns_to_the_initial_state() -> TestResult {
    let (_dir, path, handle) = spawn_server("roundtrip", standard_session);

    let instance = Instance::attach(&path)?;
    let initial = instance.state();
    assert_eq!(initial, VmState::Running);

    let (state_tx, state_rx) = mpsc::channel();
    instance.set_state_callback(move |state| {
        let _ = state_tx.send(state);
    });

    instance.pause()?;
    assert_eq!(
        state_rx.recv_timeout(Duration::from_secs(2))?,
        VmState::Paused
    );
    assert_eq!(instance.query_state()?, VmState::Paused);

    instance.resume()?;
    assert_eq!(
        state_rx.recv_timeout(Duration::from_secs(2))?,
        VmState::Running
    );
    assert_eq!(instance.state(), initial);

    instance.quit()?;
    handle.join().unwrap();
    Ok(())
}

#[test]
fn quit_succeeds_even_when_the_server_hangs_up_first() -> TestResult {
    let (_dir, path, handle) = spawn_server("quitter", |mut stream| {
        stream.write_all(GREETING.as_bytes()).expect("greeting");
        for _ in 0..2 {
            if let Some((execute, id, _)) = read_command(&mut stream) {
                if execute == "query-status" {
                    reply(&mut stream, &id, json!({ "status": "running", "running": true }));
                } else {
                    reply_ok(&mut stream, &id);
                }
            }
        }
        // Drop the connection on quit without replying at all.
        let _ = read_line_raw(&mut stream);
    });

    let instance = Instance::attach(&path)?;
    instance.quit()?;

    assert!(instance.qmp().is_none(), "transport must be torn down");
    assert_eq!(instance.state(), VmState::Shutdown);
    // Attached instances never delete a socket file they did not create.
    assert!(path.exists(), "attached cleanup must keep the socket file");

    // Teardown stays idempotent through repeated force stops.
    instance.force_stop();
    instance.force_stop();

    handle.join().unwrap();
    Ok(())
}

#[test]
fn fd_passing_hands_a_live_descriptor_to_the_server() -> TestResult {
    let (_dir, path, handle) = spawn_server("fdpass", |mut stream| {
        stream.write_all(GREETING.as_bytes()).expect("greeting");
        for _ in 0..2 {
            if let Some((execute, id, _)) = read_command(&mut stream) {
                if execute == "query-status" {
                    reply(&mut stream, &id, json!({ "status": "running", "running": true }));
                } else {
                    reply_ok(&mut stream, &id);
                }
            }
        }

        // The getfd command arrives with an SCM_RIGHTS descriptor.
        let (line, fd) = recv_with_fd(&stream);
        let (execute, id, value) = parse_command(&line);
        assert_eq!(execute, "getfd");
        let fd_name = value["arguments"]["fdname"].as_str().unwrap().to_string();
        assert!(fd_name.starts_with("vnc-client-"));
        let fd = fd.expect("descriptor must accompany getfd");

        // Prove the descriptor is live by speaking through it.
        let mut passed = unsafe { <UnixStream as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
        passed.write_all(b"hello").unwrap();
        drop(passed);
        reply_ok(&mut stream, &id);

        if let Some((execute, id, value)) = read_command(&mut stream) {
            assert_eq!(execute, "add_client");
            assert_eq!(value["arguments"]["protocol"], "vnc");
            assert_eq!(value["arguments"]["fdname"], fd_name);
            assert_eq!(value["arguments"]["skipauth"], true);
            reply_ok(&mut stream, &id);
        }
    });

    let instance = Instance::attach(&path)?;

    let (ours, theirs) = UnixStream::pair()?;
    instance.add_vnc_client(&theirs, true)?;
    drop(theirs);

    let mut greeting = [0u8; 5];
    let mut ours = ours;
    ours.set_read_timeout(Some(Duration::from_secs(2)))?;
    ours.read_exact(&mut greeting)?;
    assert_eq!(&greeting, b"hello");

    instance.close();
    handle.join().unwrap();
    Ok(())
}

/// recvmsg wrapper collecting one line of payload plus any SCM_RIGHTS
/// descriptor riding along.
fn recv_with_fd(stream: &UnixStream) -> (String, Option<RawFd>) {
    let mut buf = [0u8; 4096];
    let mut control = [0u8; 64];
    let mut fd = None;

    let received = unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;

        let received = libc::recvmsg(stream.as_raw_fd(), &mut msg, 0);
        assert!(received > 0, "recvmsg failed");

        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                fd = Some(std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
        received as usize
    };

    let line = String::from_utf8_lossy(&buf[..received])
        .trim_end()
        .to_string();
    (line, fd)
}

fn fake_qemu_dir() -> TestResult<TempDir> {
    let dir = tempfile::tempdir()?;
    let binary = dir.path().join("qemu-system-x86_64");
    fs::write(&binary, "#!/bin/sh\nexec sleep 60\n")?;
    let mut permissions = fs::metadata(&binary)?.permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&binary, permissions)?;
    Ok(dir)
}

#[test]
fn start_fails_when_the_control_socket_never_appears() -> TestResult {
    let dir = fake_qemu_dir()?;

    let mut config = VmConfig::default();
    config.name = "no-socket".to_string();
    config.arch = "x86_64".to_string();
    config.qemu_path = Some(dir.path().to_path_buf());
    config.socket_dir = Some(dir.path().join("sockets"));

    let started = Instant::now();
    match Instance::start(&config) {
        Err(Error::Spawn { message }) => {
            assert!(message.contains("timed out waiting for control socket"));
        }
        other => panic!("expected spawn error, got {other:?}"),
    }
    assert!(
        started.elapsed() >= Duration::from_secs(10),
        "gave up before the socket deadline"
    );
    assert!(!dir.path().join("sockets").join("no-socket.sock").exists());
    Ok(())
}

#[test]
fn start_honors_the_cancellation_token() -> TestResult {
    let dir = fake_qemu_dir()?;

    let mut config = VmConfig::default();
    config.name = "cancelled".to_string();
    config.arch = "x86_64".to_string();
    config.qemu_path = Some(dir.path().to_path_buf());
    config.socket_dir = Some(dir.path().join("sockets"));

    let token = CancelToken::new();
    let canceller = token.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        canceller.cancel();
    });

    let started = Instant::now();
    match Instance::start_with_cancel(&config, &token) {
        Err(Error::Cancelled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[test]
fn invalid_configuration_is_rejected_before_any_io() -> TestResult {
    let mut config = VmConfig::default();
    config.memory = Some(warden::MemoryConfig {
        size: 0,
        backend: None,
        mem_lock: false,
    });
    // No qemu override: a config error must win before binary discovery.
    match Instance::start(&config) {
        Err(Error::InvalidConfig { message }) => assert!(message.contains("memory")),
        other => panic!("expected configuration error, got {other:?}"),
    }
    Ok(())
}
