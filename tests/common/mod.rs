//! Shared harness for the root-level integration tests: spawns the `supd`
//! binary itself (the teacher's own `tests/common/mod.rs` spawns a raw TCP
//! test server the same way) against a generated configuration file, and
//! gives callers a small set of polling helpers instead of fixed sleeps.

use std::{
    io::Write,
    net::{Ipv4Addr, SocketAddrV4, TcpListener as StdTcpListener},
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    process::{Child, Command},
    time::Instant,
};

/// Finds a currently-free TCP port on loopback. There is an inherent race
/// between this call and the caller actually binding the port, but it is
/// the same approach the teacher's own test harness uses
/// (`available_tcp_ports`) and is good enough for a single-process test
/// suite.
pub fn free_tcp_port() -> u16 {
    StdTcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .expect("failed to bind an ephemeral port to discover a free one")
        .local_addr()
        .expect("bound listener has no local address")
        .port()
}

/// Writes `yaml` to a fresh temporary file and returns its path. The
/// tempfile is intentionally leaked for the test's lifetime (`into_path`)
/// since the `supd` binary needs to read it after this function returns.
pub fn write_config(yaml: &str) -> PathBuf {
    let mut file = tempfile::Builder::new()
        .prefix("supd-test-")
        .suffix(".yaml")
        .tempfile()
        .expect("failed to create temporary config file");
    file.write_all(yaml.as_bytes()).expect("failed to write temporary config file");
    file.into_temp_path().keep().expect("failed to persist temporary config file")
}

/// Spawns `supd` against the given config file.
pub fn spawn_supd(config_path: &PathBuf) -> Child {
    Command::new(env!("CARGO_BIN_EXE_supd"))
        .arg("--config")
        .arg(config_path)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .expect("failed to spawn the supd binary under test")
}

/// Polls `127.0.0.1:port` until a TCP connection succeeds or `timeout`
/// elapses.
pub async fn wait_for_port(port: u16, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("port {port} never became reachable within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Issues a bare-bones HTTP GET against `127.0.0.1:port` and returns the
/// full response text.
pub async fn http_get(port: u16) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap_or_else(|err| panic!("failed to connect to port {port}: {err}"));

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("failed to write request");

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8(response).expect("response was not valid utf-8")
}

/// Sends a POSIX signal (e.g. `"KILL"`, `"HUP"`) to `pid` from outside the
/// process under test, the same way an operator's shell would. Used by tests
/// that exercise externally-initiated worker death or a master-level reload,
/// as opposed to `Child::start_kill`, which only ever targets the `supd`
/// process this harness itself spawned.
pub async fn send_signal(pid: u32, signal: &str) {
    let status = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg(pid.to_string())
        .status()
        .await
        .expect("failed to invoke `kill`");
    assert!(status.success(), "kill -{signal} {pid} did not succeed");
}

/// Polls `path` until it exists and holds a non-empty value, then parses it
/// as the PID it's expected to contain.
pub async fn wait_for_pidfile(path: &std::path::Path, timeout: Duration) -> u32 {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if let Ok(pid) = contents.trim().parse() {
                return pid;
            }
        }
        if Instant::now() >= deadline {
            panic!("pidfile {} never appeared within {timeout:?}", path.display());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Polls `path` until its contents parse to a PID different from
/// `previous_pid`, i.e. the worker slot has been replaced by a new process.
pub async fn wait_for_pid_change(path: &std::path::Path, previous_pid: u32, timeout: Duration) -> u32 {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                if pid != previous_pid {
                    return pid;
                }
            }
        }
        if Instant::now() >= deadline {
            panic!(
                "pidfile {} still held pid {previous_pid} after {timeout:?}",
                path.display()
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
