//! End-to-end tests against the `supd` binary itself, covering the
//! degenerate single-process mode, the clustered master/worker mode,
//! externally-initiated worker death, rolling restart, and the
//! first-worker crash-loop budget (spec.md §8 scenarios 1 through 5),
//! using the in-tree `echo_service` demo module as the services under
//! test.

mod common;

use std::time::Duration;

use common::{
    free_tcp_port, http_get, send_signal, spawn_supd, wait_for_pid_change, wait_for_pidfile, wait_for_port, write_config,
};

/// `num_workers: 0` runs the service directly in the `supd` process with no
/// forking at all; a GET against the configured port must still see a
/// plain 200 with body `ok\n`.
#[tokio::test]
async fn degenerate_mode_serves_simple_server() {
    let port = free_tcp_port();
    let config_path = write_config(&format!(
        "num_workers: 0\nservices:\n  - name: s\n    module: simple_server\n    conf:\n      port: {port}\n"
    ));

    let mut child = spawn_supd(&config_path);

    wait_for_port(port, Duration::from_secs(5)).await;
    let response = http_get(port).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "unexpected response: {response}");
    assert!(response.ends_with("ok\n"), "unexpected response body: {response}");

    child.start_kill().expect("failed to terminate supd under test");
    let _ = child.wait().await;
}

/// `num_workers: 1` forks exactly one worker; the service it hosts must be
/// reachable the same way as in degenerate mode, proving the fork/IPC/
/// startup-gate path actually gets a worker all the way to serving traffic.
#[tokio::test]
async fn clustered_mode_serves_simple_server_through_one_worker() {
    let port = free_tcp_port();
    let config_path = write_config(&format!(
        "num_workers: 1\nworker_heartbeat_timeout_ms: 2000\nservices:\n  - name: s\n    module: simple_server\n    conf:\n      port: {port}\n"
    ));

    let mut child = spawn_supd(&config_path);

    wait_for_port(port, Duration::from_secs(5)).await;
    let response = http_get(port).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "unexpected response: {response}");
    assert!(response.ends_with("ok\n"), "unexpected response body: {response}");

    child.start_kill().expect("failed to terminate supd under test");
    let _ = child.wait().await;
}

/// An empty `services` list is a hard configuration error (spec.md §9 open
/// question, resolved in DESIGN.md): the master must exit 1 without ever
/// binding anything.
#[tokio::test]
async fn empty_services_exits_with_code_one() {
    let config_path = write_config("num_workers: 0\nservices: []\n");

    let mut child = spawn_supd(&config_path);
    let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .expect("supd did not exit promptly on a configuration error")
        .expect("failed to wait on supd process");

    assert_eq!(status.code(), Some(1));
}

/// spec.md §8 scenario 3: killing one worker out from under the master with
/// an external `SIGKILL` must not shrink the pool — within a bounded window
/// the same slot is occupied by a new process with a different pid. Uses the
/// `pidfile` demo module instead of `simple_server` because every worker
/// would otherwise race to bind the same configured port.
#[tokio::test]
async fn worker_killed_externally_is_respawned_with_a_new_pid() {
    let dir = tempfile::tempdir().expect("failed to create temporary pidfile directory");
    let dir_path = dir.path().display();
    let config_path = write_config(&format!(
        "num_workers: 2\nworker_heartbeat_timeout_ms: 2000\nservices:\n  - name: s\n    module: pidfile\n    conf:\n      dir: \"{dir_path}\"\n"
    ));

    let mut child = spawn_supd(&config_path);

    let worker1_pidfile = dir.path().join("worker-1.pid");
    let worker2_pidfile = dir.path().join("worker-2.pid");
    let original_pid1 = wait_for_pidfile(&worker1_pidfile, Duration::from_secs(5)).await;
    let original_pid2 = wait_for_pidfile(&worker2_pidfile, Duration::from_secs(5)).await;

    send_signal(original_pid1, "KILL").await;

    let replaced_pid1 = wait_for_pid_change(&worker1_pidfile, original_pid1, Duration::from_secs(5)).await;
    assert_ne!(replaced_pid1, original_pid1);

    // The sibling slot was never touched.
    let still_pid2 = std::fs::read_to_string(&worker2_pidfile)
        .expect("worker 2's pidfile disappeared")
        .trim()
        .parse::<u32>()
        .expect("worker 2's pidfile did not contain a pid");
    assert_eq!(still_pid2, original_pid2);

    child.start_kill().expect("failed to terminate supd under test");
    let _ = child.wait().await;
}

/// spec.md §8 scenario 4: `SIGHUP` to the master must cycle every worker
/// through the kill protocol one at a time, ending with a pid set wholly
/// disjoint from the one that preceded the reload.
#[tokio::test]
async fn sighup_rolling_restarts_every_worker() {
    let dir = tempfile::tempdir().expect("failed to create temporary pidfile directory");
    let dir_path = dir.path().display();
    let config_path = write_config(&format!(
        "num_workers: 2\nworker_heartbeat_timeout_ms: 2000\nservices:\n  - name: s\n    module: pidfile\n    conf:\n      dir: \"{dir_path}\"\n"
    ));

    let mut child = spawn_supd(&config_path);
    let master_pid = child.id().expect("spawned supd process has no pid");

    let worker1_pidfile = dir.path().join("worker-1.pid");
    let worker2_pidfile = dir.path().join("worker-2.pid");
    let original_pid1 = wait_for_pidfile(&worker1_pidfile, Duration::from_secs(5)).await;
    let original_pid2 = wait_for_pidfile(&worker2_pidfile, Duration::from_secs(5)).await;

    send_signal(master_pid, "HUP").await;

    let new_pid1 = wait_for_pid_change(&worker1_pidfile, original_pid1, Duration::from_secs(10)).await;
    let new_pid2 = wait_for_pid_change(&worker2_pidfile, original_pid2, Duration::from_secs(10)).await;

    assert_ne!(new_pid1, original_pid1);
    assert_ne!(new_pid2, original_pid2);
    assert_ne!(new_pid1, new_pid2, "the two restarted slots must not collide on a pid");

    child.start_kill().expect("failed to terminate supd under test");
    let _ = child.wait().await;
}

/// spec.md §8 scenario 5: a service factory that fails synchronously on
/// every attempt exhausts the first-worker startup budget (three strikes)
/// and the master exits 1.
#[tokio::test]
async fn first_worker_crash_loop_exits_with_code_one() {
    let config_path = write_config("num_workers: 1\nservices:\n  - name: s\n    module: always_fail\n");

    let mut child = spawn_supd(&config_path);
    let status = tokio::time::timeout(Duration::from_secs(8), child.wait())
        .await
        .expect("supd did not exit promptly after exhausting the first-worker startup budget")
        .expect("failed to wait on supd process");

    assert_eq!(status.code(), Some(1));
}
