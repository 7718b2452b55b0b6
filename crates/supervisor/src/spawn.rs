//! Starts one worker slot: re-execs the current binary in `--role worker`
//! mode, wires up the IPC reader and writer tasks, and sends the initial
//! `config` message. See DESIGN.md for why re-exec-and-pipe replaces a raw
//! `fork(2)`.

use std::process::Stdio;

use ipc::{IpcReader, IpcWriter, ToMaster, ToWorker};
use tokio::{process::Command, sync::mpsc};

use crate::{events::SupervisorEvent, record::WorkerRecord};

/// Everything `spawn_worker` starts that the caller doesn't need a handle to
/// beyond the [`WorkerRecord`] itself.
pub(crate) fn spawn_worker(
    worker_id: u32,
    config: &serde_json::Value,
    events_tx: mpsc::Sender<SupervisorEvent>,
) -> std::io::Result<WorkerRecord> {
    let exe = std::env::current_exe()?;

    let mut child = Command::new(exe)
        .arg("--role")
        .arg("worker")
        .arg("--worker-id")
        .arg(worker_id.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(false)
        .spawn()?;

    let pid = child.id().unwrap_or(0);
    let stdin = child.stdin.take().expect("piped stdin");
    let stdout = child.stdout.take().expect("piped stdout");

    let (to_worker_tx, to_worker_rx) = mpsc::channel::<ToWorker>(64);
    let _ = tokio::spawn(run_writer(stdin, to_worker_rx));

    let reader_events_tx = events_tx.clone();
    let _ = tokio::spawn(run_reader(worker_id, stdout, reader_events_tx));

    let (force_kill_tx, force_kill_rx) = mpsc::channel::<()>(1);
    let _ = tokio::spawn(run_exit_watcher(worker_id, child, force_kill_rx, events_tx));

    // Send the initial configuration immediately, before installing any
    // other listener.
    if to_worker_tx
        .try_send(ToWorker::Config {
            config: config.clone(),
        })
        .is_err()
    {
        tracing::error!(worker_id, "failed to queue initial config for new worker");
    }

    Ok(WorkerRecord {
        worker_id,
        pid,
        last_heartbeat_at: None,
        status: None,
        killed: false,
        to_worker: Some(to_worker_tx),
        force_kill: force_kill_tx,
        kill_timer: None,
    })
}

async fn run_writer(stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<ToWorker>) {
    let mut writer: IpcWriter<_, ToWorker> = IpcWriter::new(stdin);
    while let Some(message) = rx.recv().await {
        if let Err(err) = writer.send(&message).await {
            tracing::debug!(error = %err, "failed to send message to worker");
        }
    }
    // Dropping `writer` here closes the child's stdin: the kill protocol's
    // graceful "disconnect" request is implemented by letting this task end.
}

async fn run_reader(worker_id: u32, stdout: tokio::process::ChildStdout, events_tx: mpsc::Sender<SupervisorEvent>) {
    let mut reader: IpcReader<_, ToMaster> = IpcReader::new(stdout);
    loop {
        match reader.recv().await {
            Ok(message) => {
                if events_tx.send(SupervisorEvent::FromWorker { worker_id, message }).await.is_err() {
                    return;
                }
            }
            Err(ipc::Error::Closed) => return,
            Err(err) => {
                tracing::debug!(worker_id, error = %err, "ipc read error from worker");
                return;
            }
        }
    }
}

async fn run_exit_watcher(
    worker_id: u32,
    mut child: tokio::process::Child,
    mut force_kill_rx: mpsc::Receiver<()>,
    events_tx: mpsc::Sender<SupervisorEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = force_kill_rx.recv() => {
            if let Err(err) = child.start_kill() {
                tracing::debug!(worker_id, error = %err, "failed to send SIGKILL");
            }
            child.wait().await.ok()
        }
    };

    let _ = events_tx.send(SupervisorEvent::WorkerExited { worker_id, status }).await;
}
