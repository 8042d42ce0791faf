//! In-process [`SessionFactory`] for exercising tunnels and deliveries without sshd.
//!
//! Commands run through the local `sh`, uploads land on the local filesystem and
//! forwards are byte echoes. A connect through a tunnel dials the tunnel listener
//! for real and checks that a probe comes back, so chained tunnels are traversed
//! end to end.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use delivery_spec::{DeliveryError, DeliveryResult, ServerSpec};
use system_utils::process::run_streaming;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;

use crate::session::{
    ConnectTarget, ExecStatus, FileChannel, ForwardChannel, SecureSession, SessionFactory,
};

const PROBE: &[u8] = b"ping";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectRecord {
    pub server_id: String,
    pub addr: String,
    pub through_tunnel: bool,
}

#[derive(Default)]
struct Recorder {
    connects: Vec<ConnectRecord>,
    execs: Vec<(String, String)>,
    uploads: Vec<(String, String)>,
    forwards: Vec<String>,
    closed_sessions: usize,
    failing: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct LoopbackFactory {
    recorder: Arc<Mutex<Recorder>>,
}

impl LoopbackFactory {
    /// Every later connect to `server_id` fails with a connection error.
    pub fn fail_server(&self, server_id: &str) {
        self.lock().failing.insert(server_id.to_string());
    }

    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.lock().connects.clone()
    }

    /// `(server id, command)` in execution order.
    pub fn execs(&self) -> Vec<(String, String)> {
        self.lock().execs.clone()
    }

    /// `(server id, remote path)` of every file channel opened.
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.lock().uploads.clone()
    }

    pub fn forwards(&self) -> Vec<String> {
        self.lock().forwards.clone()
    }

    pub fn closed_sessions(&self) -> usize {
        self.lock().closed_sessions
    }

    fn lock(&self) -> MutexGuard<'_, Recorder> {
        lock(&self.recorder)
    }
}

fn lock(recorder: &Mutex<Recorder>) -> MutexGuard<'_, Recorder> {
    recorder.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl SessionFactory for LoopbackFactory {
    async fn connect(
        &self,
        server: &ServerSpec,
        target: &ConnectTarget,
    ) -> DeliveryResult<Arc<dyn SecureSession>> {
        let failing = {
            let mut recorder = self.lock();
            recorder.connects.push(ConnectRecord {
                server_id: server.id.clone(),
                addr: target.addr(),
                through_tunnel: target.through_tunnel,
            });
            recorder.failing.contains(&server.id)
        };
        if failing {
            return Err(DeliveryError::connection(format!(
                "{}: connection refused",
                server.id
            )));
        }
        let tunnel = if target.through_tunnel {
            Some(probe_tunnel(target).await?)
        } else {
            None
        };
        Ok(Arc::new(LoopbackSession {
            server_id: server.id.clone(),
            recorder: Arc::clone(&self.recorder),
            tunnel: tokio::sync::Mutex::new(tunnel),
            closed: Mutex::new(false),
        }))
    }
}

async fn probe_tunnel(target: &ConnectTarget) -> DeliveryResult<TcpStream> {
    let addr = target.addr();
    let mut stream = TcpStream::connect(&addr)
        .await
        .map_err(|err| DeliveryError::connection(format!("{addr}: {err}")))?;
    stream
        .write_all(PROBE)
        .await
        .map_err(|err| DeliveryError::connection(format!("{addr}: {err}")))?;
    let mut echo = [0u8; PROBE.len()];
    stream
        .read_exact(&mut echo)
        .await
        .map_err(|err| DeliveryError::connection(format!("{addr}: tunnel probe failed: {err}")))?;
    if echo != PROBE {
        return Err(DeliveryError::connection(format!(
            "{addr}: tunnel probe returned unexpected bytes"
        )));
    }
    Ok(stream)
}

struct LoopbackSession {
    server_id: String,
    recorder: Arc<Mutex<Recorder>>,
    tunnel: tokio::sync::Mutex<Option<TcpStream>>,
    closed: Mutex<bool>,
}

#[async_trait]
impl SecureSession for LoopbackSession {
    async fn execute(&self, command: &str) -> DeliveryResult<ExecStatus> {
        lock(&self.recorder)
            .execs
            .push((self.server_id.clone(), command.to_string()));
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        let status = run_streaming(&mut cmd, &self.server_id)
            .await
            .map_err(|err| DeliveryError::transfer(format!("{err:#}")))?;
        Ok(ExecStatus {
            code: status.code(),
        })
    }

    async fn open_file_channel(
        &self,
        remote_path: &str,
        _mode: u32,
    ) -> DeliveryResult<FileChannel> {
        lock(&self.recorder)
            .uploads
            .push((self.server_id.clone(), remote_path.to_string()));
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("cat > \"$1\"")
            .arg("upload")
            .arg(Path::new(remote_path))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|err| DeliveryError::transfer(format!("failed to open {remote_path}: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DeliveryError::transfer("upload stdin unavailable"))?;
        let path = remote_path.to_string();
        let closed = tokio::spawn(async move {
            let status = child
                .wait()
                .await
                .map_err(|err| DeliveryError::transfer(format!("upload of {path} failed: {err}")))?;
            if status.success() {
                Ok(())
            } else {
                Err(DeliveryError::transfer(format!(
                    "upload of {path} exited with {status}"
                )))
            }
        });
        Ok(FileChannel::new(Box::new(stdin), closed))
    }

    async fn open_forward(&self, host: &str, port: u16) -> DeliveryResult<ForwardChannel> {
        lock(&self.recorder).forwards.push(format!("{host}:{port}"));
        let (local, remote) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(remote);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
            let _ = writer.shutdown().await;
        });
        Ok(Box::new(local))
    }

    async fn close(&self) {
        {
            let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
            if *closed {
                return;
            }
            *closed = true;
        }
        self.tunnel.lock().await.take();
        lock(&self.recorder).closed_sessions += 1;
    }
}
