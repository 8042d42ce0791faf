use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use delivery_spec::{DeliveryError, DeliveryResult, ServerSpec, SocksProxy};
use system_utils::process::{run_command_with_timeout, run_streaming};
use system_utils::ssh::{shell_escape, Askpass};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::session::{
    ConnectTarget, ExecStatus, FileChannel, ForwardChannel, JoinedStream, SecureSession,
    SessionFactory,
};
use crate::socks::{SOCKS_PASSWORD_ENV, SOCKS_USER_ENV};

const SSH_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const SSH_CONNECT_TIMEOUT_SECS: u64 = 10;
const CONTROL_SOCKET_WAIT_INTERVAL: Duration = Duration::from_millis(50);

pub const DEFAULT_MASTER_READY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct SshOptions {
    pub ssh_program: String,
    pub control_dir: PathBuf,
    /// How long to wait for a master connection to authenticate.
    pub ready_timeout: Duration,
    /// Executable providing the `socks-connect` subcommand, run as ssh `ProxyCommand`.
    pub proxy_helper: Option<PathBuf>,
}

impl SshOptions {
    pub fn new(control_dir: PathBuf) -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            control_dir,
            ready_timeout: DEFAULT_MASTER_READY_TIMEOUT,
            proxy_helper: std::env::current_exe().ok(),
        }
    }
}

/// Sessions backed by the system `ssh` client: one ControlMaster per session, with
/// exec, upload and `-W` forwarding multiplexed over its control socket.
pub struct SshSessionFactory {
    options: SshOptions,
}

impl SshSessionFactory {
    pub fn new(options: SshOptions) -> DeliveryResult<Self> {
        std::fs::create_dir_all(&options.control_dir).map_err(|err| {
            DeliveryError::config(format!(
                "failed to create {}: {err}",
                options.control_dir.display()
            ))
        })?;
        Ok(Self { options })
    }
}

#[async_trait]
impl SessionFactory for SshSessionFactory {
    async fn connect(
        &self,
        server: &ServerSpec,
        target: &ConnectTarget,
    ) -> DeliveryResult<Arc<dyn SecureSession>> {
        let ssh = SshTarget::new(server, target, &self.options)?;
        let control_path = control_path_for(&self.options.control_dir);
        info!(
            event = "ssh.connect.start",
            server = %server.id,
            addr = %target.addr(),
            through_tunnel = target.through_tunnel,
            "opening ssh session"
        );
        let mut child = spawn_master(&ssh, &control_path, &self.options)?;
        if let Err(err) =
            wait_for_master(&mut child, &control_path, self.options.ready_timeout, &ssh).await
        {
            let _ = child.kill().await;
            let _ = child.wait().await;
            let _ = std::fs::remove_file(&control_path);
            return Err(err);
        }
        info!(event = "ssh.connect.ready", server = %server.id, "ssh session ready");
        // A master blocked on a full stderr pipe stalls every multiplexed channel.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_master_stderr(server.id.clone(), stderr));
        }
        Ok(Arc::new(SshSession {
            ssh,
            ssh_program: self.options.ssh_program.clone(),
            control_path,
            master: Mutex::new(Some(child)),
        }))
    }
}

pub(crate) struct SshTarget {
    pub(crate) label: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) user: Option<String>,
    pub(crate) identity_file: Option<PathBuf>,
    pub(crate) host_key_alias: Option<String>,
    pub(crate) proxy: Option<(SocksProxy, PathBuf)>,
    pub(crate) ssh_args: Vec<String>,
    pub(crate) ssh_password: Option<String>,
}

impl SshTarget {
    pub(crate) fn new(
        server: &ServerSpec,
        target: &ConnectTarget,
        options: &SshOptions,
    ) -> DeliveryResult<Self> {
        let proxy = match (&server.socks_proxy, target.through_tunnel) {
            (Some(proxy), false) => {
                let helper = options.proxy_helper.clone().ok_or_else(|| {
                    DeliveryError::config(format!(
                        "server {} uses a socks proxy but no proxy helper is available",
                        server.id
                    ))
                })?;
                Some((proxy.clone(), helper))
            }
            (Some(_), true) => {
                warn!(
                    event = "ssh.socks.skipped",
                    server = %server.id,
                    "server is reached through a tunnel, ignoring its socks proxy"
                );
                None
            }
            (None, _) => None,
        };
        Ok(Self {
            label: server.id.clone(),
            host: target.host.clone(),
            port: target.port,
            user: server.credentials.user.clone(),
            identity_file: server.credentials.identity_file.clone(),
            host_key_alias: target.through_tunnel.then(|| server.host.clone()),
            proxy,
            ssh_args: server.ssh_args.clone(),
            ssh_password: server.credentials.password.clone(),
        })
    }

    pub(crate) fn master_args(&self, control_path: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-N".into(),
            "-T".into(),
            "-o".into(),
            "ControlMaster=yes".into(),
            "-o".into(),
            format!("ControlPath={}", control_path.display()),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
            "-o".into(),
            format!("ConnectTimeout={}", SSH_CONNECT_TIMEOUT_SECS),
            "-o".into(),
            "ServerAliveInterval=30".into(),
            "-o".into(),
            "ServerAliveCountMax=3".into(),
        ];
        if self.ssh_password.is_none() {
            args.extend(["-o".into(), "BatchMode=yes".into()]);
        }
        args.extend(["-p".into(), self.port.to_string()]);
        if let Some(user) = self.user.as_ref() {
            args.extend(["-l".into(), user.clone()]);
        }
        if let Some(identity) = self.identity_file.as_ref() {
            args.extend(["-i".into(), identity.display().to_string()]);
        }
        if let Some(alias) = self.host_key_alias.as_ref() {
            args.extend(["-o".into(), format!("HostKeyAlias={alias}")]);
        }
        if let Some((proxy, helper)) = self.proxy.as_ref() {
            args.extend([
                "-o".into(),
                format!(
                    "ProxyCommand={} socks-connect --proxy {} --target %h:%p",
                    shell_escape(&helper.display().to_string()),
                    shell_escape(&proxy.addr())
                ),
            ]);
        }
        args.extend(self.ssh_args.iter().cloned());
        args.push(self.host.clone());
        args
    }
}

fn spawn_master(
    target: &SshTarget,
    control_path: &Path,
    options: &SshOptions,
) -> DeliveryResult<Child> {
    let mut cmd = build_ssh_base(target, &options.ssh_program)?;
    cmd.args(target.master_args(control_path));
    if let Some((proxy, _)) = target.proxy.as_ref() {
        if let Some(user) = proxy.user.as_ref() {
            cmd.env(SOCKS_USER_ENV, user);
        }
        if let Some(password) = proxy.password.as_ref() {
            cmd.env(SOCKS_PASSWORD_ENV, password);
        }
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.spawn().map_err(|err| {
        DeliveryError::connection(format!(
            "failed to start {} for {}: {err}",
            options.ssh_program, target.label
        ))
    })
}

async fn wait_for_master(
    child: &mut Child,
    control_path: &Path,
    ready_timeout: Duration,
    target: &SshTarget,
) -> DeliveryResult<()> {
    let start = Instant::now();
    loop {
        if control_path.exists() {
            return Ok(());
        }
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut stderr = Vec::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_end(&mut stderr).await;
                }
                let detail = format_ssh_failure(
                    &format!("ssh to {} exited with {status}", target.label),
                    &[],
                    &stderr,
                    target.ssh_password.is_some(),
                );
                return Err(DeliveryError::connection(detail));
            }
            Ok(None) => {}
            Err(err) => {
                return Err(DeliveryError::connection(format!(
                    "ssh to {} status check failed: {err}",
                    target.label
                )))
            }
        }
        if start.elapsed() >= ready_timeout {
            return Err(DeliveryError::connection(format!(
                "ssh to {} not ready after {}ms",
                target.label,
                ready_timeout.as_millis()
            )));
        }
        tokio::time::sleep(CONTROL_SOCKET_WAIT_INTERVAL).await;
    }
}

async fn drain_master_stderr(label: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => debug!(
                event = "ssh.master.stderr",
                server = %label,
                line = %String::from_utf8_lossy(&line).trim_end(),
                "ssh master output"
            ),
            Err(err) => {
                debug!(server = %label, error = %err, "ssh master stderr closed");
                break;
            }
        }
    }
}

pub(crate) struct SshSession {
    ssh: SshTarget,
    ssh_program: String,
    control_path: PathBuf,
    master: Mutex<Option<Child>>,
}

impl SshSession {
    fn mux_command(&self) -> Command {
        let mut cmd = Command::new(&self.ssh_program);
        cmd.arg("-S")
            .arg(&self.control_path)
            .arg("-o")
            .arg("ControlMaster=no")
            .arg("-o")
            .arg("BatchMode=yes");
        cmd
    }
}

#[async_trait]
impl SecureSession for SshSession {
    async fn execute(&self, command: &str) -> DeliveryResult<ExecStatus> {
        let mut cmd = self.mux_command();
        cmd.arg("-T").arg(&self.ssh.host).arg(command);
        let status = run_streaming(&mut cmd, "ssh exec")
            .await
            .map_err(|err| DeliveryError::transfer(format!("{err:#}")))?;
        Ok(ExecStatus {
            code: status.code(),
        })
    }

    async fn open_file_channel(
        &self,
        remote_path: &str,
        mode: u32,
    ) -> DeliveryResult<FileChannel> {
        let escaped = shell_escape(remote_path);
        let remote_cmd = format!("cat > {escaped} && chmod {mode:o} {escaped}");
        let mut cmd = self.mux_command();
        cmd.arg("-T")
            .arg(&self.ssh.host)
            .arg(remote_cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|err| {
            DeliveryError::transfer(format!("failed to open upload channel: {err}"))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DeliveryError::transfer("upload channel has no stdin"))?;
        let path = remote_path.to_string();
        let closed = tokio::spawn(async move {
            let output = child
                .wait_with_output()
                .await
                .map_err(|err| DeliveryError::transfer(format!("upload to {path} failed: {err}")))?;
            if output.status.success() {
                Ok(())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(DeliveryError::transfer(format!(
                    "upload to {path} failed: {}",
                    stderr.trim()
                )))
            }
        });
        Ok(FileChannel::new(Box::new(stdin), closed))
    }

    async fn open_forward(&self, host: &str, port: u16) -> DeliveryResult<ForwardChannel> {
        let mut cmd = self.mux_command();
        cmd.arg("-W")
            .arg(format!("{host}:{port}"))
            .arg(&self.ssh.host)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|err| {
            DeliveryError::connection(format!(
                "failed to open forward to {host}:{port} via {}: {err}",
                self.ssh.label
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DeliveryError::connection("forward channel has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeliveryError::connection("forward channel has no stdout"))?;
        debug!(
            event = "ssh.forward.open",
            server = %self.ssh.label,
            dst = %format!("{host}:{port}"),
            "forward channel open"
        );
        Ok(Box::new(JoinedStream::new(stdout, stdin, child)))
    }

    async fn close(&self) {
        let Some(mut child) = self.master.lock().await.take() else {
            return;
        };
        if let Err(err) = exit_master(&self.ssh_program, &self.control_path, &self.ssh.host).await
        {
            debug!(server = %self.ssh.label, error = %err, "ssh -O exit failed");
        }
        match child.try_wait() {
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
        let _ = std::fs::remove_file(&self.control_path);
        info!(event = "ssh.session.closed", server = %self.ssh.label, "ssh session closed");
    }
}

async fn exit_master(ssh_program: &str, control_path: &Path, host: &str) -> anyhow::Result<()> {
    let mut cmd = Command::new(ssh_program);
    cmd.arg("-S")
        .arg(control_path)
        .arg("-O")
        .arg("exit")
        .arg(host);
    let output = run_command_with_timeout(&mut cmd, SSH_COMMAND_TIMEOUT, "ssh -O exit").await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ssh -O exit failed: {}", stderr.trim());
    }
    Ok(())
}

fn build_ssh_base(target: &SshTarget, program: &str) -> DeliveryResult<Command> {
    let mut cmd = Command::new(program);
    if let Some(password) = target.ssh_password.as_ref() {
        info!(
            event = "ssh.auth.askpass",
            server = %target.label,
            "using SSH_ASKPASS for password auth"
        );
        Askpass::install_default()
            .map_err(|err| DeliveryError::connection(format!("{err:#}")))?
            .apply(&mut cmd, password);
    }
    Ok(cmd)
}

fn control_path_for(control_dir: &Path) -> PathBuf {
    let id = uuid::Uuid::new_v4().simple().to_string();
    control_dir.join(format!("{}.sock", &id[..16]))
}

fn format_ssh_failure(label: &str, stdout: &[u8], stderr: &[u8], has_password: bool) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    let detail = format!("{}{}", stdout, stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("; ");
    let mut message = if detail.is_empty() {
        label.to_string()
    } else {
        format!("{label}: {detail}")
    };
    if let Some(hint) = ssh_auth_hint(&detail, has_password) {
        message.push_str(" (");
        message.push_str(hint);
        message.push(')');
    }
    message
}

fn ssh_auth_hint(detail: &str, has_password: bool) -> Option<&'static str> {
    let detail = detail.to_lowercase();
    if detail.contains("keyboard-interactive")
        || detail.contains("verification code")
        || detail.contains("two-factor")
    {
        return Some("keyboard-interactive/2FA is not supported; use SSH key auth");
    }
    if detail.contains("permission denied")
        || detail.contains("authentication failed")
        || detail.contains("no supported authentication methods available")
        || detail.contains("too many authentication failures")
    {
        if has_password {
            return Some("password auth failed; check the server password");
        }
        return Some("authentication failed; configure an SSH key or a password");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SshOptions {
        SshOptions {
            ssh_program: "ssh".to_string(),
            control_dir: PathBuf::from("/tmp/ctl"),
            ready_timeout: DEFAULT_MASTER_READY_TIMEOUT,
            proxy_helper: Some(PathBuf::from("/usr/local/bin/deliver")),
        }
    }

    fn proxy() -> SocksProxy {
        SocksProxy {
            host: "proxy.local".to_string(),
            port: 1080,
            user: Some("alice".to_string()),
            password: Some("secret".to_string()),
        }
    }

    #[test]
    fn direct_master_uses_configured_address_and_key() {
        let mut server = ServerSpec::new("a", "a.example")
            .with_port(2200)
            .with_user("deploy");
        server.credentials.identity_file = Some(PathBuf::from("/keys/id"));
        server.ssh_args = vec!["-o".to_string(), "Compression=yes".to_string()];
        let target = SshTarget::new(&server, &ConnectTarget::direct(&server), &options()).unwrap();
        let args = target.master_args(Path::new("/tmp/ctl/x.sock"));
        let joined = args.join(" ");
        assert!(joined.contains("ControlPath=/tmp/ctl/x.sock"));
        assert!(joined.contains("-p 2200"));
        assert!(joined.contains("-l deploy"));
        assert!(joined.contains("-i /keys/id"));
        assert!(joined.contains("BatchMode=yes"));
        assert!(joined.contains("Compression=yes"));
        assert!(!joined.contains("HostKeyAlias"));
        assert_eq!(args.last().map(String::as_str), Some("a.example"));
    }

    #[test]
    fn password_auth_disables_batch_mode() {
        let mut server = ServerSpec::new("a", "a.example");
        server.credentials.password = Some("pw".to_string());
        let target = SshTarget::new(&server, &ConnectTarget::direct(&server), &options()).unwrap();
        let args = target.master_args(Path::new("/tmp/ctl/x.sock"));
        assert!(!args.iter().any(|arg| arg == "BatchMode=yes"));
        assert!(!args.iter().any(|arg| arg.contains("pw")));
    }

    #[test]
    fn tunneled_master_dials_loopback_with_host_key_alias() {
        let server = ServerSpec::new("b", "b.example").with_socks_proxy(proxy());
        let target = ConnectTarget::tunnel("127.0.0.1:40001".parse().unwrap());
        let ssh = SshTarget::new(&server, &target, &options()).unwrap();
        let args = ssh.master_args(Path::new("/tmp/ctl/x.sock"));
        let joined = args.join(" ");
        assert!(joined.contains("-p 40001"));
        assert!(joined.contains("HostKeyAlias=b.example"));
        assert!(!joined.contains("ProxyCommand"));
        assert_eq!(args.last().map(String::as_str), Some("127.0.0.1"));
    }

    #[test]
    fn socks_proxy_becomes_proxy_command() {
        let server = ServerSpec::new("a", "a.example").with_socks_proxy(proxy());
        let ssh = SshTarget::new(&server, &ConnectTarget::direct(&server), &options()).unwrap();
        let args = ssh.master_args(Path::new("/tmp/ctl/x.sock"));
        let proxy_arg = args
            .iter()
            .find(|arg| arg.starts_with("ProxyCommand="))
            .expect("proxy command");
        assert_eq!(
            proxy_arg,
            "ProxyCommand='/usr/local/bin/deliver' socks-connect --proxy 'proxy.local:1080' --target %h:%p"
        );
        assert!(!proxy_arg.contains("secret"));
    }

    #[test]
    fn socks_proxy_without_helper_is_config_error() {
        let server = ServerSpec::new("a", "a.example").with_socks_proxy(proxy());
        let mut options = options();
        options.proxy_helper = None;
        let err = SshTarget::new(&server, &ConnectTarget::direct(&server), &options)
            .err()
            .expect("error");
        assert!(matches!(err, DeliveryError::Config(_)));
    }

    #[test]
    fn failure_message_is_single_line_with_hint() {
        let message = format_ssh_failure(
            "ssh to a exited with exit status: 255",
            b"",
            b"Warning: added\ndeploy@a.example: Permission denied (publickey).\n",
            false,
        );
        assert!(!message.contains('\n'));
        assert!(message.contains("Permission denied"));
        assert!(message.contains("configure an SSH key"));
    }

    #[test]
    fn no_hint_for_unrelated_errors() {
        assert_eq!(ssh_auth_hint("connection refused", true), None);
        assert!(ssh_auth_hint("Verification code:", false).is_some());
    }

    #[test]
    fn control_paths_are_unique_and_short() {
        let dir = Path::new("/tmp/ctl");
        let first = control_path_for(dir);
        let second = control_path_for(dir);
        assert_ne!(first, second);
        assert!(first.to_string_lossy().len() < 40);
    }

    // Stands in for the system ssh client. `-N` starts a master running `{master}`,
    // `-O exit` removes the control socket, `-W` echoes, anything else runs the
    // last argument through `sh -c`.
    const STUB_SSH: &str = r#"#!/bin/sh
case "$1" in
  -N)
    for arg in "$@"; do
      case "$arg" in
        ControlPath=*) ctl="${arg#ControlPath=}" ;;
      esac
    done
    {master}
    ;;
esac
if [ "$3" = "-O" ]; then
  rm -f "$2"
  exit 0
fi
for arg in "$@"; do
  if [ "$arg" = "-W" ]; then
    exec cat
  fi
done
for last in "$@"; do :; done
exec sh -c "$last"
"#;

    const READY_MASTER: &str = r#"touch "$ctl"; exec sleep 30"#;

    struct StubSsh {
        dir: PathBuf,
        control_dir: PathBuf,
        factory: SshSessionFactory,
    }

    impl StubSsh {
        fn new(master: &str) -> Self {
            use std::os::unix::fs::PermissionsExt;

            let dir = std::env::temp_dir().join(format!(
                "deliver-ssh-{}",
                uuid::Uuid::new_v4().simple()
            ));
            std::fs::create_dir_all(&dir).unwrap();
            let program = dir.join("ssh");
            std::fs::write(&program, STUB_SSH.replace("{master}", master)).unwrap();
            std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
            let control_dir = dir.join("ctl");
            let factory = SshSessionFactory::new(SshOptions {
                ssh_program: program.display().to_string(),
                control_dir: control_dir.clone(),
                ready_timeout: Duration::from_secs(5),
                proxy_helper: None,
            })
            .unwrap();
            Self {
                dir,
                control_dir,
                factory,
            }
        }

        async fn connect(&self) -> DeliveryResult<Arc<dyn SecureSession>> {
            let server = ServerSpec::new("a", "a.example").with_user("deploy");
            self.factory
                .connect(&server, &ConnectTarget::direct(&server))
                .await
        }

        fn control_entries(&self, suffix: &str) -> usize {
            std::fs::read_dir(&self.control_dir)
                .unwrap()
                .filter(|entry| {
                    entry
                        .as_ref()
                        .unwrap()
                        .file_name()
                        .to_string_lossy()
                        .ends_with(suffix)
                })
                .count()
        }
    }

    impl Drop for StubSsh {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    #[tokio::test]
    async fn rejected_handshake_is_connection_error_with_hint() {
        let stub = StubSsh::new(
            r#"echo "deploy@a.example: Permission denied (publickey)." >&2; exit 255"#,
        );
        let err = stub.connect().await.err().expect("handshake error");
        assert!(matches!(err, DeliveryError::Connection(_)), "{err}");
        assert!(err.message().contains("ssh to a exited"), "{err}");
        assert!(err.message().contains("Permission denied"), "{err}");
        assert!(err.message().contains("authentication failed"), "{err}");
        assert_eq!(stub.control_entries(".sock"), 0);
    }

    #[tokio::test]
    async fn master_that_never_becomes_ready_times_out() {
        let stub = StubSsh::new("exec sleep 30");
        let mut options = stub.factory.options.clone();
        options.ready_timeout = Duration::from_millis(200);
        let factory = SshSessionFactory::new(options).unwrap();
        let server = ServerSpec::new("a", "a.example");
        let err = factory
            .connect(&server, &ConnectTarget::direct(&server))
            .await
            .err()
            .expect("ready timeout");
        assert!(matches!(err, DeliveryError::Connection(_)), "{err}");
        assert!(err.message().contains("not ready after 200ms"), "{err}");
    }

    #[tokio::test]
    async fn execute_reports_remote_exit_status() {
        let stub = StubSsh::new(READY_MASTER);
        let session = stub.connect().await.unwrap();
        assert!(session.execute("true").await.unwrap().success());
        let status = session.execute("echo failing; exit 7").await.unwrap();
        assert_eq!(status.code, Some(7));
        assert!(!status.success());
        session.close().await;
    }

    #[tokio::test]
    async fn upload_completes_with_requested_mode() {
        use std::os::unix::fs::PermissionsExt;
        use tokio::io::AsyncWriteExt;

        let stub = StubSsh::new(READY_MASTER);
        let session = stub.connect().await.unwrap();
        let remote = stub.dir.join("upload.tgz");
        let payload = vec![b'x'; 300_000];
        let mut channel = session
            .open_file_channel(&remote.display().to_string(), 0o600)
            .await
            .unwrap();
        channel.write_all(&payload).await.unwrap();
        channel.close().await.unwrap();

        let metadata = std::fs::metadata(&remote).unwrap();
        assert_eq!(metadata.len(), payload.len() as u64);
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
        session.close().await;
    }

    #[tokio::test]
    async fn upload_into_missing_directory_fails_on_close() {
        use tokio::io::AsyncWriteExt;

        let stub = StubSsh::new(READY_MASTER);
        let session = stub.connect().await.unwrap();
        let remote = stub.dir.join("missing/upload.tgz");
        let mut channel = session
            .open_file_channel(&remote.display().to_string(), 0o600)
            .await
            .unwrap();
        let _ = channel.write_all(b"data").await;
        let err = channel.close().await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transfer(_)), "{err}");
        session.close().await;
    }

    #[tokio::test]
    async fn forward_relays_bytes() {
        use tokio::io::AsyncWriteExt;

        let stub = StubSsh::new(READY_MASTER);
        let session = stub.connect().await.unwrap();
        let mut forward = session.open_forward("b.example", 22).await.unwrap();
        forward.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        forward.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");
        drop(forward);
        session.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_removes_control_socket() {
        let stub = StubSsh::new(READY_MASTER);
        let session = stub.connect().await.unwrap();
        assert_eq!(stub.control_entries(".sock"), 1);
        session.close().await;
        session.close().await;
        assert_eq!(stub.control_entries(".sock"), 0);
    }

    #[tokio::test]
    async fn chatty_master_keeps_running_after_ready() {
        let stub = StubSsh::new(
            r#"touch "$ctl"; head -c 200000 /dev/zero | tr '\0' x >&2; touch "$ctl.drained"; exec sleep 30"#,
        );
        let session = stub.connect().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while stub.control_entries(".drained") == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("master wrote past a full stderr pipe");
        session.close().await;
    }
}
