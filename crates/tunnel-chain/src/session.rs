use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use delivery_spec::{DeliveryError, DeliveryResult, ServerSpec};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::task::JoinHandle;

/// Where a session actually dials. Differs from the server's own address when the
/// server sits behind a local tunnel listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub through_tunnel: bool,
}

impl ConnectTarget {
    pub fn direct(server: &ServerSpec) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            through_tunnel: false,
        }
    }

    pub fn tunnel(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            through_tunnel: true,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecStatus {
    /// `None` when the remote side was terminated by a signal.
    pub code: Option<i32>,
}

impl ExecStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Raw duplex bytes relayed to a host reachable from the session's server.
pub type ForwardChannel = Box<dyn ByteStream>;

/// Writable remote file. The upload is complete only once [`FileChannel::close`]
/// has observed the remote side closing.
pub struct FileChannel {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    closed: JoinHandle<DeliveryResult<()>>,
}

impl FileChannel {
    pub fn new(
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        closed: JoinHandle<DeliveryResult<()>>,
    ) -> Self {
        Self { writer, closed }
    }

    pub async fn close(self) -> DeliveryResult<()> {
        let FileChannel { mut writer, closed } = self;
        writer
            .shutdown()
            .await
            .map_err(|err| DeliveryError::transfer(format!("failed to finish upload: {err}")))?;
        drop(writer);
        closed
            .await
            .map_err(|err| DeliveryError::transfer(format!("upload channel task failed: {err}")))?
    }
}

impl AsyncWrite for FileChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.writer).poll_shutdown(cx)
    }
}

/// Joins a read half and a write half into one duplex stream, keeping `guard` alive
/// for as long as the stream is.
pub struct JoinedStream<R, W, G> {
    reader: R,
    writer: W,
    _guard: G,
}

impl<R, W, G> JoinedStream<R, W, G> {
    pub fn new(reader: R, writer: W, guard: G) -> Self {
        Self {
            reader,
            writer,
            _guard: guard,
        }
    }
}

impl<R, W, G> AsyncRead for JoinedStream<R, W, G>
where
    R: AsyncRead + Unpin,
    W: Unpin,
    G: Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl<R, W, G> AsyncWrite for JoinedStream<R, W, G>
where
    R: Unpin,
    W: AsyncWrite + Unpin,
    G: Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// An established, authenticated session to one server.
#[async_trait]
pub trait SecureSession: Send + Sync {
    /// Runs `command` remotely, streaming its stdout/stderr to ours.
    async fn execute(&self, command: &str) -> DeliveryResult<ExecStatus>;

    async fn open_file_channel(&self, remote_path: &str, mode: u32)
        -> DeliveryResult<FileChannel>;

    async fn open_forward(&self, host: &str, port: u16) -> DeliveryResult<ForwardChannel>;

    /// Idempotent. Errors are logged, not returned.
    async fn close(&self);
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Opens a session to `server` by dialing `target`, authenticating with the
    /// server's own credentials.
    async fn connect(
        &self,
        server: &ServerSpec,
        target: &ConnectTarget,
    ) -> DeliveryResult<Arc<dyn SecureSession>>;
}
