use std::net::SocketAddr;
use std::sync::Arc;

use delivery_spec::{DeliveryError, DeliveryResult, ServerSpec};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::HopChain;
use crate::session::{ConnectTarget, SessionFactory};

pub const DEFAULT_IDLE_CLOSE_DELAY: Duration = Duration::from_millis(2);

#[derive(Clone, Debug)]
pub struct TunnelOptions {
    pub bind_host: String,
    /// Delay between the last connection closing and the listener shutting down.
    pub idle_close_delay: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            idle_close_delay: DEFAULT_IDLE_CLOSE_DELAY,
        }
    }
}

/// Local listener relaying each accepted connection through a session on `gate`
/// to `target`.
pub struct TunnelServer {
    gate: ServerSpec,
    gate_target: ConnectTarget,
    target: ServerSpec,
    factory: Arc<dyn SessionFactory>,
    options: TunnelOptions,
}

impl TunnelServer {
    pub fn new(
        gate: ServerSpec,
        gate_target: ConnectTarget,
        target: ServerSpec,
        factory: Arc<dyn SessionFactory>,
        options: TunnelOptions,
    ) -> Self {
        Self {
            gate,
            gate_target,
            target,
            factory,
            options,
        }
    }

    pub async fn start(self) -> DeliveryResult<TunnelHandle> {
        let bind = format!("{}:0", self.options.bind_host);
        let listener = TcpListener::bind(&bind).await.map_err(|err| {
            DeliveryError::connection(format!("failed to bind tunnel listener on {bind}: {err}"))
        })?;
        let local_addr = listener.local_addr().map_err(|err| {
            DeliveryError::connection(format!("failed to read tunnel listener address: {err}"))
        })?;
        let label = format!("{} -> {}", self.gate.id, self.target.id);
        let shared = Arc::new(Shared {
            label: label.clone(),
            state: Mutex::new(ListenerState::default()),
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
            failure: Mutex::new(None),
        });
        info!(
            event = "tunnel.listen",
            tunnel = %label,
            local_addr = %local_addr,
            gate_addr = %self.gate_target.addr(),
            target_addr = %self.target.addr(),
            "tunnel listening"
        );
        let context = Arc::new(ConnectionContext {
            gate: self.gate,
            gate_target: self.gate_target,
            target: self.target,
            factory: self.factory,
            idle_close_delay: self.options.idle_close_delay,
        });
        tokio::spawn(accept_loop(listener, Arc::clone(&shared), context));
        Ok(TunnelHandle {
            local_addr,
            shared,
        })
    }
}

pub struct TunnelHandle {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl TunnelHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address a session uses to reach the tunnel's target through this listener.
    pub fn connect_target(&self) -> ConnectTarget {
        ConnectTarget::tunnel(self.local_addr)
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub async fn live_connections(&self) -> usize {
        self.shared.state.lock().await.live
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// First connection-level error that brought the listener down, if any.
    pub async fn failure(&self) -> Option<String> {
        self.shared.failure.lock().await.clone()
    }

    /// Resolves once the listener is closed and every connection task has finished.
    pub async fn wait_closed(&self) {
        self.shared.stopped.cancelled().await;
    }

    pub async fn close(&self) {
        self.shared.close().await;
        self.wait_closed().await;
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

/// Tunnels built for one hop chain, in chain order.
#[derive(Default)]
pub struct TunnelChain {
    handles: Vec<TunnelHandle>,
}

impl TunnelChain {
    /// Builds one listener per `(gate, target)` link. Hop `i > 0` reaches its gate
    /// through the listener built for hop `i - 1`.
    pub async fn build(
        chain: &HopChain,
        factory: Arc<dyn SessionFactory>,
        options: &TunnelOptions,
    ) -> DeliveryResult<Self> {
        let mut tunnels = Self::default();
        for (gate, target) in chain.links() {
            let gate_target = match tunnels.handles.last() {
                Some(previous) => previous.connect_target(),
                None => ConnectTarget::direct(gate),
            };
            let server = TunnelServer::new(
                gate.clone(),
                gate_target,
                target.clone(),
                Arc::clone(&factory),
                options.clone(),
            );
            match server.start().await {
                Ok(handle) => tunnels.handles.push(handle),
                Err(err) => {
                    tunnels.close_all().await;
                    return Err(err);
                }
            }
        }
        Ok(tunnels)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &[TunnelHandle] {
        &self.handles
    }

    /// Where the destination of the chain is dialed: the last listener, or the
    /// destination itself when no tunnel was needed.
    pub fn entry_target(&self, destination: &ServerSpec) -> ConnectTarget {
        match self.handles.last() {
            Some(last) => last.connect_target(),
            None => ConnectTarget::direct(destination),
        }
    }

    /// Listener-level errors recorded so far, labelled by tunnel.
    pub async fn failures(&self) -> Vec<String> {
        let mut failures = Vec::new();
        for handle in &self.handles {
            if let Some(failure) = handle.failure().await {
                failures.push(format!("tunnel {}: {failure}", handle.label()));
            }
        }
        failures
    }

    pub async fn close_all(&self) {
        for handle in self.handles.iter().rev() {
            handle.close().await;
        }
    }
}

struct Shared {
    label: String,
    state: Mutex<ListenerState>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    failure: Mutex<Option<String>>,
}

#[derive(Default)]
struct ListenerState {
    live: usize,
    close_timer: Option<JoinHandle<()>>,
    closed: bool,
}

impl Shared {
    /// Counts a new connection. Returns false once the listener has been closed.
    async fn register(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        state.live += 1;
        if let Some(timer) = state.close_timer.take() {
            timer.abort();
            debug!(tunnel = %self.label, "pending idle close cancelled");
        }
        true
    }

    async fn release(self: &Arc<Self>, idle_close_delay: Duration) {
        let mut state = self.state.lock().await;
        state.live = state.live.saturating_sub(1);
        if state.live > 0 || state.closed {
            return;
        }
        let shared = Arc::clone(self);
        state.close_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle_close_delay).await;
            let mut state = shared.state.lock().await;
            if state.live == 0 && !state.closed {
                state.closed = true;
                state.close_timer = None;
                shared.shutdown.cancel();
                info!(event = "tunnel.idle_close", tunnel = %shared.label, "tunnel idle, closing");
            }
        }));
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        if let Some(timer) = state.close_timer.take() {
            timer.abort();
        }
        self.shutdown.cancel();
    }

    async fn fail(&self, err: &DeliveryError) {
        {
            let mut failure = self.failure.lock().await;
            if failure.is_none() {
                *failure = Some(err.to_string());
            }
        }
        warn!(
            event = "tunnel.failed",
            tunnel = %self.label,
            error = %err,
            "tunnel connection failed, closing listener"
        );
        self.close().await;
    }
}

struct ConnectionContext {
    gate: ServerSpec,
    gate_target: ConnectTarget,
    target: ServerSpec,
    factory: Arc<dyn SessionFactory>,
    idle_close_delay: Duration,
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, context: Arc<ConnectionContext>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        shared
                            .fail(&DeliveryError::connection(format!("accept failed: {err}")))
                            .await;
                        break;
                    }
                };
                if !shared.register().await {
                    debug!(tunnel = %shared.label, peer = %peer, "listener closed, dropping connection");
                    break;
                }
                debug!(tunnel = %shared.label, peer = %peer, "tunnel connection accepted");
                let shared = Arc::clone(&shared);
                let context = Arc::clone(&context);
                connections.spawn(async move {
                    let mut stream = stream;
                    let served = serve_connection(&mut stream, &context, &shared.shutdown).await;
                    if let Err(err) = served {
                        shared.fail(&err).await;
                    }
                    drop(stream);
                    shared.release(context.idle_close_delay).await;
                });
            }
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
    shared.stopped.cancel();
    info!(event = "tunnel.closed", tunnel = %shared.label, "tunnel closed");
}

async fn serve_connection(
    inbound: &mut TcpStream,
    context: &ConnectionContext,
    shutdown: &CancellationToken,
) -> DeliveryResult<()> {
    let session = tokio::select! {
        session = context.factory.connect(&context.gate, &context.gate_target) => session?,
        _ = shutdown.cancelled() => return Ok(()),
    };
    let outcome = async {
        let mut channel = session
            .open_forward(&context.target.host, context.target.port)
            .await?;
        tokio::select! {
            copied = tokio::io::copy_bidirectional(inbound, &mut channel) => {
                let (sent, received) = copied.map_err(|err| {
                    DeliveryError::connection(format!(
                        "relay to {} failed: {err}",
                        context.target.addr()
                    ))
                })?;
                debug!(sent, received, target = %context.target.addr(), "tunnel connection finished");
                Ok(())
            }
            _ = shutdown.cancelled() => Ok(()),
        }
    }
    .await;
    session.close().await;
    outcome
}
