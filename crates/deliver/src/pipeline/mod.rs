mod stage;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use delivery_spec::{DeliveryError, DeliveryResult, DeliverySpec, TaskSpec};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{info, warn};
use tunnel_chain::{HopChain, SecureSession, SessionFactory, TunnelChain, TunnelOptions};

use crate::archive::{archive_path_in, create_archive, LocalArchive};
use crate::hooks::run_hooks;
use crate::remote::{remote_archive_path, unpack_archive, upload_archive};

pub(crate) use stage::{DeliveryFailure, DeliveryReport, DeliveryStage};

pub(crate) const DEFAULT_REMOTE_TMP: &str = "/tmp";

#[derive(Clone, Debug)]
pub(crate) struct PipelineOptions {
    pub(crate) tunnel: TunnelOptions,
    /// Remote directory the archive is uploaded to before unpacking.
    pub(crate) remote_tmp: String,
    /// Local directory the archive is written to.
    pub(crate) work_dir: PathBuf,
    /// Upper bound for every stage that does I/O. `None` waits indefinitely.
    pub(crate) stage_timeout: Option<Duration>,
}

impl PipelineOptions {
    pub(crate) fn new(work_dir: PathBuf) -> Self {
        Self {
            tunnel: TunnelOptions::default(),
            remote_tmp: DEFAULT_REMOTE_TMP.to_string(),
            work_dir,
            stage_timeout: None,
        }
    }
}

/// Runs one task: hooks, tunnels, archive, upload, remote unpack. Stages run
/// strictly in order and the first failure ends the run.
pub(crate) struct DeliveryPipeline {
    spec: DeliverySpec,
    factory: Arc<dyn SessionFactory>,
    options: PipelineOptions,
    progress: Option<mpsc::UnboundedSender<DeliveryStage>>,
}

#[derive(Default)]
struct RunResources {
    tunnels: Option<TunnelChain>,
    session: Option<Arc<dyn SecureSession>>,
    archive: Option<LocalArchive>,
}

impl RunResources {
    async fn release(&mut self) {
        if let Some(archive) = self.archive.take() {
            archive.remove();
        }
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        if let Some(tunnels) = self.tunnels.take() {
            tunnels.close_all().await;
        }
    }
}

impl DeliveryPipeline {
    pub(crate) fn new(
        spec: DeliverySpec,
        factory: Arc<dyn SessionFactory>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            spec,
            factory,
            options,
            progress: None,
        }
    }

    /// Every stage entered, `Done` or `Failed` last, is sent to `progress`.
    pub(crate) fn with_progress(mut self, progress: mpsc::UnboundedSender<DeliveryStage>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub(crate) async fn run(&self, task_id: &str) -> Result<DeliveryReport, DeliveryFailure> {
        let started = Instant::now();
        info!(event = "delivery.start", task = %task_id, "delivery started");
        let mut resources = RunResources::default();
        match self.deliver(task_id, &mut resources, started).await {
            Ok(report) => {
                self.emit(DeliveryStage::Done);
                info!(
                    event = "delivery.done",
                    task = %task_id,
                    chain = %report.chain.join(" -> "),
                    bytes = report.archive_bytes,
                    elapsed_ms = report.elapsed_ms,
                    "delivery done"
                );
                Ok(report)
            }
            Err(failure) => {
                let failure = with_tunnel_failures(failure, resources.tunnels.as_ref()).await;
                resources.release().await;
                self.emit(DeliveryStage::Failed);
                warn!(
                    event = "delivery.failed",
                    task = %task_id,
                    stage = %failure.stage,
                    error = %failure.error,
                    elapsed_ms = started.elapsed().as_millis(),
                    "delivery failed"
                );
                Err(failure)
            }
        }
    }

    async fn deliver(
        &self,
        task_id: &str,
        resources: &mut RunResources,
        started: Instant,
    ) -> Result<DeliveryReport, DeliveryFailure> {
        let task = self
            .stage(task_id, DeliveryStage::Init, async { self.lookup(task_id) })
            .await?;

        self.stage(task_id, DeliveryStage::PreHooks, async {
            run_hooks("before", &task.before_commands).await
        })
        .await?;

        let (chain, session) = self
            .stage(task_id, DeliveryStage::Connecting, async {
                let chain = HopChain::resolve(&self.spec, &task.dst.server_id)?;
                info!(event = "delivery.chain", chain = %chain.describe(), "hop chain resolved");
                let tunnels =
                    TunnelChain::build(&chain, Arc::clone(&self.factory), &self.options.tunnel)
                        .await?;
                let target = tunnels.entry_target(chain.destination());
                resources.tunnels = Some(tunnels);
                let session = self.factory.connect(chain.destination(), &target).await?;
                resources.session = Some(Arc::clone(&session));
                Ok::<_, DeliveryError>((chain, session))
            })
            .await?;

        let archive_bytes = self
            .stage(task_id, DeliveryStage::Archiving, async {
                let dest = archive_path_in(&self.options.work_dir);
                let archive = create_archive(&task.src_path, dest).await?;
                info!(
                    event = "archive.created",
                    archive = %archive.path().display(),
                    bytes = archive.size(),
                    "archive created"
                );
                let size = archive.size();
                resources.archive = Some(archive);
                Ok::<_, DeliveryError>(size)
            })
            .await?;

        let remote_archive = self
            .stage(task_id, DeliveryStage::Uploading, async {
                let archive = resources
                    .archive
                    .as_ref()
                    .ok_or_else(|| DeliveryError::transfer("archive missing before upload"))?;
                let remote_path = remote_archive_path(&self.options.remote_tmp, archive);
                upload_archive(session.as_ref(), archive, &remote_path).await?;
                Ok::<_, DeliveryError>(remote_path)
            })
            .await?;

        self.stage(task_id, DeliveryStage::Unpacking, async {
            unpack_archive(session.as_ref(), &remote_archive, &task.dst.path).await
        })
        .await?;

        let tunnel_count = resources.tunnels.as_ref().map_or(0, TunnelChain::len);
        self.stage(task_id, DeliveryStage::Cleanup, async {
            resources.release().await;
            Ok::<_, DeliveryError>(())
        })
        .await?;

        self.stage(task_id, DeliveryStage::PostHooks, async {
            run_hooks("after", &task.after_commands).await
        })
        .await?;

        Ok(DeliveryReport {
            task: task.id.clone(),
            chain: chain.hops().iter().map(|hop| hop.id.clone()).collect(),
            tunnels: tunnel_count,
            archive_bytes,
            remote_archive,
            destination: task.dst.path.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn lookup(&self, task_id: &str) -> DeliveryResult<&TaskSpec> {
        let task = self.spec.task(task_id)?;
        if self.spec.server(&task.dst.server_id).is_none() {
            return Err(DeliveryError::config("unknown dst server"));
        }
        Ok(task)
    }

    async fn stage<T, Fut>(
        &self,
        task_id: &str,
        stage: DeliveryStage,
        work: Fut,
    ) -> Result<T, DeliveryFailure>
    where
        Fut: Future<Output = DeliveryResult<T>>,
    {
        self.emit(stage);
        info!(
            event = "delivery.stage.start",
            task = %task_id,
            stage = %stage,
            "stage start"
        );
        let start = Instant::now();
        let result = match self.deadline(stage) {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => Err(timeout_error(stage, limit)),
            },
            None => work.await,
        };
        match result {
            Ok(value) => {
                info!(
                    event = "delivery.stage.done",
                    task = %task_id,
                    stage = %stage,
                    elapsed_ms = start.elapsed().as_millis(),
                    "stage done"
                );
                Ok(value)
            }
            Err(err) => {
                warn!(
                    event = "delivery.stage.failed",
                    task = %task_id,
                    stage = %stage,
                    elapsed_ms = start.elapsed().as_millis(),
                    error = %err,
                    "stage failed"
                );
                Err(DeliveryFailure::new(stage, err))
            }
        }
    }

    fn deadline(&self, stage: DeliveryStage) -> Option<Duration> {
        match stage {
            DeliveryStage::Init | DeliveryStage::Cleanup => None,
            _ => self.options.stage_timeout,
        }
    }

    fn emit(&self, stage: DeliveryStage) {
        if let Some(progress) = self.progress.as_ref() {
            let _ = progress.send(stage);
        }
    }
}

fn timeout_error(stage: DeliveryStage, limit: Duration) -> DeliveryError {
    let message = format!(
        "{stage} timed out after {}",
        humantime::format_duration(limit)
    );
    match stage {
        DeliveryStage::Connecting => DeliveryError::connection(message),
        DeliveryStage::PreHooks | DeliveryStage::Unpacking | DeliveryStage::PostHooks => {
            DeliveryError::command(message)
        }
        _ => DeliveryError::transfer(message),
    }
}

/// Appends listener-level tunnel errors, which usually explain a failure seen
/// further down the chain.
async fn with_tunnel_failures(
    failure: DeliveryFailure,
    tunnels: Option<&TunnelChain>,
) -> DeliveryFailure {
    let Some(tunnels) = tunnels else {
        return failure;
    };
    let failures = tunnels.failures().await;
    if failures.is_empty() {
        return failure;
    }
    let detail = failures.join("; ");
    let error = match failure.error {
        DeliveryError::Config(message) => DeliveryError::Config(format!("{message} ({detail})")),
        DeliveryError::Connection(message) => {
            DeliveryError::Connection(format!("{message} ({detail})"))
        }
        DeliveryError::Transfer(message) => {
            DeliveryError::Transfer(format!("{message} ({detail})"))
        }
        DeliveryError::Command(message) => DeliveryError::Command(format!("{message} ({detail})")),
    };
    DeliveryFailure::new(failure.stage, error)
}
