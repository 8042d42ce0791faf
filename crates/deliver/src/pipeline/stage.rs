use std::fmt;

use delivery_spec::DeliveryError;
use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DeliveryStage {
    Init,
    PreHooks,
    Connecting,
    Archiving,
    Uploading,
    Unpacking,
    Cleanup,
    PostHooks,
    Done,
    Failed,
}

impl DeliveryStage {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::PreHooks => "pre_hooks",
            Self::Connecting => "connecting",
            Self::Archiving => "archiving",
            Self::Uploading => "uploading",
            Self::Unpacking => "unpacking",
            Self::Cleanup => "cleanup",
            Self::PostHooks => "post_hooks",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A run that stopped at `stage`. Stages after it were not attempted.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{stage}: {error}")]
pub(crate) struct DeliveryFailure {
    pub(crate) stage: DeliveryStage,
    pub(crate) error: DeliveryError,
}

impl DeliveryFailure {
    pub(crate) fn new(stage: DeliveryStage, error: DeliveryError) -> Self {
        Self { stage, error }
    }
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct DeliveryReport {
    pub(crate) task: String,
    pub(crate) chain: Vec<String>,
    pub(crate) tunnels: usize,
    pub(crate) archive_bytes: u64,
    pub(crate) remote_archive: String,
    pub(crate) destination: String,
    pub(crate) elapsed_ms: u64,
}
