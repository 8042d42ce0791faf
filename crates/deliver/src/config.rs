use anyhow::Context;
use delivery_spec::{
    Credentials, DeliveryResult, DeliverySpec, ServerSpec, SocksProxy, TaskSpec, DEFAULT_SSH_PORT,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const HOME_CONFIG_FILES: [&str; 2] = [".deliveryrc.toml", ".delivery.toml"];

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DeliveryConfig {
    #[serde(default)]
    pub(crate) servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub(crate) tasks: BTreeMap<String, TaskConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ServerConfig {
    pub(crate) host: String,
    pub(crate) port: Option<u16>,
    pub(crate) user: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) identity_file: Option<String>,
    pub(crate) ssh_args: Option<Vec<String>>,
    pub(crate) via: Option<String>,
    pub(crate) socks_proxy: Option<SocksProxyConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SocksProxyConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) user: Option<String>,
    pub(crate) password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TaskConfig {
    pub(crate) src: SrcConfig,
    pub(crate) dst: DstConfig,
    pub(crate) before: Option<HookConfig>,
    pub(crate) after: Option<HookConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SrcConfig {
    pub(crate) path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DstConfig {
    pub(crate) server: String,
    pub(crate) path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct HookConfig {
    pub(crate) run: CommandList,
}

/// `run = "cmd"` or `run = ["cmd1", "cmd2"]`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum CommandList {
    One(String),
    Many(Vec<String>),
}

impl CommandList {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(command) => vec![command],
            Self::Many(commands) => commands,
        }
    }
}

/// Home config files first, then the explicit ones. Later files win.
pub(crate) fn config_search_paths(home: Option<&Path>, explicit: &[PathBuf]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = home {
        paths.extend(HOME_CONFIG_FILES.iter().map(|name| home.join(name)));
    }
    paths.extend(explicit.iter().map(|path| expand_tilde(&path.to_string_lossy())));
    paths
}

pub(crate) fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Reads and deep-merges every existing file of `paths`, then validates the result.
pub(crate) fn load_delivery_config(paths: &[PathBuf]) -> anyhow::Result<DeliveryConfig> {
    let mut merged: Option<toml::Value> = None;
    for path in paths {
        if !path.is_file() {
            continue;
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let value: toml::Value = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        tracing::debug!(event = "config.loaded", path = %path.display(), "config file loaded");
        merged = Some(match merged {
            Some(base) => merge_values(base, value),
            None => value,
        });
    }
    let Some(merged) = merged else {
        anyhow::bail!("config not found");
    };
    let config: DeliveryConfig = merged.try_into().context("invalid config")?;
    validate_delivery_config(&config)?;
    Ok(config)
}

/// Tables merge key by key; any other value in `overlay` replaces the one in `base`.
fn merge_values(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            toml::Value::Table(base)
        }
        (_, overlay) => overlay,
    }
}

/// Shape checks only. Dangling `via` and `dst.server` references are reported by
/// the delivery itself.
fn validate_delivery_config(config: &DeliveryConfig) -> anyhow::Result<()> {
    for (id, server) in &config.servers {
        if id.trim().is_empty() {
            anyhow::bail!("server id cannot be empty");
        }
        if server.host.trim().is_empty() {
            anyhow::bail!("server {id} must set host");
        }
        if server.port == Some(0) {
            anyhow::bail!("server {id} port must be between 1 and 65535");
        }
        if let Some(proxy) = server.socks_proxy.as_ref() {
            if proxy.host.trim().is_empty() {
                anyhow::bail!("server {id} socks_proxy must set host");
            }
            if proxy.port == 0 {
                anyhow::bail!("server {id} socks_proxy port must be between 1 and 65535");
            }
        }
    }
    for (id, task) in &config.tasks {
        if id.trim().is_empty() {
            anyhow::bail!("task id cannot be empty");
        }
        if task.src.path.trim().is_empty() {
            anyhow::bail!("task {id} must set src.path");
        }
        if task.dst.server.trim().is_empty() {
            anyhow::bail!("task {id} must set dst.server");
        }
        if task.dst.path.trim().is_empty() {
            anyhow::bail!("task {id} must set dst.path");
        }
    }
    Ok(())
}

/// Builds the immutable registry used by a run. Ports default to 22 here and
/// nowhere else.
pub(crate) fn build_delivery_spec(config: DeliveryConfig) -> DeliveryResult<DeliverySpec> {
    let servers = config.servers.into_iter().map(|(id, server)| ServerSpec {
        id,
        host: server.host.trim().to_string(),
        port: server.port.unwrap_or(DEFAULT_SSH_PORT),
        credentials: Credentials {
            user: server.user,
            password: server.password,
            identity_file: server.identity_file.as_deref().map(expand_tilde),
        },
        via: server.via,
        socks_proxy: server.socks_proxy.map(|proxy| SocksProxy {
            host: proxy.host.trim().to_string(),
            port: proxy.port,
            user: proxy.user,
            password: proxy.password,
        }),
        ssh_args: server.ssh_args.unwrap_or_default(),
    });
    let tasks = config.tasks.into_iter().map(|(id, task)| {
        let mut spec = TaskSpec::new(id, expand_tilde(&task.src.path), task.dst.server, task.dst.path);
        spec.before_commands = task.before.map(|hook| hook.run.into_vec()).unwrap_or_default();
        spec.after_commands = task.after.map(|hook| hook.run.into_vec()).unwrap_or_default();
        spec
    });
    DeliverySpec::new(servers, tasks)
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
