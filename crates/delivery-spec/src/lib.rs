mod error;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub use error::{DeliveryError, DeliveryResult};

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub user: Option<String>,
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SocksProxy {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
}

impl SocksProxy {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One SSH-reachable host. Built once from the validated config and never mutated.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerSpec {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub credentials: Credentials,
    /// Server that has to be reached before this one.
    pub via: Option<String>,
    pub socks_proxy: Option<SocksProxy>,
    #[serde(default)]
    pub ssh_args: Vec<String>,
}

impl ServerSpec {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            credentials: Credentials::default(),
            via: None,
            socks_proxy: None,
            ssh_args: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_via(mut self, via: impl Into<String>) -> Self {
        self.via = Some(via.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.credentials.user = Some(user.into());
        self
    }

    pub fn with_socks_proxy(mut self, proxy: SocksProxy) -> Self {
        self.socks_proxy = Some(proxy);
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Destination {
    pub server_id: String,
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSpec {
    pub id: String,
    pub src_path: PathBuf,
    pub dst: Destination,
    #[serde(default)]
    pub before_commands: Vec<String>,
    #[serde(default)]
    pub after_commands: Vec<String>,
}

impl TaskSpec {
    pub fn new(
        id: impl Into<String>,
        src_path: impl Into<PathBuf>,
        server_id: impl Into<String>,
        dst_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            src_path: src_path.into(),
            dst: Destination {
                server_id: server_id.into(),
                path: dst_path.into(),
            },
            before_commands: Vec::new(),
            after_commands: Vec::new(),
        }
    }

    pub fn with_before(mut self, commands: Vec<String>) -> Self {
        self.before_commands = commands;
        self
    }

    pub fn with_after(mut self, commands: Vec<String>) -> Self {
        self.after_commands = commands;
        self
    }
}

/// Server and task registries for one run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeliverySpec {
    servers: BTreeMap<String, ServerSpec>,
    tasks: BTreeMap<String, TaskSpec>,
}

impl DeliverySpec {
    pub fn new(
        servers: impl IntoIterator<Item = ServerSpec>,
        tasks: impl IntoIterator<Item = TaskSpec>,
    ) -> DeliveryResult<Self> {
        let mut server_map = BTreeMap::new();
        for server in servers {
            if server.id.trim().is_empty() {
                return Err(DeliveryError::config("server id cannot be empty"));
            }
            if server_map.contains_key(&server.id) {
                return Err(DeliveryError::config(format!(
                    "duplicate server id: {}",
                    server.id
                )));
            }
            server_map.insert(server.id.clone(), server);
        }
        let mut task_map = BTreeMap::new();
        for task in tasks {
            if task.id.trim().is_empty() {
                return Err(DeliveryError::config("task id cannot be empty"));
            }
            if task_map.contains_key(&task.id) {
                return Err(DeliveryError::config(format!(
                    "duplicate task id: {}",
                    task.id
                )));
            }
            task_map.insert(task.id.clone(), task);
        }
        Ok(Self {
            servers: server_map,
            tasks: task_map,
        })
    }

    pub fn server(&self, id: &str) -> Option<&ServerSpec> {
        self.servers.get(id)
    }

    pub fn task(&self, id: &str) -> DeliveryResult<&TaskSpec> {
        self.tasks
            .get(id)
            .ok_or_else(|| DeliveryError::config("unknown task"))
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskSpec> {
        self.tasks.values()
    }
}
