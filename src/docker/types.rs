//! Request and response shapes for the container API, and their translation
//! to and from engine types.

use std::collections::HashMap;

use bollard::container::Config;
use bollard::models::{
    ContainerInspectResponse, ContainerSummary, EventMessage, HostConfig, ImageSummary,
    PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use serde::{Deserialize, Serialize};

use super::connections::ConnectionCounts;
use super::error::{DockerError, Result};

const BYTES_PER_MB: i64 = 1024 * 1024;
const NANO_CPUS_PER_CORE: f64 = 1e9;

/// Megabytes to engine bytes, `None` when the result does not fit an `i64`.
fn memory_bytes(mb: u64) -> Option<i64> {
    i64::try_from(mb).ok()?.checked_mul(BYTES_PER_MB)
}

/// Length actor ids are truncated to in event payloads.
pub const SHORT_ID_LEN: usize = 12;

fn default_protocol() -> String {
    "tcp".to_string()
}

/// One published port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

/// Body of a container create or update request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub env: Vec<String>,
    /// Memory limit in megabytes.
    #[serde(default)]
    pub memory: Option<u64>,
    /// CPU limit in cores.
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub command: Vec<String>,
    /// One of `no`, `always`, `on-failure`, `unless-stopped`.
    #[serde(default)]
    pub restart: Option<String>,
    /// Named volumes, bound from `<host volume dir>/<name>/<volume>` to `/<volume>`.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub attach_stdin: bool,
    #[serde(default)]
    pub attach_stdout: bool,
    #[serde(default)]
    pub attach_stderr: bool,
}

impl ContainerSpec {
    /// Reject requests the daemon would misinterpret.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(DockerError::InvalidRequest("image is required".to_string()));
        }
        for port in &self.ports {
            if port.host_port == 0 || port.container_port == 0 {
                return Err(DockerError::InvalidRequest(
                    "ports must be greater than 0".to_string(),
                ));
            }
            let protocol = port.protocol.to_ascii_lowercase();
            if protocol != "tcp" && protocol != "udp" {
                return Err(DockerError::InvalidRequest(format!(
                    "unsupported protocol '{}'",
                    port.protocol
                )));
            }
        }
        if let Some(mb) = self.memory
            && memory_bytes(mb).is_none()
        {
            return Err(DockerError::InvalidRequest(format!("invalid memory limit {}", mb)));
        }
        if let Some(cpu) = self.cpu
            && !(cpu.is_finite() && cpu >= 0.0)
        {
            return Err(DockerError::InvalidRequest(format!("invalid cpu limit {}", cpu)));
        }
        if let Some(restart) = &self.restart {
            parse_restart_policy(restart)?;
        }
        if !self.volumes.is_empty() {
            let name = self.name.as_deref().unwrap_or_default();
            if !is_plain_segment(name) {
                return Err(DockerError::InvalidRequest(
                    "a container name is required when volumes are set".to_string(),
                ));
            }
            if let Some(bad) = self.volumes.iter().find(|v| !is_plain_segment(v)) {
                return Err(DockerError::InvalidRequest(format!(
                    "invalid volume name '{}'",
                    bad
                )));
            }
        }
        Ok(())
    }

    /// Translate into an engine create config.
    pub fn to_engine_config(&self, host_volume_dir: &str) -> Result<Config<String>> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &self.ports {
            let key = format!("{}/{}", port.container_port, port.protocol.to_ascii_lowercase());
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings
                .entry(key)
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(PortBinding {
                    host_ip: Some(String::new()),
                    host_port: Some(port.host_port.to_string()),
                });
        }

        let mut volumes: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut binds = Vec::new();
        if let Some(name) = &self.name {
            let prefix = host_volume_dir.trim_end_matches('/');
            for volume in &self.volumes {
                let container_path = format!("/{}", volume);
                binds.push(format!("{}/{}/{}:{}", prefix, name, volume, container_path));
                volumes.insert(container_path, HashMap::new());
            }
        }

        let restart_policy = match self.restart.as_deref() {
            Some(policy) if !policy.trim().is_empty() => Some(RestartPolicy {
                name: Some(parse_restart_policy(policy)?),
                maximum_retry_count: None,
            }),
            _ => None,
        };

        let memory = match self.memory.filter(|mb| *mb > 0) {
            Some(mb) => Some(memory_bytes(mb).ok_or_else(|| {
                DockerError::InvalidRequest(format!("invalid memory limit {}", mb))
            })?),
            None => None,
        };

        let host_config = HostConfig {
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            binds: (!binds.is_empty()).then_some(binds),
            memory,
            nano_cpus: self
                .cpu
                .filter(|cores| *cores > 0.0)
                .map(|cores| (cores * NANO_CPUS_PER_CORE) as i64),
            restart_policy,
            ..Default::default()
        };

        Ok(Config {
            image: Some(self.image.clone()),
            env: (!self.env.is_empty()).then(|| self.env.clone()),
            cmd: (!self.command.is_empty()).then(|| self.command.clone()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            volumes: (!volumes.is_empty()).then_some(volumes),
            tty: Some(self.tty),
            attach_stdin: Some(self.attach_stdin),
            attach_stdout: Some(self.attach_stdout),
            attach_stderr: Some(self.attach_stderr),
            host_config: Some(host_config),
            ..Default::default()
        })
    }
}

fn is_plain_segment(value: &str) -> bool {
    !value.is_empty() && value != "." && value != ".." && !value.contains(['/', '\\', ':'])
}

fn parse_restart_policy(value: &str) -> Result<RestartPolicyNameEnum> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" => Ok(RestartPolicyNameEnum::EMPTY),
        "no" => Ok(RestartPolicyNameEnum::NO),
        "always" => Ok(RestartPolicyNameEnum::ALWAYS),
        "on-failure" => Ok(RestartPolicyNameEnum::ON_FAILURE),
        "unless-stopped" => Ok(RestartPolicyNameEnum::UNLESS_STOPPED),
        other => Err(DockerError::InvalidRequest(format!(
            "unknown restart policy '{}'",
            other
        ))),
    }
}

/// Rebuild a create config from an inspected container, for rollback.
pub fn config_from_inspect(inspect: &ContainerInspectResponse) -> Config<String> {
    let mut config = Config::<String> {
        host_config: inspect.host_config.clone(),
        ..Default::default()
    };
    if let Some(c) = &inspect.config {
        config.image = c.image.clone();
        config.cmd = c.cmd.clone();
        config.entrypoint = c.entrypoint.clone();
        config.env = c.env.clone();
        config.exposed_ports = c.exposed_ports.clone();
        config.volumes = c.volumes.clone();
        config.labels = c.labels.clone();
        config.working_dir = c.working_dir.clone();
        config.user = c.user.clone();
        config.tty = c.tty;
        config.open_stdin = c.open_stdin;
        config.attach_stdin = c.attach_stdin;
        config.attach_stdout = c.attach_stdout;
        config.attach_stderr = c.attach_stderr;
    }
    if config.image.is_none() {
        config.image = inspect.image.clone();
    }
    config
}

/// Row of the container list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerListItem {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
    pub status: String,
}

impl From<ContainerSummary> for ContainerListItem {
    fn from(summary: ContainerSummary) -> Self {
        Self {
            id: summary.id.unwrap_or_default(),
            names: summary.names.unwrap_or_default(),
            image: summary.image.unwrap_or_default(),
            state: summary.state.map(|s| s.to_string()).unwrap_or_default(),
            status: summary.status.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStateInfo {
    pub status: String,
    pub running: bool,
    pub started_at: String,
    pub finished_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

/// Resource limits as entered on create: megabytes and cores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub memory: u64,
    pub cpu: f64,
}

/// Normalized inspect result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub created: String,
    pub state: ContainerStateInfo,
    pub mounts: Vec<MountInfo>,
    pub resources: ResourceInfo,
    pub ports: Vec<PortMapping>,
    pub restart_policy: String,
    pub env: Vec<String>,
    pub command: Vec<String>,
    /// Established connections per port; only sampled while running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<ConnectionCounts>,
}

impl ContainerDetails {
    pub fn from_inspect(inspect: ContainerInspectResponse) -> Self {
        let state = inspect
            .state
            .map(|s| ContainerStateInfo {
                status: s.status.map(|st| st.to_string()).unwrap_or_default(),
                running: s.running.unwrap_or(false),
                started_at: s.started_at.unwrap_or_default(),
                finished_at: s.finished_at.unwrap_or_default(),
            })
            .unwrap_or_default();

        let mounts = inspect
            .mounts
            .unwrap_or_default()
            .into_iter()
            .map(|m| MountInfo {
                kind: m.typ.map(|t| t.to_string()).unwrap_or_default(),
                source: m.source.unwrap_or_default(),
                destination: m.destination.unwrap_or_default(),
                read_only: !m.rw.unwrap_or(true),
            })
            .collect();

        let host = inspect.host_config.unwrap_or_default();
        let resources = ResourceInfo {
            memory: host.memory.unwrap_or(0).max(0) as u64 / BYTES_PER_MB as u64,
            cpu: host.nano_cpus.unwrap_or(0) as f64 / NANO_CPUS_PER_CORE,
        };

        let mut ports: Vec<PortMapping> = host
            .port_bindings
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(key, bindings)| {
                let (container_port, protocol) = split_port_key(&key);
                bindings
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(move |b| {
                        let host_port = b.host_port.and_then(|p| p.parse().ok())?;
                        Some(PortMapping {
                            host_port,
                            container_port,
                            protocol: protocol.clone(),
                        })
                    })
            })
            .collect();
        ports.sort_by_key(|p| (p.container_port, p.host_port));

        let restart_policy = host
            .restart_policy
            .and_then(|p| p.name)
            .map(|n| n.to_string())
            .unwrap_or_default();

        let (env, command) = inspect
            .config
            .map(|c| (c.env.unwrap_or_default(), c.cmd.unwrap_or_default()))
            .unwrap_or_default();

        Self {
            id: inspect.id.unwrap_or_default(),
            name: inspect
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image: inspect.image.unwrap_or_default(),
            created: inspect.created.unwrap_or_default(),
            state,
            mounts,
            resources,
            ports,
            restart_policy,
            env,
            command,
            connections: None,
        }
    }
}

fn split_port_key(key: &str) -> (u16, String) {
    let (port, protocol) = key.split_once('/').unwrap_or((key, "tcp"));
    (port.parse().unwrap_or(0), protocol.to_string())
}

/// Result of a create or update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedContainer {
    pub id: String,
    pub warnings: Vec<String>,
}

/// Row of the image list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub size: i64,
    pub created: i64,
}

impl From<ImageSummary> for ImageInfo {
    fn from(summary: ImageSummary) -> Self {
        Self {
            id: summary.id,
            repo_tags: summary.repo_tags,
            size: summary.size,
            created: summary.created,
        }
    }
}

/// Daemon event as relayed to clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerEvent {
    pub event_type: String,
    pub action: String,
    /// Actor id truncated to 12 characters.
    pub actor_id: String,
    pub attributes: HashMap<String, String>,
    /// Unix seconds.
    pub time: i64,
}

impl From<EventMessage> for DockerEvent {
    fn from(message: EventMessage) -> Self {
        let (actor_id, attributes) = message
            .actor
            .map(|a| (a.id.unwrap_or_default(), a.attributes.unwrap_or_default()))
            .unwrap_or_default();
        Self {
            event_type: message.typ.map(|t| t.to_string()).unwrap_or_default(),
            action: message.action.unwrap_or_default(),
            actor_id: short_id(&actor_id),
            attributes,
            time: message.time.unwrap_or_default(),
        }
    }
}

/// First 12 characters of an engine id.
pub fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}
