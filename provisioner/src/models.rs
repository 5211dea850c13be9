use serde::Serialize;
use std::{collections::BTreeMap as Map, fmt, path::PathBuf, time::Duration};

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageId(pub String);

#[derive(Clone, Debug, Hash, Serialize, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageName(pub String);

#[derive(Clone, Debug, Hash)]
pub struct ImageSpec {
    pub name: ImageName,
    pub context: PathBuf,
    /// Path of the Dockerfile relative to the build context.
    pub dockerfile: PathBuf,
    /// Reuse an existing image with the same name even if the build
    /// context has changed since it was built.
    pub ignore_build_changes: bool,
}

#[derive(Clone, Debug)]
pub struct Image {
    pub id: ImageId,
    pub labels: Map<String, String>,
}

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerId(pub String);

#[derive(Clone, Debug, Hash, Serialize, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerName(pub String);

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Copy, Clone, Debug, Hash, Serialize, PartialOrd, Ord, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Publishes `internal` inside the container on `external` on the host.
#[derive(Clone, Debug, Hash, Serialize, PartialEq, Eq)]
pub struct PortMapping {
    pub internal: u16,
    pub external: u16,
    pub protocol: Protocol,
}

#[derive(Clone, Debug, Hash, Serialize, PartialEq, Eq)]
pub enum Mount {
    Bind {
        source: PathBuf,
        target: PathBuf,
        read_only: bool,
    },
    Volume {
        name: String,
        target: PathBuf,
        read_only: bool,
    },
    Tmpfs {
        target: PathBuf,
        size: Option<u64>,
    },
}

impl Mount {
    pub fn target(&self) -> &PathBuf {
        match self {
            Mount::Bind { target, .. } | Mount::Volume { target, .. } | Mount::Tmpfs { target, .. } => {
                target
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    OnFailure,
    Never,
}

impl RestartPolicy {
    /// The name the container engine uses for this policy.
    pub fn engine_name(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Never => "no",
        }
    }

    pub fn from_engine_name(name: &str) -> Option<RestartPolicy> {
        match name {
            "always" => Some(RestartPolicy::Always),
            "on-failure" => Some(RestartPolicy::OnFailure),
            "" | "no" => Some(RestartPolicy::Never),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Hash, Serialize, PartialEq, Eq)]
pub enum HealthCommand {
    /// Quoted into a single command line and run by the container's shell.
    Exec(Vec<String>),
    /// Executed with the container's default shell.
    Shell(String),
}

#[derive(Clone, Debug, Hash, Serialize, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub command: HealthCommand,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

impl HealthCheckSpec {
    /// Upper bound on how long the engine needs to reach a verdict for a
    /// freshly started container.
    pub fn settle_time(&self) -> Duration {
        let attempts = self.retries.saturating_add(1);
        let cycle = self.interval.saturating_add(self.timeout);
        self.start_period
            .saturating_add(cycle.checked_mul(attempts).unwrap_or(Duration::MAX))
    }
}

/// A host file of `KEY=VALUE` lines exposed read-only inside the container.
///
/// When `content` is set the file is owned by the provisioner and written
/// before the container is created, otherwise it is supplied externally.
#[derive(Clone, Debug, Hash, Serialize, PartialEq, Eq)]
pub struct EnvFile {
    pub path: PathBuf,
    pub target: PathBuf,
    pub content: Option<String>,
}

impl EnvFile {
    pub fn is_managed(&self) -> bool {
        self.content.is_some()
    }

    pub fn mount(&self) -> Mount {
        Mount::Bind {
            source: self.path.clone(),
            target: self.target.clone(),
            read_only: true,
        }
    }
}

#[derive(Clone, Debug, Hash)]
pub struct ContainerSpec {
    pub name: ContainerName,
    pub image_name: ImageName,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<Mount>,
    pub env_file: Option<EnvFile>,
    pub restart_policy: RestartPolicy,
    pub health_check: Option<HealthCheckSpec>,
    pub labels: Map<String, String>,
}

impl ContainerSpec {
    /// Declared mounts followed by the env file mount, if any.
    pub fn all_mounts(&self) -> Vec<Mount> {
        let mut mounts = self.mounts.clone();
        if let Some(env_file) = &self.env_file {
            mounts.push(env_file.mount());
        }
        mounts
    }
}

#[derive(Clone, Debug)]
pub struct Container {
    pub id: ContainerId,
    pub name: ContainerName,
    pub image: ImageId,
    pub status: ContainerStatus,
    pub health: Option<HealthStatus>,
    pub restart_policy: Option<RestartPolicy>,
    pub labels: Map<String, String>,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Unknown,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Starting => "starting",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

/// Where a declared container is in its lifecycle, as observed on the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Absent,
    Created,
    Starting,
    Healthy,
    Unhealthy,
    /// Running without a health check.
    Running,
    Stopped,
}

impl Lifecycle {
    pub fn observe(container: Option<&Container>) -> Lifecycle {
        let container = match container {
            Some(container) => container,
            None => return Lifecycle::Absent,
        };

        match (container.status, container.health) {
            (ContainerStatus::Created, _) => Lifecycle::Created,
            (ContainerStatus::Running, Some(HealthStatus::Starting)) => Lifecycle::Starting,
            (ContainerStatus::Running, Some(HealthStatus::Healthy)) => Lifecycle::Healthy,
            (ContainerStatus::Running, Some(HealthStatus::Unhealthy)) => Lifecycle::Unhealthy,
            (ContainerStatus::Running, None) => Lifecycle::Running,
            (ContainerStatus::Exited, _) | (ContainerStatus::Unknown, _) => Lifecycle::Stopped,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Lifecycle::Absent => "absent",
            Lifecycle::Created => "created",
            Lifecycle::Starting => "starting",
            Lifecycle::Healthy => "healthy",
            Lifecycle::Unhealthy => "unhealthy",
            Lifecycle::Running => "running",
            Lifecycle::Stopped => "stopped",
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildPolicy {
    Always,
    IfChanged,
}

/// Desired state read from a declaration file: one image and the one
/// container built from it.
#[derive(Clone, Debug)]
pub struct Declaration {
    pub image: ImageSpec,
    pub container: ContainerSpec,
}
