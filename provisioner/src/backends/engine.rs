use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use serde::Deserialize;
use std::{
    collections::BTreeMap as Map,
    fs::File,
    io,
    process::{Command, Output, Stdio},
    time::Duration,
};
use tempfile::TempDir;

use crate::{
    error::ProvisionError,
    models::{
        Container, ContainerId, ContainerName, ContainerSpec, ContainerStatus, HealthCheckSpec,
        HealthCommand, HealthStatus, Image, ImageId, ImageName, ImageSpec, Mount, RestartPolicy,
    },
    services::ContainerBackend,
};

/// Drives a docker compatible engine CLI (`docker` or `podman`).
pub struct EngineBackend {
    program: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageInspect {
    id: String,
    config: Option<ImageConfigInspect>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageConfigInspect {
    labels: Option<Map<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    id: String,
    name: String,
    image: String,
    state: StateInspect,
    config: ContainerConfigInspect,
    host_config: Option<HostConfigInspect>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StateInspect {
    status: String,
    // podman reports this as `Healthcheck`
    #[serde(alias = "Healthcheck")]
    health: Option<HealthInspect>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthInspect {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfigInspect {
    labels: Option<Map<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfigInspect {
    restart_policy: Option<RestartPolicyInspect>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RestartPolicyInspect {
    name: String,
}

fn container_status(status: &str) -> ContainerStatus {
    match status {
        "created" | "configured" => ContainerStatus::Created,
        "running" | "restarting" => ContainerStatus::Running,
        "exited" | "dead" | "stopped" => ContainerStatus::Exited,
        status => {
            warn!("unknown container status: {:?}", status);
            ContainerStatus::Unknown
        }
    }
}

fn health_status(status: &str) -> Option<HealthStatus> {
    match status {
        "starting" => Some(HealthStatus::Starting),
        "healthy" => Some(HealthStatus::Healthy),
        "unhealthy" => Some(HealthStatus::Unhealthy),
        _ => None,
    }
}

impl From<ContainerInspect> for Container {
    fn from(inspect: ContainerInspect) -> Container {
        let health = inspect
            .state
            .health
            .as_ref()
            .and_then(|health| health_status(&health.status));

        let restart_policy = inspect
            .host_config
            .and_then(|host_config| host_config.restart_policy)
            .and_then(|policy| RestartPolicy::from_engine_name(&policy.name));

        Container {
            id: ContainerId(inspect.id),
            name: ContainerName(inspect.name.trim_start_matches('/').to_owned()),
            image: ImageId(inspect.image),
            status: container_status(&inspect.state.status),
            health,
            restart_policy,
            labels: inspect.config.labels.unwrap_or_else(Default::default),
        }
    }
}

fn parse_containers(json: &str) -> Result<Vec<Container>> {
    let inspect: Vec<ContainerInspect> =
        serde_json::from_str(json).context("unexpected container inspect output")?;
    Ok(inspect.into_iter().map(Container::from).collect())
}

fn parse_image(json: &str) -> Result<Option<Image>> {
    let inspect: Vec<ImageInspect> =
        serde_json::from_str(json).context("unexpected image inspect output")?;

    Ok(inspect.into_iter().next().map(|image| Image {
        id: ImageId(image.id),
        labels: image
            .config
            .and_then(|config| config.labels)
            .unwrap_or_else(Default::default),
    }))
}

fn not_found(output: &Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr).to_ascii_lowercase();
    stderr.contains("no such") || stderr.contains("not found") || stderr.contains("not known")
}

/// Go style duration understood by the engine's `--health-*` flags.
fn go_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

fn mount_arg(mount: &Mount) -> String {
    match mount {
        Mount::Bind {
            source,
            target,
            read_only,
        } => {
            let mut arg = format!(
                "type=bind,source={},target={}",
                source.display(),
                target.display()
            );
            if *read_only {
                arg.push_str(",readonly");
            }
            arg
        }
        Mount::Volume {
            name,
            target,
            read_only,
        } => {
            let mut arg = format!("type=volume,source={},target={}", name, target.display());
            if *read_only {
                arg.push_str(",readonly");
            }
            arg
        }
        Mount::Tmpfs { target, size } => {
            let mut arg = format!("type=tmpfs,target={}", target.display());
            if let Some(size) = size {
                arg.push_str(&format!(",tmpfs-size={}", size));
            }
            arg
        }
    }
}

fn health_args(health_check: &HealthCheckSpec) -> Vec<String> {
    let command = match &health_check.command {
        HealthCommand::Shell(command) => command.clone(),
        HealthCommand::Exec(argv) => shell_words::join(argv),
    };

    vec![
        "--health-cmd".into(),
        command,
        "--health-interval".into(),
        go_duration(health_check.interval),
        "--health-timeout".into(),
        go_duration(health_check.timeout),
        "--health-retries".into(),
        health_check.retries.to_string(),
        "--health-start-period".into(),
        go_duration(health_check.start_period),
    ]
}

/// Arguments for `create`, in the order the engine expects them.
fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_owned(), "--name".into(), spec.name.0.clone()];

    for (key, value) in spec.labels.iter() {
        args.push("--label".into());
        args.push(format!("{}={}", key, value));
    }

    for port in spec.ports.iter() {
        args.push("--publish".into());
        args.push(format!(
            "{}:{}/{}",
            port.external,
            port.internal,
            port.protocol.as_str()
        ));
    }

    for mount in spec.all_mounts().iter() {
        args.push("--mount".into());
        args.push(mount_arg(mount));
    }

    args.push("--restart".into());
    args.push(spec.restart_policy.engine_name().into());

    if let Some(health_check) = &spec.health_check {
        args.extend(health_args(health_check));
    }

    args.push(spec.image_name.0.clone());
    args
}

fn remove_args(id: &ContainerId, remove_volumes: bool) -> Vec<&str> {
    let mut args = vec!["rm"];
    if remove_volumes {
        args.push("--volumes");
    }
    args.push(&id.0);
    args
}

fn build_args(spec: &ImageSpec, labels: &Map<String, String>, iid_file: &str) -> Vec<String> {
    let mut args = vec![
        "build".to_owned(),
        "--tag".into(),
        spec.name.0.clone(),
        "--file".into(),
        spec.dockerfile.to_string_lossy().into_owned(),
        "--iidfile".into(),
        iid_file.to_owned(),
    ];

    for (key, value) in labels.iter() {
        args.push("--label".into());
        args.push(format!("{}={}", key, value));
    }

    // the context is streamed on stdin
    args.push("-".into());
    args
}

impl EngineBackend {
    /// Checks that the engine is installed and its daemon answers.
    pub fn connect<P: Into<String>>(program: P) -> Result<EngineBackend> {
        let backend = EngineBackend {
            program: program.into(),
        };

        let output = backend.output(&["info"])?;
        if !output.status.success() {
            return Err(ProvisionError::EngineUnavailable {
                engine: backend.program.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }
            .into());
        }

        Ok(backend)
    }

    fn command<S: AsRef<str>>(&self, args: &[S]) -> Command {
        let mut command = Command::new(&self.program);
        command.args(args.iter().map(|arg| arg.as_ref()));
        debug!(
            "{} {}",
            self.program,
            shell_words::join(args.iter().map(|arg| arg.as_ref()))
        );
        command
    }

    fn unavailable(&self, err: io::Error) -> anyhow::Error {
        ProvisionError::EngineUnavailable {
            engine: self.program.clone(),
            reason: format!("failed to invoke `{}`: {}", self.program, err),
        }
        .into()
    }

    fn output<S: AsRef<str>>(&self, args: &[S]) -> Result<Output> {
        self.command(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| self.unavailable(err))
    }

    /// Runs the engine and returns its stdout, failing on a non-zero exit.
    fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        let output = self.output(args)?;
        if !output.status.success() {
            return Err(anyhow!(
                "`{} {}` failed: {}",
                self.program,
                args.first().map(|arg| arg.as_ref()).unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn inspect_containers(&self, ids: &[String]) -> Result<Vec<Container>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["container".to_owned(), "inspect".into()];
        args.extend(ids.iter().cloned());
        parse_containers(&self.run(&args)?)
    }
}

impl ContainerBackend for EngineBackend {
    fn get_image(&mut self, name: &ImageName) -> Result<Option<Image>> {
        let output = self.output(&["image", "inspect", name.0.as_str()])?;
        if !output.status.success() {
            if not_found(&output) {
                return Ok(None);
            }
            return Err(anyhow!(
                "failed to inspect image {}: {}",
                name.0,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        parse_image(&String::from_utf8_lossy(&output.stdout))
    }

    fn build_image(
        &mut self,
        spec: &ImageSpec,
        context_archive: &std::path::Path,
        labels: &Map<String, String>,
    ) -> Result<ImageId> {
        let temp_dir = TempDir::new()?;
        let iid_path = temp_dir.path().join("iid");
        let iid_file = iid_path
            .to_str()
            .ok_or_else(|| anyhow!("the temporary directory path is not valid utf-8"))?;

        let context = File::open(context_archive)?;
        let status = self
            .command(&build_args(spec, labels, iid_file))
            .stdin(Stdio::from(context))
            .status()
            .map_err(|err| self.unavailable(err))?;

        if !status.success() {
            return Err(ProvisionError::Build {
                image: spec.name.0.clone(),
                reason: format!("{} build exited with {}", self.program, status),
            }
            .into());
        }

        let image_id = std::fs::read_to_string(&iid_path)
            .with_context(|| format!("{} build did not report an image id", self.program))?;
        temp_dir.close()?;

        Ok(ImageId(image_id.trim().to_owned()))
    }

    fn get_container(&mut self, name: &str) -> Result<Option<Container>> {
        let output = self.output(&["container", "inspect", name])?;
        if !output.status.success() {
            if not_found(&output) {
                return Ok(None);
            }
            return Err(anyhow!(
                "failed to inspect container {}: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(parse_containers(&String::from_utf8_lossy(&output.stdout))?
            .into_iter()
            .next())
    }

    fn list_containers(
        &mut self,
        labels: Vec<(&str, &str)>,
    ) -> Result<Map<ContainerName, Container>> {
        let mut args = vec![
            "ps".to_owned(),
            "--all".into(),
            "--quiet".into(),
            "--no-trunc".into(),
        ];
        for (label, value) in labels.iter() {
            args.push("--filter".into());
            args.push(format!("label={}={}", label, value));
        }

        let ids = self
            .run(&args)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect::<Vec<_>>();

        let containers = self
            .inspect_containers(&ids)?
            .into_iter()
            .map(|container| (container.name.clone(), container))
            .collect();

        Ok(containers)
    }

    fn create_container(&mut self, spec: ContainerSpec) -> Result<ContainerId> {
        let output = self.run(&create_args(&spec))?;
        let id = output
            .lines()
            .last()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow!("{} create did not print a container id", self.program))?;

        Ok(ContainerId(id.to_owned()))
    }

    fn start_container(&mut self, id: &ContainerId) -> Result<()> {
        self.run(&["start", id.0.as_str()])?;
        Ok(())
    }

    fn stop_container(&mut self, id: &ContainerId, timeout: u32) -> Result<()> {
        let timeout = timeout.to_string();
        self.run(&["stop", "--time", timeout.as_str(), id.0.as_str()])?;
        Ok(())
    }

    fn remove_container(&mut self, id: &ContainerId, remove_volumes: bool) -> Result<()> {
        self.run(&remove_args(id, remove_volumes))?;
        Ok(())
    }

    fn update_restart_policy(&mut self, id: &ContainerId, policy: RestartPolicy) -> Result<()> {
        self.run(&["update", "--restart", policy.engine_name(), id.0.as_str()])?;
        Ok(())
    }
}
