use anyhow::{anyhow, Result};
use log::{info, warn};
use std::{
    collections::BTreeMap as Map,
    fs::{self, OpenOptions},
    io::Write,
    thread,
    time::{Duration, Instant},
};

use crate::{
    context,
    error::{self, ProvisionError},
    hasher::digest,
    models::{
        BuildPolicy, Container, ContainerId, ContainerName, ContainerSpec, ContainerStatus,
        Declaration, EnvFile, HealthStatus, ImageId, ImageSpec, Lifecycle,
    },
    services::ContainerBackend,
};

pub const LABEL_PROJECT: &str = "io.provisioner.project";
pub const LABEL_HASH: &str = "io.provisioner.hash";
pub const LABEL_CONTEXT: &str = "io.provisioner.context";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContainerOperation {
    Create,
    Recreate,
    /// Change the restart policy in place.
    Update,
    Start,
    Stop,
    /// Stop and remove. `volumes` also drops the container's anonymous volumes.
    Remove { volumes: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageOperation {
    Build,
    Rebuild,
    Reuse(ImageId),
}

/// Digest of everything about a container that the engine fixes at
/// creation time. The restart policy is left out since it can be updated
/// in place.
pub fn spec_hash(spec: &ContainerSpec) -> Result<String> {
    digest(&(
        &spec.name,
        &spec.image_name,
        &spec.ports,
        &spec.mounts,
        &spec.env_file,
        &spec.health_check,
    ))
}

pub struct Controller {
    backend: Box<dyn ContainerBackend>,
    declaration: Declaration,
    containers: Map<ContainerName, Container>,
    project_name: String,
}

impl Controller {
    pub fn init<B, P>(project_name: P, backend: B, declaration: Declaration) -> Result<Controller>
    where
        B: 'static + ContainerBackend,
        P: Into<String>,
    {
        let project_name = project_name.into();
        let mut backend = Box::new(backend);
        let containers =
            backend.list_containers(vec![(LABEL_PROJECT, project_name.as_str())])?;

        Ok(Controller {
            backend,
            declaration,
            containers,
            project_name,
        })
    }

    pub fn declaration(&self) -> &Declaration {
        &self.declaration
    }

    /// Re-reads this project's containers from the engine.
    pub fn refresh(&mut self) -> Result<()> {
        self.containers = self
            .backend
            .list_containers(vec![(LABEL_PROJECT, self.project_name.as_str())])?;
        Ok(())
    }

    /// Decides whether the declared image has to be built.
    pub fn image_plan(&mut self, build_policy: BuildPolicy) -> Result<ImageOperation> {
        let spec = &self.declaration.image;
        let image = self.backend.get_image(&spec.name)?;

        let operation = match (build_policy, image) {
            (_, None) => ImageOperation::Build,
            (BuildPolicy::Always, Some(_)) => ImageOperation::Rebuild,
            (BuildPolicy::IfChanged, Some(image)) if spec.ignore_build_changes => {
                info!("reusing image {} (build changes are ignored)", spec.name.0);
                ImageOperation::Reuse(image.id)
            }
            (BuildPolicy::IfChanged, Some(image)) => {
                let context_digest = context::digest(spec)?;
                if image.labels.get(LABEL_CONTEXT) == Some(&context_digest) {
                    ImageOperation::Reuse(image.id)
                } else {
                    info!("build context of {} changed", spec.name.0);
                    ImageOperation::Rebuild
                }
            }
        };

        Ok(operation)
    }

    /// Makes sure the declared image exists and returns its id.
    pub fn ensure_image(&mut self, build_policy: BuildPolicy) -> Result<ImageId> {
        if let ImageOperation::Reuse(id) = self.image_plan(build_policy)? {
            return Ok(id);
        }

        let spec = self.declaration.image.clone();
        let id = self
            .build_image(&spec)
            .map_err(|err| error::build_failure(&spec.name.0, err))?;
        info!("built image {} as {}", spec.name.0, id.0);

        Ok(id)
    }

    fn build_image(&mut self, spec: &ImageSpec) -> Result<ImageId> {
        let context_digest = context::digest(spec)?;
        let archive = context::archive(spec)?;

        let mut labels = Map::new();
        labels.insert(LABEL_PROJECT.to_owned(), self.project_name.clone());
        labels.insert(LABEL_CONTEXT.to_owned(), context_digest);

        info!("sending {} bytes of build context", archive.size);
        let id = self.backend.build_image(spec, archive.path(), &labels)?;
        archive.close()?;

        Ok(id)
    }

    /// Writes the managed env file. Returns whether anything was written.
    ///
    /// Externally supplied env files are left alone.
    pub fn ensure_env_file(&mut self) -> Result<bool> {
        let env_file = match &self.declaration.container.env_file {
            Some(env_file) => env_file,
            None => return Ok(false),
        };

        let content = match &env_file.content {
            Some(content) => content,
            None => {
                if !env_file.path.is_file() {
                    warn!(
                        "external env file {} does not exist",
                        env_file.path.display()
                    );
                }
                return Ok(false);
            }
        };

        if !self.env_file_outdated() {
            return Ok(false);
        }

        let io_error = |source| ProvisionError::Io {
            path: env_file.path.clone(),
            source,
        };

        // Written in place so a running bind mount keeps pointing at it.
        let mut options = OpenOptions::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .write(true)
            .create(true)
            .truncate(true)
            .open(&env_file.path)
            .map_err(io_error)?;
        file.write_all(content.as_bytes()).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;

        info!("wrote env file {}", env_file.path.display());
        Ok(true)
    }

    /// Whether the managed env file is missing or holds other content.
    pub fn env_file_outdated(&self) -> bool {
        match &self.declaration.container.env_file {
            Some(EnvFile {
                path,
                content: Some(content),
                ..
            }) => fs::read(path)
                .map(|current| current != content.as_bytes())
                .unwrap_or(true),
            _ => false,
        }
    }

    /// Finds containers with a project label that is the same as the current project
    /// but that are no longer declared.
    pub fn find_orphans(&mut self) -> Result<Vec<ContainerName>> {
        let declared = &self.declaration.container.name;

        let orphans = self
            .containers
            .keys()
            .filter(|name| *name != declared)
            .cloned()
            .collect::<Vec<_>>();

        info!("found orphans: {:?}", orphans);

        Ok(orphans)
    }

    /// Finds the declared container, failing if its name is taken by a
    /// container this project does not own.
    fn declared_container(&mut self) -> Result<Option<Container>> {
        let name = self.declaration.container.name.clone();
        if let Some(container) = self.containers.get(&name) {
            return Ok(Some(container.clone()));
        }

        match self.backend.get_container(&name.0)? {
            None => Ok(None),
            Some(container) => {
                let owner = container.labels.get(LABEL_PROJECT);
                let reason = match owner {
                    Some(owner) => format!("it belongs to project {:?}", owner),
                    None => "it was not created by this tool".to_owned(),
                };

                Err(ProvisionError::Conflict {
                    name: name.0,
                    reason,
                }
                .into())
            }
        }
    }

    /// Operations that bring the declared container to its desired state.
    ///
    /// `image` is the id the container must run. `None` means the image is
    /// about to be (re)built, so any existing container will be replaced.
    pub fn start_containers_diff(
        &mut self,
        image: Option<&ImageId>,
    ) -> Result<Vec<(ContainerName, ContainerOperation)>> {
        let spec = &self.declaration.container;
        let name = spec.name.clone();
        let spec_hash = spec_hash(spec)?;
        let restart_policy = spec.restart_policy;

        let container = match self.declared_container()? {
            Some(container) => container,
            None => return Ok(vec![(name, ContainerOperation::Create)]),
        };

        let hash_matches = container
            .labels
            .get(LABEL_HASH)
            .map(|h| *h == spec_hash)
            .unwrap_or(false);
        let image_matches = image.map(|id| *id == container.image).unwrap_or(false);

        if !hash_matches || !image_matches || container.status == ContainerStatus::Unknown {
            info!(
                "{} must be replaced (spec changed: {}, image changed: {})",
                name, !hash_matches, !image_matches
            );
            return Ok(vec![(name, ContainerOperation::Recreate)]);
        }

        let mut diff = Vec::new();
        if container.restart_policy != Some(restart_policy) {
            diff.push((name.clone(), ContainerOperation::Update));
        }

        match container.status {
            ContainerStatus::Created | ContainerStatus::Exited => {
                diff.push((name, ContainerOperation::Start))
            }
            ContainerStatus::Running | ContainerStatus::Unknown => (),
        }

        Ok(diff)
    }

    pub fn stop_containers_diff(&mut self) -> Result<Vec<(ContainerName, ContainerOperation)>> {
        let diff = self
            .containers
            .get(&self.declaration.container.name)
            .filter(|container| container.status == ContainerStatus::Running)
            .map(|container| (container.name.clone(), ContainerOperation::Stop))
            .into_iter()
            .collect();

        Ok(diff)
    }

    /// Removes the container. A managed env file stays on disk.
    pub fn remove_containers_diff(
        &mut self,
        volumes: bool,
    ) -> Result<Vec<(ContainerName, ContainerOperation)>> {
        if let Some(env_file) = &self.declaration.container.env_file {
            if env_file.is_managed() {
                warn!(
                    "the managed env file {} is not deleted on teardown",
                    env_file.path.display()
                );
            }
        }

        let diff = self
            .containers
            .get(&self.declaration.container.name)
            .map(|container| {
                let operation = ContainerOperation::Remove { volumes };
                (container.name.clone(), operation)
            })
            .into_iter()
            .collect();

        Ok(diff)
    }

    pub fn container_apply(
        &mut self,
        name: &ContainerName,
        operation: ContainerOperation,
        timeout: u32,
    ) -> Result<()> {
        match operation {
            ContainerOperation::Create => {
                let container_id = self.container_create(name)?;
                self.backend.start_container(&container_id)?;
            }
            ContainerOperation::Recreate => {
                let container = self.existing(name)?;

                if container.status == ContainerStatus::Running {
                    self.backend.stop_container(&container.id, timeout)?;
                }
                self.backend.remove_container(&container.id, false)?;
                let container_id = self.container_create(name)?;
                self.backend.start_container(&container_id)?;
            }
            ContainerOperation::Update => {
                let container = self.existing(name)?;
                let restart_policy = self.declaration.container.restart_policy;
                self.backend
                    .update_restart_policy(&container.id, restart_policy)?;
            }
            ContainerOperation::Start => {
                let container = self.existing(name)?;
                self.backend.start_container(&container.id)?;
            }
            ContainerOperation::Stop => {
                let container = self.existing(name)?;
                self.backend.stop_container(&container.id, timeout)?;
            }
            ContainerOperation::Remove { volumes } => {
                let container = self.existing(name)?;

                if container.status == ContainerStatus::Running {
                    self.backend.stop_container(&container.id, timeout)?;
                }
                self.backend.remove_container(&container.id, volumes)?;
            }
        }

        self.refresh()
    }

    fn existing(&self, name: &ContainerName) -> Result<Container> {
        self.containers
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("could not find container {:?}", name))
    }

    fn container_create(&mut self, name: &ContainerName) -> Result<ContainerId> {
        if *name != self.declaration.container.name {
            return Err(anyhow!("unknown container name: {:?}", name));
        }

        let mut spec = self.declaration.container.clone();
        let hash = spec_hash(&spec)?;

        spec.labels
            .insert(LABEL_PROJECT.into(), self.project_name.clone());
        spec.labels.insert(LABEL_HASH.into(), hash);

        let id = self.backend.create_container(spec)?;
        info!("created container {} ({})", name, id.0);

        Ok(id)
    }

    fn declared_container_id(&mut self) -> Result<ContainerId> {
        self.declared_container()?
            .map(|container| container.id)
            .ok_or_else(|| anyhow!("container {} does not exist", self.declaration.container.name))
    }

    /// Latest health check result the engine recorded for a container.
    /// `None` if the container has no health check.
    pub fn health_status(&mut self, id: &ContainerId) -> Result<Option<HealthStatus>> {
        let container = self
            .backend
            .get_container(&id.0)?
            .ok_or_else(|| anyhow!("container {} does not exist", id.0))?;

        Ok(container.health)
    }

    pub fn lifecycle(&mut self) -> Result<Lifecycle> {
        let container = match self.declared_container()? {
            Some(container) => self.backend.get_container(&container.id.0)?,
            None => None,
        };

        Ok(Lifecycle::observe(container.as_ref()))
    }

    /// How long to wait for a verdict when no deadline is given.
    pub fn default_health_deadline(&self) -> Duration {
        self.declaration
            .container
            .health_check
            .as_ref()
            .map(|health_check| health_check.settle_time())
            .unwrap_or_else(|| Duration::from_secs(0))
    }

    /// Polls the declared container until its health check leaves
    /// `starting` or `deadline` passes, returning the last status seen.
    pub fn wait_healthy(&mut self, deadline: Duration, poll: Duration) -> Result<HealthStatus> {
        let id = self.declared_container_id()?;
        let started = Instant::now();

        loop {
            let status = self
                .health_status(&id)?
                .ok_or_else(|| anyhow!("container {} has no health check", id.0))?;

            if status != HealthStatus::Starting || started.elapsed() >= deadline {
                return Ok(status);
            }

            thread::sleep(poll);
        }
    }
}
