//! An in-memory engine for exercising reconciliation without a daemon.

use anyhow::{anyhow, Result};
use std::{
    cell::RefCell,
    collections::{BTreeMap as Map, VecDeque},
    path::Path,
    rc::Rc,
};

use crate::{
    error::ProvisionError,
    models::{
        Container, ContainerId, ContainerName, ContainerSpec, ContainerStatus, HealthStatus,
        Image, ImageId, ImageName, ImageSpec, RestartPolicy,
    },
    services::ContainerBackend,
};

/// Every call that changes engine state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Build(ImageName),
    Create(ContainerName),
    Start(ContainerId),
    Stop(ContainerId),
    /// Container and whether its anonymous volumes went with it.
    Remove(ContainerId, bool),
    Update(ContainerId, RestartPolicy),
}

#[derive(Default)]
pub struct State {
    pub images: Map<ImageName, Image>,
    pub containers: Map<ContainerName, Container>,
    pub specs: Map<ContainerName, ContainerSpec>,
    pub mutations: Vec<Mutation>,
    /// Health reported on successive inspections of a started container.
    pub health_script: VecDeque<HealthStatus>,
    pub fail_builds: bool,
    next_id: u32,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{}", prefix, self.next_id)
    }

    fn container_mut(&mut self, id: &ContainerId) -> Result<&mut Container> {
        self.containers
            .values_mut()
            .find(|container| container.id == *id)
            .ok_or_else(|| anyhow!("no such container: {}", id.0))
    }
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub state: Rc<RefCell<State>>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        Default::default()
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.state.borrow().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.state.borrow_mut().mutations.clear();
    }

    pub fn container(&self, name: &str) -> Option<Container> {
        self.state
            .borrow()
            .containers
            .get(&ContainerName(name.into()))
            .cloned()
    }

    pub fn spec(&self, name: &str) -> Option<ContainerSpec> {
        self.state
            .borrow()
            .specs
            .get(&ContainerName(name.into()))
            .cloned()
    }

    /// Adds a container that was not created by any provisioner project.
    pub fn insert_foreign(&self, name: &str) {
        let mut state = self.state.borrow_mut();
        let id = ContainerId(state.next_id("foreign-"));
        state.containers.insert(
            ContainerName(name.into()),
            Container {
                id,
                name: ContainerName(name.into()),
                image: ImageId("sha256:foreign".into()),
                status: ContainerStatus::Running,
                health: None,
                restart_policy: Some(RestartPolicy::Never),
                labels: Map::new(),
            },
        );
    }

    pub fn set_status(&self, name: &str, status: ContainerStatus) {
        if let Some(container) = self
            .state
            .borrow_mut()
            .containers
            .get_mut(&ContainerName(name.into()))
        {
            container.status = status;
        }
    }
}

impl ContainerBackend for MemoryBackend {
    fn get_image(&mut self, name: &ImageName) -> Result<Option<Image>> {
        Ok(self.state.borrow().images.get(name).cloned())
    }

    fn build_image(
        &mut self,
        spec: &ImageSpec,
        context_archive: &Path,
        labels: &Map<String, String>,
    ) -> Result<ImageId> {
        let mut state = self.state.borrow_mut();
        if state.fail_builds || !context_archive.is_file() {
            return Err(ProvisionError::Build {
                image: spec.name.0.clone(),
                reason: "build failed".into(),
            }
            .into());
        }

        let id = ImageId(state.next_id("sha256:"));
        state.images.insert(
            spec.name.clone(),
            Image {
                id: id.clone(),
                labels: labels.clone(),
            },
        );
        state.mutations.push(Mutation::Build(spec.name.clone()));

        Ok(id)
    }

    fn get_container(&mut self, name_or_id: &str) -> Result<Option<Container>> {
        let mut state = self.state.borrow_mut();
        let name = match state
            .containers
            .values()
            .find(|container| container.name.0 == name_or_id || container.id.0 == name_or_id)
        {
            Some(container) => container.name.clone(),
            None => return Ok(None),
        };

        let running_with_health = match state.containers.get(&name) {
            Some(container) => {
                container.status == ContainerStatus::Running && container.health.is_some()
            }
            None => return Ok(None),
        };

        if running_with_health {
            if let Some(health) = state.health_script.pop_front() {
                if let Some(container) = state.containers.get_mut(&name) {
                    container.health = Some(health);
                }
            }
        }

        Ok(state.containers.get(&name).cloned())
    }

    fn list_containers(
        &mut self,
        labels: Vec<(&str, &str)>,
    ) -> Result<Map<ContainerName, Container>> {
        let state = self.state.borrow();

        let containers = state
            .containers
            .iter()
            .filter(|(_, container)| {
                labels.iter().all(|(label, value)| {
                    container.labels.get(*label).map(|s| s.as_str()) == Some(*value)
                })
            })
            .map(|(name, container)| (name.clone(), container.clone()))
            .collect();

        Ok(containers)
    }

    fn create_container(&mut self, spec: ContainerSpec) -> Result<ContainerId> {
        let mut state = self.state.borrow_mut();
        if state.containers.contains_key(&spec.name) {
            return Err(anyhow!("container name {} is already in use", spec.name));
        }

        let image = state
            .images
            .get(&spec.image_name)
            .map(|image| image.id.clone())
            .ok_or_else(|| anyhow!("no such image: {}", spec.image_name.0))?;

        let id = ContainerId(state.next_id("container-"));
        state.containers.insert(
            spec.name.clone(),
            Container {
                id: id.clone(),
                name: spec.name.clone(),
                image,
                status: ContainerStatus::Created,
                health: None,
                restart_policy: Some(spec.restart_policy),
                labels: spec.labels.clone(),
            },
        );
        state.mutations.push(Mutation::Create(spec.name.clone()));
        state.specs.insert(spec.name.clone(), spec);

        Ok(id)
    }

    fn start_container(&mut self, id: &ContainerId) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let name = state.container_mut(id)?.name.clone();
        let has_health_check = state
            .specs
            .get(&name)
            .map(|spec| spec.health_check.is_some())
            .unwrap_or(false);

        let container = state.container_mut(id)?;
        container.status = ContainerStatus::Running;
        container.health = if has_health_check {
            Some(HealthStatus::Starting)
        } else {
            None
        };
        state.mutations.push(Mutation::Start(id.clone()));
        Ok(())
    }

    fn stop_container(&mut self, id: &ContainerId, _timeout: u32) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.container_mut(id)?.status = ContainerStatus::Exited;
        state.mutations.push(Mutation::Stop(id.clone()));
        Ok(())
    }

    fn remove_container(&mut self, id: &ContainerId, remove_volumes: bool) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let name = state.container_mut(id)?.name.clone();
        state.containers.remove(&name);
        state.specs.remove(&name);
        state
            .mutations
            .push(Mutation::Remove(id.clone(), remove_volumes));
        Ok(())
    }

    fn update_restart_policy(&mut self, id: &ContainerId, policy: RestartPolicy) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.container_mut(id)?.restart_policy = Some(policy);
        state.mutations.push(Mutation::Update(id.clone(), policy));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containers_resolve_by_name_or_id() {
        let mut backend = MemoryBackend::new();
        backend.insert_foreign("redis");
        let id = backend.container("redis").unwrap().id;

        let by_name = backend.get_container("redis").unwrap().unwrap();
        let by_id = backend.get_container(&id.0).unwrap().unwrap();
        assert_eq!(by_name.id, id);
        assert_eq!(by_id.name, ContainerName("redis".into()));
        assert!(backend.get_container("missing").unwrap().is_none());
    }
}
