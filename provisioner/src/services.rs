use anyhow::Result;
use std::{collections::BTreeMap as Map, path::Path};

use crate::models::{
    Container, ContainerId, ContainerName, ContainerSpec, Declaration, Image, ImageId, ImageName,
    ImageSpec, RestartPolicy,
};

pub trait DeclarationFrontend {
    fn declaration<P: AsRef<Path>>(&mut self, declaration_path: P) -> Result<Declaration>;
}

/// A thin client over a container engine.
pub trait ContainerBackend {
    fn get_image(&mut self, name: &ImageName) -> Result<Option<Image>>;

    /// Builds `image_spec` from a tar archive of its build context.
    fn build_image(
        &mut self,
        image_spec: &ImageSpec,
        context_archive: &Path,
        labels: &Map<String, String>,
    ) -> Result<ImageId>;

    /// Looks up a container by name or id, regardless of who created it.
    fn get_container(&mut self, name: &str) -> Result<Option<Container>>;

    fn list_containers(
        &mut self,
        labels: Vec<(&str, &str)>,
    ) -> Result<Map<ContainerName, Container>>;

    fn create_container(&mut self, container_spec: ContainerSpec) -> Result<ContainerId>;

    fn start_container(&mut self, id: &ContainerId) -> Result<()>;

    fn stop_container(&mut self, id: &ContainerId, timeout: u32) -> Result<()>;

    fn remove_container(&mut self, id: &ContainerId, remove_volumes: bool) -> Result<()>;

    fn update_restart_policy(&mut self, id: &ContainerId, policy: RestartPolicy) -> Result<()>;
}
