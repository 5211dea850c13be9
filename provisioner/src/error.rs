use std::{io, path::PathBuf};

use thiserror::Error;

/// Failures that abort a reconciliation and need operator attention.
///
/// These travel inside `anyhow::Error`; `main` downcasts to pick the exit
/// code.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The image could not be built. No container has been touched.
    #[error("failed to build image {image}: {reason}")]
    Build { image: String, reason: String },
    /// A managed env file could not be written.
    #[error("failed to write {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The container name is taken by something this project did not create.
    #[error("container name {name:?} is already in use: {reason}")]
    Conflict { name: String, reason: String },
    /// The container engine could not be reached.
    #[error("cannot reach the {engine} engine: {reason}")]
    EngineUnavailable { engine: String, reason: String },
}

impl ProvisionError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionError::Build { .. } => 2,
            ProvisionError::Io { .. } => 3,
            ProvisionError::Conflict { .. } => 4,
            ProvisionError::EngineUnavailable { .. } => 5,
        }
    }
}

/// Reclassifies an unclassified failure on the build path as a build error
/// for `image`. Errors that already carry a `ProvisionError` pass through.
pub fn build_failure(image: &str, err: anyhow::Error) -> anyhow::Error {
    if classified(&err) {
        return err;
    }

    ProvisionError::Build {
        image: image.to_owned(),
        reason: format!("{:#}", err),
    }
    .into()
}

fn classified(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<ProvisionError>().is_some())
}

/// Exit code for an error returned from a command.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ProvisionError>())
        .map(ProvisionError::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use std::error::Error as _;

    #[test]
    fn exit_code_survives_context() {
        let err: anyhow::Result<()> = Err(ProvisionError::Conflict {
            name: "mcp-server".into(),
            reason: "not created by project \"app\"".into(),
        }
        .into());
        let err = err.context("reconciling mcp-server").unwrap_err();

        assert_eq!(exit_code(&err), 4);
    }

    #[test]
    fn unclassified_errors_exit_with_one() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn build_failure_wraps_only_unclassified_errors() {
        let err = build_failure("app", anyhow::anyhow!("tar stream broke"));
        assert_eq!(exit_code(&err), 2);
        assert!(err.to_string().contains("tar stream broke"));

        let unavailable = ProvisionError::EngineUnavailable {
            engine: "docker".into(),
            reason: "not running".into(),
        };
        let err = build_failure("app", unavailable.into());
        assert_eq!(exit_code(&err), 5);
    }

    #[test]
    fn io_error_keeps_its_source() {
        let err = ProvisionError::Io {
            path: "/srv/app/.env".into(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };

        assert!(err.source().is_some());
        assert!(err.to_string().contains("/srv/app/.env"));
        assert_eq!(err.exit_code(), 3);

        let err = anyhow::Error::from(err);
        assert_eq!(format!("{:#}", err), "failed to write /srv/app/.env: denied");
    }
}
