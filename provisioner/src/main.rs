use anyhow::{anyhow, bail, Result};
use crossterm::{
    cursor,
    style::{self, Colorize, Styler},
    QueueableCommand,
};
use log::info;
use std::{
    env,
    io::{stderr, stdout, Write},
    path::{Path, PathBuf},
    process,
    time::Duration,
};
use structopt::StructOpt;

use backends::EngineBackend;
use controller::{ContainerOperation, Controller, ImageOperation};
use frontends::DeclarationFileFrontend;
use models::{BuildPolicy, ContainerName, HealthStatus};
use services::DeclarationFrontend;

mod backends;
mod context;
mod controller;
mod error;
mod frontends;
mod hasher;
mod models;
mod services;

const DECLARATION_FILE_NAMES: [&str; 2] = ["provision.yml", "provision.yaml"];
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, StructOpt)]
#[structopt(
    name = "provisioner",
    about = "Builds an image and keeps a single container running from it."
)]
struct Opt {
    #[structopt(short, long, parse(from_os_str))]
    /// Declaration file, defaults to provision.yml in the current directory or a parent.
    file: Option<PathBuf>,

    #[structopt(short, long)]
    /// Project name, defaults to the name of the declaration's directory.
    project_name: Option<String>,

    #[structopt(long, env = "PROVISIONER_ENGINE", default_value = "docker")]
    /// Container engine CLI to drive, e.g. docker or podman.
    engine: String,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Builds the image if it is missing or its build context changed.
    Build {
        #[structopt(long)]
        /// Build even if an up to date image exists.
        force: bool,
    },
    /// Shows what `up` would do without changing anything.
    Plan {
        #[structopt(long)]
        build: bool,
    },
    /// Builds the image, writes the env file and starts the container.
    Up {
        #[structopt(long)]
        /// Build the image even if an up to date one exists.
        build: bool,

        #[structopt(long, default_value = "5")]
        timeout: u32,

        #[structopt(long)]
        remove_orphans: bool,

        #[structopt(long)]
        /// Wait for the health check to pass.
        wait: bool,
    },
    Stop {
        #[structopt(long, default_value = "5")]
        timeout: u32,

        #[structopt(long)]
        remove_orphans: bool,
    },
    /// Stops and removes the container. The image and env file are kept.
    Down {
        #[structopt(long, default_value = "5")]
        timeout: u32,

        #[structopt(short, long)]
        /// Also remove the container's anonymous volumes. Named volumes are kept.
        volumes: bool,

        #[structopt(long)]
        remove_orphans: bool,
    },
    /// Reports the container's lifecycle state.
    Health {
        #[structopt(long)]
        /// Wait until the health check leaves `starting`.
        wait: bool,

        #[structopt(long)]
        /// Seconds to wait, defaults to what the health check needs to settle.
        timeout: Option<u64>,
    },
}

fn find_declaration_file<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    for path in path.as_ref().ancestors() {
        for name in DECLARATION_FILE_NAMES.iter() {
            let declaration_path = path.join(name);
            if declaration_path.exists() {
                return Some(declaration_path);
            }
        }
    }

    None
}

fn main() {
    pretty_env_logger::init_custom_env("PROVISIONER_LOG");

    let opt = Opt::from_args();

    if let Err(err) = run(opt) {
        let mut stderr = stderr();
        let _ = stderr.queue(style::PrintStyledContent("ERROR: ".red().bold()));
        let _ = stderr.queue(style::Print(format!("{:#}\n", err)));
        let _ = stderr.flush();

        process::exit(error::exit_code(&err));
    }
}

fn run(opt: Opt) -> Result<()> {
    let mut stdout = stdout();

    let declaration_path = match opt.file {
        Some(file) => file.canonicalize()?,
        None => find_declaration_file(env::current_dir()?).ok_or_else(|| {
            anyhow!("Couldn't find a provision.yml file in the current working directory or any of its parents.")
        })?,
    };
    info!("found declaration file {:?}", declaration_path);

    let work_directory = declaration_path
        .parent()
        .ok_or_else(|| anyhow!("Declaration file has no parent."))?;
    info!("found work directory {:?}", work_directory);

    env::set_current_dir(work_directory)?;

    let project_name = match opt.project_name {
        Some(project_name) => project_name,
        None => work_directory
            .file_name()
            .and_then(|path| path.to_str())
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("Couldn't determine the project name."))?,
    };
    info!("project name {:?}", project_name);

    let mut frontend = DeclarationFileFrontend::new();
    let declaration = frontend.declaration(declaration_path.as_path())?;
    info!("parsed declaration");

    let backend = EngineBackend::connect(opt.engine.as_str())?;
    info!("connected to {}", opt.engine);

    let mut controller = Controller::init(project_name, backend, declaration)?;
    info!("created controller");

    match opt.command {
        Command::Build { force } => {
            let build_policy = if force {
                BuildPolicy::Always
            } else {
                BuildPolicy::IfChanged
            };

            let image_id = controller.ensure_image(build_policy)?;
            println!("{}", image_id.0);
        }
        Command::Plan { build } => {
            let build_policy = if build {
                BuildPolicy::Always
            } else {
                BuildPolicy::IfChanged
            };
            plan(&mut controller, &mut stdout, build_policy)?;
        }
        Command::Up {
            build,
            timeout,
            remove_orphans,
            wait,
        } => {
            check_orphans(&mut controller, &mut stdout, remove_orphans, timeout)?;

            let build_policy = if build {
                BuildPolicy::Always
            } else {
                BuildPolicy::IfChanged
            };

            let image_id = controller.ensure_image(build_policy)?;
            controller.ensure_env_file()?;

            let diff = controller.start_containers_diff(Some(&image_id))?;
            container_apply(&mut controller, &mut stdout, diff, timeout)?;

            if wait {
                let deadline = controller.default_health_deadline();
                report_health(&mut controller, &mut stdout, deadline)?;
            }
        }
        Command::Stop {
            timeout,
            remove_orphans,
        } => {
            check_orphans(&mut controller, &mut stdout, remove_orphans, timeout)?;

            let diff = controller.stop_containers_diff()?;
            container_apply(&mut controller, &mut stdout, diff, timeout)?;
        }
        Command::Down {
            timeout,
            volumes,
            remove_orphans,
        } => {
            check_orphans(&mut controller, &mut stdout, remove_orphans, timeout)?;

            let diff = controller.remove_containers_diff(volumes)?;
            container_apply(&mut controller, &mut stdout, diff, timeout)?;
        }
        Command::Health { wait, timeout } => {
            if wait {
                let deadline = timeout
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| controller.default_health_deadline());
                report_health(&mut controller, &mut stdout, deadline)?;
            } else {
                let lifecycle = controller.lifecycle()?;
                stdout
                    .queue(style::Print(format!("{}\n", lifecycle)))?
                    .flush()?;
            }
        }
    }

    Ok(())
}

fn plan(
    controller: &mut Controller,
    stdout: &mut impl Write,
    build_policy: BuildPolicy,
) -> Result<()> {
    let image_name = controller.declaration().image.name.0.clone();
    let image_operation = controller.image_plan(build_policy)?;

    let image_line = match &image_operation {
        ImageOperation::Build => format!("Build image {}", image_name),
        ImageOperation::Rebuild => format!("Rebuild image {}", image_name),
        ImageOperation::Reuse(id) => format!("Reuse image {} ({})", image_name, id.0),
    };
    stdout.queue(style::Print(format!("{}\n", image_line)))?;

    if controller.env_file_outdated() {
        if let Some(env_file) = &controller.declaration().container.env_file {
            stdout.queue(style::Print(format!(
                "Write env file {}\n",
                env_file.path.display()
            )))?;
        }
    }

    let image_id = match image_operation {
        ImageOperation::Reuse(id) => Some(id),
        ImageOperation::Build | ImageOperation::Rebuild => None,
    };

    let diff = controller.start_containers_diff(image_id.as_ref())?;
    for (container_name, operation) in diff.iter() {
        stdout.queue(style::Print(format!(
            "{} {}\n",
            operation_name(*operation),
            container_name
        )))?;
    }

    for orphan in controller.find_orphans()? {
        stdout
            .queue(style::PrintStyledContent("INFO: ".cyan().bold()))?
            .queue(style::Print(format!("{} is an orphan\n", orphan)))?;
    }

    stdout.flush()?;
    Ok(())
}

fn report_health(
    controller: &mut Controller,
    stdout: &mut impl Write,
    deadline: Duration,
) -> Result<()> {
    let status = controller.wait_healthy(deadline, HEALTH_POLL_INTERVAL)?;

    let styled = match status {
        HealthStatus::Healthy => "healthy".green().bold(),
        HealthStatus::Starting => "starting".yellow().bold(),
        HealthStatus::Unhealthy => "unhealthy".red().bold(),
    };
    stdout
        .queue(style::PrintStyledContent(styled))?
        .queue(style::Print("\n"))?
        .flush()?;

    match status {
        HealthStatus::Healthy => Ok(()),
        HealthStatus::Starting => bail!("health check did not settle within {:?}", deadline),
        HealthStatus::Unhealthy => bail!("container is unhealthy"),
    }
}

/// Looks for orphans, if there are any and `remove_orphans` is set to true
/// they will be removed. Otherwise a message will be printed.
fn check_orphans(
    controller: &mut Controller,
    stdout: &mut impl Write,
    remove_orphans: bool,
    timeout: u32,
) -> Result<()> {
    let orphans = controller.find_orphans()?;

    if !orphans.is_empty() {
        if remove_orphans {
            let diff = orphans
                .into_iter()
                .map(|name| (name, ContainerOperation::Remove { volumes: false }))
                .collect();
            container_apply(controller, stdout, diff, timeout)?;
        } else {
            stdout
                .queue(style::PrintStyledContent("INFO: ".cyan().bold()))?
                .queue(style::Print(
                    "found orphans, rerun with --remove-orphans to remove them.\n",
                ))?
                .flush()?;
        }
    } else {
        info!("found no orphans");
    }

    Ok(())
}

fn operation_name(operation: ContainerOperation) -> &'static str {
    match operation {
        ContainerOperation::Create => "Create",
        ContainerOperation::Recreate => "Recreate",
        ContainerOperation::Update => "Update",
        ContainerOperation::Start => "Start",
        ContainerOperation::Stop => "Stop",
        ContainerOperation::Remove { .. } => "Remove",
    }
}

fn container_apply(
    controller: &mut Controller,
    stdout: &mut impl Write,
    operations: Vec<(ContainerName, ContainerOperation)>,
    timeout: u32,
) -> Result<()> {
    fn operation_verb(operation: ContainerOperation) -> &'static str {
        match operation {
            ContainerOperation::Create => "Creating",
            ContainerOperation::Recreate => "Recreating",
            ContainerOperation::Update => "Updating",
            ContainerOperation::Start => "Starting",
            ContainerOperation::Stop => "Stopping",
            ContainerOperation::Remove { .. } => "Removing",
        }
    }

    let lines = operations
        .iter()
        .map(|(container_name, operation)| {
            let verb = operation_verb(*operation);
            format!("{} {}", verb, container_name)
        })
        .collect::<Vec<_>>();

    let longest_line = lines.iter().map(|line| line.len()).max().unwrap_or(0);

    for line in lines.iter() {
        stdout.queue(style::Print(line))?;

        let padding = longest_line - line.len() + 1;
        stdout
            .queue(cursor::MoveRight(padding as u16))?
            .queue(style::Print("...\n"))?;
    }

    stdout.flush()?;

    for (line, (container_name, operation)) in operations.into_iter().enumerate() {
        controller.container_apply(&container_name, operation, timeout)?;

        stdout
            .queue(cursor::SavePosition)?
            .queue(cursor::MoveToPreviousLine((lines.len() - line) as u16))?
            .queue(cursor::MoveRight(longest_line as u16 + 5))?
            .queue(style::PrintStyledContent("done".green().bold()))?
            .queue(cursor::RestorePosition)?
            .flush()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn declaration_file_is_found_in_a_parent() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("provision.yaml"), "").unwrap();
        let nested = dir.path().join("app/src");
        fs::create_dir_all(&nested).unwrap();

        assert_eq!(
            find_declaration_file(&nested),
            Some(dir.path().join("provision.yaml"))
        );
    }

    #[test]
    fn yml_wins_over_yaml() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("provision.yml"), "").unwrap();
        fs::write(dir.path().join("provision.yaml"), "").unwrap();

        assert_eq!(
            find_declaration_file(dir.path()),
            Some(dir.path().join("provision.yml"))
        );
    }

    #[test]
    fn parses_up_flags() {
        let opt = Opt::from_iter(vec![
            "provisioner",
            "--engine",
            "podman",
            "up",
            "--build",
            "--wait",
            "--timeout",
            "10",
        ]);

        assert_eq!(opt.engine, "podman");
        match opt.command {
            Command::Up {
                build,
                timeout,
                remove_orphans,
                wait,
            } => {
                assert!(build);
                assert!(wait);
                assert!(!remove_orphans);
                assert_eq!(timeout, 10);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn parses_down_volumes() {
        let opt = Opt::from_iter(vec!["provisioner", "down", "-v"]);

        match opt.command {
            Command::Down { volumes, .. } => assert!(volumes),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
