use anyhow::{anyhow, bail, Context, Result};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};
use serde_yaml;
use std::{
    collections::BTreeSet as Set,
    fmt,
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    models::{
        ContainerName, ContainerSpec, Declaration, EnvFile, HealthCheckSpec, HealthCommand,
        ImageName, ImageSpec, Mount, PortMapping, Protocol, RestartPolicy,
    },
    services::DeclarationFrontend,
};

const DEFAULT_ENV_FILE_TARGET: &str = "/app/.env";

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct DeclarationFile {
    pub image: Image,

    pub container: Container,

    #[serde(default)]
    pub ports: Vec<Port>,

    #[serde(default)]
    pub mounts: Vec<MountEntry>,

    pub env_file_path: Option<String>,

    pub env_file_target: Option<String>,

    pub env_content: Option<String>,

    #[serde(default)]
    pub restart_policy: Restart,

    pub health_check: Option<HealthCheck>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Image {
    pub name: String,

    pub build_context: String,

    pub dockerfile: Option<String>,

    #[serde(default)]
    pub ignore_build_changes: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Container {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum Port {
    Short(ShortPort),
    Extended {
        internal: u16,
        external: u16,
        #[serde(default)]
        protocol: Option<String>,
    },
}

/// `"8000"`, `8000` or `"9000:8000/tcp"`.
#[derive(Clone, Debug)]
struct ShortPort(PortMapping);

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum MountEntry {
    Short(String),
    Extended(ExtendedMount),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ExtendedMount {
    #[serde(rename_all = "camelCase")]
    Bind {
        source: String,
        target: String,
        #[serde(default)]
        read_only: bool,
    },
    #[serde(rename_all = "camelCase")]
    Volume {
        source: String,
        target: String,
        #[serde(default)]
        read_only: bool,
    },
    Tmpfs {
        target: String,
        size: Option<u64>,
    },
}

#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum Restart {
    Always,
    OnFailure,
    Never,
}

impl Default for Restart {
    fn default() -> Self {
        Restart::Always
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct HealthCheck {
    pub command: Command,

    #[serde(default = "default_interval")]
    pub interval: HumanDuration,

    #[serde(default = "default_interval")]
    pub timeout: HumanDuration,

    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default)]
    pub start_period: HumanDuration,
}

fn default_interval() -> HumanDuration {
    HumanDuration(Duration::from_secs(30))
}

fn default_retries() -> u32 {
    3
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum Command {
    Shell(String),
    Exec(Vec<String>),
}

#[derive(Copy, Clone, Debug, Default)]
struct HumanDuration(Duration);

fn parse_protocol(protocol: &str) -> Result<Protocol, String> {
    match protocol.to_ascii_lowercase().as_str() {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        _ => Err(format!("protocol must be 'tcp' or 'udp', got {:?}", protocol)),
    }
}

fn parse_port(value: &str) -> Result<PortMapping, String> {
    let (ports, protocol) = match value.find('/') {
        Some(index) => (&value[..index], parse_protocol(&value[index + 1..])?),
        None => (value, Protocol::Tcp),
    };

    let number = |s: &str| {
        s.trim()
            .parse::<u16>()
            .map_err(|err| format!("invalid port {:?}: {}", s, err))
    };

    let (external, internal) = match ports.find(':') {
        Some(index) => (number(&ports[..index])?, number(&ports[index + 1..])?),
        None => {
            let port = number(ports)?;
            (port, port)
        }
    };

    Ok(PortMapping {
        internal,
        external,
        protocol,
    })
}

impl<'de> Deserialize<'de> for ShortPort {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PortVisitor;

        impl<'de> Visitor<'de> for PortVisitor {
            type Value = ShortPort;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a port number or a string like \"EXTERNAL:INTERNAL/tcp\"")
            }

            fn visit_u64<E>(self, value: u64) -> Result<ShortPort, E>
            where
                E: de::Error,
            {
                if value > u64::from(u16::MAX) {
                    return Err(E::custom(format!("port {} is out of range", value)));
                }
                let port = value as u16;
                Ok(ShortPort(PortMapping {
                    internal: port,
                    external: port,
                    protocol: Protocol::Tcp,
                }))
            }

            fn visit_str<E>(self, value: &str) -> Result<ShortPort, E>
            where
                E: de::Error,
            {
                parse_port(value).map(ShortPort).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(PortVisitor)
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| value.len());
    let (amount, unit) = value.split_at(split);

    let amount = amount
        .parse::<u64>()
        .map_err(|_| format!("invalid duration {:?}", value))?;

    let seconds = |factor: u64| {
        amount
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration {:?} is too large", value))
    };

    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "" | "s" => seconds(1),
        "m" => seconds(60),
        "h" => seconds(60 * 60),
        _ => Err(format!(
            "invalid duration unit {:?}, expected one of ms, s, m, h",
            unit
        )),
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = HumanDuration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a duration like \"30s\" or a number of seconds")
            }

            fn visit_u64<E>(self, value: u64) -> Result<HumanDuration, E>
            where
                E: de::Error,
            {
                Ok(HumanDuration(Duration::from_secs(value)))
            }

            fn visit_str<E>(self, value: &str) -> Result<HumanDuration, E>
            where
                E: de::Error,
            {
                parse_duration(value).map(HumanDuration).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

/// Resolves `path` against the directory holding the declaration file.
fn resolve(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn is_bind_source(source: &str) -> bool {
    source.starts_with('/') || source.starts_with('.') || source.starts_with('~')
}

fn expand_home(source: &str) -> Result<String> {
    if let Some(rest) = source.strip_prefix('~') {
        let home = std::env::var("HOME").context("cannot expand ~ without $HOME")?;
        Ok(format!("{}{}", home, rest))
    } else {
        Ok(source.to_owned())
    }
}

impl MountEntry {
    fn into_mount(self, base: &Path) -> Result<Mount> {
        let mount = match self {
            MountEntry::Short(value) => {
                let parts = value.split(':').collect::<Vec<_>>();
                let (source, target, read_only) = match parts.as_slice() {
                    [source, target] => (*source, *target, false),
                    [source, target, "ro"] => (*source, *target, true),
                    [source, target, "rw"] => (*source, *target, false),
                    _ => bail!("invalid mount {:?}, expected SOURCE:TARGET[:ro|rw]", value),
                };

                if is_bind_source(source) {
                    Mount::Bind {
                        source: resolve(base, &expand_home(source)?),
                        target: PathBuf::from(target),
                        read_only,
                    }
                } else {
                    Mount::Volume {
                        name: source.to_owned(),
                        target: PathBuf::from(target),
                        read_only,
                    }
                }
            }
            MountEntry::Extended(ExtendedMount::Bind {
                source,
                target,
                read_only,
            }) => Mount::Bind {
                source: resolve(base, &expand_home(&source)?),
                target: PathBuf::from(target),
                read_only,
            },
            MountEntry::Extended(ExtendedMount::Volume {
                source,
                target,
                read_only,
            }) => Mount::Volume {
                name: source,
                target: PathBuf::from(target),
                read_only,
            },
            MountEntry::Extended(ExtendedMount::Tmpfs { target, size }) => Mount::Tmpfs {
                target: PathBuf::from(target),
                size,
            },
        };

        Ok(mount)
    }
}

impl HealthCheck {
    fn into_spec(self) -> Result<HealthCheckSpec> {
        let command = match self.command {
            Command::Shell(command) if !command.trim().is_empty() => HealthCommand::Shell(command),
            Command::Exec(argv) if !argv.is_empty() => HealthCommand::Exec(argv),
            _ => bail!("healthCheck.command must not be empty"),
        };

        if self.retries == 0 {
            bail!("healthCheck.retries must be at least 1");
        }
        if self.interval.0 == Duration::from_secs(0) || self.timeout.0 == Duration::from_secs(0) {
            bail!("healthCheck.interval and healthCheck.timeout must be positive");
        }

        Ok(HealthCheckSpec {
            command,
            interval: self.interval.0,
            timeout: self.timeout.0,
            retries: self.retries,
            start_period: self.start_period.0,
        })
    }
}

fn validate(declaration: &Declaration) -> Result<()> {
    if declaration.image.name.0.trim().is_empty() {
        bail!("image.name must not be empty");
    }
    if declaration.container.name.0.trim().is_empty() {
        bail!("container.name must not be empty");
    }

    let mut published = Set::new();
    for port in declaration.container.ports.iter() {
        if port.internal == 0 || port.external == 0 {
            bail!("port 0 cannot be published");
        }
        if !published.insert((port.external, port.protocol)) {
            bail!(
                "host port {}/{} is published more than once",
                port.external,
                port.protocol.as_str()
            );
        }
    }

    let mut targets = Set::new();
    for mount in declaration.container.all_mounts() {
        let target = mount.target();
        if !target.is_absolute() {
            bail!("mount target {} must be absolute", target.display());
        }
        if !targets.insert(target.clone()) {
            bail!("{} is mounted more than once", target.display());
        }
    }

    Ok(())
}

pub struct DeclarationFileFrontend;

impl DeclarationFileFrontend {
    pub fn new() -> DeclarationFileFrontend {
        DeclarationFileFrontend
    }

    /// Parses a declaration, resolving relative paths against `base`.
    pub fn parse(&self, contents: &str, base: &Path) -> Result<Declaration> {
        let file: DeclarationFile = serde_yaml::from_str(contents)?;

        let image_name = ImageName(file.image.name);
        let image = ImageSpec {
            name: image_name.clone(),
            context: resolve(base, &file.image.build_context),
            dockerfile: PathBuf::from(file.image.dockerfile.unwrap_or_else(|| "Dockerfile".into())),
            ignore_build_changes: file.image.ignore_build_changes,
        };

        let env_file = match (file.env_file_path, file.env_content) {
            (Some(path), content) => Some(EnvFile {
                path: resolve(base, &path),
                target: PathBuf::from(
                    file.env_file_target
                        .unwrap_or_else(|| DEFAULT_ENV_FILE_TARGET.into()),
                ),
                content,
            }),
            (None, Some(_)) => bail!("envContent requires envFilePath"),
            (None, None) => None,
        };

        let ports = file
            .ports
            .into_iter()
            .map(|port| -> Result<PortMapping> {
                match port {
                    Port::Short(ShortPort(mapping)) => Ok(mapping),
                    Port::Extended {
                        internal,
                        external,
                        protocol,
                    } => {
                        let protocol = match protocol {
                            Some(protocol) => parse_protocol(&protocol).map_err(|err| anyhow!(err))?,
                            None => Protocol::Tcp,
                        };
                        Ok(PortMapping {
                            internal,
                            external,
                            protocol,
                        })
                    }
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let mounts = file
            .mounts
            .into_iter()
            .map(|mount| mount.into_mount(base))
            .collect::<Result<Vec<_>>>()?;

        let restart_policy = match file.restart_policy {
            Restart::Always => RestartPolicy::Always,
            Restart::OnFailure => RestartPolicy::OnFailure,
            Restart::Never => RestartPolicy::Never,
        };

        let health_check = file.health_check.map(HealthCheck::into_spec).transpose()?;

        let container = ContainerSpec {
            name: ContainerName(file.container.name),
            image_name,
            ports,
            mounts,
            env_file,
            restart_policy,
            health_check,
            labels: Default::default(),
        };

        let declaration = Declaration { image, container };
        validate(&declaration)?;

        Ok(declaration)
    }
}

impl DeclarationFrontend for DeclarationFileFrontend {
    fn declaration<P: AsRef<Path>>(&mut self, declaration_path: P) -> Result<Declaration> {
        let declaration_path = declaration_path.as_ref();
        let mut file = File::open(declaration_path)
            .with_context(|| format!("failed to open {}", declaration_path.display()))?;

        let mut contents = String::new();
        std::io::Read::read_to_string(&mut file, &mut contents)?;

        let base = declaration_path
            .parent()
            .ok_or_else(|| anyhow!("declaration file has no parent directory"))?;

        self.parse(&contents, base)
            .with_context(|| format!("invalid declaration {}", declaration_path.display()))
    }
}
