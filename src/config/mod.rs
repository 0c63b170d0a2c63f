//! File-based description of the dependencies a test run needs.

mod format;

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    time::Duration,
};

use regex::Regex;
use reqwest::Method;
use serde::Deserialize;
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
use snafu::{ResultExt, Snafu};

pub use self::format::Format;
use crate::{
    access::AccessStrategy,
    builder::{ContainerSpec, ProbeSpec, ResourceSpec},
    cluster::WorkloadKind,
    endpoint::ResourceId,
    lifecycle::{DEFAULT_READINESS_TIMEOUT, LifecycleSettings, ManagedResource},
    namespace,
    wait::{CommandCheck, DEFAULT_HTTP_STATUSES, HttpCheck, LogCheck, PollInterval, WaitStrategy},
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Could not read {:?}: {}", path, source))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unknown config format for {:?}; use .toml, .yaml, .yml or .json", path))]
    UnknownFormat { path: PathBuf },

    #[snafu(display("Could not parse {} config: {}", format, message))]
    Parse { format: Format, message: String },

    #[snafu(display("Invalid config:\n{}", errors.join("\n")))]
    Invalid { errors: Vec<String> },

    #[snafu(display("No resource named {:?} in config", name))]
    UnknownResource { name: String },
}

const fn default_readiness_timeout() -> Duration {
    DEFAULT_READINESS_TIMEOUT
}

const fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LifecycleConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_readiness_timeout", rename = "readiness_timeout_secs")]
    pub readiness_timeout: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_poll_interval", rename = "poll_interval_ms")]
    pub poll_interval: Duration,

    /// When set, the interval doubles after every attempt up to this cap.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(default, rename = "max_poll_interval_ms")]
    pub max_poll_interval: Option<Duration>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            readiness_timeout: default_readiness_timeout(),
            poll_interval: default_poll_interval(),
            max_poll_interval: None,
        }
    }
}

impl LifecycleConfig {
    pub const fn settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            readiness_timeout: self.readiness_timeout,
            poll_interval: match self.max_poll_interval {
                Some(max) => PollInterval::Backoff {
                    initial: self.poll_interval,
                    max,
                },
                None => PollInterval::Fixed(self.poll_interval),
            },
        }
    }
}

const fn default_max_wait() -> Duration {
    crate::access::load_balancer::DEFAULT_MAX_WAIT
}

const fn default_lb_interval() -> Duration {
    crate::access::load_balancer::DEFAULT_INTERVAL
}

const fn default_helper_timeout() -> Duration {
    crate::access::helper::DEFAULT_TIMEOUT
}

fn default_helper_program() -> String {
    crate::access::helper::DEFAULT_PROGRAM.to_owned()
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum AccessConfig {
    #[default]
    PortForward,
    NodePort {
        #[serde(default)]
        node_address: Option<String>,
    },
    LoadBalancer {
        #[serde_as(as = "DurationSeconds<u64>")]
        #[serde(default = "default_max_wait", rename = "max_wait_secs")]
        max_wait: Duration,

        #[serde_as(as = "DurationSeconds<u64>")]
        #[serde(default = "default_lb_interval", rename = "poll_interval_secs")]
        poll_interval: Duration,
    },
    HelperProcess {
        #[serde(default = "default_helper_program")]
        program: String,

        /// Arguments placed before the helper's own subcommands.
        #[serde(default)]
        args: Vec<String>,

        #[serde(default)]
        profile: Option<String>,

        #[serde_as(as = "DurationSeconds<u64>")]
        #[serde(default = "default_helper_timeout", rename = "timeout_secs")]
        timeout: Duration,
    },
}

impl AccessConfig {
    pub fn build(&self) -> AccessStrategy {
        match self {
            AccessConfig::PortForward => AccessStrategy::port_forward(),
            AccessConfig::NodePort { node_address } => {
                AccessStrategy::node_port(node_address.clone())
            }
            AccessConfig::LoadBalancer {
                max_wait,
                poll_interval,
            } => AccessStrategy::load_balancer(*max_wait, *poll_interval),
            AccessConfig::HelperProcess {
                program,
                args,
                profile,
                timeout,
            } => {
                let command = std::iter::once(program.clone())
                    .chain(args.iter().cloned())
                    .collect();
                AccessStrategy::helper_process(command, profile.clone(), *timeout)
            }
        }
    }

    fn validate(&self, errors: &mut Vec<String>) {
        match self {
            AccessConfig::PortForward | AccessConfig::NodePort { .. } => {}
            AccessConfig::LoadBalancer {
                max_wait,
                poll_interval,
            } => {
                if max_wait.is_zero() {
                    errors.push("access: max_wait_secs must be greater than zero".into());
                }
                if poll_interval.is_zero() {
                    errors.push("access: poll_interval_secs must be greater than zero".into());
                }
            }
            AccessConfig::HelperProcess {
                program, timeout, ..
            } => {
                if program.trim().is_empty() {
                    errors.push("access: program must not be empty".into());
                }
                if timeout.is_zero() {
                    errors.push("access: timeout_secs must be greater than zero".into());
                }
            }
        }
    }
}

const fn default_delete_on_exit() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamespaceConfig {
    /// Use exactly this namespace.
    #[serde(default)]
    pub name: Option<String>,

    /// Generate a namespace name containing this context.
    #[serde(default)]
    pub context: Option<String>,

    #[serde(default = "default_delete_on_exit")]
    pub delete_on_exit: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            name: None,
            context: None,
            delete_on_exit: default_delete_on_exit(),
        }
    }
}

impl NamespaceConfig {
    /// The explicit name, or a freshly generated one.
    pub fn resolve_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => namespace::generate(self.context.as_deref()),
        }
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if let Some(name) = &self.name {
            if self.context.is_some() {
                errors.push("namespace: set either name or context, not both".into());
            }
            if !is_dns_label(name) {
                errors.push(format!(
                    "namespace: {:?} is not a valid namespace name",
                    name
                ));
            }
        }
    }
}

fn default_http_path() -> String {
    "/".into()
}

const fn default_times() -> usize {
    1
}

const fn default_request_timeout() -> Duration {
    crate::wait::DEFAULT_HTTP_REQUEST_TIMEOUT
}

/// One readiness condition. Ports default to the resource's internal port.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitConfig {
    Readiness,
    Port {
        #[serde(default)]
        port: Option<u16>,
    },
    Http {
        #[serde(default)]
        port: Option<u16>,

        #[serde(default = "default_http_path")]
        path: String,

        #[serde(default)]
        method: Option<String>,

        #[serde(default)]
        tls: bool,

        #[serde(default)]
        statuses: Vec<u16>,

        /// Regex the response body must match.
        #[serde(default)]
        body: Option<String>,

        #[serde_as(as = "DurationSeconds<u64>")]
        #[serde(default = "default_request_timeout", rename = "request_timeout_secs")]
        request_timeout: Duration,
    },
    LogMessage {
        pattern: String,

        #[serde(default = "default_times")]
        times: usize,
    },
    Command {
        command: Vec<String>,
    },
}

impl WaitConfig {
    pub fn build(&self, internal_port: u16) -> Result<WaitStrategy, String> {
        Ok(match self {
            WaitConfig::Readiness => WaitStrategy::Readiness,
            WaitConfig::Port { port } => WaitStrategy::Port {
                port: port.unwrap_or(internal_port),
            },
            WaitConfig::Http {
                port,
                path,
                method,
                tls,
                statuses,
                body,
                request_timeout,
            } => {
                let method = match method {
                    Some(method) => Method::from_bytes(method.to_uppercase().as_bytes())
                        .map_err(|_| format!("invalid HTTP method {:?}", method))?,
                    None => Method::GET,
                };
                if request_timeout.is_zero() {
                    return Err("request_timeout_secs must be greater than zero".into());
                }
                let body = body
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|error| format!("invalid body pattern: {}", error))?;
                WaitStrategy::Http(HttpCheck {
                    path: path.clone(),
                    method,
                    tls: *tls,
                    statuses: if statuses.is_empty() {
                        DEFAULT_HTTP_STATUSES.to_vec()
                    } else {
                        statuses.clone()
                    },
                    body,
                    request_timeout: *request_timeout,
                    ..HttpCheck::new(port.unwrap_or(internal_port))
                })
            }
            WaitConfig::LogMessage { pattern, times } => {
                let pattern = Regex::new(pattern)
                    .map_err(|error| format!("invalid log pattern: {}", error))?;
                if *times == 0 {
                    return Err("times must be at least 1".into());
                }
                WaitStrategy::LogMessage(LogCheck {
                    pattern,
                    times: *times,
                })
            }
            WaitConfig::Command { command } => {
                if command.is_empty() {
                    return Err("command must not be empty".into());
                }
                WaitStrategy::Command(CommandCheck {
                    command: command.clone(),
                })
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(default)]
    pub kind: WorkloadKind,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Defaults to the first declared port.
    #[serde(default)]
    pub internal_port: Option<u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub readiness_probe: Option<ProbeSpec>,
    /// Conditions that must all hold. Empty means workload readiness.
    #[serde(default)]
    pub wait: Vec<WaitConfig>,
}

impl ResourceConfig {
    pub fn internal_port(&self) -> Option<u16> {
        self.internal_port.or_else(|| self.ports.first().copied())
    }

    pub fn wait_strategy(&self) -> Result<WaitStrategy, Vec<String>> {
        let Some(internal_port) = self.internal_port() else {
            return Err(vec![format!(
                "resource {:?}: no ports are declared",
                self.name
            )]);
        };
        let mut errors = Vec::new();
        let mut strategies = Vec::new();
        for (index, wait) in self.wait.iter().enumerate() {
            match wait.build(internal_port) {
                Ok(strategy) => strategies.push(strategy),
                Err(error) => errors.push(format!(
                    "resource {:?}: wait[{}]: {}",
                    self.name, index, error
                )),
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(match strategies.len() {
            0 => WaitStrategy::Readiness,
            1 => strategies.remove(0),
            _ => WaitStrategy::all(strategies),
        })
    }

    /// Builds the managed resource placed in `namespace`.
    pub fn build(&self, namespace: &str) -> Result<ManagedResource, Error> {
        let wait = self
            .wait_strategy()
            .map_err(|errors| Error::Invalid { errors })?;
        let internal_port = self.internal_port().unwrap_or_default();
        let container = ContainerSpec {
            image: self.image.clone(),
            ports: self.ports.clone(),
            env: self.env.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            readiness_probe: self.readiness_probe.clone(),
        };
        let mut spec = ResourceSpec::new(
            ResourceId::new(namespace, &self.name),
            container,
            internal_port,
        );
        spec.kind = self.kind;
        spec.labels = self.labels.clone();
        Ok(ManagedResource::new(spec, wait))
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if !is_dns_label(&self.name) {
            errors.push(format!(
                "resource {:?}: name must be lowercase alphanumerics and '-', at most {} characters",
                self.name,
                namespace::MAX_LENGTH
            ));
        }
        if self.image.trim().is_empty() {
            errors.push(format!("resource {:?}: image must not be empty", self.name));
        }
        if let Some(port) = self.internal_port
            && !self.ports.is_empty()
            && !self.ports.contains(&port)
        {
            errors.push(format!(
                "resource {:?}: internal port {} is not among the declared ports",
                self.name, port
            ));
        }
        if let Err(wait_errors) = self.wait_strategy() {
            errors.extend(wait_errors);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub namespace: NamespaceConfig,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

impl Config {
    /// Reads, parses and validates the config at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let format = Format::from_path(path).map_err(|path| Error::UnknownFormat {
            path: path.to_owned(),
        })?;
        let content = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        Self::load_from_str(&content, format)
    }

    /// Parses and validates `content`.
    pub fn load_from_str(content: &str, format: Format) -> Result<Self, Error> {
        let config: Config = format::deserialize(content, format)
            .map_err(|message| Error::Parse { format, message })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let mut errors = Vec::new();

        if self.lifecycle.readiness_timeout.is_zero() {
            errors.push("lifecycle: readiness_timeout_secs must be greater than zero".into());
        }
        if self.lifecycle.poll_interval.is_zero() {
            errors.push("lifecycle: poll_interval_ms must be greater than zero".into());
        }
        if let Some(max) = self.lifecycle.max_poll_interval
            && max < self.lifecycle.poll_interval
        {
            errors.push(
                "lifecycle: max_poll_interval_ms must not be less than poll_interval_ms".into(),
            );
        }
        self.access.validate(&mut errors);
        self.namespace.validate(&mut errors);

        let mut names = HashSet::new();
        for resource in &self.resources {
            if !names.insert(resource.name.as_str()) {
                errors.push(format!("duplicate resource name {:?}", resource.name));
            }
            resource.validate(&mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Invalid { errors })
        }
    }

    /// The resources named in `names`, in config order. All of them if
    /// `names` is empty.
    pub fn select(&self, names: &[String]) -> Result<Vec<&ResourceConfig>, Error> {
        if let Some(name) = names
            .iter()
            .find(|name| !self.resources.iter().any(|resource| &resource.name == *name))
        {
            return Err(Error::UnknownResource { name: name.clone() });
        }
        Ok(self
            .resources
            .iter()
            .filter(|resource| names.is_empty() || names.contains(&resource.name))
            .collect())
    }
}

fn is_dns_label(name: &str) -> bool {
    !name.is_empty() && name.len() <= namespace::MAX_LENGTH && namespace::sanitize(name) == name
}
