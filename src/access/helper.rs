//! Access through a helper CLI that knows how to reach the cluster VM,
//! `minikube service --url` being the canonical one.

use std::{process::Stdio, sync::Mutex, time::Duration};

use snafu::ResultExt;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::{Child, Command},
    time::timeout,
};

use super::{
    AccessFailure, HelperIoSnafu, HelperSpawnSnafu, access_error,
    node_port::{fetch_service, node_port},
};
use crate::{
    Error,
    cache::{CacheEntry, EndpointCache, Releasable},
    cluster::ClusterHandle,
    endpoint::{ExternalEndpoint, ResourceId},
    internal_events::{HelperFallbackUsed, HelperInvoked},
};

pub const DEFAULT_PROGRAM: &str = "minikube";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A helper still running after printing its URL, typically because it
/// serves the tunnel behind that URL. Killed on release.
#[derive(Debug)]
pub struct HelperSession {
    child: Mutex<Option<Child>>,
}

impl Releasable for HelperSession {
    fn release(&self) {
        let child = match self.child.lock() {
            Ok(mut child) => child.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut child) = child {
            let _ = child.start_kill();
        }
    }
}

pub struct HelperProcess {
    command: Vec<String>,
    profile: Option<String>,
    timeout: Duration,
    cache: EndpointCache<HelperSession>,
}

impl Default for HelperProcess {
    fn default() -> Self {
        Self::new(vec![DEFAULT_PROGRAM.to_owned()], None, DEFAULT_TIMEOUT)
    }
}

enum ServiceOutput {
    Found(ExternalEndpoint),
    Exited {
        exit_code: Option<i32>,
        lines: Vec<String>,
    },
}

impl HelperProcess {
    /// `command` is the program followed by any fixed leading arguments.
    pub fn new(command: Vec<String>, profile: Option<String>, timeout: Duration) -> Self {
        Self {
            command,
            profile,
            timeout,
            cache: EndpointCache::new(),
        }
    }

    pub const fn cache(&self) -> &EndpointCache<HelperSession> {
        &self.cache
    }

    pub async fn resolve(
        &self,
        cluster: &dyn ClusterHandle,
        resource: &ResourceId,
        port: u16,
    ) -> Result<ExternalEndpoint, Error> {
        let key = resource.key(port);
        self.cache
            .get_or_try_insert_with(&key, || async {
                let primary = match self.service_url(resource).await {
                    Ok((endpoint, session)) => {
                        return Ok(CacheEntry::new(endpoint, session));
                    }
                    Err(primary) => primary,
                };
                emit!(HelperFallbackUsed {
                    resource,
                    error: &primary
                });
                match self.fallback(cluster, resource, port).await {
                    Ok(endpoint) => Ok(CacheEntry::new(endpoint, None)),
                    Err(fallback) => Err(access_error(
                        resource,
                        port,
                        AccessFailure::HelperFallback {
                            primary: Box::new(primary),
                            fallback: Box::new(fallback),
                        },
                    )),
                }
            })
            .await
    }

    pub fn cleanup(&self, resource: &ResourceId) {
        self.cache.invalidate_resource(resource);
    }

    fn build_command<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> Command {
        let (program, leading) = match self.command.split_first() {
            Some((program, leading)) => (program.as_str(), leading),
            None => (DEFAULT_PROGRAM, &[][..]),
        };
        let mut command = Command::new(program);
        command.args(leading);
        if let Some(profile) = &self.profile {
            command.arg("-p").arg(profile);
        }
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn program(&self) -> String {
        self.command.join(" ")
    }

    /// Runs `<helper> service <name> -n <namespace> --url` and takes the
    /// first line that is a well-formed `http(s)://` URL.
    async fn service_url(
        &self,
        resource: &ResourceId,
    ) -> Result<(ExternalEndpoint, Option<HelperSession>), AccessFailure> {
        let args = [
            "service",
            resource.name.as_str(),
            "-n",
            resource.namespace.as_str(),
            "--url",
        ];
        emit!(HelperInvoked {
            program: &self.program(),
            args: &args
        });
        let mut child = self
            .build_command(args)
            .spawn()
            .context(HelperSpawnSnafu {
                program: self.program(),
            })?;
        let stdout = child.stdout.take();
        let stderr = tokio::spawn(read_all(child.stderr.take()));

        let output = timeout(self.timeout, async {
            let mut lines = Vec::new();
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout).lines();
                while let Some(line) = reader.next_line().await.context(HelperIoSnafu)? {
                    if let Some(endpoint) = parse_helper_url(&line) {
                        return Ok(ServiceOutput::Found(endpoint));
                    }
                    lines.push(line);
                }
            }
            let status = child.wait().await.context(HelperIoSnafu)?;
            Ok::<_, AccessFailure>(ServiceOutput::Exited {
                exit_code: status.code(),
                lines,
            })
        })
        .await;

        match output {
            Err(_) => {
                let _ = child.start_kill();
                Err(AccessFailure::HelperTimeout {
                    timeout: self.timeout,
                })
            }
            Ok(Err(error)) => Err(error),
            Ok(Ok(ServiceOutput::Found(endpoint))) => {
                let session = match child.try_wait() {
                    Ok(Some(_)) => None,
                    _ => Some(HelperSession {
                        child: Mutex::new(Some(child)),
                    }),
                };
                Ok((endpoint, session))
            }
            Ok(Ok(ServiceOutput::Exited { exit_code, lines })) => {
                let stderr = stderr.await.unwrap_or_default();
                let mut output = lines.join("\n");
                if !stderr.trim().is_empty() {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(stderr.trim());
                }
                Err(AccessFailure::HelperOutput { exit_code, output })
            }
        }
    }

    /// Asks the helper for the cluster address and pairs it with the node
    /// port of the service.
    async fn fallback(
        &self,
        cluster: &dyn ClusterHandle,
        resource: &ResourceId,
        port: u16,
    ) -> Result<ExternalEndpoint, Error> {
        let address = self
            .cluster_address()
            .await
            .map_err(|source| access_error(resource, port, source))?;
        let service = fetch_service(cluster, resource).await?;
        let node_port = node_port(&service, resource, port)?;
        Ok(ExternalEndpoint::new(address, node_port))
    }

    /// First non-empty line printed by `<helper> ip`.
    async fn cluster_address(&self) -> Result<String, AccessFailure> {
        emit!(HelperInvoked {
            program: &self.program(),
            args: &["ip"]
        });
        let child = self.build_command(["ip"]).spawn().context(HelperSpawnSnafu {
            program: self.program(),
        })?;
        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| AccessFailure::HelperTimeout {
                timeout: self.timeout,
            })?
            .context(HelperIoSnafu)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let address = stdout.lines().map(str::trim).find(|line| !line.is_empty());
        match address {
            Some(address) if output.status.success() => Ok(address.to_owned()),
            _ => Err(AccessFailure::HelperOutput {
                exit_code: output.status.code(),
                output: format!(
                    "{} {}",
                    stdout.trim(),
                    String::from_utf8_lossy(&output.stderr).trim()
                )
                .trim()
                .to_owned(),
            }),
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut output = String::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_string(&mut output).await;
    }
    output
}

/// Parses one line of helper output as an endpoint if the line is an
/// `http://` or `https://` URL with a host.
pub fn parse_helper_url(line: &str) -> Option<ExternalEndpoint> {
    let line = line.trim();
    if !(line.starts_with("http://") || line.starts_with("https://")) {
        return None;
    }
    ExternalEndpoint::from_url(line).ok()
}
