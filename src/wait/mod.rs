//! Readiness conditions and the engine that waits for them.

mod poll;

use std::{fmt, time::Duration};

use futures::{FutureExt, future::BoxFuture};
use regex::Regex;
use reqwest::{Method, StatusCode};
use tokio::{net::TcpStream, time::Instant};

pub use self::poll::{PollInterval, Probe, WaitOutcome, poll_until};
use crate::{
    Error,
    access::AccessStrategy,
    cluster::{ClusterHandle, WorkloadKind},
    endpoint::{ExternalEndpoint, ResourceId},
};

pub const DEFAULT_HTTP_STATUSES: [u16; 4] = [200, 201, 202, 204];
pub const DEFAULT_HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// What a waiting resource is checked against.
pub struct WaitContext<'a> {
    pub cluster: &'a dyn ClusterHandle,
    pub resource: &'a ResourceId,
    pub kind: WorkloadKind,
    pub interval: PollInterval,
}

#[derive(Debug, Clone)]
pub struct HttpCheck {
    pub port: u16,
    pub path: String,
    pub method: Method,
    pub tls: bool,
    pub statuses: Vec<u16>,
    pub body: Option<Regex>,
    pub request_timeout: Duration,
}

impl HttpCheck {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            path: "/".into(),
            method: Method::GET,
            tls: false,
            statuses: DEFAULT_HTTP_STATUSES.to_vec(),
            body: None,
            request_timeout: DEFAULT_HTTP_REQUEST_TIMEOUT,
        }
    }

    fn url(&self, endpoint: &ExternalEndpoint) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        let path = self.path.trim_start_matches('/');
        format!("{}/{}", endpoint.to_url(scheme), path)
    }
}

#[derive(Debug, Clone)]
pub struct LogCheck {
    pub pattern: Regex,
    /// Minimum number of matching lines.
    pub times: usize,
}

impl LogCheck {
    pub fn matches(&self, logs: &str) -> usize {
        logs.lines().filter(|line| self.pattern.is_match(line)).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCheck {
    pub command: Vec<String>,
}

/// A readiness condition. `All` succeeds once every member has succeeded,
/// checked in order against one shared deadline.
#[derive(Debug, Clone, Default)]
pub enum WaitStrategy {
    /// Ready replicas equal desired replicas.
    #[default]
    Readiness,
    /// A TCP connection to the externally resolved port succeeds.
    Port { port: u16 },
    Http(HttpCheck),
    LogMessage(LogCheck),
    Command(CommandCheck),
    All(Vec<WaitStrategy>),
}

impl fmt::Display for WaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitStrategy::Readiness => f.write_str("readiness"),
            WaitStrategy::Port { port } => write!(f, "port {} accepting connections", port),
            WaitStrategy::Http(check) => write!(
                f,
                "{} {} on port {} returning {:?}",
                check.method, check.path, check.port, check.statuses
            ),
            WaitStrategy::LogMessage(check) => write!(
                f,
                "log matching {:?} {} time(s)",
                check.pattern.as_str(),
                check.times
            ),
            WaitStrategy::Command(check) => write!(f, "command {:?} exiting 0", check.command),
            WaitStrategy::All(strategies) => {
                let names: Vec<String> = strategies.iter().map(ToString::to_string).collect();
                write!(f, "all of [{}]", names.join(", "))
            }
        }
    }
}

impl WaitStrategy {
    pub fn all(strategies: impl IntoIterator<Item = WaitStrategy>) -> Self {
        WaitStrategy::All(strategies.into_iter().collect())
    }

    /// Waits until the condition holds, failing with [`Error::Timeout`] once
    /// `deadline` passes. Check errors count as "not yet" unless the
    /// resource itself is gone.
    pub fn wait<'a>(
        &'a self,
        cx: &'a WaitContext<'a>,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<WaitOutcome, Error>> {
        async move {
            match self {
                WaitStrategy::All(strategies) => wait_all(strategies, cx, deadline).await,
                single => {
                    let condition = single.to_string();
                    poll_until(cx.resource, &condition, deadline, cx.interval, || {
                        single.check(cx)
                    })
                    .await
                }
            }
        }
        .boxed()
    }

    async fn check(&self, cx: &WaitContext<'_>) -> Probe {
        match self {
            WaitStrategy::Readiness => check_readiness(cx).await,
            WaitStrategy::Port { port } => match endpoint(cx, *port).await {
                Ok(endpoint) => match cx.cluster.access_strategy() {
                    AccessStrategy::PortForward(_) => {
                        check_forwarded_port(cx, *port, &endpoint).await
                    }
                    _ => check_port(&endpoint).await,
                },
                Err(probe) => probe,
            },
            WaitStrategy::Http(check) => match endpoint(cx, check.port).await {
                Ok(endpoint) => check_http(check, &endpoint).await,
                Err(probe) => probe,
            },
            WaitStrategy::LogMessage(check) => {
                match cx.cluster.logs(cx.resource, cx.kind).await {
                    Ok(logs) => {
                        let found = check.matches(&logs);
                        let observed = format!("{} of {} matching line(s)", found, check.times);
                        if found >= check.times {
                            Probe::Ready(observed)
                        } else {
                            Probe::Pending(observed)
                        }
                    }
                    Err(error) => Probe::Pending(error.to_string()),
                }
            }
            WaitStrategy::Command(check) => {
                match cx.cluster.exec(cx.resource, cx.kind, &check.command).await {
                    Ok(result) if result.success() => Probe::Ready("exit code 0".into()),
                    Ok(result) => Probe::Pending(format!(
                        "exit code {}: {}",
                        result.exit_code,
                        result.stderr.trim()
                    )),
                    Err(error) => Probe::Pending(error.to_string()),
                }
            }
            // Composites never reach the single-condition path.
            WaitStrategy::All(_) => Probe::Pending("composite".into()),
        }
    }
}

async fn wait_all(
    strategies: &[WaitStrategy],
    cx: &WaitContext<'_>,
    deadline: Instant,
) -> Result<WaitOutcome, Error> {
    let started = Instant::now();
    let mut attempts = 0;
    let mut observed = Vec::with_capacity(strategies.len());
    for strategy in strategies {
        let outcome = strategy.wait(cx, deadline).await?;
        attempts += outcome.attempts;
        observed.push(outcome.last_observed);
    }
    Ok(WaitOutcome {
        ready: true,
        elapsed: started.elapsed(),
        attempts,
        last_observed: observed.join("; "),
    })
}

async fn check_readiness(cx: &WaitContext<'_>) -> Probe {
    match cx.cluster.get_workload(cx.resource, cx.kind).await {
        Ok(Some(workload)) => {
            let ready = workload.ready_replicas();
            let desired = workload.desired_replicas();
            let observed = format!("{}/{} replicas ready", ready, desired);
            if ready == desired {
                Probe::Ready(observed)
            } else {
                Probe::Pending(observed)
            }
        }
        Ok(None) => Probe::Fatal(Error::ResourceNotFound {
            resource: cx.resource.clone(),
            kind: cx.kind.as_str(),
        }),
        Err(error) => Probe::Pending(error.to_string()),
    }
}

async fn endpoint(cx: &WaitContext<'_>, port: u16) -> Result<ExternalEndpoint, Probe> {
    cx.cluster
        .access_strategy()
        .resolve(cx.cluster, cx.resource, port)
        .await
        .map_err(|error| match error {
            Error::ResourceNotFound { .. } | Error::PortNotExposed { .. } => Probe::Fatal(error),
            other => Probe::Pending(other.to_string()),
        })
}

async fn check_port(endpoint: &ExternalEndpoint) -> Probe {
    match TcpStream::connect((endpoint.host(), endpoint.port())).await {
        Ok(_) => Probe::Ready(format!("connected to {}", endpoint)),
        Err(error) => Probe::Pending(format!("connect to {}: {}", endpoint, error)),
    }
}

/// The local end of a tunnel accepts connections whatever the pod state, so
/// the pod port is checked through its own forwarding stream.
async fn check_forwarded_port(
    cx: &WaitContext<'_>,
    port: u16,
    endpoint: &ExternalEndpoint,
) -> Probe {
    let probe = cx.cluster.probe_port(cx.resource, port);
    match tokio::time::timeout(PORT_PROBE_TIMEOUT, probe).await {
        Ok(Ok(())) => Probe::Ready(format!(
            "pod port {} accepting connections via {}",
            port, endpoint
        )),
        Ok(Err(error)) => Probe::Pending(error.to_string()),
        Err(_) => Probe::Pending(format!(
            "pod port {} did not answer within {:?}",
            port, PORT_PROBE_TIMEOUT
        )),
    }
}

async fn check_http(check: &HttpCheck, endpoint: &ExternalEndpoint) -> Probe {
    let client = match reqwest::Client::builder()
        .timeout(check.request_timeout)
        .danger_accept_invalid_certs(check.tls)
        .build()
    {
        Ok(client) => client,
        Err(error) => return Probe::Pending(error.to_string()),
    };
    let url = check.url(endpoint);
    let response = match client.request(check.method.clone(), &url).send().await {
        Ok(response) => response,
        Err(error) => return Probe::Pending(format!("{} {}: {}", check.method, url, error)),
    };
    let status = response.status();
    if !accepts(&check.statuses, status) {
        return Probe::Pending(format!("{} returned {}", url, status));
    }
    match &check.body {
        None => Probe::Ready(format!("{} returned {}", url, status)),
        Some(pattern) => match response.text().await {
            Ok(body) if pattern.is_match(&body) => {
                Probe::Ready(format!("{} returned {} with matching body", url, status))
            }
            Ok(_) => Probe::Pending(format!("{} body does not match {:?}", url, pattern.as_str())),
            Err(error) => Probe::Pending(error.to_string()),
        },
    }
}

fn accepts(statuses: &[u16], status: StatusCode) -> bool {
    statuses.contains(&status.as_u16())
}
