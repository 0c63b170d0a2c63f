use std::{error::Error, net::SocketAddr};

use metrics::{counter, gauge};

use super::InternalEvent;
use crate::endpoint::{ExternalEndpoint, ResourceId};

#[derive(Debug)]
pub struct EndpointResolved<'a> {
    pub resource: &'a ResourceId,
    pub port: u16,
    pub strategy: &'static str,
    pub endpoint: &'a ExternalEndpoint,
}

impl InternalEvent for EndpointResolved<'_> {
    fn emit_logs(&self) {
        debug!(
            message = "Resolved external endpoint.",
            resource = %self.resource,
            port = self.port,
            strategy = self.strategy,
            endpoint = %self.endpoint,
        );
    }

    fn emit_metrics(&self) {
        counter!("endpoints_resolved_total", "strategy" => self.strategy).increment(1);
    }
}

#[derive(Debug)]
pub struct NodeAddressFallback<'a> {
    pub address: &'a str,
}

impl InternalEvent for NodeAddressFallback<'_> {
    fn emit_logs(&self) {
        warn!(
            message = "No node reports an internal address; falling back.",
            address = %self.address,
        );
    }
}

#[derive(Debug)]
pub struct HelperInvoked<'a> {
    pub program: &'a str,
    pub args: &'a [&'a str],
}

impl InternalEvent for HelperInvoked<'_> {
    fn emit_logs(&self) {
        debug!(
            message = "Running helper process.",
            program = %self.program,
            args = ?self.args,
        );
    }

    fn emit_metrics(&self) {
        counter!("helper_invocations_total").increment(1);
    }
}

#[derive(Debug)]
pub struct HelperFallbackUsed<'a> {
    pub resource: &'a ResourceId,
    pub error: &'a dyn Error,
}

impl InternalEvent for HelperFallbackUsed<'_> {
    fn emit_logs(&self) {
        warn!(
            message = "Helper did not report a URL; using node address instead.",
            resource = %self.resource,
            error = %self.error,
        );
    }

    fn emit_metrics(&self) {
        counter!("helper_fallbacks_total").increment(1);
    }
}

#[derive(Debug)]
pub struct TunnelOpened<'a> {
    pub resource: &'a ResourceId,
    pub local_addr: SocketAddr,
}

impl InternalEvent for TunnelOpened<'_> {
    fn emit_logs(&self) {
        debug!(
            message = "Opened port-forward tunnel.",
            resource = %self.resource,
            local_addr = %self.local_addr,
        );
    }

    fn emit_metrics(&self) {
        gauge!("open_tunnels").increment(1.0);
    }
}

#[derive(Debug)]
pub struct TunnelClosed<'a> {
    pub resource: &'a ResourceId,
    pub local_addr: SocketAddr,
}

impl InternalEvent for TunnelClosed<'_> {
    fn emit_logs(&self) {
        debug!(
            message = "Closed port-forward tunnel.",
            resource = %self.resource,
            local_addr = %self.local_addr,
        );
    }

    fn emit_metrics(&self) {
        gauge!("open_tunnels").decrement(1.0);
    }
}

#[derive(Debug)]
pub struct TunnelConnectionFailed<'a> {
    pub resource: &'a ResourceId,
    pub error: &'a dyn Error,
}

impl InternalEvent for TunnelConnectionFailed<'_> {
    fn emit_logs(&self) {
        error!(
            message = "Tunnel connection failed.",
            resource = %self.resource,
            error = %self.error,
            error_type = "connection_failed",
        );
    }

    fn emit_metrics(&self) {
        counter!("tunnel_errors_total").increment(1);
    }
}
