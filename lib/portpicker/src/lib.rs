//! Selects local ports that are free to bind.
//!
//! Ports handed out by [`pick_unused_port`] stay reserved for the lifetime of
//! the process (or until [`release_port`] is called), so two callers in the
//! same process never receive the same port even if neither has bound it yet.

use std::{
    collections::HashSet,
    net::{IpAddr, SocketAddr, TcpListener, ToSocketAddrs, UdpSocket},
    sync::{LazyLock, Mutex},
};

use rand::Rng;

pub type Port = u16;

const RANDOM_ATTEMPTS: usize = 10;
const OS_ATTEMPTS: usize = 10;
const RANDOM_RANGE: std::ops::Range<Port> = 15000..25000;

static RESERVED: LazyLock<Mutex<HashSet<Port>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

fn test_bind_udp<A: ToSocketAddrs>(addr: A) -> Option<Port> {
    Some(UdpSocket::bind(addr).ok()?.local_addr().ok()?.port())
}

fn test_bind_tcp<A: ToSocketAddrs>(addr: A) -> Option<Port> {
    Some(TcpListener::bind(addr).ok()?.local_addr().ok()?.port())
}

/// Check if a port is free on UDP.
pub fn is_free_udp(ip: IpAddr, port: Port) -> bool {
    test_bind_udp(SocketAddr::new(ip, port)).is_some()
}

/// Check if a port is free on TCP.
pub fn is_free_tcp(ip: IpAddr, port: Port) -> bool {
    test_bind_tcp(SocketAddr::new(ip, port)).is_some()
}

/// Check if a port is free on both TCP and UDP.
pub fn is_free(ip: IpAddr, port: Port) -> bool {
    is_free_tcp(ip, port) && is_free_udp(ip, port)
}

/// Asks the OS for a free port.
fn ask_free_tcp_port(ip: IpAddr) -> Option<Port> {
    test_bind_tcp(SocketAddr::new(ip, 0))
}

fn reserve(port: Port) -> bool {
    match RESERVED.lock() {
        Ok(mut reserved) => reserved.insert(port),
        Err(poisoned) => poisoned.into_inner().insert(port),
    }
}

/// Returns a previously picked port to the pool.
pub fn release_port(port: Port) {
    match RESERVED.lock() {
        Ok(mut reserved) => reserved.remove(&port),
        Err(poisoned) => poisoned.into_inner().remove(&port),
    };
}

/// Picks an available port that is free on both TCP and UDP and has not been
/// handed out before by this process.
///
/// A handful of random ports are probed first; if none is usable the OS is
/// asked for an ephemeral port. Returns `None` when every attempt failed.
pub fn pick_unused_port(ip: IpAddr) -> Option<Port> {
    let mut rng = rand::rng();

    for _ in 0..RANDOM_ATTEMPTS {
        let port = rng.random_range(RANDOM_RANGE);
        if is_free(ip, port) && reserve(port) {
            return Some(port);
        }
    }

    for _ in 0..OS_ATTEMPTS {
        if let Some(port) = ask_free_tcp_port(ip)
            && is_free_udp(ip, port)
            && reserve(port)
        {
            return Some(port);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn picked_port_is_bindable() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let port = pick_unused_port(ip).unwrap();
        assert!(TcpListener::bind((ip, port)).is_ok());
    }

    #[test]
    fn ports_are_not_handed_out_twice() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let ports: HashSet<Port> = (0..20).map(|_| pick_unused_port(ip).unwrap()).collect();
        assert_eq!(ports.len(), 20);
    }

    #[test]
    fn bound_port_is_not_free() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let listener = TcpListener::bind((ip, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_free_tcp(ip, port));
    }
}
