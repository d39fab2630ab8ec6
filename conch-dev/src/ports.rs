//! Ephemeral port allocation for proxied dev processes.
//!
//! Each proxied process gets one OS-assigned loopback port per run. The
//! listener used to discover the port is released immediately, so another
//! process can in principle grab it before the dev process binds; that race
//! surfaces as a startup failure of the process itself, not of allocation.

use std::collections::HashSet;
use std::net::TcpListener;

use crate::error::DevError;

const PORT_DRAW_ATTEMPTS: usize = 16;

/// Ask the OS for a currently-free loopback port.
pub fn random_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Allocate `count` pairwise-distinct ephemeral ports.
///
/// The OS normally hands out distinct ports, but nothing guarantees it once
/// the discovery listener is closed, so duplicate draws are retried.
pub fn allocate_distinct_ports(count: usize) -> Result<Vec<u16>, DevError> {
    let mut ports = Vec::with_capacity(count);
    let mut seen = HashSet::new();

    for _ in 0..count {
        let mut drawn = None;
        for _ in 0..PORT_DRAW_ATTEMPTS {
            let port = random_port().map_err(DevError::PortAllocation)?;
            if seen.insert(port) {
                drawn = Some(port);
                break;
            }
        }
        match drawn {
            Some(port) => ports.push(port),
            None => {
                return Err(DevError::PortAllocation(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "could not draw a distinct ephemeral port",
                )));
            }
        }
    }

    Ok(ports)
}
