//! Free-port discovery for test-network instances.

use rand::Rng;
use tokio::net::TcpListener;

use crate::error::{EctoError, Result};

/// Scan `[base, base + width)` and return every port currently bindable on
/// localhost. Errors with [`EctoError::NoFreePort`] when the whole range is
/// occupied.
///
/// The result is a point-in-time observation; a returned port can be taken
/// by another process before the caller binds it.
pub async fn free_ports(base: u16, width: u16) -> Result<Vec<u16>> {
    let mut free = Vec::new();

    for offset in 0..width {
        let Some(port) = base.checked_add(offset) else {
            break;
        };
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
            drop(listener);
            free.push(port);
        }
    }

    if free.is_empty() {
        return Err(EctoError::NoFreePort { base, width });
    }
    Ok(free)
}

/// Pick one port uniformly at random from a scan result.
///
/// Random selection (rather than lowest-first) reduces collision probability
/// when several campaigns scan the same range on one host.
pub fn pick_port(free: &[u16]) -> Option<u16> {
    if free.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0..free.len());
    Some(free[idx])
}
