//! Port availability probing.

use std::net::{Ipv4Addr, TcpListener};

use crate::model::Port;

/// Checks whether `port` can be bound on loopback right now.
///
/// The listener is closed immediately, so this is an observation, not a
/// reservation; the registry turns the momentary answer into a stable
/// allocation by recording it under the registry lock.
pub fn is_port_available(port: Port) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port.as_u16())).is_ok()
}
