//! NetworkAddress and Forwarding: the two immutable value types the rest of
//! the crate is built around (design.md §3).

use std::fmt;

/// An unresolved `(host, port)` pair.
///
/// The host is kept verbatim, never resolved to a numeric address, because
/// it is passed through to both the SSH client (which re-interprets it via
/// its own config) and the rule driver (which accepts hostnames directly).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    host: String,
    port: u16,
}

impl NetworkAddress {
    /// `port` must be in `1..=65535`; `0` is rejected because it cannot name
    /// a real TCP endpoint on either side of this crate's pipeline.
    pub fn new(host: impl Into<String>, port: u16) -> Option<Self> {
        if port == 0 {
            return None;
        }
        Some(Self {
            host: host.into(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One local->target pair, carried inside a single SSH session via `-L`.
///
/// Immutable once constructed; a Forwarding corresponds to exactly one
/// installed rule while its parent Supervisor is `Active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarding {
    local: NetworkAddress,
    target: NetworkAddress,
}

impl Forwarding {
    pub fn new(local: NetworkAddress, target: NetworkAddress) -> Self {
        Self { local, target }
    }

    pub fn local(&self) -> &NetworkAddress {
        &self.local
    }

    pub fn target(&self) -> &NetworkAddress {
        &self.target
    }

    /// The `-L local.port:target.host:target.port` argument for this forwarding.
    pub fn ssh_local_forward_arg(&self) -> String {
        format!(
            "{}:{}:{}",
            self.local.port(),
            self.target.host(),
            self.target.port()
        )
    }
}

impl fmt::Display for Forwarding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.target)
    }
}
