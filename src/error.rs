// The error kinds below are exactly the ones enumerated for the core in the
// design (ConfigUnreadable .. UnexpectedChildExit), plus the couple of
// structural variants that real I/O forces on us (Io, PortParse).
//
// Disposition is part of the contract, not just documentation: callers that
// match on `Error` to decide whether to keep going (ConfigUnreadable,
// ConfigMalformed, RuleRemoveFailed -> log and continue) versus abort
// (everything else) should match against these variants rather than
// stringly-typed messages.

use std::io;
use std::net::AddrParseError;

use nix::errno::Errno;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file {path} could not be opened: {source}")]
    ConfigUnreadable { path: String, source: io::Error },

    #[error("config value for {keyword:?} in section for {host:?} could not be parsed: {value:?}")]
    ConfigMalformed {
        host: String,
        keyword: String,
        value: String,
    },

    #[error("hop {hop} is unreachable: {source}")]
    HopUnreachable { hop: String, source: io::Error },

    #[error("local endpoint for hop {hop} is not an IPv4/IPv6 address as expected")]
    WrongAddressFamily { hop: String },

    #[error("operating system refused to fork: {0}")]
    ForkFailed(#[source] Errno),

    #[error("installing rule for {local} -> {target} failed with exit status {status}")]
    RuleInstallFailed {
        local: String,
        target: String,
        status: String,
    },

    #[error("removing rule for {local} -> {target} failed with exit status {status}")]
    RuleRemoveFailed {
        local: String,
        target: String,
        status: String,
    },

    #[error("pid {0} exited without an explicit disconnect")]
    UnexpectedChildExit(i32),

    #[error("{what} contains two forwardings bound to local port {port}")]
    DuplicateLocalPort { what: String, port: u16 },

    #[error("could not parse port: {0}")]
    PortParse(String),

    #[error(transparent)]
    AddrParse(#[from] AddrParseError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Nix(#[from] Errno),
}

pub type Result<T> = std::result::Result<T, Error>;
