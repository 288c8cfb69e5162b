//! Transparent TCP redirection to hosts only reachable via an SSH hop.
//!
//! An embedder resolves a hop alias through [`config::resolve`], hands the
//! result plus a list of targets to a [`manager::Manager`], and gets back
//! the pid of the SSH client multiplexing a rule-redirected local port per
//! target. The crate forks and execs a real SSH client and shells out to a
//! NAT tool to install kernel packet-rewrite rules; it has no CLI or UI of
//! its own and expects its embedder to drive [`manager::Manager::reap`] (or
//! [`manager::Manager::wait_for_all`]) from whatever loop already exists.

pub mod config;
pub mod error;
pub mod manager;
pub mod net;
pub mod port;
pub mod rule;
pub mod signals;
pub mod supervisor;

pub use error::{Error, Result};
pub use manager::Manager;
pub use net::{Forwarding, NetworkAddress};
pub use rule::RuleDriver;
pub use supervisor::{State, Supervisor};
