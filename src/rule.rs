//! Rule Driver (design.md §4.3).
//!
//! Installs and removes the kernel packet-rewrite rule for one Forwarding,
//! via an external privileged tool (`iptables` by default): "for outbound
//! TCP packets destined for target.host:target.port, rewrite the
//! destination to local.port on the loopback interface."
//!
//! Removal always uses the same five-tuple as the matching install, so it
//! disables exactly one rule even when another Supervisor has installed an
//! identical-looking rule for the same target (design.md §9, open question
//! on shared targets).

use std::ffi::OsString;
use std::process::Command;

use crate::error::{Error, Result};
use crate::net::Forwarding;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Add,
    Delete,
}

impl Action {
    fn flag(self) -> &'static str {
        match self {
            Action::Add => "-A",
            Action::Delete => "-D",
        }
    }
}

/// Invokes an external NAT-manipulation tool. The default tool is the
/// system `iptables` binary; tests substitute a harmless stand-in.
#[derive(Debug, Clone)]
pub struct RuleDriver {
    tool: OsString,
}

impl Default for RuleDriver {
    fn default() -> Self {
        Self {
            tool: OsString::from("iptables"),
        }
    }
}

impl RuleDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different tool binary, e.g. for tests or for a host that
    /// fronts iptables with a setuid wrapper.
    pub fn with_tool(tool: impl Into<OsString>) -> Self {
        Self { tool: tool.into() }
    }

    /// Install the rule for `forwarding`. A non-zero exit is fatal to the
    /// calling Supervisor (RuleInstallFailed).
    pub fn install(&self, forwarding: &Forwarding) -> Result<()> {
        self.run(Action::Add, forwarding).map_err(|status| Error::RuleInstallFailed {
            local: forwarding.local().to_string(),
            target: forwarding.target().to_string(),
            status,
        })
    }

    /// Remove the rule for `forwarding`. A non-zero exit here is logged by
    /// the caller but is not fatal to the teardown.
    pub fn remove(&self, forwarding: &Forwarding) -> Result<()> {
        self.run(Action::Delete, forwarding).map_err(|status| Error::RuleRemoveFailed {
            local: forwarding.local().to_string(),
            target: forwarding.target().to_string(),
            status,
        })
    }

    fn run(&self, action: Action, forwarding: &Forwarding) -> std::result::Result<(), String> {
        let args = build_args(action, forwarding);
        log::debug!("rule driver: {:?} {:?}", self.tool, args);

        let status = Command::new(&self.tool)
            .args(&args)
            .status()
            .map_err(|e| format!("could not launch {:?}: {}", self.tool, e))?;

        if status.success() {
            Ok(())
        } else {
            Err(status.to_string())
        }
    }
}

/// Build the argument list for one rule action: NAT table, OUTPUT chain,
/// TCP, matching on the forwarding's target, redirecting to its local port.
fn build_args(action: Action, forwarding: &Forwarding) -> Vec<String> {
    vec![
        "-t".into(),
        "nat".into(),
        action.flag().into(),
        "OUTPUT".into(),
        "-p".into(),
        "tcp".into(),
        "--dport".into(),
        forwarding.target().port().to_string(),
        "-d".into(),
        forwarding.target().host().to_string(),
        "-j".into(),
        "REDIRECT".into(),
        "--to-port".into(),
        forwarding.local().port().to_string(),
    ]
}
