//! Connection Supervisor (design.md §4.4).
//!
//! Owns a single SSH client process carrying N local forwardings. A
//! Supervisor is constructed in `New`, forks into `Active` on a successful
//! `connect()`, and ends in `Closed` — it is never reused (design.md §3).

use std::collections::HashSet;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{execvp, fork, ForkResult, Pid};

use crate::error::{Error, Result};
use crate::net::Forwarding;
use crate::rule::RuleDriver;
use crate::signals;

/// Keepalive interval (seconds) passed to the SSH client so a dead hop is
/// noticed instead of leaving a half-open tunnel.
const SERVER_ALIVE_INTERVAL: &str = "300";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Active,
    Closed,
}

/// Owns one SSH child process and the Forwardings multiplexed through it.
#[derive(Debug)]
pub struct Supervisor {
    // The hop *alias*, passed to ssh verbatim (design.md §4.4): ssh
    // re-resolves it through its own config. The crate's Config Resolver
    // is consulted upstream of this type only to pick a local port bound
    // to the right route (see manager.rs::create_tunnel) — its result
    // never reaches the exec'd ssh argv.
    hop: String,
    forwardings: Vec<Forwarding>,
    ssh_program: OsString,
    rule_driver: RuleDriver,
    // Set once, on a successful fork, and kept for identification even
    // after the Supervisor closes — see design.md open-question notes:
    // the "pid set iff Active" invariant is enforced by the Manager's
    // Registry (which only keys in Active supervisors), not by nulling
    // this field, because callbacks need to see it on a just-closed
    // Supervisor too.
    pid: Option<Pid>,
    state: State,
}

impl Supervisor {
    /// Construct a new, unconnected Supervisor. Fails if two Forwardings
    /// share a local port — the allocator races are supposed to prevent
    /// this, but nothing stops a caller from constructing one by hand.
    pub fn new(
        hop: impl Into<String>,
        forwardings: Vec<Forwarding>,
        ssh_program: impl Into<OsString>,
        rule_driver: RuleDriver,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for fwd in &forwardings {
            if !seen.insert(fwd.local().port()) {
                return Err(Error::DuplicateLocalPort {
                    what: "Supervisor::new".to_string(),
                    port: fwd.local().port(),
                });
            }
        }

        Ok(Self {
            hop: hop.into(),
            forwardings,
            ssh_program: ssh_program.into(),
            rule_driver,
            pid: None,
            state: State::New,
        })
    }

    pub fn hop(&self) -> &str {
        &self.hop
    }

    pub fn forwardings(&self) -> &[Forwarding] {
        &self.forwardings
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Fork the SSH client and install this Supervisor's rules. Must be
    /// called exactly once, while `New`.
    ///
    /// On success: transitions to `Active`, returns the child's pid.
    /// On rule-install failure: the child is killed and reaped, already
    /// -installed rules for earlier Forwardings are removed in reverse
    /// order, the Supervisor transitions to `Closed`, and the error
    /// propagates.
    pub fn connect(&mut self) -> Result<Pid> {
        assert_eq!(self.state, State::New, "Supervisor::connect called twice");

        let args = self.build_ssh_args();

        // Safety: the child branch below (unblocking signals, building the
        // argv, execvp) does allocate — CString/Vec heap allocations are
        // not strictly async-signal-safe after fork() in a multi-threaded
        // process. This crate's scheduling model is single cooperative-
        // thread only (design.md §5), so there's no other thread that could
        // hold the allocator lock at fork time; child.rs in the teacher
        // code this crate is descended from makes the same argument for
        // doing the same thing.
        match unsafe { fork() }.map_err(Error::ForkFailed)? {
            ForkResult::Child => {
                if let Err(e) = signals::unblock_all_in_child() {
                    log::error!("hopforward child: failed to unblock signals: {}", e);
                }
                exec_ssh(&self.ssh_program, &args);
            }
            ForkResult::Parent { child } => {
                self.pid = Some(child);
            }
        }

        if let Err(e) = self.install_rules() {
            self.kill_and_reap_child();
            self.state = State::Closed;
            return Err(e);
        }

        self.state = State::Active;
        log::info!(
            "supervisor: connected to {} (pid {}) with {} forwarding(s)",
            self.hop,
            self.pid.expect("set on the fork-parent branch above"),
            self.forwardings.len()
        );
        Ok(self.pid.expect("set on the fork-parent branch above"))
    }

    /// Legal in `Active`. Idempotent: calling again when already `Closed`
    /// is a no-op.
    pub fn disconnect(&mut self) {
        if self.state != State::Active {
            return;
        }

        if let Some(pid) = self.pid {
            if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
                log::warn!("supervisor: failed to signal pid {}: {}", pid, e);
            }
        }

        for fwd in &self.forwardings {
            if let Err(e) = self.rule_driver.remove(fwd) {
                // RuleRemoveFailed: logged, not fatal to the teardown.
                log::warn!("supervisor: {}", e);
            }
        }

        self.state = State::Closed;
    }

    /// Called by the reaper/waitForAll path when the child has already
    /// exited on its own, without an explicit disconnect(). Tears down
    /// rules but does not attempt to signal the (already-dead) child.
    pub fn mark_closed_by_reaper(&mut self) {
        if self.state != State::Active {
            return;
        }
        for fwd in &self.forwardings {
            if let Err(e) = self.rule_driver.remove(fwd) {
                log::warn!("supervisor: {}", e);
            }
        }
        self.state = State::Closed;
    }

    fn install_rules(&self) -> Result<()> {
        for (i, fwd) in self.forwardings.iter().enumerate() {
            if let Err(e) = self.rule_driver.install(fwd) {
                for installed in self.forwardings[..i].iter().rev() {
                    if let Err(remove_err) = self.rule_driver.remove(installed) {
                        log::warn!("rollback: {}", remove_err);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn kill_and_reap_child(&mut self) {
        if let Some(pid) = self.pid.take() {
            let _ = signal::kill(pid, Signal::SIGTERM);
            let _ = waitpid(pid, None);
            // Keep the pid around for identification/logging even though
            // the process is gone — see the struct-level comment.
            self.pid = Some(pid);
        }
    }

    fn build_ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-T".to_string(), // no pseudo-terminal
            "-N".to_string(), // no remote command / no shell
            "-o".to_string(),
            "ForwardAgent=no".to_string(),
            "-o".to_string(),
            format!("ServerAliveInterval={}", SERVER_ALIVE_INTERVAL),
        ];
        for fwd in &self.forwardings {
            args.push("-L".to_string());
            args.push(fwd.ssh_local_forward_arg());
        }
        args.push(self.hop.clone());
        args
    }
}

/// Replace the current process image with the SSH client. Never returns on
/// success; on failure, writes a diagnostic and exits with a non-zero code
/// (design.md §4.4).
fn exec_ssh(program: &OsStr, args: &[String]) -> ! {
    let program_c = CString::new(program.as_bytes()).expect("ssh program path has no NUL bytes");
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(program_c.clone());
    for arg in args {
        argv.push(CString::new(arg.as_str()).expect("ssh argument has no NUL bytes"));
    }

    let err = execvp(&program_c, &argv).unwrap_err();
    eprintln!("hopforward: exec of {:?} failed: {}", program, err);
    unsafe { libc::_exit(127) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetworkAddress;
    use std::fs;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::NamedTempFile;

    fn forwarding(local_port: u16) -> Forwarding {
        let local = NetworkAddress::new("127.0.0.1", local_port).unwrap();
        let target = NetworkAddress::new("irc.example.net", 6667).unwrap();
        Forwarding::new(local, target)
    }

    fn forwarding_to_port(local_port: u16, target_port: u16) -> Forwarding {
        let local = NetworkAddress::new("127.0.0.1", local_port).unwrap();
        let target = NetworkAddress::new("irc.example.net", target_port).unwrap();
        Forwarding::new(local, target)
    }

    fn hop() -> &'static str {
        "hop.example.net"
    }

    /// A rule-tool stand-in that logs every invocation's action (`$3`) and
    /// target port (`$8`, matching `build_args`'s argument order) to
    /// `log_path`, and fails only an `-A` (install) whose target port is
    /// `fail_port` — so a test can drive "forwarding 0 installs, forwarding
    /// 1's install fails" and then inspect exactly which rules were
    /// installed and removed.
    fn fails_install_for_port_script(log_path: &std::path::Path, fail_port: u16) -> NamedTempFile {
        let mut script = NamedTempFile::new().unwrap();
        writeln!(script, "#!/bin/sh").unwrap();
        writeln!(script, "echo \"$3 $8\" >> {}", log_path.display()).unwrap();
        writeln!(
            script,
            "if [ \"$3\" = \"-A\" ] && [ \"$8\" = \"{}\" ]; then exit 1; fi",
            fail_port
        )
        .unwrap();
        writeln!(script, "exit 0").unwrap();
        let mut perms = fs::metadata(script.path()).unwrap().permissions();
        perms.set_mode(0o700);
        fs::set_permissions(script.path(), perms).unwrap();
        script
    }

    #[test]
    fn rejects_duplicate_local_ports() {
        let result = Supervisor::new(
            hop(),
            vec![forwarding(4000), forwarding(4000)],
            "ssh",
            RuleDriver::with_tool("true"),
        );
        assert!(matches!(result, Err(Error::DuplicateLocalPort { .. })));
    }

    #[test]
    fn starts_in_new_state_with_no_pid() {
        let sup = Supervisor::new(hop(), vec![forwarding(4000)], "ssh", RuleDriver::with_tool("true"))
            .unwrap();
        assert_eq!(sup.state(), State::New);
        assert_eq!(sup.pid(), None);
    }

    #[test]
    fn connect_forks_a_real_child_and_installs_rules_with_a_stub_driver() {
        // "true" stands in for ssh: it execs, runs briefly, and exits 0.
        // The rule driver is stubbed with "true" too so the test needs no
        // privileges and touches no real firewall state.
        let mut sup = Supervisor::new(
            hop(),
            vec![forwarding(4001)],
            "true",
            RuleDriver::with_tool("true"),
        )
        .unwrap();

        let pid = sup.connect().expect("connect should succeed");
        assert_eq!(sup.state(), State::Active);
        assert_eq!(sup.pid(), Some(pid));

        // Reap the child ourselves since nothing else will in this test.
        let _ = waitpid(pid, None);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut sup = Supervisor::new(
            hop(),
            vec![forwarding(4002)],
            "true",
            RuleDriver::with_tool("true"),
        )
        .unwrap();
        let pid = sup.connect().unwrap();
        sup.disconnect();
        assert_eq!(sup.state(), State::Closed);
        sup.disconnect(); // no-op
        assert_eq!(sup.state(), State::Closed);
        let _ = waitpid(pid, None);
    }

    #[test]
    fn failed_rule_install_rolls_back_and_kills_child() {
        let mut sup = Supervisor::new(
            hop(),
            vec![forwarding(4003), forwarding(4004)],
            "true",
            RuleDriver::with_tool("false"), // every install fails
        )
        .unwrap();

        let result = sup.connect();
        assert!(matches!(result, Err(Error::RuleInstallFailed { .. })));
        assert_eq!(sup.state(), State::Closed);
    }

    #[test]
    fn failed_rule_install_on_a_later_forwarding_rolls_back_the_earlier_one() {
        let log = NamedTempFile::new().unwrap();
        let script = fails_install_for_port_script(log.path(), 6668);

        let mut sup = Supervisor::new(
            hop(),
            vec![
                forwarding_to_port(4010, 6667), // installs fine
                forwarding_to_port(4011, 6668), // install fails
            ],
            "true",
            RuleDriver::with_tool(script.path().to_path_buf()),
        )
        .unwrap();

        let result = sup.connect();
        assert!(matches!(result, Err(Error::RuleInstallFailed { .. })));
        assert_eq!(sup.state(), State::Closed);

        let calls = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = calls.lines().collect();
        // Forwarding 0 installs, forwarding 1's install fails, then
        // forwarding 0's rule is removed during rollback: net zero rules
        // left standing from this attempt.
        assert_eq!(lines, vec!["-A 6667", "-A 6668", "-D 6667"]);
    }
}
