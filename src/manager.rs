//! Manager: the Registry of live tunnels plus the reaper that notices when
//! an SSH client dies on its own (design.md §4.5).
//!
//! Grounded on the teacher's `app.rs` (owns the `BTreeMap<String, Server>`
//! registry, dispatches UI-visible events) and `wait_children.rs` (the
//! SIGCHLD-adjacent poll loop that treats "no longer answers kill(pid, 0)"
//! as "the child is gone, tear it down and tell the UI"). This crate has no
//! UI and no gtk event loop to piggyback on, so polling is exposed directly
//! as `reap()` for an embedder to call from whatever loop it already has,
//! instead of being wired to a particular timer.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;

use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::config;
use crate::error::Result;
use crate::net::{Forwarding, NetworkAddress};
use crate::port;
use crate::rule::RuleDriver;
use crate::signals::CriticalSection;
use crate::supervisor::Supervisor;

type Callback = Box<dyn FnMut(&Supervisor)>;

/// Owns every live Supervisor, keyed by the pid of its SSH child, and the
/// configuration needed to turn a hop alias into a connection: the ordered
/// config-file list the Config Resolver walks, and the ssh/rule-tool
/// programs to invoke.
pub struct Manager {
    config_files: Vec<PathBuf>,
    ssh_program: OsString,
    rule_driver: RuleDriver,
    registry: HashMap<Pid, Supervisor>,
    on_create: Vec<Callback>,
    on_close: Vec<Callback>,
}

impl Manager {
    pub fn new(
        config_files: Vec<PathBuf>,
        ssh_program: impl Into<OsString>,
        rule_driver: RuleDriver,
    ) -> Self {
        Self {
            config_files,
            ssh_program: ssh_program.into(),
            rule_driver,
            registry: HashMap::new(),
            on_create: Vec::new(),
            on_close: Vec::new(),
        }
    }

    /// Fires exactly once per Supervisor, right after it is added to the
    /// registry.
    pub fn add_create_callback(&mut self, cb: impl FnMut(&Supervisor) + 'static) {
        self.on_create.push(Box::new(cb));
    }

    /// Fires exactly once per Supervisor, right after its registry entry is
    /// removed and its rules are torn down.
    pub fn add_close_callback(&mut self, cb: impl FnMut(&Supervisor) + 'static) {
        self.on_close.push(Box::new(cb));
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn get(&self, pid: Pid) -> Option<&Supervisor> {
        self.registry.get(&pid)
    }

    /// Resolve `hop_alias` through the configured file list, allocate a
    /// local port per target against the *resolved* address, fork an SSH
    /// client carrying all of them — invoked with the alias verbatim, so
    /// ssh's own config resolves it a second time (design.md §4.4) — and
    /// register the result. The fork, rule install, and registry insert
    /// all happen inside one [`CriticalSection`] so an external terminate
    /// signal can't land in the middle and leave an orphaned child or a
    /// half-registered Supervisor.
    pub fn create_tunnel(
        &mut self,
        hop_alias: impl Into<String>,
        targets: &[NetworkAddress],
    ) -> Result<Pid> {
        let hop_alias = hop_alias.into();
        let resolved = config::resolve(&hop_alias, &self.config_files);

        let mut forwardings = Vec::with_capacity(targets.len());
        for target in targets {
            let local = port::allocate(&resolved)?;
            forwardings.push(Forwarding::new(local, target.clone()));
        }

        let _critical = CriticalSection::enter()?;

        let mut supervisor = Supervisor::new(
            hop_alias,
            forwardings,
            self.ssh_program.clone(),
            self.rule_driver.clone(),
        )?;
        let pid = supervisor.connect()?;

        // Insert before firing onCreate (design.md §5 ordering guarantee):
        // a callback that reads the Registry must see its own Supervisor
        // already present.
        self.registry.insert(pid, supervisor);
        for cb in &mut self.on_create {
            cb(self.registry.get(&pid).expect("just inserted"));
        }
        log::info!("manager: created tunnel (pid {})", pid);
        Ok(pid)
    }

    /// Disconnect and unregister one tunnel. A `pid` not in the registry is
    /// a no-op, not an error — the caller may be racing the reaper.
    pub fn remove_tunnel(&mut self, pid: Pid) -> Result<()> {
        let _critical = CriticalSection::enter()?;
        if let Some(mut supervisor) = self.registry.remove(&pid) {
            supervisor.disconnect();
            log::info!("manager: removed tunnel (pid {})", pid);
            for cb in &mut self.on_close {
                cb(&supervisor);
            }
        }
        Ok(())
    }

    /// Disconnect and unregister every tunnel. Used for shutdown.
    pub fn close_all(&mut self) -> Result<()> {
        let _critical = CriticalSection::enter()?;
        for (_, mut supervisor) in self.registry.drain() {
            supervisor.disconnect();
            for cb in &mut self.on_close {
                cb(&supervisor);
            }
        }
        Ok(())
    }

    /// Non-blocking poll: reap any SSH children that have already exited,
    /// tear down their rules, and remove them from the registry. Intended
    /// to be called periodically by whatever loop the embedder already
    /// runs (design.md's analogue of the teacher's 500ms `gtk::timeout_add`
    /// poll, minus any UI dependency).
    ///
    /// Returns the pids that were reaped this call.
    pub fn reap(&mut self) -> Vec<Pid> {
        // waitpid on each pid this Manager actually owns, never on -1: a
        // global wait would also reap children an embedder forked for its
        // own purposes (design.md §4.5).
        let pids: Vec<Pid> = self.registry.keys().copied().collect();
        let mut reaped = Vec::new();

        for pid in pids {
            match wait::waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                    reaped.push(pid);
                }
                Ok(_) => {} // still running, or a stop/continue we don't act on
                Err(_) => {} // ECHILD: already reaped elsewhere, or gone
            }
        }

        for pid in &reaped {
            if let Some(mut supervisor) = self.registry.remove(pid) {
                supervisor.mark_closed_by_reaper();
                log::info!("manager: reaped tunnel (pid {})", pid);
                for cb in &mut self.on_close {
                    cb(&supervisor);
                }
            }
        }

        reaped
    }

    /// Blocks until every registered child has exited, reaping and closing
    /// each as it goes. Unlike `reap`, this does not return until the
    /// registry is empty — for an embedder with no event loop of its own
    /// that just wants to wait out a batch of tunnels before exiting.
    pub fn wait_for_all(&mut self) {
        while !self.registry.is_empty() {
            let pids: Vec<Pid> = self.registry.keys().copied().collect();
            let mut any_progress = false;

            for pid in pids {
                match wait::waitpid(pid, None) {
                    Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                        any_progress = true;
                        if let Some(mut supervisor) = self.registry.remove(&pid) {
                            supervisor.mark_closed_by_reaper();
                            log::info!("manager: reaped tunnel (pid {})", pid);
                            for cb in &mut self.on_close {
                                cb(&supervisor);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(_) => {
                        // ECHILD: this pid is already gone from under us.
                        // Drop it so the loop can terminate.
                        any_progress = true;
                        self.registry.remove(&pid);
                    }
                }
            }

            if !any_progress {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::fs;
    use std::io::Write;
    use std::net::TcpListener;
    use std::os::unix::fs::PermissionsExt;
    use std::rc::Rc;
    use tempfile::NamedTempFile;

    fn target() -> NetworkAddress {
        NetworkAddress::new("irc.example.net", 6667).unwrap()
    }

    fn target_b() -> NetworkAddress {
        NetworkAddress::new("irc.example.net", 6668).unwrap()
    }

    /// See supervisor.rs's identical helper: logs each rule-tool
    /// invocation's action and target port, and fails only an install
    /// (`-A`) for `fail_port`.
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

    /// A loopback listener stands in for a reachable SSH hop, and a config
    /// file maps the alias "hop" onto it so `create_tunnel`'s resolve step
    /// (and the Local Port Allocator behind it) has something real to
    /// probe, without needing an actual sshd. Caller must keep both the
    /// listener and the temp file alive for as long as the Manager is used.
    fn manager_with_reachable_hop() -> (Manager, TcpListener, NamedTempFile) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let hop_port = listener.local_addr().unwrap().port();

        let mut config_file = NamedTempFile::new().unwrap();
        writeln!(config_file, "Host hop").unwrap();
        writeln!(config_file, "  HostName 127.0.0.1").unwrap();
        writeln!(config_file, "  Port {}", hop_port).unwrap();

        let manager = Manager::new(
            vec![config_file.path().to_path_buf()],
            "true",
            RuleDriver::with_tool("true"),
        );
        (manager, listener, config_file)
    }

    #[test]
    fn create_tunnel_registers_exactly_once_and_fires_create_callback_once() {
        let (mut manager, _listener, _config_file) = manager_with_reachable_hop();
        let seen = Rc::new(RefCell::new(0));
        let seen_clone = Rc::clone(&seen);
        manager.add_create_callback(move |_sup| {
            *seen_clone.borrow_mut() += 1;
        });

        let pid = manager.create_tunnel("hop", &[target()]).expect("create_tunnel");
        assert_eq!(manager.len(), 1);
        assert!(manager.get(pid).is_some());
        assert_eq!(*seen.borrow(), 1);
        assert_eq!(manager.get(pid).unwrap().hop(), "hop");

        manager.close_all().unwrap();
    }

    #[test]
    fn remove_tunnel_fires_close_callback_and_unregisters() {
        let (mut manager, _listener, _config_file) = manager_with_reachable_hop();
        let closed = Rc::new(RefCell::new(false));
        let closed_clone = Rc::clone(&closed);
        manager.add_close_callback(move |_sup| {
            *closed_clone.borrow_mut() = true;
        });

        let pid = manager.create_tunnel("hop", &[target()]).unwrap();
        manager.remove_tunnel(pid).unwrap();

        assert!(manager.is_empty());
        assert!(*closed.borrow());
    }

    #[test]
    fn remove_tunnel_on_unknown_pid_is_a_no_op() {
        let mut manager = Manager::new(vec![], "true", RuleDriver::with_tool("true"));
        assert!(manager.remove_tunnel(Pid::from_raw(999_999)).is_ok());
    }

    #[test]
    fn reap_notices_a_child_that_exited_on_its_own() {
        let (mut manager, _listener, _config_file) = manager_with_reachable_hop();
        let pid = manager.create_tunnel("hop", &[target()]).unwrap();

        // "true" has already exited by the time we get here in practice,
        // but give the kernel a moment in case the scheduler is slow.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let reaped = manager.reap();
        assert!(reaped.contains(&pid));
        assert!(manager.get(pid).is_none());
    }

    #[test]
    fn failed_rule_install_leaves_nothing_registered_and_never_fires_create() {
        let (mut manager, _listener, _config_file) = manager_with_reachable_hop();
        let log = NamedTempFile::new().unwrap();
        let script = fails_install_for_port_script(log.path(), 6668);
        manager.rule_driver = RuleDriver::with_tool(script.path().to_path_buf());
        let fired = Rc::new(RefCell::new(false));
        let fired_clone = Rc::clone(&fired);
        manager.add_create_callback(move |_sup| {
            *fired_clone.borrow_mut() = true;
        });

        // The first target's rule installs fine; the second's fails, so
        // the whole create rolls back: net zero rules left standing and
        // the first target's rule actually gets removed again.
        let result = manager.create_tunnel("hop", &[target(), target_b()]);
        assert!(result.is_err());
        assert!(manager.is_empty());
        assert!(!*fired.borrow());

        let calls = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(lines, vec!["-A 6667", "-A 6668", "-D 6667"]);
    }
}
