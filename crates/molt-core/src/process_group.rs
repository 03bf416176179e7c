//! Process groups for supervised workers
//!
//! Every process spawned through a [`ProcessGroup`] joins one POSIX process
//! group, so descendants inherit membership and the whole set can be
//! signalled at once. Lifecycle changes are reported as [`GroupEvent`]s:
//! spawns are posted to an attached [`Reactor`], exits are collected by
//! [`ProcessGroup::reap`] after `SIGCHLD` wakes the supervisor.
//!
//! The group outlives its direct children: it stays signallable until the
//! last descendant has left it, and only then reports `ActiveCountZero`.

use std::collections::HashSet;
use std::io::{self, Read};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::Arc;

use parking_lot::Mutex;
use signal_hook::SigId;
use thiserror::Error;

use crate::reactor::Reactor;

/// Posted-completion keys used for group messages
pub const MSG_NEW_PROCESS: usize = 1;
pub const MSG_ACTIVE_PROCESS_LIMIT: usize = 2;

/// Errors from process group operations
#[derive(Error, Debug)]
pub enum GroupError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Active process limit reached ({0})")]
    ActiveLimit(usize),
}

/// Per-group and per-process limits; zero means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupLimits {
    /// Maximum number of live direct children
    pub max_active: usize,
    /// CPU time per process (RLIMIT_CPU)
    pub cpu_seconds: u64,
    /// Address space per process (RLIMIT_AS)
    pub memory_bytes: u64,
}

/// A lifecycle notification for a group member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEvent {
    NewProcess(u32),
    NormalExit { pid: u32, status: i32 },
    /// Killed by `signal`; 0 if the exit status could not be collected
    AbnormalExit { pid: u32, signal: i32 },
    ActiveCountZero,
    ActiveProcessLimit,
    MemoryLimit(u32),
    TimeLimit(u32),
}

impl GroupEvent {
    /// Decode a message posted by [`ProcessGroup::spawn`]
    pub fn from_posted(key: usize, value: u64) -> Option<Self> {
        match key {
            MSG_NEW_PROCESS => Some(GroupEvent::NewProcess(value as u32)),
            MSG_ACTIVE_PROCESS_LIMIT => Some(GroupEvent::ActiveProcessLimit),
            _ => None,
        }
    }
}

/// How a child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    Signaled(i32),
}

impl ExitState {
    /// Decode a raw `waitpid` status; `None` for stop/continue reports
    pub fn from_raw(status: libc::c_int) -> Option<Self> {
        if libc::WIFEXITED(status) {
            Some(ExitState::Exited(libc::WEXITSTATUS(status)))
        } else if libc::WIFSIGNALED(status) {
            Some(ExitState::Signaled(libc::WTERMSIG(status)))
        } else {
            None
        }
    }
}

/// Map a termination to the events it produces
///
/// A child killed by `SIGXCPU` ran out of CPU time. With an address-space
/// limit in force, death by `SIGSEGV`, `SIGABRT` or `SIGKILL` is reported as
/// a memory limit hit, since that is how failed allocations usually end.
pub fn classify_exit(pid: u32, state: ExitState, limits: &GroupLimits) -> Vec<GroupEvent> {
    match state {
        ExitState::Exited(status) => vec![GroupEvent::NormalExit { pid, status }],
        ExitState::Signaled(signal) => {
            let mut events = Vec::with_capacity(2);
            if signal == libc::SIGXCPU {
                events.push(GroupEvent::TimeLimit(pid));
            } else if limits.memory_bytes > 0
                && matches!(signal, libc::SIGSEGV | libc::SIGABRT | libc::SIGKILL)
            {
                events.push(GroupEvent::MemoryLimit(pid));
            }
            events.push(GroupEvent::AbnormalExit { pid, signal });
            events
        }
    }
}

#[derive(Default)]
struct GroupState {
    /// Process group id; set by the first spawn after the group was empty
    /// and kept while any descendant is still a member
    pgid: Option<i32>,
    active: HashSet<u32>,
    /// The group emptied and `ActiveCountZero` is still to be reported
    drained: bool,
}

/// A named set of processes tracked as one unit
pub struct ProcessGroup {
    name: String,
    limits: GroupLimits,
    state: Mutex<GroupState>,
    notifier: Mutex<Option<Arc<Reactor>>>,
    sigchld: Mutex<Option<SigId>>,
}

impl ProcessGroup {
    pub fn new(name: &str, limits: GroupLimits) -> Self {
        Self {
            name: name.to_string(),
            limits,
            state: Mutex::new(GroupState::default()),
            notifier: Mutex::new(None),
            sigchld: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> &GroupLimits {
        &self.limits
    }

    /// Post spawn notifications to `reactor` from now on
    pub fn attach(&self, reactor: Arc<Reactor>) {
        *self.notifier.lock() = Some(reactor);
    }

    /// Register for `SIGCHLD` and return the readable end of the signal pipe
    ///
    /// The returned stream becomes readable whenever a child changes state.
    /// Registering again replaces the previous pipe.
    pub fn watch_exits(&self) -> io::Result<UnixStream> {
        let (read_end, write_end) = UnixStream::pair()?;
        write_end.set_nonblocking(true)?;
        let id = signal_hook::low_level::pipe::register(libc::SIGCHLD, write_end)?;

        if let Some(previous) = self.sigchld.lock().replace(id) {
            signal_hook::low_level::unregister(previous);
        }
        Ok(read_end)
    }

    /// Spawn `command` into the group and return its pid
    pub fn spawn(&self, command: &mut Command) -> Result<u32, GroupError> {
        let mut state = self.state.lock();

        if self.limits.max_active > 0 && state.active.len() >= self.limits.max_active {
            log::warn!(
                "Group {}: refusing spawn, {} processes active",
                self.name,
                state.active.len()
            );
            self.notify(MSG_ACTIVE_PROCESS_LIMIT, 0);
            return Err(GroupError::ActiveLimit(self.limits.max_active));
        }

        if state.active.is_empty() {
            if let Some(pgid) = state.pgid {
                if !group_alive(pgid) {
                    state.pgid = None;
                    state.drained = true;
                }
            }
        }

        // 0 makes the child the leader of a fresh group
        command.process_group(state.pgid.unwrap_or(0));

        let limits = self.limits;
        if limits.cpu_seconds > 0 || limits.memory_bytes > 0 {
            unsafe {
                command.pre_exec(move || apply_rlimits(&limits));
            }
        }

        // The Child handle is not kept: exits are collected by `reap`
        let pid = command
            .spawn()
            .map_err(|source| GroupError::Spawn {
                command: format!("{:?}", command.get_program()),
                source,
            })?
            .id();

        if state.pgid.is_none() {
            state.pgid = Some(pid as i32);
        }
        state.active.insert(pid);
        log::info!("Group {}: spawned pid {}", self.name, pid);

        self.notify(MSG_NEW_PROCESS, pid as u64);
        Ok(pid)
    }

    /// Collect exited members without blocking
    ///
    /// `ActiveCountZero` is reported once no process is left in the group,
    /// which may be later than the exit of the last direct child.
    pub fn reap(&self) -> Vec<GroupEvent> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut events = Vec::new();
        let mut exited = Vec::new();

        for &pid in &state.active {
            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };
            if ret == pid as libc::pid_t {
                if let Some(exit) = ExitState::from_raw(status) {
                    events.extend(classify_exit(pid, exit, &self.limits));
                    exited.push(pid);
                }
            } else if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::warn!(
                    "Group {}: exit status of pid {} lost: {}",
                    self.name,
                    pid,
                    err
                );
                events.push(GroupEvent::AbnormalExit { pid, signal: 0 });
                exited.push(pid);
            }
        }
        for pid in &exited {
            state.active.remove(pid);
        }

        if let Some(pgid) = state.pgid {
            // Descendants adopted after their own parent exited
            loop {
                let mut status: libc::c_int = 0;
                let ret = unsafe { libc::waitpid(-pgid, &mut status, libc::WNOHANG) };
                if ret <= 0 {
                    break;
                }
                let pid = ret as u32;
                if state.active.remove(&pid) {
                    if let Some(exit) = ExitState::from_raw(status) {
                        events.extend(classify_exit(pid, exit, &self.limits));
                    }
                } else {
                    log::debug!("Group {}: reaped descendant {}", self.name, pid);
                }
            }

            if state.active.is_empty() && !group_alive(pgid) {
                state.pgid = None;
                state.drained = true;
            }
        }

        if std::mem::take(&mut state.drained) {
            events.push(GroupEvent::ActiveCountZero);
        }
        events
    }

    /// Pids of live direct children
    pub fn active(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.state.lock().active.iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Send `signal` to every member of the group, descendants included
    pub fn signal_all(&self, signal: i32) -> io::Result<()> {
        let Some(pgid) = self.state.lock().pgid else {
            return Ok(());
        };
        let ret = unsafe { libc::killpg(pgid, signal) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn notify(&self, key: usize, value: u64) {
        if let Some(reactor) = self.notifier.lock().as_ref() {
            if let Err(e) = reactor.post(key, value) {
                log::warn!("Group {}: failed to post event: {}", self.name, e);
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(id) = self.sigchld.lock().take() {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Whether any process is still a member of group `pgid`
fn group_alive(pgid: i32) -> bool {
    let ret = unsafe { libc::killpg(pgid, 0) };
    ret == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Make this process the reaper of its orphaned descendants
///
/// A member's children that outlive it are reparented here instead of to
/// init, so their exits raise `SIGCHLD` and [`ProcessGroup::reap`] collects
/// them. Does nothing outside Linux.
pub fn adopt_orphans() -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let enable: libc::c_ulong = 1;
        let ret = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, enable) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Empty a non-blocking signal pipe
pub fn drain(source: &UnixStream) -> io::Result<()> {
    let mut buf = [0u8; 64];
    loop {
        match (&*source).read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Runs in the forked child before exec; only async-signal-safe calls
fn apply_rlimits(limits: &GroupLimits) -> io::Result<()> {
    if limits.cpu_seconds > 0 {
        set_rlimit(libc::RLIMIT_CPU, limits.cpu_seconds)?;
    }
    if limits.memory_bytes > 0 {
        set_rlimit(libc::RLIMIT_AS, limits.memory_bytes)?;
    }
    Ok(())
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

fn set_rlimit(resource: Resource, value: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    let ret = unsafe { libc::setrlimit(resource, &limit) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn reap_until(group: &ProcessGroup, want: usize) -> Vec<GroupEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while events.len() < want && Instant::now() < deadline {
            events.extend(group.reap());
            std::thread::sleep(Duration::from_millis(10));
        }
        events
    }

    #[test]
    fn test_classify_normal_exit() {
        let limits = GroupLimits::default();
        assert_eq!(
            classify_exit(10, ExitState::Exited(3), &limits),
            vec![GroupEvent::NormalExit { pid: 10, status: 3 }]
        );
    }

    #[test]
    fn test_classify_cpu_limit() {
        let limits = GroupLimits::default();
        assert_eq!(
            classify_exit(11, ExitState::Signaled(libc::SIGXCPU), &limits),
            vec![
                GroupEvent::TimeLimit(11),
                GroupEvent::AbnormalExit {
                    pid: 11,
                    signal: libc::SIGXCPU
                }
            ]
        );
    }

    #[test]
    fn test_classify_memory_limit_only_when_configured() {
        let unlimited = GroupLimits::default();
        assert_eq!(
            classify_exit(12, ExitState::Signaled(libc::SIGSEGV), &unlimited),
            vec![GroupEvent::AbnormalExit {
                pid: 12,
                signal: libc::SIGSEGV
            }]
        );

        let limited = GroupLimits {
            memory_bytes: 1 << 30,
            ..Default::default()
        };
        assert_eq!(
            classify_exit(12, ExitState::Signaled(libc::SIGSEGV), &limited)[0],
            GroupEvent::MemoryLimit(12)
        );
        assert_eq!(
            classify_exit(12, ExitState::Signaled(libc::SIGTERM), &limited),
            vec![GroupEvent::AbnormalExit {
                pid: 12,
                signal: libc::SIGTERM
            }]
        );
    }

    #[test]
    fn test_posted_decoding() {
        assert_eq!(
            GroupEvent::from_posted(MSG_NEW_PROCESS, 99),
            Some(GroupEvent::NewProcess(99))
        );
        assert_eq!(
            GroupEvent::from_posted(MSG_ACTIVE_PROCESS_LIMIT, 0),
            Some(GroupEvent::ActiveProcessLimit)
        );
        assert_eq!(GroupEvent::from_posted(1000, 0), None);
    }

    #[test]
    fn test_spawn_and_reap() {
        let group = ProcessGroup::new("test-reap", GroupLimits::default());
        let pid = group
            .spawn(Command::new("sh").args(["-c", "exit 3"]))
            .unwrap();
        assert_eq!(group.active(), vec![pid]);

        let events = reap_until(&group, 2);
        assert_eq!(
            events,
            vec![
                GroupEvent::NormalExit { pid, status: 3 },
                GroupEvent::ActiveCountZero
            ]
        );
        assert!(group.active().is_empty());
    }

    #[test]
    fn test_members_share_a_group() {
        let group = ProcessGroup::new("test-pgid", GroupLimits::default());
        let first = group.spawn(Command::new("sleep").arg("5")).unwrap();
        let second = group.spawn(Command::new("sleep").arg("5")).unwrap();

        let pgid_of = |pid: u32| unsafe { libc::getpgid(pid as libc::pid_t) };
        assert_eq!(pgid_of(first), first as i32);
        assert_eq!(pgid_of(second), first as i32);

        group.signal_all(libc::SIGKILL).unwrap();
        let events = reap_until(&group, 3);
        assert!(events.contains(&GroupEvent::AbnormalExit {
            pid: first,
            signal: libc::SIGKILL
        }));
        assert_eq!(events.last(), Some(&GroupEvent::ActiveCountZero));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_descendants_keep_the_group() {
        adopt_orphans().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");

        let group = ProcessGroup::new("test-descendants", GroupLimits::default());
        let script = format!("sleep 30 & echo $! > {}; exit 0", pid_file.display());
        let pid = group.spawn(Command::new("sh").args(["-c", &script])).unwrap();

        let events = reap_until(&group, 1);
        assert_eq!(events, vec![GroupEvent::NormalExit { pid, status: 0 }]);
        assert!(group.active().is_empty());

        let grandchild: libc::pid_t = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(unsafe { libc::getpgid(grandchild) }, pid as i32);

        // The group is not empty yet
        std::thread::sleep(Duration::from_millis(50));
        assert!(group.reap().is_empty());

        group.signal_all(libc::SIGKILL).unwrap();
        let events = reap_until(&group, 1);
        assert_eq!(events, vec![GroupEvent::ActiveCountZero]);
        assert_ne!(unsafe { libc::kill(grandchild, 0) }, 0);
    }

    #[test]
    fn test_lost_status_is_recorded() {
        let group = ProcessGroup::new("test-lost", GroupLimits::default());
        let pid = group.spawn(Command::new("sh").args(["-c", "exit 0"])).unwrap();

        // Collected behind the group's back
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, 0) };
        assert_eq!(ret, pid as libc::pid_t);

        let events = reap_until(&group, 2);
        assert_eq!(
            events,
            vec![
                GroupEvent::AbnormalExit { pid, signal: 0 },
                GroupEvent::ActiveCountZero
            ]
        );
    }

    #[test]
    fn test_active_limit_refuses_spawn() {
        let limits = GroupLimits {
            max_active: 1,
            ..Default::default()
        };
        let group = ProcessGroup::new("test-limit", limits);
        group.spawn(Command::new("sleep").arg("5")).unwrap();

        let err = group.spawn(Command::new("sleep").arg("5")).unwrap_err();
        assert!(matches!(err, GroupError::ActiveLimit(1)));

        group.signal_all(libc::SIGKILL).unwrap();
        reap_until(&group, 2);
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let group = ProcessGroup::new("test-missing", GroupLimits::default());
        let err = group
            .spawn(&mut Command::new("/nonexistent/molt-worker"))
            .unwrap_err();
        assert!(matches!(err, GroupError::Spawn { .. }));
        assert!(group.active().is_empty());
    }
}
