//! Bookkeeping of process group events

use molt_core::GroupEvent;

/// Pids grouped by what happened to them
///
/// The supervisor only observes; nothing here triggers corrective action.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub new_processes: Vec<u32>,
    /// `(pid, exit status)`
    pub normal_exits: Vec<(u32, i32)>,
    /// `(pid, terminating signal)`
    pub abnormal_exits: Vec<(u32, i32)>,
    pub memory_limits: Vec<u32>,
    pub time_limits: Vec<u32>,
    /// Times the group became empty
    pub active_count_zero: usize,
    /// Spawns refused because the group was full
    pub active_process_limit: usize,
}

impl EventRecord {
    pub fn apply(&mut self, event: &GroupEvent) {
        match *event {
            GroupEvent::NewProcess(pid) => self.new_processes.push(pid),
            GroupEvent::NormalExit { pid, status } => self.normal_exits.push((pid, status)),
            GroupEvent::AbnormalExit { pid, signal } => self.abnormal_exits.push((pid, signal)),
            GroupEvent::ActiveCountZero => self.active_count_zero += 1,
            GroupEvent::ActiveProcessLimit => self.active_process_limit += 1,
            GroupEvent::MemoryLimit(pid) => self.memory_limits.push(pid),
            GroupEvent::TimeLimit(pid) => self.time_limits.push(pid),
        }
    }

    /// Whether `pid` has been seen to exit, normally or not
    pub fn has_exited(&self, pid: u32) -> bool {
        self.normal_exits.iter().any(|&(p, _)| p == pid)
            || self.abnormal_exits.iter().any(|&(p, _)| p == pid)
    }
}
