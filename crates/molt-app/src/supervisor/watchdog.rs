//! Supervisor thread for the worker process group
//!
//! The supervisor owns a [`ProcessGroup`] and a reactor of its own. A
//! dedicated thread blocks in [`Reactor::run`] and:
//! 1. Wakes when the `SIGCHLD` pipe becomes readable and reaps exited members
//! 2. Receives spawn and limit messages posted by the group
//! 3. Records every event and mirrors it to the event log
//!
//! The thread also reaps on a short period, so a group whose last members
//! were reparented elsewhere is still seen to drain.

use std::io;
use std::os::unix::net::UnixStream;
use std::process::Command;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use molt_core::process_group::drain;
use molt_core::{
    adopt_orphans, CompletionHandler, GroupError, GroupEvent, GroupLimits, Operation, ProcessGroup, Reactor,
    ReactorError, RunStatus,
};

use super::record::EventRecord;
use crate::event_log::EventLog;

/// How often the group is reaped without a `SIGCHLD`
const DRAIN_CHECK: Duration = Duration::from_secs(1);

/// Errors from the supervisor
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Reactor error: {0}")]
    Reactor(#[from] ReactorError),

    #[error("Supervisor thread panicked")]
    Panicked,
}

/// Turns completions into recorded group events
struct GroupHandler {
    group: Arc<ProcessGroup>,
    record: Arc<Mutex<EventRecord>>,
    log: Arc<EventLog>,
}

impl GroupHandler {
    fn note(&self, event: GroupEvent) {
        match event {
            GroupEvent::NewProcess(_) | GroupEvent::NormalExit { status: 0, .. } => {
                log::debug!("Group {}: {:?}", self.group.name(), event)
            }
            _ => log::info!("Group {}: {:?}", self.group.name(), event),
        }
        self.log.group_event(&event);
        self.record.lock().apply(&event);
    }

    fn collect(&self) {
        for event in self.group.reap() {
            self.note(event);
        }
    }
}

impl CompletionHandler for GroupHandler {
    fn on_notify(&mut self, reactor: &Reactor, source: UnixStream) {
        if let Err(e) = drain(&source) {
            log::warn!("Group {}: failed to drain signal pipe: {}", self.group.name(), e);
        }

        self.collect();

        if let Err(e) = reactor.submit(Operation::Notify(source)) {
            log::error!(
                "Group {}: cannot rearm exit notifications: {}",
                self.group.name(),
                e
            );
        }
    }

    fn on_posted(&mut self, _reactor: &Reactor, key: usize, value: u64) {
        match GroupEvent::from_posted(key, value) {
            Some(event) => self.note(event),
            None => log::debug!("Group {}: unknown message {}", self.group.name(), key),
        }
    }
}

/// Long-lived observer of the worker process group
pub struct Supervisor {
    group: Arc<ProcessGroup>,
    reactor: Arc<Reactor>,
    record: Arc<Mutex<EventRecord>>,
    worker: Option<JoinHandle<Result<RunStatus, ReactorError>>>,
}

impl Supervisor {
    /// Create the group and start the supervisor thread
    pub fn start(
        name: &str,
        limits: GroupLimits,
        log: Arc<EventLog>,
    ) -> Result<Self, SupervisorError> {
        if let Err(e) = adopt_orphans() {
            log::warn!("Cannot adopt orphaned workers: {}", e);
        }

        let reactor = Arc::new(Reactor::new(1)?);
        let group = Arc::new(ProcessGroup::new(name, limits));
        group.attach(Arc::clone(&reactor));

        let exits = group.watch_exits()?;
        reactor.submit(Operation::Notify(exits))?;

        let record = Arc::new(Mutex::new(EventRecord::default()));
        let mut handler = GroupHandler {
            group: Arc::clone(&group),
            record: Arc::clone(&record),
            log,
        };

        let thread_reactor = Arc::clone(&reactor);
        let worker = std::thread::Builder::new()
            .name("molt-supervisor".into())
            .spawn(move || -> Result<RunStatus, ReactorError> {
                loop {
                    match thread_reactor.run(Some(DRAIN_CHECK), &mut handler)? {
                        RunStatus::TimedOut => handler.collect(),
                        status => return Ok(status),
                    }
                }
            })?;

        log::info!(
            "Supervisor started for group {} (max_active={}, cpu_seconds={}, memory_bytes={})",
            name,
            limits.max_active,
            limits.cpu_seconds,
            limits.memory_bytes
        );

        Ok(Self {
            group,
            reactor,
            record,
            worker: Some(worker),
        })
    }

    /// Start `command` as a member of the group
    pub fn spawn(&self, command: &mut Command) -> Result<u32, GroupError> {
        self.group.spawn(command)
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    /// Ask every member of the group to exit
    pub fn terminate_all(&self) -> io::Result<()> {
        log::info!("Group {}: sending SIGTERM", self.group.name());
        self.group.signal_all(libc::SIGTERM)
    }

    /// Snapshot of everything recorded so far
    pub fn record(&self) -> EventRecord {
        self.record.lock().clone()
    }

    /// Stop the supervisor thread and return the final record
    ///
    /// Members keep running; callers wanting them gone signal the group
    /// first.
    pub fn shutdown(mut self) -> Result<EventRecord, SupervisorError> {
        self.stop()?;
        Ok(self.record())
    }

    fn stop(&mut self) -> Result<(), SupervisorError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        self.reactor.release_waiter()?;
        let status = worker.join().map_err(|_| SupervisorError::Panicked)??;
        self.reactor.cancel_all();
        log::info!("Supervisor for group {} stopped ({:?})", self.group.name(), status);
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Supervisor shutdown failed: {}", e);
        }
    }
}
