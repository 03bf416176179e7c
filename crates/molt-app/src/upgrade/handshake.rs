//! Upgrade handshake between the running and the newly installed instance
//!
//! The running (old) instance listens on a well-known Unix socket. The new
//! instance, launched with `--install`, connects once and writes an 8-byte
//! token. The old instance reads exactly that many bytes and treats the
//! hand-off as confirmed only if they equal [`HandshakeMessage::CANONICAL`].
//!
//! The protocol itself lives in [`HandshakeMachine`], which maps completion
//! events to actions without touching any descriptor. [`HandshakeServer`]
//! feeds it from a [`Reactor`] running on a worker thread.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::net::Shutdown;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use molt_core::{CompletionHandler, Operation, Reactor, ReactorError, RunStatus};

use crate::failure::{HardFailure, HardFailureKind};

/// Size of every handshake payload
pub const MESSAGE_LEN: usize = 8;

/// Threads allowed inside the handshake reactor
const REACTOR_CONCURRENCY: usize = 2;

/// An 8-byte handshake payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeMessage([u8; MESSAGE_LEN]);

impl HandshakeMessage {
    /// The only payload that confirms a hand-off
    pub const CANONICAL: HandshakeMessage = HandshakeMessage(*b"alive001");

    pub const fn new(bytes: [u8; MESSAGE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_LEN] {
        &self.0
    }

    /// Exact comparison; partial or padded input never matches
    pub fn confirms(received: &[u8]) -> bool {
        received == Self::CANONICAL.0.as_slice()
    }
}

/// Where the server side of one attempt stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingConnect,
    AwaitingRead,
    /// Payload received; `true` if it was the canonical token
    Resolved(bool),
    Cancelling,
    Closed,
    /// Accept or read failed; the attempt ends by timeout
    Failed,
    /// Disconnect failed after the payload was read
    Aborted,
}

/// Inputs to the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent<'a> {
    Begin,
    /// A client connected (`true`) or the accept failed (`false`)
    Connected(bool),
    /// Bytes read before the peer closed, or `None` if the read failed
    ReadComplete(Option<&'a [u8]>),
    Disconnected(bool),
    WriteComplete,
    Cancel,
}

/// What the driver must do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeAction {
    None,
    Accept,
    Read,
    Disconnect,
    /// Wake the waiting worker
    Release,
    /// Protocol violation: fail with [`HardFailureKind::Upgrade`]
    Abort,
}

/// Server-side protocol state
#[derive(Debug)]
pub struct HandshakeMachine {
    state: HandshakeState,
    confirmed: bool,
}

impl Default for HandshakeMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeMachine {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Idle,
            confirmed: false,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Whether the canonical token was received
    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn advance(&mut self, event: HandshakeEvent<'_>) -> HandshakeAction {
        use HandshakeAction as A;
        use HandshakeEvent as E;
        use HandshakeState as S;

        let (next, action) = match (self.state, event) {
            (S::Closed, E::Cancel) => (S::Closed, A::Release),
            (_, E::Cancel) => (S::Cancelling, A::Release),
            (_, E::WriteComplete) => (self.state, A::None),

            (S::Idle, E::Begin) => (S::AwaitingConnect, A::Accept),
            (S::AwaitingConnect, E::Connected(true)) => (S::AwaitingRead, A::Read),
            (S::AwaitingConnect, E::Connected(false)) => (S::Failed, A::None),
            (S::AwaitingRead, E::ReadComplete(Some(buf))) => {
                self.confirmed = HandshakeMessage::confirms(buf);
                (S::Resolved(self.confirmed), A::Disconnect)
            }
            (S::AwaitingRead, E::ReadComplete(None)) => (S::Failed, A::None),
            (S::Resolved(_), E::Disconnected(true)) => (S::Closed, A::Release),
            (S::Resolved(_), E::Disconnected(false)) => (S::Aborted, A::Abort),
            (S::Cancelling, E::Disconnected(_)) => (S::Closed, A::None),

            (state, event) => {
                log::debug!("Handshake: ignoring {:?} in state {:?}", event, state);
                (state, A::None)
            }
        };

        if next != self.state {
            log::debug!("Handshake: {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        action
    }
}

/// State shared between the server handle and its worker
struct Session {
    machine: HandshakeMachine,
    abort: Option<HardFailure>,
}

type SharedSession = Arc<Mutex<Session>>;

/// Feeds reactor completions into the machine
struct ServerHandler {
    session: SharedSession,
}

impl ServerHandler {
    fn disconnect(stream: &UnixStream) -> bool {
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => true,
            // The peer already hung up
            Err(e) if e.kind() == io::ErrorKind::NotConnected => true,
            Err(e) => {
                log::warn!("Handshake: disconnect failed: {}", e);
                false
            }
        }
    }

    fn perform(session: &mut Session, reactor: &Reactor, action: HandshakeAction) {
        match action {
            HandshakeAction::Release => {
                if let Err(e) = reactor.release_waiter() {
                    log::warn!("Handshake: failed to release waiter: {}", e);
                }
            }
            HandshakeAction::Abort => {
                session.abort = Some(HardFailure::new(HardFailureKind::Upgrade));
                if let Err(e) = reactor.release_waiter() {
                    log::warn!("Handshake: failed to release waiter: {}", e);
                }
            }
            _ => {}
        }
    }
}

impl CompletionHandler for ServerHandler {
    fn on_connect(&mut self, reactor: &Reactor, result: io::Result<UnixStream>) {
        let mut session = self.session.lock();
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Handshake: accept failed: {}", e);
                session.machine.advance(HandshakeEvent::Connected(false));
                return;
            }
        };

        log::debug!("Handshake: client connected");
        if session.machine.advance(HandshakeEvent::Connected(true)) != HandshakeAction::Read {
            return;
        }

        let op = Operation::Read {
            stream,
            buf: vec![0u8; MESSAGE_LEN],
        };
        if let Err(e) = reactor.submit(op) {
            log::warn!("Handshake: failed to queue read: {}", e);
            session.machine.advance(HandshakeEvent::ReadComplete(None));
        }
    }

    fn on_read(
        &mut self,
        reactor: &Reactor,
        stream: UnixStream,
        buf: Vec<u8>,
        result: io::Result<usize>,
    ) {
        let mut session = self.session.lock();
        let event = match result {
            Ok(n) => HandshakeEvent::ReadComplete(Some(&buf[..n])),
            Err(ref e) => {
                log::warn!("Handshake: read failed: {}", e);
                HandshakeEvent::ReadComplete(None)
            }
        };

        let action = session.machine.advance(event);
        if action != HandshakeAction::Disconnect {
            return;
        }

        let ok = Self::disconnect(&stream);
        drop(stream);
        let action = session.machine.advance(HandshakeEvent::Disconnected(ok));
        Self::perform(&mut session, reactor, action);
    }

    fn on_write(&mut self, _reactor: &Reactor, _stream: UnixStream, _result: io::Result<usize>) {
        self.session
            .lock()
            .machine
            .advance(HandshakeEvent::WriteComplete);
    }
}

/// Exclusive claim on an endpoint path
///
/// The lock lives in `<endpoint>.lock` and is released when the file is
/// closed. The lock file itself is left in place.
struct EndpointLock {
    _file: File,
}

impl EndpointLock {
    fn acquire(endpoint: &Path) -> io::Result<Self> {
        let mut name = OsString::from(endpoint.as_os_str());
        name.push(".lock");

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .mode(0o600)
            .open(PathBuf::from(name))?;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} is in use by another instance", endpoint.display()),
                ));
            }
            return Err(err);
        }
        Ok(Self { _file: file })
    }
}

/// Server side of one upgrade attempt
///
/// Dropping the server without calling [`end`](Self::end) cancels it.
pub struct HandshakeServer {
    endpoint: PathBuf,
    reactor: Arc<Reactor>,
    session: SharedSession,
    worker: Option<JoinHandle<Result<RunStatus, ReactorError>>>,
    // Declared last so it is released after the endpoint is unlinked
    _lock: EndpointLock,
}

impl HandshakeServer {
    /// Bind `endpoint` and start waiting for the new instance
    ///
    /// The worker gives up after `timeout`. Fails if another attempt holds
    /// the endpoint.
    pub fn begin(endpoint: &Path, timeout: Duration) -> Result<Self, HardFailure> {
        let io_failure = |e: io::Error| HardFailure::with_source(HardFailureKind::FileIo, e);

        let lock = EndpointLock::acquire(endpoint).map_err(io_failure)?;

        // Holding the lock, any socket file left here is stale
        match std::fs::remove_file(endpoint) {
            Ok(()) => log::debug!("Removed stale endpoint {}", endpoint.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_failure(e)),
        }

        let listener = UnixListener::bind(endpoint).map_err(io_failure)?;
        let reactor = Reactor::new(REACTOR_CONCURRENCY)
            .map_err(|e| HardFailure::with_source(HardFailureKind::FileIo, e))?;
        let reactor = Arc::new(reactor);

        let session = Arc::new(Mutex::new(Session {
            machine: HandshakeMachine::new(),
            abort: None,
        }));

        let mut server = Self {
            endpoint: endpoint.to_path_buf(),
            reactor,
            session,
            worker: None,
            _lock: lock,
        };

        {
            let mut session = server.session.lock();
            if session.machine.advance(HandshakeEvent::Begin) == HandshakeAction::Accept {
                server
                    .reactor
                    .submit(Operation::Accept(listener))
                    .map_err(io_failure)?;
            }
        }

        let reactor = Arc::clone(&server.reactor);
        let mut handler = ServerHandler {
            session: Arc::clone(&server.session),
        };
        let worker = std::thread::Builder::new()
            .name("molt-handshake".into())
            .spawn(move || reactor.run(Some(timeout), &mut handler))
            .map_err(io_failure)?;
        server.worker = Some(worker);

        log::info!(
            "Waiting up to {} ms for hand-off on {}",
            timeout.as_millis(),
            endpoint.display()
        );
        Ok(server)
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Wait for the attempt to finish and report whether it was confirmed
    pub fn end(mut self) -> Result<bool, HardFailure> {
        let status = self.join()?;

        let mut session = self.session.lock();
        if let Some(failure) = session.abort.take() {
            return Err(failure);
        }

        let confirmed = session.machine.confirmed();
        match status {
            RunStatus::Released => log::info!("Hand-off finished, confirmed: {}", confirmed),
            RunStatus::TimedOut => log::info!("Hand-off timed out"),
        }
        Ok(confirmed)
    }

    /// Abandon the attempt: close the endpoint, release the worker and join it
    pub fn cancel(mut self) {
        self.cancel_and_join();
    }

    fn cancel_and_join(&mut self) {
        if self.worker.is_none() {
            return;
        }

        {
            let mut session = self.session.lock();
            let action = session.machine.advance(HandshakeEvent::Cancel);
            let dropped = self.reactor.cancel_all();
            log::debug!("Handshake: cancelled with {} pending operation(s)", dropped);
            session.machine.advance(HandshakeEvent::Disconnected(true));
            ServerHandler::perform(&mut session, &self.reactor, action);
        }

        if let Err(e) = self.join() {
            log::warn!("Handshake worker ended badly during cancel: {}", e);
        }
    }

    fn join(&mut self) -> Result<RunStatus, HardFailure> {
        let Some(worker) = self.worker.take() else {
            return Ok(RunStatus::Released);
        };

        let outcome = worker.join();

        // Whatever happened, the endpoint is finished with
        self.reactor.cancel_all();
        if let Err(e) = std::fs::remove_file(&self.endpoint) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!(
                    "Failed to remove endpoint {}: {}",
                    self.endpoint.display(),
                    e
                );
            }
        }

        match outcome {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(HardFailure::with_source(HardFailureKind::Unexpected, e)),
            Err(_) => Err(HardFailure::with_source(
                HardFailureKind::Unexpected,
                "handshake worker panicked",
            )),
        }
    }
}

impl Drop for HandshakeServer {
    fn drop(&mut self) {
        self.cancel_and_join();
    }
}

/// Connect once to `endpoint` and write `payload`
///
/// Returns the number of bytes the server accepted. There is no retry: the
/// server is always started before the new instance is launched.
pub fn send_payload(endpoint: &Path, payload: &[u8]) -> io::Result<usize> {
    let mut stream = UnixStream::connect(endpoint)?;
    let written = stream.write(payload)?;
    stream.flush()?;
    Ok(written)
}

/// Client side: confirm the hand-off to the instance listening on `endpoint`
pub fn start_new(endpoint: &Path) -> io::Result<()> {
    let token = HandshakeMessage::CANONICAL;
    let written = send_payload(endpoint, token.as_bytes())?;
    if written != MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("only {} of {} token bytes accepted", written, MESSAGE_LEN),
        ));
    }
    log::info!("Confirmed hand-off on {}", endpoint.display());
    Ok(())
}
