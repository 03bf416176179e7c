//! Completion reactor over Unix descriptors
//!
//! A [`Reactor`] owns a queue of pending operations (accept, read, write,
//! notify) and a wake pipe. Threads calling [`Reactor::run`] block in
//! `poll(2)` until an operation can make progress, perform it, and hand the
//! finished [`Completion`] to a [`CompletionHandler`]. Callers therefore see
//! completion semantics even though the kernel interface is readiness based.
//!
//! Operations own their endpoint and buffer for as long as they are pending.
//! Both come back with the completion; if the reactor is dropped or
//! [`Reactor::cancel_all`] is called first, they are dropped with it.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

/// Wake byte asking one waiter to return [`RunStatus::Released`]
const WAKE_RELEASE: u8 = 1;
/// Wake byte announcing a posted completion
const WAKE_POSTED: u8 = 2;

/// Errors from the reactor itself (not from the operations it performs)
#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Too many concurrent waiters (max: {0})")]
    Busy(usize),
}

/// Why a call to [`Reactor::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// A release signal was consumed
    Released,
    /// The deadline passed without a release
    TimedOut,
}

/// An operation handed to the reactor
pub enum Operation {
    /// Accept one connection; the listener is closed afterwards
    Accept(UnixListener),
    /// Fill `buf` completely, or until the peer closes
    Read { stream: UnixStream, buf: Vec<u8> },
    /// Write all of `buf`
    Write { stream: UnixStream, buf: Vec<u8> },
    /// Complete as soon as `source` becomes readable; nothing is consumed
    Notify(UnixStream),
}

impl Operation {
    fn fd(&self) -> RawFd {
        match self {
            Operation::Accept(listener) => listener.as_raw_fd(),
            Operation::Read { stream, .. }
            | Operation::Write { stream, .. }
            | Operation::Notify(stream) => stream.as_raw_fd(),
        }
    }

    fn events(&self) -> libc::c_short {
        match self {
            Operation::Write { .. } => libc::POLLOUT,
            _ => libc::POLLIN,
        }
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            Operation::Accept(listener) => listener.set_nonblocking(true),
            Operation::Read { stream, .. }
            | Operation::Write { stream, .. }
            | Operation::Notify(stream) => stream.set_nonblocking(true),
        }
    }
}

/// A finished operation
#[derive(Debug)]
pub enum Completion {
    Connect(io::Result<UnixStream>),
    /// `result` holds the number of bytes placed in `buf`; fewer than
    /// `buf.len()` means the peer closed early
    Read {
        stream: UnixStream,
        buf: Vec<u8>,
        result: io::Result<usize>,
    },
    Write {
        stream: UnixStream,
        result: io::Result<usize>,
    },
    Notify(UnixStream),
    Posted { key: usize, value: u64 },
}

/// Receives completions from [`Reactor::run`]
///
/// Every callback defaults to doing nothing, so handlers only implement the
/// kinds of completion they issue.
pub trait CompletionHandler {
    fn on_connect(&mut self, _reactor: &Reactor, _result: io::Result<UnixStream>) {}

    fn on_read(
        &mut self,
        _reactor: &Reactor,
        _stream: UnixStream,
        _buf: Vec<u8>,
        _result: io::Result<usize>,
    ) {
    }

    fn on_write(&mut self, _reactor: &Reactor, _stream: UnixStream, _result: io::Result<usize>) {}

    fn on_notify(&mut self, _reactor: &Reactor, _source: UnixStream) {}

    fn on_posted(&mut self, _reactor: &Reactor, _key: usize, _value: u64) {}
}

struct Pending {
    token: usize,
    op: Operation,
    /// Bytes already transferred for reads and writes
    progress: usize,
}

/// Outcome of trying to perform a ready operation
enum Step {
    Done(Completion),
    Again(Pending),
}

/// A completion queue with a bounded number of concurrent waiters
pub struct Reactor {
    pending: Mutex<Vec<Pending>>,
    posted: Mutex<VecDeque<(usize, u64)>>,
    next_token: AtomicUsize,
    waiters: AtomicUsize,
    concurrency: usize,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
}

impl Reactor {
    /// Create a reactor that admits at most `concurrency` threads in `run`
    pub fn new(concurrency: usize) -> Result<Self, ReactorError> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;

        Ok(Self {
            pending: Mutex::new(Vec::new()),
            posted: Mutex::new(VecDeque::new()),
            next_token: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
            concurrency: concurrency.max(1),
            wake_rx,
            wake_tx,
        })
    }

    /// Queue an operation; its completion is delivered by a later `run`
    pub fn submit(&self, op: Operation) -> io::Result<usize> {
        op.set_nonblocking()?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().push(Pending {
            token,
            op,
            progress: 0,
        });
        self.wake(WAKE_POSTED)?;
        Ok(token)
    }

    /// Queue a user completion, delivered through `on_posted`
    pub fn post(&self, key: usize, value: u64) -> io::Result<()> {
        self.posted.lock().push_back((key, value));
        self.wake(WAKE_POSTED)
    }

    /// Wake exactly one blocked `run`, which returns [`RunStatus::Released`]
    ///
    /// If nobody is waiting, the next call to `run` returns immediately.
    pub fn release_waiter(&self) -> io::Result<()> {
        self.wake(WAKE_RELEASE)
    }

    /// Drop every pending operation, closing the endpoints they own
    pub fn cancel_all(&self) -> usize {
        let dropped: Vec<Pending> = std::mem::take(&mut *self.pending.lock());
        let count = dropped.len();
        if count > 0 {
            log::debug!("Reactor: cancelled {} pending operation(s)", count);
        }
        count
    }

    /// Number of operations still waiting for their completion
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait for completions and dispatch them to `handler`
    ///
    /// `timeout` bounds the whole call, not each individual wait; `None`
    /// waits until released.
    pub fn run<H>(&self, timeout: Option<Duration>, handler: &mut H) -> Result<RunStatus, ReactorError>
    where
        H: CompletionHandler + ?Sized,
    {
        let _guard = WaiterGuard::enter(self)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            self.dispatch_posted(handler);

            let wait_ms = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(RunStatus::TimedOut);
                    }
                    poll_timeout_ms(deadline - now)
                }
                None => -1,
            };

            let (mut fds, tokens) = self.poll_set();
            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, wait_ms) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if ret == 0 {
                continue;
            }

            // Posted work and new submissions are picked up on the next pass
            if fds[0].revents != 0 && self.take_wake_byte()? == Some(WAKE_RELEASE) {
                return Ok(RunStatus::Released);
            }

            for (fd, token) in fds[1..].iter().zip(tokens) {
                if fd.revents == 0 {
                    continue;
                }
                // Another waiter may have taken it already
                let Some(pending) = self.take(token) else {
                    continue;
                };
                match perform(pending) {
                    Step::Done(completion) => dispatch(self, handler, completion),
                    Step::Again(pending) => self.pending.lock().push(pending),
                }
            }
        }
    }

    fn dispatch_posted<H: CompletionHandler + ?Sized>(&self, handler: &mut H) {
        loop {
            let next = self.posted.lock().pop_front();
            match next {
                Some((key, value)) => dispatch(self, handler, Completion::Posted { key, value }),
                None => break,
            }
        }
    }

    fn poll_set(&self) -> (Vec<libc::pollfd>, Vec<usize>) {
        let pending = self.pending.lock();
        let mut fds = Vec::with_capacity(pending.len() + 1);
        let mut tokens = Vec::with_capacity(pending.len());

        fds.push(libc::pollfd {
            fd: self.wake_rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for p in pending.iter() {
            fds.push(libc::pollfd {
                fd: p.op.fd(),
                events: p.op.events(),
                revents: 0,
            });
            tokens.push(p.token);
        }

        (fds, tokens)
    }

    fn take(&self, token: usize) -> Option<Pending> {
        let mut pending = self.pending.lock();
        let index = pending.iter().position(|p| p.token == token)?;
        Some(pending.swap_remove(index))
    }

    fn take_wake_byte(&self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match (&self.wake_rx).read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    fn wake(&self, byte: u8) -> io::Result<()> {
        match (&self.wake_tx).write(&[byte]) {
            Ok(_) => Ok(()),
            // A full wake pipe already guarantees a wakeup, but a release
            // byte must not be lost
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && byte != WAKE_RELEASE => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Counts threads inside `run` and enforces the concurrency bound
struct WaiterGuard<'a> {
    waiters: &'a AtomicUsize,
}

impl<'a> WaiterGuard<'a> {
    fn enter(reactor: &'a Reactor) -> Result<Self, ReactorError> {
        let previous = reactor.waiters.fetch_add(1, Ordering::AcqRel);
        if previous >= reactor.concurrency {
            reactor.waiters.fetch_sub(1, Ordering::AcqRel);
            return Err(ReactorError::Busy(reactor.concurrency));
        }
        Ok(Self {
            waiters: &reactor.waiters,
        })
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Round up so a sub-millisecond remainder does not spin
fn poll_timeout_ms(remaining: Duration) -> libc::c_int {
    let ms = remaining.as_micros().div_ceil(1000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

fn perform(mut pending: Pending) -> Step {
    match pending.op {
        Operation::Accept(listener) => match listener.accept() {
            Ok((stream, _addr)) => Step::Done(Completion::Connect(Ok(stream))),
            Err(e) if retryable(&e) => {
                pending.op = Operation::Accept(listener);
                Step::Again(pending)
            }
            Err(e) => Step::Done(Completion::Connect(Err(e))),
        },
        Operation::Read { mut stream, mut buf } => loop {
            if pending.progress == buf.len() {
                let result = Ok(pending.progress);
                return Step::Done(Completion::Read { stream, buf, result });
            }
            match stream.read(&mut buf[pending.progress..]) {
                Ok(0) => {
                    let result = Ok(pending.progress);
                    return Step::Done(Completion::Read { stream, buf, result });
                }
                Ok(n) => pending.progress += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    pending.op = Operation::Read { stream, buf };
                    return Step::Again(pending);
                }
                Err(e) => {
                    return Step::Done(Completion::Read {
                        stream,
                        buf,
                        result: Err(e),
                    })
                }
            }
        },
        Operation::Write { mut stream, buf } => loop {
            if pending.progress == buf.len() {
                let result = Ok(pending.progress);
                return Step::Done(Completion::Write { stream, result });
            }
            match stream.write(&buf[pending.progress..]) {
                Ok(0) => {
                    let result = Err(io::Error::from(io::ErrorKind::WriteZero));
                    return Step::Done(Completion::Write { stream, result });
                }
                Ok(n) => pending.progress += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    pending.op = Operation::Write { stream, buf };
                    return Step::Again(pending);
                }
                Err(e) => return Step::Done(Completion::Write { stream, result: Err(e) }),
            }
        },
        Operation::Notify(source) => Step::Done(Completion::Notify(source)),
    }
}

fn retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn dispatch<H: CompletionHandler + ?Sized>(reactor: &Reactor, handler: &mut H, completion: Completion) {
    match completion {
        Completion::Connect(result) => handler.on_connect(reactor, result),
        Completion::Read {
            stream,
            buf,
            result,
        } => handler.on_read(reactor, stream, buf, result),
        Completion::Write { stream, result } => handler.on_write(reactor, stream, result),
        Completion::Notify(source) => handler.on_notify(reactor, source),
        Completion::Posted { key, value } => handler.on_posted(reactor, key, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Records everything it receives and releases after `stop_after` events
    #[derive(Default)]
    struct Recorder {
        connects: usize,
        reads: Vec<Vec<u8>>,
        writes: Vec<usize>,
        notifies: usize,
        posted: Vec<(usize, u64)>,
        stop_after: usize,
    }

    impl Recorder {
        fn seen(&self) -> usize {
            self.connects + self.reads.len() + self.writes.len() + self.notifies + self.posted.len()
        }

        fn maybe_release(&self, reactor: &Reactor) {
            if self.seen() >= self.stop_after {
                reactor.release_waiter().unwrap();
            }
        }
    }

    impl CompletionHandler for Recorder {
        fn on_connect(&mut self, reactor: &Reactor, result: io::Result<UnixStream>) {
            let stream = result.unwrap();
            self.connects += 1;
            reactor
                .submit(Operation::Read {
                    stream,
                    buf: vec![0u8; 4],
                })
                .unwrap();
            self.maybe_release(reactor);
        }

        fn on_read(
            &mut self,
            reactor: &Reactor,
            _stream: UnixStream,
            buf: Vec<u8>,
            result: io::Result<usize>,
        ) {
            let n = result.unwrap();
            self.reads.push(buf[..n].to_vec());
            self.maybe_release(reactor);
        }

        fn on_write(&mut self, reactor: &Reactor, _stream: UnixStream, result: io::Result<usize>) {
            self.writes.push(result.unwrap());
            self.maybe_release(reactor);
        }

        fn on_notify(&mut self, reactor: &Reactor, _source: UnixStream) {
            self.notifies += 1;
            self.maybe_release(reactor);
        }

        fn on_posted(&mut self, reactor: &Reactor, key: usize, value: u64) {
            self.posted.push((key, value));
            self.maybe_release(reactor);
        }
    }

    #[test]
    fn test_run_times_out() {
        let reactor = Reactor::new(1).unwrap();
        let mut handler = Recorder::default();

        let start = Instant::now();
        let status = reactor
            .run(Some(Duration::from_millis(50)), &mut handler)
            .unwrap();

        assert_eq!(status, RunStatus::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(handler.seen(), 0);
    }

    #[test]
    fn test_release_before_run_returns_immediately() {
        let reactor = Reactor::new(1).unwrap();
        reactor.release_waiter().unwrap();

        let mut handler = Recorder::default();
        let status = reactor
            .run(Some(Duration::from_secs(5)), &mut handler)
            .unwrap();
        assert_eq!(status, RunStatus::Released);
    }

    #[test]
    fn test_release_from_other_thread() {
        let reactor = Arc::new(Reactor::new(2).unwrap());
        let waiter = {
            let reactor = Arc::clone(&reactor);
            std::thread::spawn(move || {
                let mut handler = Recorder::default();
                reactor.run(None, &mut handler).unwrap()
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        reactor.release_waiter().unwrap();
        assert_eq!(waiter.join().unwrap(), RunStatus::Released);
    }

    #[test]
    fn test_release_wakes_one_waiter() {
        let reactor = Arc::new(Reactor::new(2).unwrap());
        let spawn_waiter = |reactor: Arc<Reactor>| {
            std::thread::spawn(move || {
                let mut handler = Recorder::default();
                reactor
                    .run(Some(Duration::from_millis(400)), &mut handler)
                    .unwrap()
            })
        };
        let a = spawn_waiter(Arc::clone(&reactor));
        let b = spawn_waiter(Arc::clone(&reactor));

        std::thread::sleep(Duration::from_millis(50));
        reactor.release_waiter().unwrap();

        let mut statuses = vec![a.join().unwrap(), b.join().unwrap()];
        statuses.sort_by_key(|s| *s == RunStatus::TimedOut);
        assert_eq!(statuses, vec![RunStatus::Released, RunStatus::TimedOut]);
    }

    #[test]
    fn test_concurrency_bound() {
        let reactor = Arc::new(Reactor::new(1).unwrap());
        let waiter = {
            let reactor = Arc::clone(&reactor);
            std::thread::spawn(move || {
                let mut handler = Recorder::default();
                reactor.run(None, &mut handler).unwrap()
            })
        };
        std::thread::sleep(Duration::from_millis(50));

        let mut handler = Recorder::default();
        let err = reactor
            .run(Some(Duration::from_millis(10)), &mut handler)
            .unwrap_err();
        assert!(matches!(err, ReactorError::Busy(1)));

        reactor.release_waiter().unwrap();
        assert_eq!(waiter.join().unwrap(), RunStatus::Released);
    }

    #[test]
    fn test_accept_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reactor.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let reactor = Reactor::new(1).unwrap();
        reactor.submit(Operation::Accept(listener)).unwrap();

        let client = std::thread::spawn(move || {
            let mut stream = UnixStream::connect(&path).unwrap();
            stream.write_all(b"ping").unwrap();
        });

        let mut handler = Recorder {
            stop_after: 2,
            ..Default::default()
        };
        let status = reactor
            .run(Some(Duration::from_secs(5)), &mut handler)
            .unwrap();
        client.join().unwrap();

        assert_eq!(status, RunStatus::Released);
        assert_eq!(handler.connects, 1);
        assert_eq!(handler.reads, vec![b"ping".to_vec()]);
        assert_eq!(reactor.pending_count(), 0);
    }

    #[test]
    fn test_short_read_reports_partial_length() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        theirs.write_all(b"ab").unwrap();
        drop(theirs);

        let reactor = Reactor::new(1).unwrap();
        reactor
            .submit(Operation::Read {
                stream: ours,
                buf: vec![0u8; 8],
            })
            .unwrap();

        let mut handler = Recorder {
            stop_after: 1,
            ..Default::default()
        };
        reactor
            .run(Some(Duration::from_secs(5)), &mut handler)
            .unwrap();
        assert_eq!(handler.reads, vec![b"ab".to_vec()]);
    }

    #[test]
    fn test_write_completes_with_length() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let reactor = Reactor::new(1).unwrap();
        reactor
            .submit(Operation::Write {
                stream: ours,
                buf: b"hello".to_vec(),
            })
            .unwrap();

        let mut handler = Recorder {
            stop_after: 1,
            ..Default::default()
        };
        reactor
            .run(Some(Duration::from_secs(5)), &mut handler)
            .unwrap();
        assert_eq!(handler.writes, vec![5]);

        let mut buf = [0u8; 5];
        theirs.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_notify_and_posted() {
        let (source, mut trigger) = UnixStream::pair().unwrap();
        let reactor = Reactor::new(1).unwrap();
        reactor.submit(Operation::Notify(source)).unwrap();
        reactor.post(7, 1234).unwrap();
        trigger.write_all(&[0]).unwrap();

        let mut handler = Recorder {
            stop_after: 2,
            ..Default::default()
        };
        reactor
            .run(Some(Duration::from_secs(5)), &mut handler)
            .unwrap();
        assert_eq!(handler.posted, vec![(7, 1234)]);
        assert_eq!(handler.notifies, 1);
    }

    #[test]
    fn test_cancel_all_closes_endpoints() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let reactor = Reactor::new(1).unwrap();
        reactor
            .submit(Operation::Read {
                stream: ours,
                buf: vec![0u8; 8],
            })
            .unwrap();

        assert_eq!(reactor.cancel_all(), 1);
        assert_eq!(reactor.pending_count(), 0);

        // Our end was dropped with the operation, so the peer sees EOF
        let mut buf = [0u8; 1];
        assert_eq!(theirs.read(&mut buf).unwrap(), 0);
    }
}
