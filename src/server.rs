//! Listener and isolation supervisor.
//!
//! The supervisor binds the listening socket, polls it with a short timeout
//! so signals stay responsive, enforces the local-only policy, allocates a
//! unique connection index per accept and hands each connection to a worker
//! under one of three isolation strategies. Fork-per-connection is the
//! default: the embedded interpreter keeps process-wide mutable state and is
//! not reentrant, so every client gets a private address space instead of a
//! lock.
#![deny(missing_docs)]
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::{debug, info, warn};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use fork::{fork, Fork};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, getppid};

use crate::engine::{Engine, SharedEngine};
use crate::proto::{DEFAULT_PORT, MAX_REQUEST};
use crate::session::{Outcome, Session};
use crate::transport::Transport;

// cleared by SIGHUP/SIGTERM and by a shutdown command
static ACTIVE: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_: nix::libc::c_int) {
    ACTIVE.store(false, Ordering::SeqCst);
}

/// How an accepted connection is served.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// One process per connection: the worker inherits a private copy of
    /// the evaluator's global state. The default.
    Fork,
    /// One thread per connection sharing the evaluator behind a lock. A
    /// long evaluation stalls every other client; retained for debugging.
    Thread,
    /// Serve on the supervisor thread; no concurrency at all.
    Inline,
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port to listen on.
    pub port: u16,
    /// Root under which per-connection directories are created.
    pub workdir: PathBuf,
    /// Drop connections whose source address is not loopback.
    pub local_only: bool,
    /// Largest accepted request body; bigger ones are drained and refused.
    pub max_request: usize,
    /// Worker strategy.
    pub isolation: Isolation,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            workdir: PathBuf::from("/tmp/Rserv"),
            local_only: true,
            max_request: MAX_REQUEST,
            isolation: Isolation::Fork,
        }
    }
}

/// The server: an engine plus the supervisor configuration.
pub struct Server<E> {
    engine: E,
    config: Config,
}

impl<E: Engine + Send + 'static> Server<E> {
    /// Pair an engine with a configuration.
    pub fn new(engine: E, config: Config) -> Self {
        Self { engine, config }
    }

    /// Bind, listen and serve until a signal or a shutdown command clears
    /// the active flag.
    pub fn start(self) -> Result<()> {
        install_signal_handlers()?;
        let listener = bind_listener(self.config.port)
            .wrap_err_with(|| format!("binding port {}", self.config.port))?;
        info!(
            target: "rsrv",
            "listening on port {} ({:?} isolation)",
            self.config.port,
            self.config.isolation
        );
        match self.config.isolation {
            Isolation::Thread => {
                serve_threaded(SharedEngine::new(self.engine), listener, self.config)
            }
            Isolation::Fork | Isolation::Inline => {
                serve_local(self.engine, listener, self.config)
            }
        }
    }
}

// fork and inline workers both borrow the supervisor's engine; the fork
// child gets its own copy-on-write image of it
fn serve_local<E: Engine>(mut engine: E, listener: TcpListener, config: Config) -> Result<()> {
    let mut ucix: u32 = 0;
    while ACTIVE.load(Ordering::SeqCst) {
        if config.isolation == Isolation::Fork {
            reap_workers();
        }
        let stream = match poll_accept(&listener, config.local_only)? {
            Some(stream) => stream,
            None => continue,
        };
        ucix += 1;
        match config.isolation {
            Isolation::Fork => match fork() {
                Ok(Fork::Child) => {
                    // the child must not inherit the accept responsibility
                    let _ = close(listener.as_raw_fd());
                    let outcome = run_worker(stream, &mut engine, ucix, &config);
                    if outcome == Outcome::Shutdown {
                        let _ = kill(getppid(), Signal::SIGTERM);
                    }
                    process::exit(0);
                }
                Ok(Fork::Parent(pid)) => {
                    debug!(target: "rsrv", "connection {ucix} handed to worker {pid}");
                    drop(stream);
                }
                Err(errno) => {
                    warn!(target: "rsrv", "fork failed ({errno}), dropping connection {ucix}");
                    drop(stream);
                }
            },
            Isolation::Inline => {
                if run_worker(stream, &mut engine, ucix, &config) == Outcome::Shutdown {
                    ACTIVE.store(false, Ordering::SeqCst);
                }
            }
            Isolation::Thread => unreachable!("thread isolation uses serve_threaded"),
        }
    }
    info!(target: "rsrv", "server shutting down");
    reap_workers();
    Ok(())
}

fn serve_threaded<E: Engine + Send + 'static>(
    engine: SharedEngine<E>,
    listener: TcpListener,
    config: Config,
) -> Result<()> {
    let mut ucix: u32 = 0;
    while ACTIVE.load(Ordering::SeqCst) {
        let stream = match poll_accept(&listener, config.local_only)? {
            Some(stream) => stream,
            None => continue,
        };
        ucix += 1;
        let engine = engine.clone();
        let config = config.clone();
        thread::spawn(move || {
            if run_worker(stream, engine, ucix, &config) == Outcome::Shutdown {
                ACTIVE.store(false, Ordering::SeqCst);
            }
        });
    }
    info!(target: "rsrv", "server shutting down");
    Ok(())
}

fn run_worker<IO: Transport, E: Engine>(
    stream: IO,
    engine: E,
    ucix: u32,
    config: &Config,
) -> Outcome {
    let session = Session::new(stream, engine, ucix, &config.workdir, config.max_request);
    match session.run() {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(target: "rsrv", "error handling connection {ucix}: {err:#}");
            Outcome::Disconnect
        }
    }
}

// ~10ms timeout keeps the loop responsive to signals and child exits
fn poll_accept(listener: &TcpListener, local_only: bool) -> Result<Option<TcpStream>> {
    let mut fds = [PollFd::new(listener.as_raw_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, 10) {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(nix::errno::Errno::EINTR) => return Ok(None),
        Err(errno) => return Err(errno.into()),
    }
    let (stream, peer) = listener.accept()?;
    if local_only && !peer.ip().is_loopback() {
        info!(target: "rsrv", "rejecting non-local connection from {peer}");
        return Ok(None);
    }
    stream.set_nodelay(true)?;
    info!(target: "rsrv", "client connected from {peer}");
    Ok(Some(stream))
}

fn bind_listener(port: u16) -> Result<TcpListener> {
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )?;
    socket::setsockopt(fd, sockopt::ReuseAddr, &true)?;
    socket::bind(fd, &SockaddrIn::new(0, 0, 0, 0, port))?;
    socket::listen(fd, 16)?;
    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &action)?;
        sigaction(Signal::SIGHUP, &action)?;
    }
    Ok(())
}

// non-blocking reap of fork workers
fn reap_workers() {
    while let Ok(status) = waitpid(None, Some(WaitPidFlag::WNOHANG)) {
        match status {
            WaitStatus::StillAlive => break,
            status => debug!(target: "rsrv", "reaped worker: {status:?}"),
        }
    }
}
