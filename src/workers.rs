use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use mio::Poll;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::AppConfig;
use crate::error::Result;
use crate::prelude::{errors, info};
use crate::server::Server;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

const SHM_NAME: &[u8] = b"/origin_server_connections\0";
const LISTEN_BACKLOG: i32 = 1024;

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

extern "C" fn handle_stop_signal(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// SIGTERM/SIGINT flip the shutdown flag; SIGPIPE is ignored so a peer
/// reset surfaces as a write error instead of killing the process.
/// Handlers are installed without SA_RESTART so the blocking waits
/// (`waitpid`, the poll) return with EINTR and observe the flag.
pub fn install_signal_handlers() -> Result<()> {
    let handler = handle_stop_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        if libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut()) != 0 {
            return Err("failed to install SIGTERM handler".into());
        }
        if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) != 0 {
            return Err("failed to install SIGINT handler".into());
        }
        let mut ignore: libc::sigaction = std::mem::zeroed();
        ignore.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut ignore.sa_mask);
        if libc::sigaction(libc::SIGPIPE, &ignore, std::ptr::null_mut()) != 0 {
            return Err("failed to ignore SIGPIPE".into());
        }
    }
    Ok(())
}

/// Bind a listening socket the way every worker expects it: reusable
/// address (and port, so the kernel spreads accepts between workers),
/// non-blocking, listening.
pub fn bind_listener(port: u16) -> Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    let _ = socket.set_reuse_port(true);
    socket.set_nonblocking(true)?;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket
        .bind(&addr.into())
        .map_err(|e| format!("failed to bind port {}: {}", port, e))?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Create (or open) the shared-memory connection counter the workers bump
/// on every accept and the status CLI reads. Shared across fork.
pub fn create_shared_counter() -> Option<&'static AtomicU32> {
    unsafe {
        let fd = libc::shm_open(
            SHM_NAME.as_ptr() as *const libc::c_char,
            libc::O_CREAT | libc::O_RDWR,
            0o666,
        );
        if fd < 0 {
            return None;
        }
        if libc::ftruncate(fd, std::mem::size_of::<AtomicU32>() as libc::off_t) != 0 {
            libc::close(fd);
            return None;
        }
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            std::mem::size_of::<AtomicU32>(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        libc::close(fd);
        if ptr == libc::MAP_FAILED {
            return None;
        }
        Some(&*(ptr as *const AtomicU32))
    }
}

/// Read-only view of the counter for the status CLI; `None` when no server
/// has ever run.
pub fn read_shared_counter() -> Option<u32> {
    unsafe {
        let fd = libc::shm_open(SHM_NAME.as_ptr() as *const libc::c_char, libc::O_RDONLY, 0);
        if fd < 0 {
            return None;
        }
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            std::mem::size_of::<AtomicU32>(),
            libc::PROT_READ,
            libc::MAP_SHARED,
            fd,
            0,
        );
        libc::close(fd);
        if ptr == libc::MAP_FAILED {
            return None;
        }
        let value = (*(ptr as *const AtomicU32)).load(Ordering::Relaxed);
        libc::munmap(ptr, std::mem::size_of::<AtomicU32>());
        Some(value)
    }
}

/// Bind the listeners, fork the worker pool, and supervise it until
/// shutdown. With a single worker the event loop runs in this process.
pub fn start(config: AppConfig) -> Result<()> {
    install_signal_handlers()?;
    let mut std_listeners = Vec::new();
    for port in config.listen_ports() {
        std_listeners.push((port, bind_listener(port)?));
    }
    let counter = create_shared_counter();
    let workers = config.worker_processes.max(1);

    if workers == 1 {
        return run_worker(config, std_listeners, counter);
    }

    let mut children: Vec<libc::pid_t> = Vec::new();
    for _ in 0..workers {
        match unsafe { libc::fork() } {
            0 => return run_worker(config, std_listeners, counter),
            pid if pid > 0 => children.push(pid),
            _ => return Err("fork failed".into()),
        }
    }
    info!("master {} forked {} workers", std::process::id(), workers);
    supervise(children);
    Ok(())
}

fn run_worker(
    config: AppConfig,
    std_listeners: Vec<(u16, std::net::TcpListener)>,
    counter: Option<&'static AtomicU32>,
) -> Result<()> {
    let poll = Poll::new()?;
    let mut server = Server::from_std_listeners(config, &poll, std_listeners)?;
    server.set_counter(counter);
    server.run(poll)
}

/// Reap workers until they are all gone, forwarding the stop signal once
/// shutdown is requested.
fn supervise(children: Vec<libc::pid_t>) {
    let mut forwarded = false;
    let mut remaining = children.len();
    while remaining > 0 {
        if shutdown_requested() && !forwarded {
            for pid in &children {
                unsafe {
                    libc::kill(*pid, libc::SIGTERM);
                }
            }
            forwarded = true;
        }
        let mut status: libc::c_int = 0;
        let reaped = unsafe { libc::waitpid(-1, &mut status, 0) };
        if reaped > 0 {
            remaining -= 1;
        } else {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ECHILD) => break,
                _ => {
                    errors!("waitpid failed: {}", err);
                    break;
                }
            }
        }
    }
}
