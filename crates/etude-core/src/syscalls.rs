// src/syscalls.rs
use crate::error::{EtudeError, EtudeResult};
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::Path;
use std::ptr;

// ---- Socket Operations ----

/// Create the shared, non-blocking TCP listener every worker accepts from.
///
/// - **Both**: SO_REUSEADDR, TCP_NODELAY (inherited by accepted sockets)
/// - **Linux**: SOCK_NONBLOCK | SOCK_CLOEXEC (atomic)
/// - **macOS**: O_NONBLOCK via fcntl, SO_NOSIGPIPE
pub fn create_listen_socket(addr: &SocketAddr) -> EtudeResult<c_int> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    #[cfg(target_os = "linux")]
    let fd = unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        fd
    };

    #[cfg(target_os = "macos")]
    let fd = unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if let Err(err) = set_nonblocking(fd) {
            libc::close(fd);
            return Err(err.into());
        }
        set_flag(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE);
        fd
    };

    unsafe {
        if !set_flag(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR) {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
        set_flag(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY);

        bind_addr(fd, addr)?;

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
    }

    Ok(fd)
}

/// Set an integer socket option to 1. Returns false on failure.
unsafe fn set_flag(fd: c_int, level: c_int, name: c_int) -> bool {
    let one: c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) == 0
    }
}

/// Bind a socket to an address, closing it on failure.
fn bind_addr(fd: c_int, addr: &SocketAddr) -> EtudeResult<()> {
    unsafe {
        let rc = match addr {
            SocketAddr::V4(a) => {
                let mut sin: libc::sockaddr_in = mem::zeroed();
                #[cfg(target_os = "macos")]
                {
                    sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
                }
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = a.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let mut sin6: libc::sockaddr_in6 = mem::zeroed();
                #[cfg(target_os = "macos")]
                {
                    sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
                }
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = a.port().to_be();
                sin6.sin6_flowinfo = a.flowinfo();
                sin6.sin6_addr = libc::in6_addr {
                    s6_addr: a.ip().octets(),
                };
                sin6.sin6_scope_id = a.scope_id();
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
    }
    Ok(())
}

/// Accept a non-blocking connection.
///
/// `Ok(None)` means another worker won the race for this connection.
pub fn accept_connection(listen_fd: c_int) -> io::Result<Option<c_int>> {
    #[cfg(target_os = "linux")]
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            Ok(Some(fd))
        }
    }

    #[cfg(target_os = "macos")]
    unsafe {
        let fd = libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut());

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            // macOS lacks accept4
            if let Err(err) = set_nonblocking(fd) {
                libc::close(fd);
                return Err(err);
            }
            set_flag(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE);
            Ok(Some(fd))
        }
    }
}

pub fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Remote address of a connected TCP socket.
pub fn peer_addr(fd: c_int) -> io::Result<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin = &*(&storage as *const _ as *const libc::sockaddr_in);
                Ok(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                    u16::from_be(sin.sin_port),
                )))
            }
            libc::AF_INET6 => {
                let sin6 = &*(&storage as *const _ as *const libc::sockaddr_in6);
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported address family",
            )),
        }
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

/// Read into `buf`. `Ok(None)` = would block, `Ok(Some(0))` = EOF.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> io::Result<Option<usize>> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                io::ErrorKind::Interrupted => Ok(None),
                _ => Err(err),
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Write from `buf`. `Ok(None)` = the socket buffer is full.
pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> io::Result<Option<usize>> {
    #[cfg(target_os = "linux")]
    let res = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };

    #[cfg(target_os = "macos")]
    let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };

    if res < 0 {
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => Ok(None),
            io::ErrorKind::Interrupted => Ok(None),
            _ => Err(err),
        }
    } else {
        Ok(Some(res as usize))
    }
}

// ---- Readiness Multiplexer ----

/// Portable readiness bits, translated to epoll or kqueue flags per platform.
pub const READABLE: u32 = 0b0001;
pub const WRITABLE: u32 = 0b0010;
pub const PRIORITY: u32 = 0b0100;
pub const HANGUP: u32 = 0b1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub fd: c_int,
    pub mask: u32,
}

#[cfg(target_os = "linux")]
pub use linux_epoll::*;

#[cfg(target_os = "linux")]
mod linux_epoll {
    use super::*;
    use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP, epoll_event};

    const MAX_EVENTS: usize = 1024;

    /// Level-triggered epoll instance. The event token is the fd itself.
    pub struct Epoll {
        pub fd: c_int,
        events: Vec<epoll_event>,
    }

    fn to_epoll(mask: u32) -> u32 {
        let mut ev = 0;
        if mask & READABLE != 0 {
            ev |= EPOLLIN | EPOLLRDHUP;
        }
        if mask & WRITABLE != 0 {
            ev |= EPOLLOUT;
        }
        if mask & PRIORITY != 0 {
            ev |= EPOLLPRI;
        }
        ev as u32
    }

    fn from_epoll(events: u32) -> u32 {
        let events = events as c_int;
        let mut mask = 0;
        if events & (EPOLLIN | EPOLLRDHUP) != 0 {
            mask |= READABLE;
        }
        if events & EPOLLOUT != 0 {
            mask |= WRITABLE;
        }
        if events & EPOLLPRI != 0 {
            mask |= PRIORITY;
        }
        if events & (EPOLLERR | EPOLLHUP) != 0 {
            mask |= HANGUP;
        }
        mask
    }

    impl Epoll {
        pub fn new() -> EtudeResult<Self> {
            unsafe {
                let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self {
                    fd,
                    events: vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
                })
            }
        }

        /// Move `fd` from interest `old` to interest `new` (both portable masks).
        pub fn update(&self, fd: c_int, old: u32, new: u32) -> EtudeResult<()> {
            let op = match (old, new) {
                (0, 0) => return Ok(()),
                (0, _) => libc::EPOLL_CTL_ADD,
                (_, 0) => libc::EPOLL_CTL_DEL,
                _ => libc::EPOLL_CTL_MOD,
            };
            let mut event = epoll_event {
                events: to_epoll(new),
                u64: fd as u64,
            };

            unsafe {
                if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                    let err = io::Error::last_os_error();
                    let gone = matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF));
                    if !(op == libc::EPOLL_CTL_DEL && gone) {
                        return Err(err.into());
                    }
                }
            }
            Ok(())
        }

        /// Block up to `timeout_ms` (-1 = forever). EINTR yields zero events.
        pub fn wait(&mut self, out: &mut Vec<Readiness>, timeout_ms: i32) -> EtudeResult<usize> {
            out.clear();
            let res = unsafe {
                libc::epoll_wait(
                    self.fd,
                    self.events.as_mut_ptr(),
                    self.events.len() as c_int,
                    timeout_ms,
                )
            };

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            for ev in &self.events[..res as usize] {
                out.push(Readiness {
                    fd: ev.u64 as c_int,
                    mask: from_epoll(ev.events),
                });
            }
            Ok(out.len())
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

// ---- Kqueue Fallback for MacOS development ----
#[cfg(target_os = "macos")]
pub use macos_kqueue::*;

#[cfg(target_os = "macos")]
mod macos_kqueue {
    use super::*;
    use libc::{EV_ADD, EV_DELETE, EV_ENABLE, EV_EOF, EVFILT_READ, EVFILT_WRITE, kevent, timespec};

    const MAX_BATCH: usize = 256;

    /// Level-triggered kqueue with the same surface as the Linux epoll wrapper.
    pub struct Epoll {
        pub fd: c_int,
        events: Vec<kevent>,
    }

    fn change(fd: c_int, filter: i16, flags: u16) -> kevent {
        kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        }
    }

    impl Epoll {
        pub fn new() -> EtudeResult<Self> {
            unsafe {
                let fd = libc::kqueue();
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self {
                    fd,
                    events: vec![mem::zeroed::<kevent>(); MAX_BATCH],
                })
            }
        }

        pub fn update(&self, fd: c_int, old: u32, new: u32) -> EtudeResult<()> {
            let mut changes = Vec::with_capacity(2);
            // kqueue has no priority filter; PRIORITY rides on EVFILT_READ.
            let old_read = old & (READABLE | PRIORITY) != 0;
            let new_read = new & (READABLE | PRIORITY) != 0;
            for (filter, was, is) in [
                (EVFILT_READ, old_read, new_read),
                (EVFILT_WRITE, old & WRITABLE != 0, new & WRITABLE != 0),
            ] {
                match (was, is) {
                    (false, true) => changes.push(change(fd, filter, EV_ADD | EV_ENABLE)),
                    (true, false) => changes.push(change(fd, filter, EV_DELETE)),
                    _ => {}
                }
            }
            if changes.is_empty() {
                return Ok(());
            }

            let res = unsafe {
                libc::kevent(
                    self.fd,
                    changes.as_ptr(),
                    changes.len() as c_int,
                    ptr::null_mut(),
                    0,
                    ptr::null(),
                )
            };
            if res < 0 && new != 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(())
        }

        pub fn wait(&mut self, out: &mut Vec<Readiness>, timeout_ms: i32) -> EtudeResult<usize> {
            out.clear();
            let ts = (timeout_ms >= 0).then(|| timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            });
            let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const timespec);

            let res = unsafe {
                libc::kevent(
                    self.fd,
                    ptr::null(),
                    0,
                    self.events.as_mut_ptr(),
                    self.events.len() as c_int,
                    ts_ptr,
                )
            };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            for ev in &self.events[..res as usize] {
                let mut mask = match ev.filter {
                    EVFILT_READ => READABLE | PRIORITY,
                    EVFILT_WRITE => WRITABLE,
                    _ => 0,
                };
                if ev.flags & EV_EOF != 0 {
                    mask |= HANGUP;
                }
                out.push(Readiness {
                    fd: ev.ident as c_int,
                    mask,
                });
            }
            Ok(out.len())
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

// ---- Process and Signal Operations ----

/// Outcome of [`fork`], seen from each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent(libc::pid_t),
    Child,
}

pub fn fork() -> io::Result<Fork> {
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent(pid)),
    }
}

pub fn getpid() -> libc::pid_t {
    unsafe { libc::getpid() }
}

pub fn kill(pid: libc::pid_t, signal: c_int) -> io::Result<()> {
    if unsafe { libc::kill(pid, signal) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// True when a process with `pid` exists (possibly owned by another user).
pub fn process_alive(pid: libc::pid_t) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(pid, 0) {
        Ok(()) => true,
        Err(err) => err.raw_os_error() == Some(libc::EPERM),
    }
}

/// Reap one exited child without blocking.
pub fn try_reap() -> io::Result<Option<(libc::pid_t, c_int)>> {
    let mut status: c_int = 0;
    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    match pid {
        0 => Ok(None),
        -1 => {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ECHILD) {
                Ok(None)
            } else {
                Err(err)
            }
        }
        pid => Ok(Some((pid, status))),
    }
}

/// Block until `pid` exits.
pub fn reap(pid: libc::pid_t) -> io::Result<c_int> {
    let mut status: c_int = 0;
    loop {
        if unsafe { libc::waitpid(pid, &mut status, 0) } >= 0 {
            return Ok(status);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// A set of signals handled synchronously with `sigwait`.
pub struct SignalSet {
    set: libc::sigset_t,
}

impl SignalSet {
    pub fn new(signals: &[c_int]) -> Self {
        unsafe {
            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            for &sig in signals {
                libc::sigaddset(&mut set, sig);
            }
            Self { set }
        }
    }

    /// Hold the signals pending so only [`SignalSet::wait`] observes them.
    pub fn block(&self) -> io::Result<()> {
        self.mask(libc::SIG_BLOCK)
    }

    pub fn unblock(&self) -> io::Result<()> {
        self.mask(libc::SIG_UNBLOCK)
    }

    fn mask(&self, how: c_int) -> io::Result<()> {
        let rc = unsafe { libc::pthread_sigmask(how, &self.set, ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }

    /// Suspend until one of the (blocked) signals is pending and take it.
    pub fn wait(&self) -> io::Result<c_int> {
        let mut sig: c_int = 0;
        let rc = unsafe { libc::sigwait(&self.set, &mut sig) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(sig)
    }
}

pub fn ignore_signal(signal: c_int) {
    unsafe {
        libc::signal(signal, libc::SIG_IGN);
    }
}

/// Ask the kernel to SIGKILL this process when its parent exits.
#[cfg(target_os = "linux")]
pub fn kill_on_parent_death() {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn kill_on_parent_death() {}

/// Detach from the controlling terminal.
///
/// Fork, `setsid`, `umask(0)`, fork again; the surviving grandchild gets
/// stdin on `/dev/null` and stdout/stderr appended to `stdout` (or
/// `/dev/null`). Both intermediate processes exit with status 0.
pub fn daemonize(stdout: Option<&Path>) -> EtudeResult<()> {
    if let Fork::Parent(_) = fork()? {
        std::process::exit(0);
    }
    unsafe {
        if libc::setsid() < 0 {
            return Err(io::Error::last_os_error().into());
        }
        libc::umask(0);
    }
    if let Fork::Parent(_) = fork()? {
        unsafe { libc::_exit(0) };
    }

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    let out = match stdout {
        Some(path) => std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                EtudeError::Config(format!("cannot open {}: {e}", path.display()))
            })?,
        None => devnull.try_clone()?,
    };

    use std::os::fd::AsRawFd;
    unsafe {
        if libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO) < 0
            || libc::dup2(out.as_raw_fd(), libc::STDOUT_FILENO) < 0
            || libc::dup2(out.as_raw_fd(), libc::STDERR_FILENO) < 0
        {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}
