//! Multi-process supervisor.
//!
//! The supervisor owns the listening socket and the shared counter store,
//! forks one [`Worker`] per configured slot and then sleeps in `sigwait`:
//!
//! * `SIGCHLD` reaps exited workers and respawns them,
//! * `SIGINT` / `SIGHUP` stop everything and remove the store,
//! * `SIGUSR1` restarts: workers and listener are recreated, the store kept.
//!
//! `stop`, `restart` and `status` let another process drive a running
//! supervisor through the pid recorded in the store.

use crate::codec::Inbound;
use crate::config::{ListenAddr, ServerConfig};
use crate::conn::ConnectionHandle;
use crate::error::{EtudeError, EtudeResult};
use crate::shm::SharedCounters;
use crate::site::StaticSite;
use crate::status::{
    self, CURRENT_CONNECTIONS, FAILED_CONNECTIONS, PID, START_AT, StatusSnapshot,
    TOTAL_CONNECTIONS, WORKERS,
};
use crate::syscalls::{self, Fork, SignalSet};
use crate::worker::{Handlers, Worker};
use libc::{c_int, pid_t};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const CONTROL_SIGNALS: [c_int; 3] = [libc::SIGINT, libc::SIGHUP, libc::SIGUSR1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
}

pub struct Server {
    config: ServerConfig,
    listen: ListenAddr,
    handlers: Handlers,
    site: Option<StaticSite>,
    listener: Option<c_int>,
    workers: HashMap<pid_t, usize>,
    core_ids: Vec<core_affinity::CoreId>,
}

impl Server {
    /// Server for `<proto>://<ip>:<port>` with default settings.
    pub fn bind(listen: &str) -> EtudeResult<Self> {
        Self::from_config(ServerConfig {
            listen: listen.to_string(),
            ..ServerConfig::default()
        })
    }

    pub fn from_config(config: ServerConfig) -> EtudeResult<Self> {
        config.validate()?;
        let listen = config.listen_addr()?;
        let site = config.static_site();
        Ok(Self {
            config,
            listen,
            handlers: Handlers::default(),
            site,
            listener: None,
            workers: HashMap::new(),
            core_ids: Vec::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers.max(1);
        self
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.config.daemon = daemon;
        self
    }

    pub fn respawn(mut self, respawn: bool) -> Self {
        self.config.respawn = respawn;
        self
    }

    pub fn stdout_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.stdout_path = Some(path.into());
        self
    }

    pub fn shm_key(mut self, key: impl Into<String>) -> Self {
        self.config.shm_key = Some(key.into());
        self
    }

    pub fn site(mut self, site: StaticSite) -> Self {
        self.site = Some(site);
        self
    }

    pub fn on_connection(mut self, f: impl FnMut(&mut ConnectionHandle<'_>) + 'static) -> Self {
        self.handlers = std::mem::take(&mut self.handlers).on_connection(f);
        self
    }

    pub fn on_message(
        mut self,
        f: impl FnMut(&mut ConnectionHandle<'_>, Inbound) + 'static,
    ) -> Self {
        self.handlers = std::mem::take(&mut self.handlers).on_message(f);
        self
    }

    pub fn on_close(mut self, f: impl FnMut(&mut ConnectionHandle<'_>) + 'static) -> Self {
        self.handlers = std::mem::take(&mut self.handlers).on_close(f);
        self
    }

    pub fn on_error(
        mut self,
        f: impl FnMut(Option<&mut ConnectionHandle<'_>>, &EtudeError) + 'static,
    ) -> Self {
        self.handlers = std::mem::take(&mut self.handlers).on_error(f);
        self
    }

    /// Start and supervise until stopped. Returns in the supervisor only;
    /// workers never return from here.
    pub fn run(mut self) -> EtudeResult<()> {
        let key = self.config.shm_key();
        ensure_not_running(&key)?;

        if self.config.daemon {
            syscalls::daemonize(self.config.stdout_path.as_deref())?;
        }
        if self.config.pin_workers {
            self.core_ids = core_affinity::get_core_ids().unwrap_or_default();
        }

        let counters = Arc::new(SharedCounters::create(&key)?);
        let signals = SignalSet::new(&[
            libc::SIGINT,
            libc::SIGHUP,
            libc::SIGUSR1,
            libc::SIGCHLD,
        ]);
        let outcome = self.drive(&counters, &signals);
        if let Err(err) = &outcome {
            error!(listen = %self.listen, %err, "supervisor failed");
        }

        info!(listen = %self.listen, "stopping");
        self.teardown(&counters);
        if let Err(err) = signals.unblock() {
            warn!(%err, "failed to restore signal mask");
        }
        for name in status::ALL {
            if let Err(err) = counters.set(name, 0i64) {
                warn!(counter = name, %err, "failed to reset counter");
            }
        }
        let removed = match Arc::try_unwrap(counters) {
            Ok(counters) => counters.remove().map_err(EtudeError::from),
            Err(_) => {
                warn!("counter store still referenced, not removed");
                Ok(())
            }
        };
        debug!(state = ?State::Stopped, "supervisor state");
        outcome.and(removed)
    }

    /// Walk the state machine until a stop is requested or a step fails.
    /// Cleanup is left to the caller either way.
    fn drive(&mut self, counters: &Arc<SharedCounters>, signals: &SignalSet) -> EtudeResult<()> {
        signals.block()?;

        let mut state = State::Starting;
        loop {
            debug!(?state, "supervisor state");
            state = match state {
                State::Starting => {
                    self.start(counters)?;
                    State::Running
                }
                State::Running => {
                    for index in 0..self.config.workers {
                        self.spawn(index, counters, signals)?;
                    }
                    self.supervise(counters, signals)?
                }
                State::Restarting => {
                    info!(listen = %self.listen, "restarting");
                    self.teardown(counters);
                    State::Starting
                }
                State::Stopping | State::Stopped => return Ok(()),
            };
        }
    }

    fn start(&mut self, counters: &SharedCounters) -> EtudeResult<()> {
        let listener = syscalls::create_listen_socket(&self.listen.addr)?;
        self.listener = Some(listener);

        counters.transaction(|tx| {
            tx.set(PID, i64::from(syscalls::getpid()))?;
            tx.set(START_AT, status::unix_now())?;
            for name in [
                WORKERS,
                CURRENT_CONNECTIONS,
                FAILED_CONNECTIONS,
                TOTAL_CONNECTIONS,
            ] {
                tx.set(name, 0i64)?;
            }
            Ok::<_, crate::error::StoreError>(())
        })??;

        info!(
            listen = %self.listen,
            workers = self.config.workers,
            pid = syscalls::getpid(),
            "server started"
        );
        Ok(())
    }

    fn spawn(
        &mut self,
        index: usize,
        counters: &Arc<SharedCounters>,
        signals: &SignalSet,
    ) -> EtudeResult<()> {
        let listener = self.listener.ok_or(EtudeError::NotRunning)?;
        match syscalls::fork()? {
            Fork::Child => self.run_worker(index, listener, counters, signals),
            Fork::Parent(pid) => {
                self.workers.insert(pid, index);
                if let Err(err) = counters.increment(WORKERS, 1) {
                    warn!(%err, "failed to count worker");
                }
                info!(pid, worker = index, "worker forked");
                Ok(())
            }
        }
    }

    fn run_worker(
        &mut self,
        index: usize,
        listener: c_int,
        counters: &Arc<SharedCounters>,
        signals: &SignalSet,
    ) -> ! {
        if let Err(err) = signals.unblock() {
            warn!(%err, "failed to restore signal mask");
        }
        for signal in CONTROL_SIGNALS {
            syscalls::ignore_signal(signal);
        }
        syscalls::kill_on_parent_death();

        if let Some(core) = (!self.core_ids.is_empty())
            .then(|| self.core_ids[index % self.core_ids.len()])
        {
            if !core_affinity::set_for_current(core) {
                warn!(worker = index, core = core.id, "failed to pin worker");
            }
        }

        let mut worker = Worker::new(
            index,
            listener,
            self.listen.protocol,
            Arc::clone(counters),
            std::mem::take(&mut self.handlers),
            self.config.worker_settings(),
        );
        if let Some(site) = self.site.take() {
            worker = worker.with_site(site);
        }

        let code = match worker.listen() {
            Ok(()) => 0,
            Err(err) => {
                error!(worker = index, %err, "worker failed");
                1
            }
        };
        unsafe { libc::_exit(code) }
    }

    fn supervise(&mut self, counters: &Arc<SharedCounters>, signals: &SignalSet) -> EtudeResult<State> {
        loop {
            match signals.wait()? {
                libc::SIGCHLD => self.reap_exited(counters, signals)?,
                libc::SIGINT | libc::SIGHUP => return Ok(State::Stopping),
                libc::SIGUSR1 => return Ok(State::Restarting),
                other => debug!(signal = other, "ignoring signal"),
            }
        }
    }

    fn reap_exited(&mut self, counters: &Arc<SharedCounters>, signals: &SignalSet) -> EtudeResult<()> {
        while let Some((pid, code)) = syscalls::try_reap()? {
            let Some(index) = self.workers.remove(&pid) else {
                continue;
            };
            if let Err(err) = counters.decrement(WORKERS, 1) {
                warn!(%err, "failed to uncount worker");
            }
            warn!(pid, worker = index, status = code, "worker exited");
            if self.config.respawn {
                self.spawn(index, counters, signals)?;
            }
        }
        Ok(())
    }

    /// Kill and reap every worker, then close the listener.
    fn teardown(&mut self, counters: &SharedCounters) {
        for &pid in self.workers.keys() {
            if let Err(err) = syscalls::kill(pid, libc::SIGKILL) {
                debug!(pid, %err, "kill failed");
            }
        }
        for (pid, index) in self.workers.drain() {
            match syscalls::reap(pid) {
                Ok(code) => debug!(pid, worker = index, status = code, "worker reaped"),
                Err(err) => warn!(pid, %err, "failed to reap worker"),
            }
        }
        if let Err(err) = counters.set(WORKERS, 0i64) {
            warn!(%err, "failed to reset worker count");
        }
        if let Some(fd) = self.listener.take() {
            syscalls::close_fd(fd);
        }
    }
}

/// Pid of the supervisor recorded under `key`, if it is alive.
pub fn running_pid(key: &str) -> EtudeResult<pid_t> {
    let counters = SharedCounters::attach(key).map_err(|_| EtudeError::NotRunning)?;
    let pid = counters.get(PID).and_then(|v| v.as_int()).unwrap_or(0) as pid_t;
    if pid > 0 && syscalls::process_alive(pid) {
        Ok(pid)
    } else {
        Err(EtudeError::NotRunning)
    }
}

fn ensure_not_running(key: &str) -> EtudeResult<()> {
    match running_pid(key) {
        Ok(pid) => Err(EtudeError::AlreadyRunning(pid)),
        Err(_) => Ok(()),
    }
}

/// Ask the supervisor to shut down (SIGINT). Returns its pid.
pub fn stop(key: &str) -> EtudeResult<pid_t> {
    let pid = running_pid(key)?;
    syscalls::kill(pid, libc::SIGINT)?;
    info!(pid, "stop requested");
    Ok(pid)
}

/// Ask the supervisor to restart its workers (SIGUSR1). Returns its pid.
pub fn restart(key: &str) -> EtudeResult<pid_t> {
    let pid = running_pid(key)?;
    syscalls::kill(pid, libc::SIGUSR1)?;
    info!(pid, "restart requested");
    Ok(pid)
}

pub fn status(key: &str) -> EtudeResult<StatusSnapshot> {
    running_pid(key)?;
    let counters = SharedCounters::attach(key)?;
    StatusSnapshot::read(&counters)
}

/// Poll until `pid` is gone. `false` on timeout.
pub fn wait_for_exit(pid: pid_t, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while syscalls::process_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    true
}
