//! Single-threaded readiness and timer scheduler.
//!
//! One `EventLoop` runs per worker process. It owns the poller, the I/O
//! registrations and the timer queue; callbacks receive the loop itself plus a
//! caller-supplied context (`C`), so a callback can add or delete
//! registrations, schedule timers or stop the loop while it runs.
//!
//! Each iteration:
//!
//! 1. waits until a handle is ready or the earliest timer is due,
//! 2. fires every due timer, soonest first,
//! 3. dispatches read, then write, then exception readiness, each phase in
//!    registration order.

use crate::error::EtudeResult;
use crate::syscalls::{self, Epoll, Readiness};
use libc::c_int;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interest {
    Read,
    Write,
    Exception,
}

impl Interest {
    fn mask(self) -> u32 {
        match self {
            Interest::Read => syscalls::READABLE,
            Interest::Write => syscalls::WRITABLE,
            Interest::Exception => syscalls::PRIORITY,
        }
    }

    /// Hang-up and error conditions wake both readers and writers so they
    /// observe the failure on their next syscall.
    fn is_ready(self, mask: u32) -> bool {
        mask & (self.mask() | syscalls::HANGUP) != 0
            && (self != Interest::Exception || mask & syscalls::PRIORITY != 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Repeating,
    Once,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

pub type IoCallback<C> = Box<dyn FnMut(&mut EventLoop<C>, &mut C, c_int)>;
pub type TimerCallback<C> = Box<dyn FnMut(&mut EventLoop<C>, &mut C, TimerId)>;

struct Registration<C> {
    fd: c_int,
    interest: Interest,
    // Taken out while the callback runs.
    callback: Option<IoCallback<C>>,
}

struct Timer<C> {
    interval: Duration,
    kind: TimerKind,
    callback: Option<TimerCallback<C>>,
}

pub struct EventLoop<C> {
    poller: Epoll,
    running: bool,
    ready: Vec<Readiness>,

    next_seq: u64,
    registrations: BTreeMap<u64, Registration<C>>,
    index: HashMap<(c_int, Interest), u64>,
    masks: HashMap<c_int, u32>,

    next_timer: u64,
    schedule: BinaryHeap<Reverse<(Instant, TimerId)>>,
    timers: HashMap<TimerId, Timer<C>>,
}

impl<C> EventLoop<C> {
    pub fn new() -> EtudeResult<Self> {
        Ok(Self {
            poller: Epoll::new()?,
            running: false,
            ready: Vec::with_capacity(1024),
            next_seq: 0,
            registrations: BTreeMap::new(),
            index: HashMap::new(),
            masks: HashMap::new(),
            next_timer: 0,
            schedule: BinaryHeap::new(),
            timers: HashMap::new(),
        })
    }

    /// Register `callback` for `interest` on `fd`.
    ///
    /// Registering an existing `(fd, interest)` pair replaces its callback and
    /// keeps its place in the dispatch order.
    pub fn add<F>(&mut self, fd: c_int, interest: Interest, callback: F) -> EtudeResult<()>
    where
        F: FnMut(&mut EventLoop<C>, &mut C, c_int) + 'static,
    {
        if let Some(seq) = self.index.get(&(fd, interest)) {
            if let Some(reg) = self.registrations.get_mut(seq) {
                reg.callback = Some(Box::new(callback));
                return Ok(());
            }
        }

        let old = self.masks.get(&fd).copied().unwrap_or(0);
        let new = old | interest.mask();
        self.poller.update(fd, old, new)?;
        self.masks.insert(fd, new);

        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert((fd, interest), seq);
        self.registrations.insert(
            seq,
            Registration {
                fd,
                interest,
                callback: Some(Box::new(callback)),
            },
        );
        Ok(())
    }

    /// Remove the `(fd, interest)` registration. No-op when absent.
    pub fn delete(&mut self, fd: c_int, interest: Interest) {
        let Some(seq) = self.index.remove(&(fd, interest)) else {
            return;
        };
        self.registrations.remove(&seq);

        let old = self.masks.get(&fd).copied().unwrap_or(0);
        let new = old & !interest.mask();
        if new == 0 {
            self.masks.remove(&fd);
        } else {
            self.masks.insert(fd, new);
        }
        if let Err(err) = self.poller.update(fd, old, new) {
            trace!(fd, ?interest, %err, "poller update on delete failed");
        }
    }

    pub fn is_registered(&self, fd: c_int, interest: Interest) -> bool {
        self.index.contains_key(&(fd, interest))
    }

    /// Schedule `callback` to run after `interval`, once or repeatedly.
    pub fn add_timer<F>(&mut self, interval: Duration, kind: TimerKind, callback: F) -> TimerId
    where
        F: FnMut(&mut EventLoop<C>, &mut C, TimerId) + 'static,
    {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        self.timers.insert(
            id,
            Timer {
                interval,
                kind,
                callback: Some(Box::new(callback)),
            },
        );
        self.schedule.push(Reverse((Instant::now() + interval, id)));
        id
    }

    /// Cancel a timer. Safe to call from the timer's own callback.
    pub fn delete_timer(&mut self, id: TimerId) {
        self.timers.remove(&id);
    }

    pub fn clear_all_timers(&mut self) {
        self.timers.clear();
        self.schedule.clear();
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Ask `run` to return. Observed at the top of the next iteration.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Dispatch readiness and timers until [`EventLoop::stop`] is called.
    ///
    /// A failed wait is fatal and returned to the caller.
    pub fn run(&mut self, ctx: &mut C) -> EtudeResult<()> {
        self.running = true;
        while self.running {
            self.run_once(ctx)?;
        }
        Ok(())
    }

    /// One wait plus one dispatch round.
    pub fn run_once(&mut self, ctx: &mut C) -> EtudeResult<()> {
        let timeout = self.wait_budget();
        let mut ready = std::mem::take(&mut self.ready);
        let waited = self.poller.wait(&mut ready, timeout);
        let watermark = self.next_seq;

        let ready_masks = match waited {
            Ok(_) => {
                let mut masks: HashMap<c_int, u32> = HashMap::with_capacity(ready.len());
                for r in &ready {
                    *masks.entry(r.fd).or_insert(0) |= r.mask;
                }
                masks
            }
            Err(err) => {
                self.ready = ready;
                return Err(err);
            }
        };
        self.ready = ready;

        self.fire_due_timers(ctx);

        for interest in [Interest::Read, Interest::Write, Interest::Exception] {
            let due: Vec<u64> = self
                .registrations
                .range(..watermark)
                .filter(|(_, reg)| {
                    reg.interest == interest
                        && ready_masks
                            .get(&reg.fd)
                            .is_some_and(|mask| interest.is_ready(*mask))
                })
                .map(|(seq, _)| *seq)
                .collect();

            for seq in due {
                self.dispatch(seq, ctx);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, seq: u64, ctx: &mut C) {
        let (fd, mut callback) = match self.registrations.get_mut(&seq) {
            Some(reg) => match reg.callback.take() {
                Some(cb) => (reg.fd, cb),
                None => return,
            },
            // Deleted by an earlier callback in this round.
            None => return,
        };

        callback(self, ctx, fd);

        if let Some(reg) = self.registrations.get_mut(&seq) {
            if reg.callback.is_none() {
                reg.callback = Some(callback);
            }
        }
    }

    /// Milliseconds until the earliest live timer, `-1` when there is none.
    fn wait_budget(&mut self) -> i32 {
        while let Some(Reverse((deadline, id))) = self.schedule.peek().copied() {
            if !self.timers.contains_key(&id) {
                self.schedule.pop();
                continue;
            }
            let now = Instant::now();
            if deadline <= now {
                return 0;
            }
            let wait = deadline - now;
            let ms = wait.as_millis() + u128::from(wait.subsec_nanos() % 1_000_000 != 0);
            return ms.min(i32::MAX as u128) as i32;
        }
        -1
    }

    fn fire_due_timers(&mut self, ctx: &mut C) {
        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = self.schedule.peek().copied() {
            if deadline > now {
                break;
            }
            self.schedule.pop();
            if self.timers.contains_key(&id) {
                due.push(id);
            }
        }

        for id in due {
            let Some(mut callback) = self.timers.get_mut(&id).and_then(|t| t.callback.take())
            else {
                continue;
            };

            callback(self, ctx, id);

            // Gone means the callback (or a sibling) deleted it.
            let Some(timer) = self.timers.get_mut(&id) else {
                continue;
            };
            if timer.kind == TimerKind::Once {
                self.timers.remove(&id);
                continue;
            }
            timer.callback = Some(callback);
            let next = Instant::now() + timer.interval;
            self.schedule.push(Reverse((next, id)));
        }
    }
}
