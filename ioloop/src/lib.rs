//! Single-threaded, poll(2)-backed event loop.
//!
//! Handlers run serially and to completion; a handler may freely register
//! or remove other handlers, including its own.

#![allow(clippy::arithmetic_side_effects)]

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    os::fd::RawFd,
    path::Path,
    rc::{Rc, Weak},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

#[cfg(target_os = "linux")]
mod notify;

/// Readiness condition an I/O handler waits for.
///
/// Error conditions (`POLLERR`/`POLLHUP`/`POLLNVAL`) are always delivered,
/// also to `Read` and `Write` handlers, so a handler discovers a dead peer
/// from the syscall it was going to make anyway.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoCondition {
    Read,
    Write,
    Error,
}

impl IoCondition {
    fn poll_events(self) -> libc::c_short {
        match self {
            IoCondition::Read => libc::POLLIN,
            IoCondition::Write => libc::POLLOUT,
            // error conditions are reported regardless of `events`
            IoCondition::Error => 0,
        }
    }

    fn matches(self, revents: libc::c_short) -> bool {
        let error = revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
        match self {
            IoCondition::Read => revents & libc::POLLIN != 0 || error,
            IoCondition::Write => revents & libc::POLLOUT != 0 || error,
            IoCondition::Error => error,
        }
    }
}

type Callback = Rc<dyn Fn()>;

struct IoEntry {
    fd: RawFd,
    condition: IoCondition,
    callback: Callback,
}

struct TimerEntry {
    deadline: Instant,
    interval: Duration,
    callback: Callback,
}

struct LoopInner {
    ios: RefCell<HashMap<u64, IoEntry>>,
    timers: RefCell<HashMap<u64, TimerEntry>>,
    #[cfg(target_os = "linux")]
    notify: RefCell<Option<notify::Inotify>>,
    next_token: Cell<u64>,
    running: Cell<bool>,
    loop_time: Cell<i64>,
}

impl LoopInner {
    fn next_token(&self) -> u64 {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        token
    }
}

/// The event loop. Cheap to clone; all clones share one handler registry.
#[derive(Clone)]
pub struct Ioloop {
    inner: Rc<LoopInner>,
}

impl Default for Ioloop {
    fn default() -> Self {
        Self::new()
    }
}

impl Ioloop {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(LoopInner {
                ios: RefCell::new(HashMap::new()),
                timers: RefCell::new(HashMap::new()),
                #[cfg(target_os = "linux")]
                notify: RefCell::new(None),
                next_token: Cell::new(0),
                running: Cell::new(false),
                loop_time: Cell::new(wall_time()),
            }),
        }
    }

    /// Registers `callback` to run whenever `fd` reports `condition`.
    ///
    /// At most one `Write` handler per fd is expected; this is not checked.
    /// Dropping the returned handle unregisters it.
    pub fn add_io(&self, fd: RawFd, condition: IoCondition, callback: impl Fn() + 'static) -> Io {
        let token = self.inner.next_token();
        self.inner.ios.borrow_mut().insert(
            token,
            IoEntry {
                fd,
                condition,
                callback: Rc::new(callback),
            },
        );
        Io {
            owner: Rc::downgrade(&self.inner),
            token,
            kind: IoKind::Fd,
        }
    }

    /// Registers a repeating timer with the given interval.
    pub fn add_timeout(&self, interval: Duration, callback: impl Fn() + 'static) -> Timeout {
        let token = self.inner.next_token();
        self.inner.timers.borrow_mut().insert(
            token,
            TimerEntry {
                deadline: Instant::now() + interval,
                interval,
                callback: Rc::new(callback),
            },
        );
        Timeout {
            owner: Rc::downgrade(&self.inner),
            token,
        }
    }

    /// Watches `path` for filesystem changes. Returns `None` when the
    /// notify backend cannot watch the path; callers are expected to fall
    /// back to timer-based polling.
    #[cfg(target_os = "linux")]
    pub fn add_notify(&self, path: &Path, callback: impl Fn() + 'static) -> Option<Io> {
        let mut guard = self.inner.notify.borrow_mut();
        if guard.is_none() {
            match notify::Inotify::new() {
                Ok(backend) => *guard = Some(backend),
                Err(err) => {
                    log::warn!("inotify unavailable: {err}");
                    return None;
                }
            }
        }
        let backend = guard.as_mut()?;
        let token = self.inner.next_token();
        match backend.add(token, path, Rc::new(callback)) {
            Ok(()) => Some(Io {
                owner: Rc::downgrade(&self.inner),
                token,
                kind: IoKind::Notify,
            }),
            Err(err) => {
                log::warn!("inotify watch on {} failed: {err}", path.display());
                None
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn add_notify(&self, _path: &Path, _callback: impl Fn() + 'static) -> Option<Io> {
        None
    }

    /// Wall-clock seconds sampled when the current dispatch batch started.
    /// Monotonic within a single run.
    pub fn time(&self) -> i64 {
        self.inner.loop_time.get()
    }

    pub fn run(&self) {
        self.inner.running.set(true);
        while self.inner.running.get() {
            self.run_once();
        }
    }

    /// Safe to call from a handler.
    pub fn stop(&self) {
        self.inner.running.set(false);
    }

    /// One loop iteration: wait for readiness or a timer, then dispatch.
    ///
    /// # Panics
    ///
    /// Panics if nothing at all is registered, since the wait could never
    /// finish.
    pub fn run_once(&self) {
        let inner = &self.inner;

        let mut pollfds: Vec<libc::pollfd> = Vec::new();
        let mut tokens: Vec<u64> = Vec::new();
        {
            let ios = inner.ios.borrow();
            for (&token, entry) in ios.iter() {
                pollfds.push(libc::pollfd {
                    fd: entry.fd,
                    events: entry.condition.poll_events(),
                    revents: 0,
                });
                tokens.push(token);
            }
        }

        #[cfg(target_os = "linux")]
        let notify_fd = {
            let guard = inner.notify.borrow();
            match guard.as_ref() {
                Some(backend) if !backend.is_empty() => {
                    pollfds.push(libc::pollfd {
                        fd: backend.fd(),
                        events: libc::POLLIN,
                        revents: 0,
                    });
                    Some(backend.fd())
                }
                _ => None,
            }
        };

        let timeout = next_timer_delay(&inner.timers.borrow());
        if pollfds.is_empty() && timeout.is_none() {
            panic!("ioloop: no I/O handlers or timeouts registered");
        }

        let rc = loop {
            // Safety: pollfds is a valid array for the duration of the call
            let rc = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout_millis(timeout),
                )
            };
            if rc < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break rc;
        };
        if rc < 0 {
            panic!("poll() failed: {}", io::Error::last_os_error());
        }

        let now_wall = wall_time();
        if now_wall > inner.loop_time.get() {
            inner.loop_time.set(now_wall);
        }

        // Expired timers first. The deadline is pushed forward before the
        // callback runs so a handler removing and re-adding timers observes
        // a consistent registry.
        let now = Instant::now();
        let due: Vec<u64> = inner
            .timers
            .borrow()
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(&token, _)| token)
            .collect();
        for token in due {
            let callback = {
                let mut timers = inner.timers.borrow_mut();
                timers.get_mut(&token).map(|entry| {
                    entry.deadline = now + entry.interval;
                    Rc::clone(&entry.callback)
                })
            };
            if let Some(callback) = callback {
                callback();
            }
        }

        // Ready fds. Registration is re-checked per token because an earlier
        // callback may have removed a later handler.
        for (i, token) in tokens.iter().enumerate() {
            let revents = pollfds[i].revents;
            if revents == 0 {
                continue;
            }
            let callback = {
                let ios = inner.ios.borrow();
                ios.get(token)
                    .filter(|entry| entry.condition.matches(revents))
                    .map(|entry| Rc::clone(&entry.callback))
            };
            if let Some(callback) = callback {
                callback();
            }
        }

        #[cfg(target_os = "linux")]
        if let Some(fd) = notify_fd {
            let ready = pollfds
                .last()
                .is_some_and(|p| p.fd == fd && p.revents & libc::POLLIN != 0);
            if ready {
                let callbacks = match inner.notify.borrow_mut().as_mut() {
                    Some(backend) => backend.drain(),
                    None => Vec::new(),
                };
                for callback in callbacks {
                    callback();
                }
            }
        }
    }
}

fn wall_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

fn next_timer_delay(timers: &HashMap<u64, TimerEntry>) -> Option<Duration> {
    let now = Instant::now();
    timers
        .values()
        .map(|entry| entry.deadline.saturating_duration_since(now))
        .min()
}

fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    let Some(timeout) = timeout else {
        return -1;
    };
    // round up so a timer is actually due when poll returns
    let mut ms = timeout.as_millis();
    if Duration::from_millis(ms as u64) < timeout {
        ms += 1;
    }
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

enum IoKind {
    Fd,
    Notify,
}

/// Registration handle for an I/O or notify watch. Dropping it (or calling
/// [`Io::remove`]) unregisters the handler; both are idempotent.
#[must_use]
pub struct Io {
    owner: Weak<LoopInner>,
    token: u64,
    kind: IoKind,
}

impl Io {
    pub fn remove(self) {}
}

impl Drop for Io {
    fn drop(&mut self) {
        let Some(inner) = self.owner.upgrade() else {
            return;
        };
        match self.kind {
            IoKind::Fd => {
                inner.ios.borrow_mut().remove(&self.token);
            }
            IoKind::Notify =>
            {
                #[cfg(target_os = "linux")]
                if let Some(backend) = inner.notify.borrow_mut().as_mut() {
                    backend.remove(self.token);
                }
            }
        }
    }
}

/// Registration handle for a repeating timer.
#[must_use]
pub struct Timeout {
    owner: Weak<LoopInner>,
    token: u64,
}

impl Timeout {
    pub fn remove(self) {}
}

impl Drop for Timeout {
    fn drop(&mut self) {
        if let Some(inner) = self.owner.upgrade() {
            inner.timers.borrow_mut().remove(&self.token);
        }
    }
}
