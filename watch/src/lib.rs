//! Rate-limited file-change watching on top of the event loop.
//!
//! Each watched path gets a filesystem-notify watch when the backend can
//! provide one. A periodic stat-based check runs regardless, because
//! change notification is unreliable on remote filesystems, and it doubles
//! as the delivery point for notifications that were suppressed by the
//! rate limit.

use {
    brook_ioloop::{Io, Ioloop, Timeout},
    log::warn,
    std::{
        cell::{Cell, RefCell},
        fs,
        os::unix::fs::MetadataExt,
        path::{Path, PathBuf},
        rc::{Rc, Weak},
        time::Duration,
    },
};

const CHECK_INTERVAL: Duration = Duration::from_millis(1000);

struct WatchedFile {
    path: PathBuf,
    last_stamp: i64,
}

struct Inner {
    ioloop: Ioloop,
    min_interval: i64,
    callback: Box<dyn Fn()>,
    files: RefCell<Vec<WatchedFile>>,
    notify_ios: RefCell<Vec<Io>>,
    timeout: RefCell<Option<Timeout>>,
    last_check: Cell<i64>,
    last_sent: Cell<i64>,
    pending: Cell<bool>,
}

impl Inner {
    /// Called by the notify backend: deliver now if the rate limit allows,
    /// otherwise leave it for the next periodic check.
    fn on_notify(&self) {
        let now = self.ioloop.time();
        self.last_check.set(now);
        if now - self.last_sent.get() >= self.min_interval {
            self.last_sent.set(now);
            self.pending.set(false);
            (self.callback)();
        } else {
            self.pending.set(true);
        }
    }

    /// Periodic check: stat every watched path and fire on any mtime
    /// change or on a previously suppressed notification.
    fn on_timer(&self) {
        let now = self.ioloop.time();
        if now - self.last_check.get() < self.min_interval {
            return;
        }
        self.last_check.set(now);

        let mut notify = self.pending.get();
        {
            let mut files = self.files.borrow_mut();
            for file in files.iter_mut() {
                let stamp = mtime(&file.path);
                if stamp != 0 && stamp != file.last_stamp {
                    file.last_stamp = stamp;
                    notify = true;
                }
            }
        }

        if notify {
            self.last_sent.set(now);
            self.pending.set(false);
            (self.callback)();
        }
    }
}

fn mtime(path: &Path) -> i64 {
    match fs::metadata(path) {
        Ok(meta) => meta.mtime(),
        Err(_) => 0,
    }
}

/// Watches a set of paths and invokes one callback on changes, at most
/// once per `min_interval` of loop time. A suppressed change is not lost;
/// it fires on a later periodic check.
pub struct Watcher {
    inner: Rc<Inner>,
}

impl Watcher {
    pub fn new(ioloop: &Ioloop, min_interval: Duration, callback: impl Fn() + 'static) -> Self {
        Self {
            inner: Rc::new(Inner {
                ioloop: ioloop.clone(),
                min_interval: min_interval.as_secs() as i64,
                callback: Box::new(callback),
                files: RefCell::new(Vec::new()),
                notify_ios: RefCell::new(Vec::new()),
                timeout: RefCell::new(None),
                last_check: Cell::new(0),
                last_sent: Cell::new(0),
                pending: Cell::new(false),
            }),
        }
    }

    pub fn add_path(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let inner = &self.inner;

        let weak: Weak<Inner> = Rc::downgrade(inner);
        match inner.ioloop.add_notify(path, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_notify();
            }
        }) {
            Some(io) => inner.notify_ios.borrow_mut().push(io),
            None => warn!(
                "no change notification for {}, relying on periodic checks",
                path.display()
            ),
        }

        inner.files.borrow_mut().push(WatchedFile {
            path: path.to_path_buf(),
            last_stamp: mtime(path),
        });

        // keep the timer even when notification works; we cannot know what
        // the notify backend does on remote filesystems
        let mut timeout = inner.timeout.borrow_mut();
        if timeout.is_none() {
            let weak: Weak<Inner> = Rc::downgrade(inner);
            *timeout = Some(inner.ioloop.add_timeout(CHECK_INTERVAL, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_timer();
                }
            }));
        }
    }

    /// Drops every watch, notify registration and the periodic check.
    pub fn remove_all(&self) {
        self.inner.last_sent.set(0);
        self.inner.files.borrow_mut().clear();
        self.inner.notify_ios.borrow_mut().clear();
        *self.inner.timeout.borrow_mut() = None;
        self.inner.pending.set(false);
    }
}
