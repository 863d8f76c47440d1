//! inotify backend for filesystem-change watches.

use {
    log::error,
    std::{
        collections::HashMap,
        ffi::CString,
        io, mem,
        os::{
            fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
            unix::ffi::OsStrExt,
        },
        path::Path,
        rc::Rc,
    },
};

const EVENT_MASK: u32 = libc::IN_MODIFY
    | libc::IN_ATTRIB
    | libc::IN_CLOSE_WRITE
    | libc::IN_CREATE
    | libc::IN_DELETE
    | libc::IN_DELETE_SELF
    | libc::IN_MOVED_FROM
    | libc::IN_MOVED_TO;

struct Watch {
    wd: libc::c_int,
    callback: Rc<dyn Fn()>,
}

pub(crate) struct Inotify {
    fd: OwnedFd,
    watches: HashMap<u64, Watch>,
}

impl Inotify {
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: libc wrapper
        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: inotify_init1 returned a fresh descriptor
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            fd,
            watches: HashMap::new(),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    pub(crate) fn add(&mut self, token: u64, path: &Path, callback: Rc<dyn Fn()>) -> io::Result<()> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        // Safety: cpath is NUL-terminated
        let wd = unsafe { libc::inotify_add_watch(self.fd.as_raw_fd(), cpath.as_ptr(), EVENT_MASK) };
        if wd < 0 {
            return Err(io::Error::last_os_error());
        }
        self.watches.insert(token, Watch { wd, callback });
        Ok(())
    }

    pub(crate) fn remove(&mut self, token: u64) {
        let Some(watch) = self.watches.remove(&token) else {
            return;
        };
        // the kernel hands out one descriptor per path; keep it while any
        // other watch still shares it
        if self.watches.values().any(|w| w.wd == watch.wd) {
            return;
        }
        // Safety: libc wrapper
        unsafe { libc::inotify_rm_watch(self.fd.as_raw_fd(), watch.wd) };
    }

    /// Reads every queued event and returns the callbacks to invoke.
    pub(crate) fn drain(&mut self) -> Vec<Rc<dyn Fn()>> {
        const HEADER_SIZE: usize = mem::size_of::<libc::inotify_event>();

        let mut callbacks: Vec<Rc<dyn Fn()>> = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            // Safety: buf is valid for buf.len() bytes
            let len = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if len < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        error!("inotify read failed: {err}");
                        break;
                    }
                }
            }
            if len == 0 {
                break;
            }

            let len = len as usize;
            let mut offset = 0;
            while offset + HEADER_SIZE <= len {
                // Safety: bounds checked above; the buffer is byte-aligned so
                // the header is read unaligned
                let event = unsafe {
                    (buf.as_ptr().add(offset) as *const libc::inotify_event).read_unaligned()
                };
                for watch in self.watches.values() {
                    if watch.wd == event.wd {
                        callbacks.push(Rc::clone(&watch.callback));
                    }
                }
                offset += HEADER_SIZE + event.len as usize;
            }
        }
        callbacks
    }
}
