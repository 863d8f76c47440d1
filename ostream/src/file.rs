//! Buffered non-blocking output stream over one file descriptor.

#![allow(clippy::arithmetic_side_effects)]

use {
    crate::{
        istream::InputStream,
        pool::Pool,
        ring::Ring,
        syscall,
    },
    brook_ioloop::{Io, IoCondition, Ioloop},
    log::error,
    std::{
        cell::{Cell, RefCell},
        io::{self, IoSlice},
        os::fd::RawFd,
        rc::Rc,
    },
    thiserror::Error,
};

// Keep buffer sizes within 4k..128k; some filesystems genuinely report
// 128k as their optimal block size.
const DEFAULT_OPTIMAL_BLOCK_SIZE: usize = 4096;
const MAX_OPTIMAL_BLOCK_SIZE: usize = 128 * 1024;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream is closed")]
    Closed,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Overlap {
    /// Distinct descriptors, or copying strictly ahead of the write
    /// position: plain head-to-tail order is safe.
    NoneOrForward,
    /// Same descriptor with the write position past the read position:
    /// copy tail-to-head or unread source bytes get clobbered.
    Backward(u64),
}

struct State {
    fd: RawFd,
    ring: Ring,
    optimal_block_size: usize,
    is_file: bool,
    autoclose: bool,
    corked: bool,
    flush_pending: bool,
    no_socket_cork: bool,
    no_sendfile: bool,
    io: Option<Io>,
}

type FlushCallback = Box<dyn FnMut() -> bool>;

struct Shared {
    ioloop: Ioloop,
    pool: Box<dyn Pool>,
    state: RefCell<State>,
    /// kept outside `state` so invoking it never holds the state borrow
    flush_callback: RefCell<Option<FlushCallback>>,
    offset: Cell<u64>,
    stream_errno: Cell<i32>,
    overflow: Cell<bool>,
    closed: Cell<bool>,
}

/// Buffered non-blocking output stream.
///
/// Cloning hands out another reference to the same stream; the underlying
/// state is dropped when the last clone goes away. Destruction only
/// releases the buffer: call [`OStream::close`] to flush and detach the
/// descriptor. The write-readiness dispatch holds its own clone for the
/// duration of a callback, so user code may drop every other handle from
/// inside the flush callback.
#[derive(Clone)]
pub struct OStream {
    shared: Rc<Shared>,
}

impl OStream {
    /// Creates a stream over `fd`, inspecting it to pick transfer
    /// strategies: regular files get no socket cork and no write-readiness
    /// handlers, seekable outputs never use sendfile, and non-seekable
    /// non-sockets are treated as pipes. A `max_buffer_size` of zero
    /// adopts the optimal block size.
    pub fn create_file(
        fd: RawFd,
        ioloop: &Ioloop,
        pool: impl Pool + 'static,
        max_buffer_size: usize,
        autoclose: bool,
    ) -> Self {
        let mut optimal_block_size = DEFAULT_OPTIMAL_BLOCK_SIZE;
        let mut is_file = false;
        let mut no_socket_cork = false;
        let mut no_sendfile = false;
        let mut offset = 0;

        match syscall::lseek(fd, 0, libc::SEEK_CUR) {
            Ok(position) => {
                offset = position;
                if let Ok(st) = syscall::fstat(fd) {
                    if st.block_size > optimal_block_size {
                        optimal_block_size = st.block_size.min(MAX_OPTIMAL_BLOCK_SIZE);
                    }
                    if st.is_regular_file {
                        no_socket_cork = true;
                        is_file = true;
                    }
                }
                // sendfile is for socket outputs of file inputs
                no_sendfile = true;
            }
            Err(_) => {
                if !syscall::is_socket(fd) {
                    // pipe or special device
                    no_sendfile = true;
                    no_socket_cork = true;
                }
            }
        }

        let max_buffer_size = if max_buffer_size == 0 {
            optimal_block_size
        } else {
            max_buffer_size
        };

        Self {
            shared: Rc::new(Shared {
                ioloop: ioloop.clone(),
                pool: Box::new(pool),
                state: RefCell::new(State {
                    fd,
                    ring: Ring::new(max_buffer_size),
                    optimal_block_size,
                    is_file,
                    autoclose,
                    corked: false,
                    flush_pending: false,
                    no_socket_cork,
                    no_sendfile,
                    io: None,
                }),
                flush_callback: RefCell::new(None),
                offset: Cell::new(offset),
                stream_errno: Cell::new(0),
                overflow: Cell::new(false),
                closed: Cell::new(false),
            }),
        }
    }

    /// Total bytes accepted since creation, adjusted by explicit seeks.
    pub fn offset(&self) -> u64 {
        self.shared.offset.get()
    }

    /// Bytes currently held in the stream buffer.
    pub fn buffer_used(&self) -> usize {
        self.shared.state.borrow().ring.used()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.get()
    }

    pub fn is_corked(&self) -> bool {
        self.shared.state.borrow().corked
    }

    /// Sticky: true once any send came up short of the requested count.
    pub fn overflowed(&self) -> bool {
        self.shared.overflow.get()
    }

    /// Raw OS error recorded by the last failing operation; zero when the
    /// stream is healthy.
    pub fn last_errno(&self) -> i32 {
        self.shared.stream_errno.get()
    }

    pub fn set_max_buffer_size(&self, max_size: usize) {
        self.shared.state.borrow_mut().ring.set_max_size(max_size);
    }

    /// Installs the write-readiness callback. It replaces the default
    /// behavior of flushing the buffer; return `true` when everything is
    /// sent, `false` to be called again on the next readiness event.
    pub fn set_flush_callback(&self, callback: impl FnMut() -> bool + 'static) {
        *self.shared.flush_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn clear_flush_callback(&self) {
        *self.shared.flush_callback.borrow_mut() = None;
    }

    pub fn send(&self, data: &[u8]) -> Result<usize, StreamError> {
        self.sendv(&[IoSlice::new(data)])
    }

    pub fn send_str(&self, data: &str) -> Result<usize, StreamError> {
        self.send(data.as_bytes())
    }

    /// Sends a scatter vector. Returns the number of bytes accepted, which
    /// is short of the total only when the buffer refused further bytes;
    /// the shortfall sets the sticky overflow flag.
    pub fn sendv(&self, iov: &[IoSlice<'_>]) -> Result<usize, StreamError> {
        if self.shared.closed.get() {
            return Err(StreamError::Closed);
        }
        self.shared.stream_errno.set(0);

        let total: usize = iov.iter().map(|s| s.len()).sum();
        let mut state = self.shared.state.borrow_mut();

        if total > state.ring.unused_space() && !state.ring.is_empty() {
            self.buffer_flush(&mut state)?;
        }

        let optimal = state.optimal_block_size.min(state.ring.max_size());
        let mut accepted: usize = 0;
        // first unconsumed byte: entry index plus offset within it
        let mut pos = 0;
        let mut pos_off = 0;

        if state.ring.is_empty() && (!state.corked || total >= optimal) {
            // send immediately
            let written = match syscall::writev_chunked(state.fd, iov) {
                Ok(n) => n,
                Err(err) => return Err(self.transport_error(&mut state, err)),
            };
            accepted = written;

            let mut remaining = written;
            while pos < iov.len() && remaining >= iov[pos].len() {
                remaining -= iov[pos].len();
                pos += 1;
            }
            pos_off = remaining;

            if pos < iov.len() && pos_off > 0 {
                // carry the partially written entry's tail into the buffer
                let tail = &iov[pos][pos_off..];
                let added = self.append(&mut state, tail);
                accepted += added;
                if added != tail.len() {
                    // buffer full
                    self.shared.overflow.set(true);
                    self.finish_send(&mut state, accepted);
                    return Ok(accepted);
                }
                pos += 1;
                pos_off = 0;
            }
        }

        // buffer it, at least partly
        while pos < iov.len() {
            let entry = &iov[pos][pos_off..];
            pos_off = 0;
            let added = self.append(&mut state, entry);
            accepted += added;
            if added != entry.len() {
                break;
            }
            pos += 1;
        }

        if accepted < total {
            self.shared.overflow.set(true);
        }
        self.finish_send(&mut state, accepted);
        Ok(accepted)
    }

    /// Drains the buffer with one scatter write. `Ok(true)` means empty,
    /// `Ok(false)` that bytes remain for the next readiness event; this
    /// never waits for the descriptor to become writable.
    pub fn flush(&self) -> Result<bool, StreamError> {
        if self.shared.closed.get() {
            return Err(StreamError::Closed);
        }
        let mut state = self.shared.state.borrow_mut();
        self.buffer_flush(&mut state)
    }

    /// Delays transmission while set: the write-readiness handler comes
    /// off, small sends accumulate into full buffers, and the kernel-level
    /// cork is engaged when the descriptor supports one. Uncorking flushes
    /// and re-arms readiness if bytes remain.
    pub fn cork(&self, set: bool) {
        if self.shared.closed.get() {
            return;
        }
        let mut state = self.shared.state.borrow_mut();
        if state.corked == set {
            return;
        }

        if set {
            state.io = None;
        } else {
            match self.buffer_flush(&mut state) {
                Ok(done) => {
                    if (!done || state.flush_pending) && state.io.is_none() {
                        self.register_write_io(&mut state);
                    }
                }
                Err(_) => {
                    // transport errors close the stream; nothing to re-arm
                }
            }
        }

        if !state.no_socket_cork && !self.shared.closed.get() {
            if syscall::set_cork(state.fd, set).is_err() {
                state.no_socket_cork = true;
            }
        }
        state.corked = set;
    }

    /// Repositions a file output. The buffer is flushed first; on success
    /// the stream offset follows the new position and the recorded errno
    /// is cleared.
    pub fn seek(&self, offset: u64) -> Result<(), StreamError> {
        if self.shared.closed.get() {
            return Err(StreamError::Closed);
        }
        if offset > i64::MAX as u64 {
            self.shared.stream_errno.set(libc::EINVAL);
            return Err(StreamError::InvalidArgument("seek offset out of range"));
        }

        let mut state = self.shared.state.borrow_mut();
        self.buffer_flush(&mut state)?;

        match syscall::lseek(state.fd, offset as i64, libc::SEEK_SET) {
            Ok(position) if position == offset => {
                self.shared.stream_errno.set(0);
                self.shared.offset.set(offset);
                Ok(())
            }
            Ok(_) => {
                self.shared.stream_errno.set(libc::EINVAL);
                Err(StreamError::InvalidArgument("seek stopped short"))
            }
            Err(err) => {
                self.shared
                    .stream_errno
                    .set(err.raw_os_error().unwrap_or(libc::EIO));
                Err(StreamError::Io(err))
            }
        }
    }

    /// Sets the "flush pending" state: the flush callback will be invoked
    /// on the next readiness event even though the buffer is empty.
    pub fn set_flush_pending(&self, set: bool) {
        if self.shared.closed.get() {
            return;
        }
        let mut state = self.shared.state.borrow_mut();
        state.flush_pending = set;
        if set && !state.corked && state.io.is_none() {
            self.register_write_io(&mut state);
        }
    }

    /// Transfers the remainder of `source` into this stream, using
    /// sendfile when the descriptor pair permits it and degrading to
    /// buffered copies otherwise. Copies within one descriptor are
    /// overlap-checked; a backward overlap is copied tail-to-head with
    /// blocking writes. Returns the number of source bytes consumed.
    pub fn send_istream(&self, source: &mut dyn InputStream) -> Result<u64, StreamError> {
        if self.shared.closed.get() {
            return Err(StreamError::Closed);
        }

        let stat = match source.stat(true) {
            Ok(stat) => stat,
            Err(err) => {
                self.shared
                    .stream_errno
                    .set(err.raw_os_error().unwrap_or(libc::EIO));
                return Err(StreamError::Io(err));
            }
        };
        let in_fd = source.fd();
        let in_size = stat.size;

        self.shared.stream_errno.set(0);

        let out_fd = self.shared.state.borrow().fd;
        let mut overlap = Overlap::NoneOrForward;
        if in_fd == Some(out_fd) {
            // copying within the same descriptor: seeks and overlapping
            // writes need care
            let Some(size) = in_size else {
                self.shared.stream_errno.set(libc::EINVAL);
                return Err(StreamError::InvalidArgument(
                    "self-copy with unknown source size",
                ));
            };
            let delta = self.shared.offset.get() as i64
                - (source.abs_start_offset() + source.v_offset()) as i64;
            if delta == 0 {
                // copying data over itself; nothing to actually move
                return Ok(size - source.v_offset());
            }
            if delta > 0 {
                overlap = Overlap::Backward(size);
            }
        }

        if overlap == Overlap::NoneOrForward {
            let sendfile_allowed = !self.shared.state.borrow().no_sendfile;
            if let (true, Some(in_fd), Some(size)) = (sendfile_allowed, in_fd, in_size) {
                match self.sendfile_from(source, in_fd, size) {
                    SendfileOutcome::Done(n) => return Ok(n),
                    SendfileOutcome::Failed(err) => return Err(err),
                    SendfileOutcome::Unsupported => {
                        // not supported with this descriptor pair; never
                        // try again, fall back to regular copying
                        self.shared.stream_errno.set(0);
                        self.shared.state.borrow_mut().no_sendfile = true;
                    }
                }
            }
        }

        match overlap {
            Overlap::Backward(size) => self.copy_backwards(source, size),
            Overlap::NoneOrForward => self.copy_forward(source, in_size),
        }
    }

    /// Flushes whatever is buffered, then detaches the descriptor (closing
    /// it when the stream owns it). Terminal: every later send fails.
    pub fn close(&self) {
        if self.shared.closed.get() {
            return;
        }
        let mut state = self.shared.state.borrow_mut();
        // best-effort: buffered bytes are attempted once, then discarded
        let _ = self.buffer_flush(&mut state);
        self.stream_closed(&mut state);
    }

    fn append(&self, state: &mut State, data: &[u8]) -> usize {
        let optimal = state.optimal_block_size;
        let corked = state.corked;
        state.ring.append(data, &*self.shared.pool, optimal, corked)
    }

    fn finish_send(&self, state: &mut State, accepted: usize) {
        self.shared
            .offset
            .set(self.shared.offset.get() + accepted as u64);
        if !state.ring.is_empty() && !state.corked && !state.is_file {
            self.register_write_io(state);
        }
    }

    fn register_write_io(&self, state: &mut State) {
        if state.io.is_some() {
            return;
        }
        let weak = Rc::downgrade(&self.shared);
        state.io = Some(
            self.shared
                .ioloop
                .add_io(state.fd, IoCondition::Write, move || {
                    if let Some(shared) = weak.upgrade() {
                        OStream { shared }.send_io();
                    }
                }),
        );
    }

    /// Write-readiness dispatch. The `OStream` this runs on is a fresh
    /// clone made by the registered callback, which is what keeps the
    /// stream alive even if the flush callback drops every user handle.
    fn send_io(&self) {
        // Clear flush_pending before the callback and re-set it only if
        // the callback asks for more, so a callback that re-arms itself
        // is not forgotten even when it returns "done".
        self.shared.state.borrow_mut().flush_pending = false;

        let callback = self.shared.flush_callback.borrow_mut().take();
        let all_sent = match callback {
            Some(mut callback) => {
                let ret = callback();
                let mut slot = self.shared.flush_callback.borrow_mut();
                if slot.is_none() {
                    *slot = Some(callback);
                }
                ret
            }
            None => self.flush().unwrap_or(true),
        };

        let mut state = self.shared.state.borrow_mut();
        if !all_sent {
            state.flush_pending = true;
        }
        if !state.flush_pending && state.ring.is_empty() {
            // all sent
            state.io = None;
        } else if !self.shared.closed.get() {
            // the callback may have removed the handler while there is
            // still data (or a pending flush) to deliver
            self.register_write_io(&mut state);
        }
    }

    fn buffer_flush(&self, state: &mut State) -> Result<bool, StreamError> {
        if !state.ring.is_empty() {
            let written = {
                let (first, second) = state.ring.as_slices();
                let iov = [IoSlice::new(first), IoSlice::new(second)];
                let count = if second.is_empty() { 1 } else { 2 };
                syscall::writev_chunked(state.fd, &iov[..count])
            };
            match written {
                Ok(n) => state.ring.advance_head(n),
                Err(err) => return Err(self.transport_error(state, err)),
            }
        }
        Ok(state.ring.is_empty())
    }

    fn transport_error(&self, state: &mut State, err: io::Error) -> StreamError {
        self.shared
            .stream_errno
            .set(err.raw_os_error().unwrap_or(libc::EIO));
        self.stream_closed(state);
        StreamError::Io(err)
    }

    fn stream_closed(&self, state: &mut State) {
        if state.autoclose && state.fd >= 0 {
            // Safety: the stream owns the descriptor
            if unsafe { libc::close(state.fd) } < 0 {
                error!(
                    "close() failed on output stream fd: {}",
                    io::Error::last_os_error()
                );
            }
            state.fd = -1;
        }
        state.io = None;
        self.shared.closed.set(true);
    }

    fn record_errno(&self, err: &io::Error) {
        self.shared
            .stream_errno
            .set(err.raw_os_error().unwrap_or(libc::EIO));
    }

    fn sendfile_from(
        &self,
        source: &mut dyn InputStream,
        in_fd: RawFd,
        in_size: u64,
    ) -> SendfileOutcome {
        let mut state = self.shared.state.borrow_mut();

        // flush out any data in buffer first to keep byte order
        match self.buffer_flush(&mut state) {
            Ok(true) => {}
            Ok(false) => return SendfileOutcome::Done(0),
            Err(err) => return SendfileOutcome::Failed(err),
        }

        let start_offset = source.v_offset();
        let mut v_offset = start_offset;
        let outcome = loop {
            let send_size = in_size - v_offset;
            if send_size == 0 {
                break None;
            }
            let mut abs_offset = source.abs_start_offset() + v_offset;
            let count = send_size.min(usize::MAX as u64) as usize;
            match syscall::sendfile(state.fd, in_fd, &mut abs_offset, count) {
                Ok(0) => break None,
                Ok(n) => {
                    v_offset += n as u64;
                    self.shared.offset.set(self.shared.offset.get() + n as u64);
                }
                Err(err) => match err.raw_os_error() {
                    Some(libc::EAGAIN | libc::EINTR) => break None,
                    Some(libc::EINVAL | libc::ENOSYS) => break Some(SendfileOutcome::Unsupported),
                    _ => {
                        let err = self.transport_error(&mut state, err);
                        break Some(SendfileOutcome::Failed(err));
                    }
                },
            }
        };

        // leave the source positioned after what actually went out
        let _ = source.seek(v_offset);
        outcome.unwrap_or(SendfileOutcome::Done(v_offset - start_offset))
    }

    fn copy_forward(
        &self,
        source: &mut dyn InputStream,
        in_size: Option<u64>,
    ) -> Result<u64, StreamError> {
        let mut state = self.shared.state.borrow_mut();
        let start_offset = source.v_offset();
        let mut remaining = in_size.map(|size| size - start_offset);

        loop {
            if remaining == Some(0) {
                break;
            }
            let block = match remaining {
                Some(left) => (state.optimal_block_size as u64).min(left) as usize,
                None => state.optimal_block_size,
            };
            let data = match source.read_data(block) {
                Ok(data) => data,
                Err(err) => {
                    self.record_errno(&err);
                    return Err(StreamError::Io(err));
                }
            };
            if data.is_empty() {
                // all sent
                break;
            }
            let take = match remaining {
                Some(left) => data.len().min(left as usize),
                None => data.len(),
            };
            let fresh_len = take;

            // buffered bytes go ahead of the fresh source data, combined
            // into one scatter write
            let buffered = state.ring.used();
            let written = {
                let (first, second) = state.ring.as_slices();
                let mut iov: Vec<IoSlice<'_>> = Vec::with_capacity(3);
                if !first.is_empty() {
                    iov.push(IoSlice::new(first));
                }
                if !second.is_empty() {
                    iov.push(IoSlice::new(second));
                }
                iov.push(IoSlice::new(&data[..take]));
                syscall::writev_chunked(state.fd, &iov)
            };
            let written = match written {
                Ok(n) => n,
                Err(err) => return Err(self.transport_error(&mut state, err)),
            };

            if written < buffered {
                // did not even get through the old buffer
                state.ring.advance_head(written);
                break;
            }
            state.ring.advance_head(buffered);

            let sent_fresh = written - buffered;
            self.shared
                .offset
                .set(self.shared.offset.get() + sent_fresh as u64);
            source.skip(sent_fresh as u64);
            if let Some(left) = remaining.as_mut() {
                *left -= sent_fresh as u64;
            }

            if sent_fresh != fresh_len {
                break;
            }
        }

        Ok(source.v_offset() - start_offset)
    }

    /// Same-descriptor copy where the write position is past the read
    /// position: work tail-to-head in buffer-sized chunks, seeking and
    /// writing each chunk fully. This is the one path allowed to block,
    /// since non-blocking partial writes could not preserve correctness.
    fn copy_backwards(
        &self,
        source: &mut dyn InputStream,
        in_size: u64,
    ) -> Result<u64, StreamError> {
        let mmaped = source.is_memory_mapped();
        let mut state = self.shared.state.borrow_mut();

        if !(self.buffer_flush(&mut state)?) {
            return Ok(0);
        }

        // stage chunks through the stream buffer; grow it toward the
        // optimal size first
        if state.optimal_block_size > state.ring.capacity() {
            let grow_by = state.optimal_block_size - state.ring.capacity();
            let optimal = state.optimal_block_size;
            let corked = state.corked;
            state.ring.grow(grow_by, &*self.shared.pool, optimal, corked);
        }
        let chunk_size = state.ring.capacity();
        if chunk_size == 0 {
            self.shared.stream_errno.set(libc::EINVAL);
            return Err(StreamError::InvalidArgument(
                "overlap copy needs a non-zero buffer",
            ));
        }

        let fd = state.fd;
        let in_start_offset = source.v_offset();
        let mut in_offset = in_size;
        let mut out_offset = self.shared.offset.get() + (in_size - in_start_offset);

        while in_offset > in_start_offset {
            let read_size = (in_offset - in_start_offset).min(chunk_size as u64) as usize;
            in_offset -= read_size as u64;
            out_offset -= read_size as u64;

            if let Err(err) = source.seek(in_offset) {
                self.record_errno(&err);
                return Err(StreamError::Io(err));
            }
            let data = match source.read_data(read_size) {
                Ok(data) if data.len() >= read_size => &data[..read_size],
                Ok(_) => {
                    self.shared.stream_errno.set(libc::EINVAL);
                    return Err(StreamError::InvalidArgument(
                        "source shrank during overlap copy",
                    ));
                }
                Err(err) => {
                    self.record_errno(&err);
                    return Err(StreamError::Io(err));
                }
            };

            if let Err(err) = syscall::lseek(fd, out_offset as i64, libc::SEEK_SET) {
                self.record_errno(&err);
                return Err(StreamError::Io(err));
            }
            self.shared.offset.set(out_offset);

            let written = if mmaped {
                // writing straight out of a mapping that aliases the file
                // corrupts it; bounce through the stream buffer
                let scratch = state.ring.scratch_mut();
                scratch[..read_size].copy_from_slice(data);
                syscall::write_full(fd, &scratch[..read_size])
            } else {
                syscall::write_full(fd, data)
            };
            if let Err(err) = written {
                self.record_errno(&err);
                return Err(StreamError::Io(err));
            }
        }

        Ok(in_size - in_start_offset)
    }
}

enum SendfileOutcome {
    Done(u64),
    Unsupported,
    Failed(StreamError),
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            istream::{FileIStream, InputStat},
            pool::SystemPool,
        },
        assert_matches::assert_matches,
        std::{
            fs,
            io::Write as _,
            os::fd::AsRawFd,
        },
    };

    fn socketpair_nonblocking() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        // Safety: fds is a valid two-element array
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "socketpair() failed: {}", io::Error::last_os_error());
        for fd in fds {
            set_nonblocking(fd);
        }
        (fds[0], fds[1])
    }

    fn set_nonblocking(fd: RawFd) {
        // Safety: libc wrapper on a test-owned fd
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            assert!(flags >= 0);
            assert!(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) >= 0);
        }
    }

    fn close_fd(fd: RawFd) {
        // Safety: test-owned fd
        unsafe { libc::close(fd) };
    }

    /// Reads everything currently queued on a non-blocking fd.
    fn drain(fd: RawFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            // Safety: buf is valid for its length
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
        }
        out
    }

    /// Stuffs the socket send buffer until the kernel refuses more.
    fn fill_socket(fd: RawFd) -> usize {
        let chunk = [0x5au8; 4096];
        let mut total = 0;
        loop {
            // Safety: chunk is valid for its length
            let n = unsafe { libc::write(fd, chunk.as_ptr() as *const libc::c_void, chunk.len()) };
            if n <= 0 {
                break;
            }
            total += n as usize;
        }
        total
    }

    fn io_registered(stream: &OStream) -> bool {
        stream.shared.state.borrow().io.is_some()
    }

    /// In-memory source with no descriptor, forcing the buffered copy path.
    struct MemIStream {
        data: Vec<u8>,
        v_offset: u64,
    }

    impl MemIStream {
        fn new(data: &[u8]) -> Self {
            Self {
                data: data.to_vec(),
                v_offset: 0,
            }
        }
    }

    impl InputStream for MemIStream {
        fn stat(&mut self, _exact_size: bool) -> io::Result<InputStat> {
            Ok(InputStat {
                size: Some(self.data.len() as u64),
            })
        }

        fn fd(&self) -> Option<RawFd> {
            None
        }

        fn v_offset(&self) -> u64 {
            self.v_offset
        }

        fn abs_start_offset(&self) -> u64 {
            0
        }

        fn seek(&mut self, v_offset: u64) -> io::Result<()> {
            self.v_offset = v_offset;
            Ok(())
        }

        fn read_data(&mut self, _min_size: usize) -> io::Result<&[u8]> {
            Ok(&self.data[self.v_offset as usize..])
        }

        fn skip(&mut self, count: u64) {
            self.v_offset += count;
        }
    }

    /// Pretends to be a mapping of the descriptor's file, so overlap
    /// copies must stage through the stream buffer.
    struct MmapIStream {
        fd: RawFd,
        data: Vec<u8>,
        v_offset: u64,
    }

    impl InputStream for MmapIStream {
        fn stat(&mut self, _exact_size: bool) -> io::Result<InputStat> {
            Ok(InputStat {
                size: Some(self.data.len() as u64),
            })
        }

        fn fd(&self) -> Option<RawFd> {
            Some(self.fd)
        }

        fn v_offset(&self) -> u64 {
            self.v_offset
        }

        fn abs_start_offset(&self) -> u64 {
            0
        }

        fn seek(&mut self, v_offset: u64) -> io::Result<()> {
            self.v_offset = v_offset;
            Ok(())
        }

        fn read_data(&mut self, _min_size: usize) -> io::Result<&[u8]> {
            Ok(&self.data[self.v_offset as usize..])
        }

        fn skip(&mut self, count: u64) {
            self.v_offset += count;
        }

        fn is_memory_mapped(&self) -> bool {
            true
        }
    }

    #[test]
    fn send_goes_straight_to_the_kernel() {
        let (rd, wr) = socketpair_nonblocking();
        let ioloop = Ioloop::new();
        let stream = OStream::create_file(wr, &ioloop, SystemPool, 4096, false);

        assert_eq!(stream.send(b"hello").unwrap(), 5);
        assert_eq!(stream.offset(), 5);
        assert_eq!(stream.buffer_used(), 0);
        assert!(!io_registered(&stream));
        assert_eq!(drain(rd), b"hello");

        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn cork_coalesces_small_sends() {
        let (rd, wr) = socketpair_nonblocking();
        let ioloop = Ioloop::new();
        let stream = OStream::create_file(wr, &ioloop, SystemPool, 1024, false);

        stream.cork(true);
        assert_eq!(stream.send(b"hello ").unwrap(), 6);
        assert_eq!(stream.send(b"world").unwrap(), 5);
        // nothing on the wire while corked
        assert_eq!(drain(rd), b"");
        assert_eq!(stream.buffer_used(), 11);
        assert!(!io_registered(&stream));

        stream.cork(false);
        assert!(stream.flush().unwrap());
        assert_eq!(drain(rd), b"hello world");
        assert_eq!(stream.offset(), 11);
        assert!(!io_registered(&stream));

        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn would_block_buffers_and_drains() {
        let (rd, wr) = socketpair_nonblocking();
        let ioloop = Ioloop::new();
        let stream = OStream::create_file(wr, &ioloop, SystemPool, 1 << 20, false);

        let prefill = fill_socket(wr);
        let payload = vec![b'A'; 64];
        assert_eq!(stream.send(&payload).unwrap(), 64);
        assert_eq!(stream.offset(), 64);
        assert_eq!(stream.buffer_used(), 64);
        assert!(io_registered(&stream));

        // make room, then let the readiness handler drain the buffer
        let received = drain(rd);
        assert_eq!(received.len(), prefill);
        ioloop.run_once();

        assert_eq!(stream.buffer_used(), 0);
        assert!(!io_registered(&stream));
        assert_eq!(drain(rd), payload);

        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn sendv_partial_acceptance_keeps_order() {
        let (rd, wr) = socketpair_nonblocking();
        let ioloop = Ioloop::new();
        let stream = OStream::create_file(wr, &ioloop, SystemPool, 4096, false);

        let prefill = fill_socket(wr);
        let iov = [
            IoSlice::new(b"abc"),
            IoSlice::new(b"defgh"),
            IoSlice::new(b"ijklmno"),
        ];
        assert_eq!(stream.sendv(&iov).unwrap(), 15);
        assert_eq!(stream.offset(), 15);
        assert!(io_registered(&stream));

        assert_eq!(drain(rd).len(), prefill);
        ioloop.run_once();
        assert_eq!(drain(rd), b"abcdefghijklmno");
        assert_eq!(stream.buffer_used(), 0);

        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn overflow_is_sticky() {
        let (rd, wr) = socketpair_nonblocking();
        let ioloop = Ioloop::new();
        let stream = OStream::create_file(wr, &ioloop, SystemPool, 16, false);

        let _prefill = fill_socket(wr);
        assert_eq!(stream.send(&[b'B'; 64]).unwrap(), 16);
        assert!(stream.overflowed());
        assert_eq!(stream.offset(), 16);

        let _ = drain(rd);
        ioloop.run_once();
        assert_eq!(stream.buffer_used(), 0);
        assert_eq!(drain(rd), [b'B'; 16]);

        // the flag never clears inside the stream
        assert_eq!(stream.send(b"ok").unwrap(), 2);
        assert!(stream.overflowed());

        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn send_istream_transfers_a_file_to_a_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        fs::write(&path, b"0123456789").unwrap();
        let file = fs::File::open(&path).unwrap();

        let (rd, wr) = socketpair_nonblocking();
        let ioloop = Ioloop::new();
        let stream = OStream::create_file(wr, &ioloop, SystemPool, 1 << 16, false);
        let mut src = FileIStream::new(file.as_raw_fd(), false).unwrap();

        assert_eq!(stream.send_istream(&mut src).unwrap(), 10);
        assert_eq!(drain(rd), b"0123456789");
        assert_eq!(stream.offset(), 10);
        assert_eq!(src.v_offset(), 10);

        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn forward_copy_combines_buffer_and_source() {
        let (rd, wr) = socketpair_nonblocking();
        let ioloop = Ioloop::new();
        let stream = OStream::create_file(wr, &ioloop, SystemPool, 4096, false);

        stream.cork(true);
        assert_eq!(stream.send(b"AB").unwrap(), 2);
        assert_eq!(stream.buffer_used(), 2);

        let mut src = MemIStream::new(b"CDEF");
        assert_eq!(stream.send_istream(&mut src).unwrap(), 4);

        // old buffer bytes went ahead of the fresh ones, in one write
        assert_eq!(drain(rd), b"ABCDEF");
        assert_eq!(stream.buffer_used(), 0);
        assert_eq!(stream.offset(), 6);
        stream.cork(false);

        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn backward_overlap_rewrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"ABCDEFGH").unwrap();
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let fd = file.as_raw_fd();

        let ioloop = Ioloop::new();
        let stream = OStream::create_file(fd, &ioloop, SystemPool, 0, false);
        stream.seek(2).unwrap();

        let mut src = FileIStream::with_range(fd, false, 0, Some(6));
        assert_eq!(stream.send_istream(&mut src).unwrap(), 6);

        assert_eq!(fs::read(&path).unwrap(), b"ABABCDEF");
        assert_eq!(stream.offset(), 2);
    }

    #[test]
    fn mmap_sources_stage_through_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"12345678").unwrap();
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let fd = file.as_raw_fd();

        let ioloop = Ioloop::new();
        let stream = OStream::create_file(fd, &ioloop, SystemPool, 0, false);
        stream.seek(2).unwrap();

        let mut src = MmapIStream {
            fd,
            data: b"123456".to_vec(),
            v_offset: 0,
        };
        assert_eq!(stream.send_istream(&mut src).unwrap(), 6);
        assert_eq!(fs::read(&path).unwrap(), b"12123456");
    }

    #[test]
    fn self_copy_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &content).unwrap();
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let fd = file.as_raw_fd();

        let ioloop = Ioloop::new();
        let stream = OStream::create_file(fd, &ioloop, SystemPool, 0, false);
        stream.seek(100).unwrap();

        let mut src = FileIStream::with_range(fd, false, 0, None);
        src.seek(100).unwrap();

        assert_eq!(stream.send_istream(&mut src).unwrap(), 900);
        assert_eq!(fs::read(&path).unwrap(), content);
        assert_eq!(stream.offset(), 100);
    }

    #[test]
    fn seek_overlays_file_regions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();

        let ioloop = Ioloop::new();
        let stream = OStream::create_file(file.as_raw_fd(), &ioloop, SystemPool, 0, false);

        assert_eq!(stream.send(b"AAAA").unwrap(), 4);
        stream.seek(2).unwrap();
        assert_eq!(stream.offset(), 2);
        assert_eq!(stream.send(b"BB").unwrap(), 2);
        assert!(stream.flush().unwrap());

        assert_eq!(fs::read(&path).unwrap(), b"AABB");
        assert_eq!(stream.offset(), 4);
        assert_eq!(stream.last_errno(), 0);
    }

    #[test]
    fn flush_callback_rearms_until_done() {
        let (rd, wr) = socketpair_nonblocking();
        let ioloop = Ioloop::new();
        let stream = OStream::create_file(wr, &ioloop, SystemPool, 4096, false);

        let calls = Rc::new(Cell::new(0u32));
        let calls2 = Rc::clone(&calls);
        stream.set_flush_callback(move || {
            calls2.set(calls2.get() + 1);
            calls2.get() >= 2
        });

        stream.set_flush_pending(true);
        assert!(io_registered(&stream));

        ioloop.run_once();
        assert_eq!(calls.get(), 1);
        // callback returned "not done": stays armed
        assert!(io_registered(&stream));

        ioloop.run_once();
        assert_eq!(calls.get(), 2);
        assert!(!io_registered(&stream));

        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn close_flushes_buffered_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();

        let ioloop = Ioloop::new();
        let stream = OStream::create_file(file.as_raw_fd(), &ioloop, SystemPool, 0, false);

        stream.cork(true);
        assert_eq!(stream.send(b"abc").unwrap(), 3);
        assert_eq!(stream.buffer_used(), 3);

        stream.close();
        assert!(stream.is_closed());
        assert_eq!(fs::read(&path).unwrap(), b"abc");
    }

    #[test]
    fn closed_stream_rejects_operations() {
        let (rd, wr) = socketpair_nonblocking();
        let ioloop = Ioloop::new();
        let stream = OStream::create_file(wr, &ioloop, SystemPool, 4096, false);

        stream.close();
        assert_matches!(stream.send(b"x"), Err(StreamError::Closed));
        assert_matches!(stream.flush(), Err(StreamError::Closed));
        assert_matches!(stream.seek(0), Err(StreamError::Closed));
        let mut src = MemIStream::new(b"y");
        assert_matches!(stream.send_istream(&mut src), Err(StreamError::Closed));
        // cork on a closed stream is a no-op, not a panic
        stream.cork(true);

        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn file_streams_adopt_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.write_all(b"xyz").unwrap();

        let ioloop = Ioloop::new();
        let stream = OStream::create_file(file.as_raw_fd(), &ioloop, SystemPool, 0, false);
        assert_eq!(stream.offset(), 3);

        assert_eq!(stream.send(b"!").unwrap(), 1);
        assert_eq!(stream.offset(), 4);
        assert_eq!(fs::read(&path).unwrap(), b"xyz!");
    }
}
