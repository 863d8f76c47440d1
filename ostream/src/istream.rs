//! Source-side interface consumed by [`OStream::send_istream`].
//!
//! [`OStream::send_istream`]: crate::OStream::send_istream

use {
    crate::syscall,
    std::{io, os::fd::RawFd},
};

pub struct InputStat {
    /// Total size of the source in bytes, when known. Pipe- and
    /// socket-backed sources report `None`.
    pub size: Option<u64>,
}

/// An opaque byte source.
///
/// Offsets come in two flavors: the *virtual* offset counts from the start
/// of the stream, while `abs_start_offset` anchors the stream within its
/// underlying descriptor, so `abs_start_offset + v_offset` is an absolute
/// file position.
pub trait InputStream {
    fn stat(&mut self, exact_size: bool) -> io::Result<InputStat>;

    /// The underlying descriptor, if there is one.
    fn fd(&self) -> Option<RawFd>;

    fn v_offset(&self) -> u64;

    fn abs_start_offset(&self) -> u64;

    fn seek(&mut self, v_offset: u64) -> io::Result<()>;

    /// Returns the bytes available at the current virtual offset, reading
    /// more until at least `min_size` are buffered or the source ends. An
    /// empty slice means end-of-stream at the current offset. The data is
    /// not consumed; call [`InputStream::skip`] to advance.
    fn read_data(&mut self, min_size: usize) -> io::Result<&[u8]>;

    fn skip(&mut self, count: u64);

    /// Whether `read_data` hands out slices of a live file mapping. Copies
    /// within the same descriptor must then stage through a private buffer.
    fn is_memory_mapped(&self) -> bool {
        false
    }
}

/// Regular-file input stream reading through a private pread buffer, so
/// the descriptor's own cursor is never disturbed.
pub struct FileIStream {
    fd: RawFd,
    autoclose: bool,
    abs_start: u64,
    size_limit: Option<u64>,
    v_offset: u64,
    /// bytes at `[v_offset, v_offset + buf.len())`
    buf: Vec<u8>,
}

const READ_CHUNK: usize = 8192;

impl FileIStream {
    /// Opens the stream over the whole descriptor, anchored at its current
    /// position.
    pub fn new(fd: RawFd, autoclose: bool) -> io::Result<Self> {
        let abs_start = syscall::lseek(fd, 0, libc::SEEK_CUR)?;
        Ok(Self::with_range(fd, autoclose, abs_start, None))
    }

    /// Opens the stream over `[abs_start, abs_start + limit)` of the
    /// descriptor; an unlimited stream ends at end-of-file.
    pub fn with_range(fd: RawFd, autoclose: bool, abs_start: u64, limit: Option<u64>) -> Self {
        Self {
            fd,
            autoclose,
            abs_start,
            size_limit: limit,
            v_offset: 0,
            buf: Vec::new(),
        }
    }

    fn clamp(&self, size: u64) -> u64 {
        let available = size.saturating_sub(self.abs_start);
        match self.size_limit {
            Some(limit) => available.min(limit),
            None => available,
        }
    }
}

impl InputStream for FileIStream {
    fn stat(&mut self, _exact_size: bool) -> io::Result<InputStat> {
        let st = syscall::fstat(self.fd)?;
        Ok(InputStat {
            size: Some(self.clamp(st.size)),
        })
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.fd)
    }

    fn v_offset(&self) -> u64 {
        self.v_offset
    }

    fn abs_start_offset(&self) -> u64 {
        self.abs_start
    }

    fn seek(&mut self, v_offset: u64) -> io::Result<()> {
        let delta = v_offset.wrapping_sub(self.v_offset);
        if v_offset >= self.v_offset && delta <= self.buf.len() as u64 {
            // still inside the buffered window
            self.buf.drain(..delta as usize);
        } else {
            self.buf.clear();
        }
        self.v_offset = v_offset;
        Ok(())
    }

    fn read_data(&mut self, min_size: usize) -> io::Result<&[u8]> {
        let min_size = min_size.max(1);
        while self.buf.len() < min_size {
            let end = self.abs_start + self.v_offset + self.buf.len() as u64;
            let mut want = (min_size - self.buf.len()).max(READ_CHUNK);
            if let Some(limit) = self.size_limit {
                let left = (self.abs_start + limit).saturating_sub(end);
                want = want.min(left as usize);
            }
            if want == 0 {
                break;
            }
            let mut chunk = vec![0u8; want];
            let n = syscall::pread(self.fd, &mut chunk, end)?;
            if n == 0 {
                break;
            }
            chunk.truncate(n);
            self.buf.extend_from_slice(&chunk);
        }
        Ok(&self.buf)
    }

    fn skip(&mut self, count: u64) {
        let buffered = count.min(self.buf.len() as u64) as usize;
        self.buf.drain(..buffered);
        self.v_offset += count;
    }
}

impl Drop for FileIStream {
    fn drop(&mut self) {
        if self.autoclose {
            // Safety: the stream owns the descriptor
            unsafe { libc::close(self.fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{fs, os::fd::AsRawFd},
    };

    fn fixture(content: &[u8]) -> (tempfile::TempDir, fs::File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src");
        fs::write(&path, content).unwrap();
        let file = fs::File::open(&path).unwrap();
        (dir, file)
    }

    #[test]
    fn reads_and_skips() {
        let (_dir, file) = fixture(b"0123456789");
        let mut src = FileIStream::new(file.as_raw_fd(), false).unwrap();

        assert_eq!(src.stat(true).unwrap().size, Some(10));
        assert_eq!(&src.read_data(4).unwrap()[..4], b"0123");

        src.skip(4);
        assert_eq!(src.v_offset(), 4);
        assert_eq!(&src.read_data(3).unwrap()[..3], b"456");

        src.skip(6);
        assert_eq!(src.read_data(1).unwrap(), b"");
    }

    #[test]
    fn seek_moves_the_window() {
        let (_dir, file) = fixture(b"abcdefgh");
        let mut src = FileIStream::new(file.as_raw_fd(), false).unwrap();

        let _ = src.read_data(8).unwrap();
        src.seek(6).unwrap();
        assert_eq!(src.read_data(2).unwrap(), b"gh");

        src.seek(0).unwrap();
        assert_eq!(&src.read_data(2).unwrap()[..2], b"ab");
    }

    #[test]
    fn range_limits_size_and_reads() {
        let (_dir, file) = fixture(b"ABCDEFGH");
        let mut src = FileIStream::with_range(file.as_raw_fd(), false, 2, Some(4));

        assert_eq!(src.stat(true).unwrap().size, Some(4));
        assert_eq!(src.read_data(16).unwrap(), b"CDEF");

        src.skip(4);
        assert_eq!(src.read_data(1).unwrap(), b"");
    }
}
