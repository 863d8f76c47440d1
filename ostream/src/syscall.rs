//! Raw syscall bindings used by the output stream.

use std::{
    io::{self, IoSlice},
    mem,
    os::fd::RawFd,
};

/// POSIX `IOV_MAX` (`<limits.h>`); the `libc` crate does not expose this
/// constant on this target, so it is mirrored here with its libc value.
const IOV_MAX: usize = 1024;

/// write(2)/writev(2) with the vector chunked at `IOV_MAX` entries.
///
/// Would-block and interruption are reported as zero bytes so callers can
/// treat "no progress" uniformly; a partial chunk stops the loop and the
/// total accepted so far is returned.
pub(crate) fn writev_chunked(fd: RawFd, iov: &[IoSlice<'_>]) -> io::Result<usize> {
    if iov.is_empty() {
        return Ok(0);
    }

    if iov.len() == 1 {
        // Safety: the slice is valid for its length
        let ret = unsafe { libc::write(fd, iov[0].as_ptr() as *const libc::c_void, iov[0].len()) };
        if ret < 0 {
            return map_write_error(0);
        }
        return Ok(ret as usize);
    }

    let mut sent: usize = 0;
    let mut rest = iov;
    loop {
        let chunk = &rest[..rest.len().min(IOV_MAX)];
        let chunk_size: usize = chunk.iter().map(|s| s.len()).sum();
        // Safety: IoSlice is ABI-compatible with iovec and the chunk is
        // valid for the duration of the call
        let ret = unsafe {
            libc::writev(
                fd,
                chunk.as_ptr() as *const libc::iovec,
                chunk.len() as libc::c_int,
            )
        };
        if ret < 0 {
            return map_write_error(sent);
        }
        sent += ret as usize;
        if ret as usize != chunk_size || chunk.len() == rest.len() {
            break;
        }
        rest = &rest[chunk.len()..];
    }
    Ok(sent)
}

fn map_write_error(sent: usize) -> io::Result<usize> {
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN | libc::EINTR) => Ok(sent),
        _ => Err(err),
    }
}

/// sendfile(2), capped at one `ssize_t` worth of bytes per call. `offset`
/// is the absolute position in `in_fd` and is advanced by the transferred
/// count; the descriptor's own position is left alone.
#[cfg(target_os = "linux")]
pub(crate) fn sendfile(
    out_fd: RawFd,
    in_fd: RawFd,
    offset: &mut u64,
    count: usize,
) -> io::Result<usize> {
    let count = count.min(libc::ssize_t::MAX as usize);
    let mut off = *offset as libc::off_t;
    // Safety: off is a valid in/out parameter for the call
    let ret = unsafe { libc::sendfile(out_fd, in_fd, &mut off, count) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    *offset = off as u64;
    Ok(ret as usize)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn sendfile(
    _out_fd: RawFd,
    _in_fd: RawFd,
    _offset: &mut u64,
    _count: usize,
) -> io::Result<usize> {
    // no usable sendfile on this target; callers fall back to the copy path
    Err(io::Error::from_raw_os_error(libc::EINVAL))
}

/// Kernel-level transmission corking (TCP_CORK).
#[cfg(target_os = "linux")]
pub(crate) fn set_cork(fd: RawFd, corked: bool) -> io::Result<()> {
    let value: libc::c_int = if corked { 1 } else { 0 };
    // Safety: libc wrapper
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_cork(_fd: RawFd, _corked: bool) -> io::Result<()> {
    Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP))
}

/// Blocking total write; retries interruption and short writes until all
/// of `data` is on the descriptor.
pub(crate) fn write_full(fd: RawFd, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        // Safety: data is valid for its length
        let ret = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR | libc::EAGAIN) => continue,
                _ => return Err(err),
            }
        }
        data = &data[ret as usize..];
    }
    Ok(())
}

pub(crate) fn pread(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    // Safety: buf is valid for its length
    let ret = unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return pread(fd, buf, offset);
        }
        return Err(err);
    }
    Ok(ret as usize)
}

pub(crate) fn lseek(fd: RawFd, offset: i64, whence: libc::c_int) -> io::Result<u64> {
    // Safety: libc wrapper
    let ret = unsafe { libc::lseek(fd, offset as libc::off_t, whence) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as u64)
}

pub(crate) struct FdStat {
    pub(crate) size: u64,
    pub(crate) block_size: usize,
    pub(crate) is_regular_file: bool,
}

pub(crate) fn fstat(fd: RawFd) -> io::Result<FdStat> {
    // Safety: st is a valid out-parameter, fully initialized by fstat
    let mut st: libc::stat = unsafe { mem::zeroed() };
    // Safety: libc wrapper
    let rc = unsafe { libc::fstat(fd, &mut st) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(FdStat {
        size: st.st_size.max(0) as u64,
        block_size: st.st_blksize.max(0) as usize,
        is_regular_file: st.st_mode & libc::S_IFMT == libc::S_IFREG,
    })
}

/// getsockname(2) probe: distinguishes sockets from pipes and special
/// devices among the non-seekable descriptors.
pub(crate) fn is_socket(fd: RawFd) -> bool {
    // Safety: addr/len are valid out-parameters
    let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // Safety: libc wrapper
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut addr as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    rc == 0
}
