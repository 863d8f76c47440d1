//! Buffered, non-blocking output streams over raw file descriptors.
//!
//! The central type is [`OStream`]: a ring-buffered byte sink bound to one
//! descriptor and driven by a [`brook_ioloop::Ioloop`]. Writes go straight
//! to the kernel whenever possible and spill into the ring buffer on
//! would-block; buffered bytes drain from the write-readiness handler.
//! Corking, zero-copy transfer from an [`InputStream`] and same-descriptor
//! overlap copies are built in.

mod file;
mod ring;
mod syscall;

pub mod istream;
pub mod pool;

pub use {
    file::{OStream, StreamError},
    istream::{FileIStream, InputStat, InputStream},
    pool::{Pool, SystemPool},
};
