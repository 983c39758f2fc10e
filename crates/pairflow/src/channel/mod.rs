//! Unidirectional record channel between two worker processes.
//!
//! A [`Channel`] is an anonymous OS pipe split into two exclusively-owned
//! endpoints:
//!
//! - **ReadEnd**: the consumer side, drained until end-of-stream
//! - **WriteEnd**: the producer side, closed to signal end-of-stream
//!
//! End-of-stream is only observed once every copy of the write end is closed,
//! so endpoints are never `Clone`. Duplicates must be made explicitly with
//! `try_clone`, and closing consumes the endpoint so a double close cannot
//! compile.
//!
//! Both descriptors are created close-on-exec: a spawned worker inherits only
//! the endpoint it is handed as stdin/stdout, never its sibling's.
//!
//! # Architecture
//!
//! - **codec**: fixed-width record framing for AsyncRead/AsyncWrite
//! - **io**: async record reader/writer built on the codec

pub mod codec;
pub mod io;

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

pub use codec::{RECORD_WIDTH, Record, RecordCodec};
pub use io::{RecordReader, RecordWriter};

/// Errors raised by channel allocation and record transfer.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The OS refused to allocate a pipe (fd table or pipe buffers exhausted).
    #[error("failed to allocate channel: {0}")]
    ResourceExhausted(#[source] std::io::Error),

    /// The reader side vanished while a record was being written.
    #[error("channel broken: no reader remains")]
    BrokenChannel(#[source] std::io::Error),

    /// Read/write failure or a truncated record.
    #[error("channel i/o failure: {0}")]
    IoFailure(#[source] std::io::Error),
}

impl ChannelError {
    pub(crate) fn from_write(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::BrokenPipe {
            Self::BrokenChannel(err)
        } else {
            Self::IoFailure(err)
        }
    }
}

/// Read-only endpoint of a [`Channel`].
#[derive(Debug)]
pub struct ReadEnd {
    fd: OwnedFd,
}

/// Write-only endpoint of a [`Channel`].
#[derive(Debug)]
pub struct WriteEnd {
    fd: OwnedFd,
}

macro_rules! endpoint_impls {
    ($ty:ident, $side:literal) => {
        impl $ty {
            /// Duplicate the endpoint. The duplicate keeps the channel open on its
            /// own until it is closed as well.
            pub fn try_clone(&self) -> std::io::Result<Self> {
                let fd = self.fd.try_clone()?;
                tracing::trace!(
                    side = $side,
                    original = self.fd.as_raw_fd(),
                    duplicate = fd.as_raw_fd(),
                    "Duplicated endpoint"
                );
                Ok(Self { fd })
            }

            /// Close the endpoint, releasing this copy of the descriptor.
            pub fn close(self) {
                tracing::trace!(side = $side, fd = self.fd.as_raw_fd(), "Closing endpoint");
                drop(self.fd);
            }

            /// Give up endpoint tracking and hand the raw descriptor to the caller.
            pub fn into_owned_fd(self) -> OwnedFd {
                self.fd
            }
        }

        impl AsFd for $ty {
            fn as_fd(&self) -> BorrowedFd<'_> {
                self.fd.as_fd()
            }
        }

        impl AsRawFd for $ty {
            fn as_raw_fd(&self) -> RawFd {
                self.fd.as_raw_fd()
            }
        }

        impl From<OwnedFd> for $ty {
            fn from(fd: OwnedFd) -> Self {
                Self { fd }
            }
        }

        impl FromRawFd for $ty {
            /// # Safety
            ///
            /// `fd` must be an open pipe descriptor not owned by anything else.
            unsafe fn from_raw_fd(fd: RawFd) -> Self {
                Self {
                    fd: unsafe { OwnedFd::from_raw_fd(fd) },
                }
            }
        }
    };
}

endpoint_impls!(ReadEnd, "read");
endpoint_impls!(WriteEnd, "write");

/// A freshly created pipe with both endpoints still held by the creator.
pub struct Channel {
    read_end: ReadEnd,
    write_end: WriteEnd,
}

impl Channel {
    /// Allocate a new pipe.
    pub fn create() -> Result<Self, ChannelError> {
        let (read_fd, write_fd) = create_pipe().map_err(ChannelError::ResourceExhausted)?;

        tracing::debug!(
            read_fd = read_fd.as_raw_fd(),
            write_fd = write_fd.as_raw_fd(),
            "Created channel"
        );

        Ok(Self {
            read_end: ReadEnd { fd: read_fd },
            write_end: WriteEnd { fd: write_fd },
        })
    }

    pub fn read_end(&self) -> &ReadEnd {
        &self.read_end
    }

    pub fn write_end(&self) -> &WriteEnd {
        &self.write_end
    }

    /// Split into independently owned endpoints.
    pub fn into_split(self) -> (ReadEnd, WriteEnd) {
        (self.read_end, self.write_end)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("read_fd", &self.read_end.as_raw_fd())
            .field("write_fd", &self.write_end.as_raw_fd())
            .finish()
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn create_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::OFlag;

    nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(std::io::Error::from)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn create_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{FcntlArg, FdFlag, fcntl};

    // No pipe2 here: there is a window where a concurrent fork could inherit both ends.
    let (read_fd, write_fd) = nix::unistd::pipe().map_err(std::io::Error::from)?;
    for fd in [&read_fd, &write_fd] {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(std::io::Error::from)?;
    }
    Ok((read_fd, write_fd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_distinct_descriptors() {
        let channel = Channel::create().unwrap();
        assert_ne!(
            channel.read_end().as_raw_fd(),
            channel.write_end().as_raw_fd()
        );
    }

    #[test]
    fn try_clone_yields_new_descriptor() {
        let (_read_end, write_end) = Channel::create().unwrap().into_split();
        let dup = write_end.try_clone().unwrap();
        assert_ne!(dup.as_raw_fd(), write_end.as_raw_fd());
    }

    #[test]
    fn broken_pipe_maps_to_broken_channel() {
        let err = ChannelError::from_write(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(matches!(err, ChannelError::BrokenChannel(_)));

        let err = ChannelError::from_write(std::io::Error::other("disk on fire"));
        assert!(matches!(err, ChannelError::IoFailure(_)));
    }
}
