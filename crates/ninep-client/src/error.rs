//! Client-side error taxonomy.
//!
//! Transport and protocol failures get their own variants so callers can tell a
//! dead connection from a malformed reply from a server-side errno. `Server`
//! carries the 9P2000.u errno verbatim; per the protocol, `-1` means "I/O error"
//! and is folded into `EIO` by whoever constructs it (see `client.rs`).

use std::{fmt, io};

/// Errno, re-exported for callers that want the symbolic constants.
pub mod errno {
    pub use nix::errno::Errno::*;
}

#[derive(Debug)]
pub enum Error {
    /// The session is in `Closing`/`Closed` and rejected a new send.
    ConnectionAborted,
    /// The receive engine observed a read error or peer close.
    ConnectionReset,
    /// The transport refused to send a frame this large; carries the msize the
    /// frame was built against so the caller can rebuild smaller.
    MessageTooLarge { attempted: u32, msize: u32 },
    /// The decoded reply's message type didn't match what the procedure expected.
    UnexpectedType { expected: &'static str, actual: crate::fcall::MsgType },
    /// `hdr.size` was out of the `[7, msize]` range, or the frame was otherwise
    /// malformed at the header level.
    BadFraming(String),
    /// A field would have read past the end of the buffer.
    ShortBuffer,
    /// An embedded NUL or invalid UTF-8 was found in a wire string.
    BadString,
    /// `version` was issued with a string the server didn't understand, or some
    /// other non-error reply that violates the client's expectations.
    Unsupported(String),
    /// The server replied `Rerror`.
    Server { errno: i32, ename: String },
    /// The tag allocator has no ids left in `[1, 0xFFFE]`.
    TagsExhausted,
    /// The fid allocator has no ids left in `[1, 0xFFFF]`.
    FidsExhausted,
    /// The request's 30-second completion ceiling elapsed.
    Timeout,
    /// Transport failure that doesn't classify more precisely.
    Io(io::Error),
}

impl Error {
    /// Map any variant to a representative POSIX errno, for callers that need one
    /// uniformly (e.g. a VFS adapter translating into `Err(ErrorKind)`).
    pub fn errno(&self) -> nix::errno::Errno {
        use nix::errno::Errno::*;
        match *self {
            Error::ConnectionAborted => ECONNABORTED,
            Error::ConnectionReset => ECONNRESET,
            Error::MessageTooLarge { .. } => EMSGSIZE,
            Error::UnexpectedType { .. } => EPROTO,
            Error::BadFraming(_) => EPROTO,
            Error::ShortBuffer => EPROTO,
            Error::BadString => EPROTO,
            Error::Unsupported(_) => ENOSYS,
            Error::Server { errno, .. } => {
                if errno == -1 {
                    EIO
                } else {
                    nix::errno::Errno::from_raw(errno)
                }
            }
            Error::TagsExhausted | Error::FidsExhausted => EAGAIN,
            Error::Timeout => ETIMEDOUT,
            Error::Io(ref e) => errno_from_ioerror(e),
        }
    }
}

fn errno_from_ioerror(e: &io::Error) -> nix::errno::Errno {
    use nix::errno::Errno::*;
    e.raw_os_error()
        .map(nix::errno::Errno::from_raw)
        .unwrap_or(match e.kind() {
            io::ErrorKind::NotFound => ENOENT,
            io::ErrorKind::PermissionDenied => EPERM,
            io::ErrorKind::ConnectionRefused => ECONNREFUSED,
            io::ErrorKind::ConnectionReset => ECONNRESET,
            io::ErrorKind::ConnectionAborted => ECONNABORTED,
            io::ErrorKind::NotConnected => ENOTCONN,
            io::ErrorKind::BrokenPipe => EPIPE,
            io::ErrorKind::AlreadyExists => EALREADY,
            io::ErrorKind::WouldBlock => EAGAIN,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => EINVAL,
            io::ErrorKind::TimedOut => ETIMEDOUT,
            io::ErrorKind::WriteZero => EAGAIN,
            io::ErrorKind::Interrupted => EINTR,
            _ => EIO,
        })
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ConnectionAborted => write!(f, "connection aborted"),
            Error::ConnectionReset => write!(f, "connection reset by peer"),
            Error::MessageTooLarge { attempted, msize } => {
                write!(f, "message too large: {attempted} bytes against msize {msize}")
            }
            Error::UnexpectedType { expected, actual } => {
                write!(f, "expected {expected}, got {actual:?}")
            }
            Error::BadFraming(ref s) => write!(f, "bad framing: {s}"),
            Error::ShortBuffer => write!(f, "short buffer"),
            Error::BadString => write!(f, "invalid string on the wire"),
            Error::Unsupported(ref s) => write!(f, "unsupported: {s}"),
            Error::Server { errno, ref ename } => write!(f, "server error {errno}: {ename}"),
            Error::TagsExhausted => write!(f, "tag space exhausted"),
            Error::FidsExhausted => write!(f, "fid space exhausted"),
            Error::Timeout => write!(f, "request timed out"),
            Error::Io(ref e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::ShortBuffer,
            io::ErrorKind::InvalidData => Error::BadString,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => Error::ConnectionReset,
            io::ErrorKind::ConnectionAborted | io::ErrorKind::NotConnected => {
                Error::ConnectionAborted
            }
            io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(e),
        }
    }
}
