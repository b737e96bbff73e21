#![forbid(unsafe_code)]
//! A 9P2000.u client core: the protocol engine that turns a reliable
//! byte-stream connection to a 9P file server into a tag-multiplexed
//! request/response transport.
//!
//! This crate does not dial the server itself — an enclosing mount
//! orchestrator is expected to resolve a name, connect a socket, and hand the
//! already-connected stream to [`client::session_start`]. From there the
//! crate owns wire framing, tag/fid allocation, the send/receive engines, and
//! the per-operation client procedures.
//!
//! # Getting started
//!
//! ```no_run
//! use ninep_client::client;
//! use ninep_client::client::vop;
//!
//! # async fn run() -> ninep_client::Result<()> {
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:564").await?;
//! let session = client::session_start_default(stream).await?;
//! let (root_fid, _root_qid) = client::attach(&session, "root", "/", 0).await?;
//!
//! let (fid, qid, _iounit) = client::open_path(&session, root_fid, "etc/motd", vop::FREAD).await?;
//! let contents = client::read_all(&session, fid, 0, 4096).await?;
//! client::clunk(&session, fid).await?;
//! # let _ = (qid, contents);
//!
//! client::session_close(&session).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Message flow
//!
//! 1. **Version negotiation** — `Tversion`/`Rversion`, folded into
//!    [`client::session_start`].
//! 2. **Attach** — [`client::attach`] binds a root fid to the export.
//! 3. **Operations** — [`client::walk`], [`client::open`], [`client::read`],
//!    [`client::write`], [`client::stat`] and their chunked/path-walking
//!    counterparts.
//! 4. **Cleanup** — [`client::clunk`] releases a fid; [`client::session_close`]
//!    tears the session down.
//!
//! # Error handling
//!
//! Every procedure returns [`error::Error`]. Transport and timeout failures
//! are always surfaced to the caller; protocol errors (malformed frames,
//! unexpected reply types) are fatal to the session and drive it to
//! `Closing`; server errors (`Rerror`) are per-request and leave the session
//! healthy. [`error::Error::errno`] maps any variant to a representative
//! POSIX errno for callers (e.g. a VFS adapter) that need one uniformly.
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`).
pub mod alloc;
pub mod client;
pub mod error;
pub mod fcall;
pub mod msgbuf;
pub mod serialize;
pub mod session;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::fcall::*;
pub use crate::session::{Session, State};
pub use crate::utils::Result;
