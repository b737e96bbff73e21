//! Client procedures: `session_start`, `session_close`, and the eight wire
//! operations a 9P2000.u client drives — version (folded into
//! `session_start`), attach, walk, open, read, write, clunk, stat.
//!
//! The shape of each procedure — build a request, send it, accept the matching
//! reply or propagate the server's `Rerror` — mirrors a 9P2000.L server's
//! `dispatch_once` match arms read backwards: there a decoded `T*` maps to a
//! filesystem call returning an `R*`; here a built `T*` is sent and the `R*`
//! is parsed out. The walk-then-open call pattern and the read/write
//! offset-loop helpers are grounded on `cohsh`'s `CohClient::open`/`walk_qid`
//! (walk, then open, clunk on a failed open) and on
//! `other_examples/...cfk-providers-src-ninep.rs.rs`'s `read_file`/`write_file`
//! chunking loops.

use crate::error::Error;
use crate::fcall::{om, FCall, MsgType, QId, Stat, DEFAULT_MSIZE, NOFID, P92000U};
use crate::session::{Session, State};

use tokio::io::{AsyncRead, AsyncWrite};

/// Negotiate the protocol version and bring a freshly-connected transport
/// into the `Running` state. This is the client's `Tversion`/`Rversion`
/// exchange; every other procedure requires a session that has completed it.
pub async fn session_start<T>(
    stream: T,
    msize: u32,
) -> Result<Session<tokio::io::WriteHalf<T>>, Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let msize = msize.max(crate::fcall::MIN_MSIZE);
    let (read_half, write_half) = tokio::io::split(stream);
    let session = Session::new(read_half, write_half, msize);

    let reply = session
        .send_version(FCall::Tversion {
            msize,
            version: P92000U.to_owned(),
        })
        .await;

    let reply = match reply {
        Ok(r) => r,
        Err(e) => {
            session.set_state(State::Closed).await;
            return Err(e);
        }
    };

    match reply {
        FCall::Rversion {
            msize: server_msize,
            version,
        } => {
            if version != P92000U {
                session.set_state(State::Closed).await;
                return Err(Error::Unsupported(format!(
                    "server does not speak {P92000U} (replied {version})"
                )));
            }
            session.set_msize(server_msize.min(msize)).await;
            session.set_state(State::Running).await;
            Ok(session)
        }
        other => {
            session.set_state(State::Closed).await;
            Err(Error::UnexpectedType {
                expected: "Rversion",
                actual: MsgType::from(&other),
            })
        }
    }
}

/// Default negotiation entry point, proposing `DEFAULT_MSIZE`.
pub async fn session_start_default<T>(
    stream: T,
) -> Result<Session<tokio::io::WriteHalf<T>>, Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    session_start(stream, DEFAULT_MSIZE).await
}

/// Tear a session down. 9P has no wire-level goodbye: the client simply stops
/// sending and shuts down the transport. `Session::close` moves the state to
/// `Closing`, fails every outstanding request with `ConnectionAborted` rather
/// than leaving it to time out, shuts the write half down, and joins the
/// receive worker before returning — so by the time this call returns the
/// request table is empty and the worker count has dropped to zero.
pub async fn session_close<W>(session: &Session<W>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    session.close().await;
}

fn expect(reply: FCall, expected: &'static str, matches: impl Fn(&FCall) -> bool) -> Result<FCall, Error> {
    if matches(&reply) {
        Ok(reply)
    } else {
        Err(Error::UnexpectedType {
            expected,
            actual: MsgType::from(&reply),
        })
    }
}

/// Fid reserved for the root attach, outside the ordinary allocator's
/// `[1, 0xFFFF]` range (spec.md §3, §4.3).
pub const ROOT_FID: u32 = 0;

/// Attach to an export, naming the user and the tree to mount. Returns the
/// root fid (always `ROOT_FID`, never drawn from the ordinary allocator) and
/// its qid.
pub async fn attach<W>(
    session: &Session<W>,
    uname: &str,
    aname: &str,
    uid: u32,
) -> Result<(u32, QId), Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let fid = ROOT_FID;
    let reply = session
        .send(FCall::Tattach {
            fid,
            afid: NOFID,
            uname: uname.to_owned(),
            aname: aname.to_owned(),
            n_uname: uid,
        })
        .await?;

    match reply {
        FCall::Rattach { qid } => Ok((fid, qid)),
        other => Err(Error::UnexpectedType {
            expected: "Rattach",
            actual: MsgType::from(&other),
        }),
    }
}

/// Walk one step from `fid`, yielding `newfid` bound to the target. `name =
/// None` is the zero-name clone form (`newfid` becomes an alias of `fid`, no
/// qid returned); `Some(name)` walks a single path component — the client
/// issues at most one name per walk to match POSIX name lookup, the same way
/// FreeBSD's `p9fs_client_proto.c` calls its walk primitive once per path
/// element rather than batching. A walk that the server refuses (`nwqid`
/// short of what was asked) is reported as a no-such-file server error and
/// `newfid` is released.
pub async fn walk<W>(
    session: &Session<W>,
    fid: u32,
    name: Option<&str>,
) -> Result<(u32, Option<QId>), Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let newfid = session.acquire_fid().await?;
    let wnames: Vec<String> = name.into_iter().map(|s| s.to_owned()).collect();
    let wanted = wnames.len();

    let reply = session
        .send(FCall::Twalk {
            fid,
            newfid,
            wnames,
        })
        .await;

    match reply {
        Ok(FCall::Rwalk { wqids }) if wqids.len() == wanted => {
            Ok((newfid, wqids.into_iter().next()))
        }
        Ok(FCall::Rwalk { .. }) => {
            session.release_fid(newfid).await;
            Err(Error::Server {
                errno: nix::errno::Errno::ENOENT as i32,
                ename: "no such file".to_owned(),
            })
        }
        Ok(other) => {
            session.release_fid(newfid).await;
            Err(Error::UnexpectedType {
                expected: "Rwalk",
                actual: MsgType::from(&other),
            })
        }
        Err(e) => {
            session.release_fid(newfid).await;
            Err(e)
        }
    }
}

/// Walk `path` (slash-separated, relative to `fid`) one component at a time,
/// issuing one `Twalk` per element and clunking each intermediate fid as soon
/// as the next hop succeeds. Returns the fid bound to the final element and
/// its qid (or `None` if `path` is empty, in which case the returned fid is a
/// bare clone of `fid` with no qid of its own to report).
pub async fn walk_path<W>(
    session: &Session<W>,
    fid: u32,
    path: &str,
) -> Result<(u32, Option<QId>), Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let names: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if names.is_empty() {
        return walk(session, fid, None).await;
    }

    let mut current = fid;
    let mut owns_current = false;
    let mut last_qid = None;

    for name in names {
        match walk(session, current, Some(name)).await {
            Ok((newfid, qid)) => {
                if owns_current {
                    let _ = clunk(session, current).await;
                }
                current = newfid;
                owns_current = true;
                last_qid = qid;
            }
            Err(e) => {
                if owns_current {
                    let _ = clunk(session, current).await;
                }
                return Err(e);
            }
        }
    }

    Ok((current, last_qid))
}

/// POSIX-ish open-mode flags accepted by `open`/`open_path`, named after the
/// FreeBSD `VOP_OPEN()` flags `p9fs_client_open` translates from — the
/// caller-facing input the wire's `OREAD`/`OWRITE`/`ORDWR`/`OTRUNC` bits are
/// derived from, not wire values themselves.
pub mod vop {
    pub const FREAD: u32 = 0x0001;
    pub const FWRITE: u32 = 0x0002;
    pub const O_TRUNC: u32 = 0x0400;
}

/// Convert `VOP_OPEN()`-style flags to a 9P2000 `Topen.mode` byte, the same
/// way `p9fs_client_open` derives `mode1` from `mode` before building
/// `Topen`: `FREAD|FWRITE` → `ORDWR`, `FREAD` alone → `OREAD`, `FWRITE` alone
/// → `OWRITE`, with `OTRUNC` added if `O_TRUNC` was requested.
fn to_wire_mode(flags: u32) -> u8 {
    let mut mode = if flags & (vop::FREAD | vop::FWRITE) == (vop::FREAD | vop::FWRITE) {
        om::ORDWR
    } else if flags & vop::FWRITE != 0 {
        om::OWRITE
    } else {
        om::OREAD
    };
    if flags & vop::O_TRUNC != 0 {
        mode |= om::OTRUNC;
    }
    mode
}

/// Open a fid for I/O, returning the server's qid and suggested `iounit`
/// (`0` meaning "no preference", per `Ropen`). `flags` is a `vop::FREAD` /
/// `vop::FWRITE` / `vop::O_TRUNC` combination, translated to the wire's
/// `OREAD`/`OWRITE`/`ORDWR`/`OTRUNC` before being sent.
pub async fn open<W>(session: &Session<W>, fid: u32, flags: u32) -> Result<(QId, u32), Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mode = to_wire_mode(flags);
    let reply = session.send(FCall::Topen { fid, mode }).await?;
    match expect(reply, "Ropen", |f| matches!(f, FCall::Ropen { .. }))? {
        FCall::Ropen { qid, iounit } => Ok((qid, iounit)),
        _ => unreachable!(),
    }
}

/// Walk to `path` under `root_fid` and open it, clunking the intermediate
/// fid if the open is refused — the same walk-then-open-then-clunk-on-failure
/// shape `cohsh`'s `open_with_qid` uses. `flags` is the same
/// `vop::FREAD`/`vop::FWRITE`/`vop::O_TRUNC` input `open` takes.
pub async fn open_path<W>(
    session: &Session<W>,
    root_fid: u32,
    path: &str,
    flags: u32,
) -> Result<(u32, QId, u32), Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (fid, _qid) = walk_path(session, root_fid, path).await?;
    match open(session, fid, flags).await {
        Ok((qid, iounit)) => Ok((fid, qid, iounit)),
        Err(e) => {
            let _ = clunk(session, fid).await;
            Err(e)
        }
    }
}

/// Header overhead of an `Rread`/`Twrite` frame (`size[4] type[1] tag[2]` plus
/// the operation's own fixed fields), used to cap a single read/write call at
/// what the negotiated `msize` can actually carry.
const RREAD_OVERHEAD: u32 = 4 + 1 + 2 + 4; // + count[4]
const TWRITE_OVERHEAD: u32 = 4 + 1 + 2 + 4 + 8 + 4; // + fid[4] offset[8] count[4]

/// A single `Tread`.
pub async fn read<W>(session: &Session<W>, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>, Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let reply = session
        .send(FCall::Tread {
            fid,
            offset,
            count,
        })
        .await?;
    match expect(reply, "Rread", |f| matches!(f, FCall::Rread { .. }))? {
        FCall::Rread { data } => Ok(data.0),
        _ => unreachable!(),
    }
}

/// Read `want` bytes starting at `offset`, issuing as many `Tread`s as the
/// negotiated `msize` requires. Stops early on a short read (EOF).
pub async fn read_all<W>(
    session: &Session<W>,
    fid: u32,
    offset: u64,
    want: u64,
) -> Result<Vec<u8>, Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let msize = session.msize().await;
    let chunk = msize.saturating_sub(RREAD_OVERHEAD).max(1);

    let mut out = Vec::with_capacity(want.min(1 << 20) as usize);
    let mut pos = offset;
    let mut remaining = want;

    while remaining > 0 {
        let this_count = (remaining.min(chunk as u64)) as u32;
        let bytes = read(session, fid, pos, this_count).await?;
        let got = bytes.len() as u64;
        out.extend_from_slice(&bytes);
        pos += got;
        remaining = remaining.saturating_sub(got);
        if got < this_count as u64 {
            break;
        }
    }
    Ok(out)
}

/// A single `Twrite`.
pub async fn write<W>(session: &Session<W>, fid: u32, offset: u64, data: &[u8]) -> Result<u32, Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let reply = session
        .send(FCall::Twrite {
            fid,
            offset,
            data: crate::fcall::Data(data.to_vec()),
        })
        .await?;
    match expect(reply, "Rwrite", |f| matches!(f, FCall::Rwrite { .. }))? {
        FCall::Rwrite { count } => Ok(count),
        _ => unreachable!(),
    }
}

/// Write all of `data` starting at `offset`, chunked to fit the negotiated
/// `msize`. Stops and reports a short write if a `Twrite` reports fewer bytes
/// accepted than were sent.
pub async fn write_all<W>(session: &Session<W>, fid: u32, offset: u64, data: &[u8]) -> Result<u64, Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let msize = session.msize().await;
    let chunk = msize.saturating_sub(TWRITE_OVERHEAD).max(1) as usize;

    let mut pos = offset;
    let mut written: u64 = 0;
    for piece in data.chunks(chunk) {
        let n = write(session, fid, pos, piece).await?;
        written += n as u64;
        pos += n as u64;
        if n as usize != piece.len() {
            break;
        }
    }
    Ok(written)
}

/// Release a fid. Per the protocol's own clunk contract, the fid is returned
/// to the allocator whether or not the server's reply is an error — the
/// server discards its side of the fid regardless (it never has anything
/// useful to say back besides "it wasn't open" cases that are already moot
/// from the client's point of view).
pub async fn clunk<W>(session: &Session<W>, fid: u32) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let reply = session.send(FCall::Tclunk { fid }).await;
    session.release_fid(fid).await;
    match reply {
        Ok(FCall::Rclunk) => Ok(()),
        Ok(other) => Err(Error::UnexpectedType {
            expected: "Rclunk",
            actual: MsgType::from(&other),
        }),
        Err(e) => Err(e),
    }
}

/// Fetch a fid's metadata.
pub async fn stat<W>(session: &Session<W>, fid: u32) -> Result<Stat, Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let reply = session.send(FCall::Tstat { fid }).await?;
    match expect(reply, "Rstat", |f| matches!(f, FCall::Rstat { .. }))? {
        FCall::Rstat { stat } => Ok(stat),
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::{Msg, QIdType};
    use crate::msgbuf::MessageBuffer;

    /// Answers `Twalk` with one `wqid` per requested name and `Tclunk` with
    /// `Rclunk`, so a test can drive `walk_path` over a real duplex transport
    /// and observe how many requests it actually issues.
    async fn mock_walk_server(mut server_io: tokio::io::DuplexStream) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        loop {
            let mut header = [0u8; 4];
            if server_io.read_exact(&mut header).await.is_err() {
                return;
            }
            let len = u32::from_le_bytes(header) as usize - 4;
            let mut body = vec![0u8; len];
            if server_io.read_exact(&mut body).await.is_err() {
                return;
            }
            let mut reader = &body[..];
            let msg = crate::serialize::read_msg(&mut reader).unwrap();

            let reply_body = match msg.body {
                FCall::Twalk { wnames, .. } => FCall::Rwalk {
                    wqids: (0..wnames.len())
                        .map(|i| QId {
                            typ: QIdType::empty(),
                            version: 0,
                            path: i as u64,
                        })
                        .collect(),
                },
                FCall::Tclunk { .. } => FCall::Rclunk,
                other => panic!("unexpected request: {other:?}"),
            };

            let reply = Msg {
                tag: msg.tag,
                body: reply_body,
            };
            let mut scratch = MessageBuffer::new();
            crate::serialize::write_msg(&mut scratch.writer(), &reply).unwrap();
            let frame = scratch.finalize();
            if server_io.write_all(&frame[..]).await.is_err() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn walk_path_issues_one_twalk_per_path_component() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_io);
        let session = Session::new(read_half, write_half, DEFAULT_MSIZE);
        session.set_state(State::Running).await;

        let server = tokio::spawn(mock_walk_server(server_io));

        let root_fid = session.acquire_fid().await.unwrap();
        let (fid, qid) = walk_path(&session, root_fid, "a/b").await.unwrap();

        assert_ne!(fid, root_fid, "walk_path must hand back a fresh fid");
        assert_eq!(qid.unwrap().path, 0, "last hop's single wqid comes through");

        server.abort();
    }

    #[tokio::test]
    async fn walk_path_of_empty_string_sends_a_zero_name_clone_walk() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_io);
        let session = Session::new(read_half, write_half, DEFAULT_MSIZE);
        session.set_state(State::Running).await;

        let server = tokio::spawn(mock_walk_server(server_io));

        let root_fid = session.acquire_fid().await.unwrap();
        let (fid, qid) = walk_path(&session, root_fid, "").await.unwrap();

        assert_ne!(fid, root_fid);
        assert!(qid.is_none());

        server.abort();
    }
}
