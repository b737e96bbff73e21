//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000.u

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000.u version string. This is the only version string the client ever proposes.
pub const P92000U: &str = "9P2000.u";

/// The version string the server returns when it doesn't understand ours.
pub const VERSION_UNKNOWN: &str = "unknown";

/// Special tag which `Tversion`/`Rversion` must use as `tag`.
pub const NOTAG: u16 = 0xFFFF;

/// Special value which `Tattach` with no auth must use as `afid`.
pub const NOFID: u32 = 0xFFFFFFFF;

/// Default proposed msize: MAXPHYS (128 KiB, the common value) plus the 7-byte header.
pub const DEFAULT_MSIZE: u32 = (128 * 1024) + 7;

/// Minimum legal frame size: `size[4] type[1] tag[2]`.
pub const MIN_MSIZE: u32 = 7;

/// Open mode bits (`stat.mode` and `Topen.mode` share the low byte).
pub mod om {
    pub const OREAD: u8 = 0;
    pub const OWRITE: u8 = 1;
    pub const ORDWR: u8 = 2;
    pub const OEXEC: u8 = 3;
    pub const OTRUNC: u8 = 0x10;
    pub const ORCLOSE: u8 = 0x40;
}

bitflags! {
    /// Bits in `stat.mode` (upper byte: file-type flags; lower 9 bits: POSIX rwx).
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct DmBits: u32 {
        const DMDIR       = 0x80000000;
        const DMAPPEND    = 0x40000000;
        const DMEXCL      = 0x20000000;
        const DMAUTH      = 0x08000000;
        const DMTMP       = 0x04000000;
        const DMSYMLINK   = 0x02000000;
        const DMDEVICE    = 0x00800000;
        const DMSOCKET    = 0x00100000;
        const DMNAMEDPIPE = 0x00200000;
    }
}

bitflags! {
    /// Bits in `Qid.typ`.
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QIdType: u8 {
        const DIR    = 0x80;
        const APPEND = 0x40;
        const EXCL   = 0x20;
        const AUTH   = 0x08;
        const TMP    = 0x04;
        const LINK   = 0x02;
        const FILE   = 0x00;
    }
}

/// Server-assigned file identity: 1-byte type, 4-byte version, 8-byte path.
///
/// Equality of QIDs implies identity of the underlying server file.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct QId {
    pub typ: QIdType,
    pub version: u32,
    pub path: u64,
}

impl QId {
    pub const SIZE: u32 = 1 + 4 + 8;
}

/// 9P2000.u `stat` record: the base 9P2000 fields followed by the `.u` suffix
/// (`extension`, `n_uid`, `n_gid`, `n_muid`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    pub typ: u16,
    pub dev: u32,
    pub qid: QId,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
    pub extension: String,
    pub n_uid: u32,
    pub n_gid: u32,
    pub n_muid: u32,
}

impl Stat {
    /// Size of the encoded record, not counting the leading `size[2]` field itself.
    pub fn size(&self) -> u16 {
        (2 + 4
            + QId::SIZE
            + 4
            + 4
            + 4
            + 8
            + (2 + self.name.len())
            + (2 + self.uid.len())
            + (2 + self.gid.len())
            + (2 + self.muid.len())
            + (2 + self.extension.len())
            + 4
            + 4
            + 4) as u16
    }

    /// Derive the file type, preferring the QID type bits and falling back to the
    /// `DM*` bits in `mode`.
    pub fn is_dir(&self) -> bool {
        self.qid.typ.contains(QIdType::DIR) || DmBits::from_bits_truncate(self.mode).contains(DmBits::DMDIR)
    }

    pub fn is_symlink(&self) -> bool {
        self.qid.typ.contains(QIdType::LINK) || DmBits::from_bits_truncate(self.mode).contains(DmBits::DMSYMLINK)
    }
}

/// Data carried by `Rread`/`Twrite`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    #[doc = "Message type, 9P2000.u operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        Tversion = 100,
        Rversion,
        Tauth,
        Rauth,
        Tattach,
        Rattach,
        // Terror = 106 is illegal, never used.
        Rerror = 107,
        Tflush,
        Rflush,
        Twalk,
        Rwalk,
        Topen,
        Ropen,
        Tcreate,
        Rcreate,
        Tread,
        Rread,
        Twrite,
        Rwrite,
        Tclunk,
        Rclunk,
        Tremove,
        Rremove,
        Tstat,
        Rstat,
        Twstat,
        Rwstat,
    }
}

impl MsgType {
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    pub fn is_r(&self) -> bool {
        use MsgType::*;
        matches!(
            *self,
            Rversion
                | Rauth
                | Rattach
                | Rerror
                | Rflush
                | Rwalk
                | Ropen
                | Rcreate
                | Rread
                | Rwrite
                | Rclunk
                | Rremove
                | Rstat
                | Rwstat
        )
    }
}

impl<'a> From<&'a FCall> for MsgType {
    fn from(fcall: &'a FCall) -> MsgType {
        match *fcall {
            FCall::Tversion { .. } => MsgType::Tversion,
            FCall::Rversion { .. } => MsgType::Rversion,
            FCall::Tauth { .. } => MsgType::Tauth,
            FCall::Rauth { .. } => MsgType::Rauth,
            FCall::Tattach { .. } => MsgType::Tattach,
            FCall::Rattach { .. } => MsgType::Rattach,
            FCall::Rerror { .. } => MsgType::Rerror,
            FCall::Tflush { .. } => MsgType::Tflush,
            FCall::Rflush => MsgType::Rflush,
            FCall::Twalk { .. } => MsgType::Twalk,
            FCall::Rwalk { .. } => MsgType::Rwalk,
            FCall::Topen { .. } => MsgType::Topen,
            FCall::Ropen { .. } => MsgType::Ropen,
            FCall::Tcreate { .. } => MsgType::Tcreate,
            FCall::Rcreate { .. } => MsgType::Rcreate,
            FCall::Tread { .. } => MsgType::Tread,
            FCall::Rread { .. } => MsgType::Rread,
            FCall::Twrite { .. } => MsgType::Twrite,
            FCall::Rwrite { .. } => MsgType::Rwrite,
            FCall::Tclunk { .. } => MsgType::Tclunk,
            FCall::Rclunk => MsgType::Rclunk,
            FCall::Tremove { .. } => MsgType::Tremove,
            FCall::Rremove => MsgType::Rremove,
            FCall::Tstat { .. } => MsgType::Tstat,
            FCall::Rstat { .. } => MsgType::Rstat,
            FCall::Twstat { .. } => MsgType::Twstat,
            FCall::Rwstat => MsgType::Rwstat,
        }
    }
}

/// A data type encapsulating the 9P2000.u messages. The full message set is
/// represented here so the codec round-trips all of it; only a subset (version,
/// attach, walk, open, read, write, clunk, stat) has a client procedure in
/// `client.rs`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    Tversion {
        msize: u32,
        version: String,
    },
    Rversion {
        msize: u32,
        version: String,
    },
    Tauth {
        afid: u32,
        uname: String,
        aname: String,
        n_uname: u32,
    },
    Rauth {
        aqid: QId,
    },
    Tattach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
        n_uname: u32,
    },
    Rattach {
        qid: QId,
    },
    Rerror {
        ename: String,
        errno: u32,
    },
    Tflush {
        oldtag: u16,
    },
    Rflush,
    Twalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    Rwalk {
        wqids: Vec<QId>,
    },
    Topen {
        fid: u32,
        mode: u8,
    },
    Ropen {
        qid: QId,
        iounit: u32,
    },
    Tcreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
    },
    Rcreate {
        qid: QId,
        iounit: u32,
    },
    Tread {
        fid: u32,
        offset: u64,
        count: u32,
    },
    Rread {
        data: Data,
    },
    Twrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    Rwrite {
        count: u32,
    },
    Tclunk {
        fid: u32,
    },
    Rclunk,
    Tremove {
        fid: u32,
    },
    Rremove,
    Tstat {
        fid: u32,
    },
    Rstat {
        stat: Stat,
    },
    Twstat {
        fid: u32,
        stat: Stat,
    },
    Rwstat,
}

impl FCall {
    /// Fids referenced by this message body, for bookkeeping by the caller.
    pub fn fids(&self) -> Vec<u32> {
        match *self {
            FCall::Tattach { afid, .. } if afid != NOFID => vec![afid],
            FCall::Twalk { fid, .. } => vec![fid],
            FCall::Topen { fid, .. } => vec![fid],
            FCall::Tcreate { fid, .. } => vec![fid],
            FCall::Tread { fid, .. } => vec![fid],
            FCall::Twrite { fid, .. } => vec![fid],
            FCall::Tclunk { fid } => vec![fid],
            FCall::Tremove { fid } => vec![fid],
            FCall::Tstat { fid } => vec![fid],
            FCall::Twstat { fid, .. } => vec![fid],
            _ => Vec::new(),
        }
    }
}

/// Envelope for a 9P message: the client-chosen tag plus the body.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    pub tag: u16,
    pub body: FCall,
}
