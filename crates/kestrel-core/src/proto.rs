//! Wire messages exchanged with a coordinator node.
//!
//! Both directions are protobuf messages with proto2-style optional fields,
//! derived with `prost` so no `.proto` compilation step is needed. Each frame
//! on the wire carries exactly one encoded message; framing itself lives in
//! the client crate.

use prost::Message;

/// Response flag bits.
pub mod flag {
    /// The frame carries a deliverable value.
    pub const VALID: i32 = 1;
    /// The frame is the last one for its tag.
    pub const DONE: i32 = 1 << 1;
    /// The event describes a write.
    pub const SET: i32 = 1 << 2;
    /// The event describes a delete.
    pub const DEL: i32 = 1 << 3;
}

/// Operation requested from the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Verb {
    Get = 1,
    Set = 2,
    Del = 3,
    Rev = 5,
    Nop = 7,
    Watch = 8,
    Walk = 9,
    Cancel = 10,
    Getdir = 14,
    Stat = 16,
}

impl Verb {
    /// Whether requests with this verb produce an open-ended stream of
    /// responses rather than a single one.
    pub fn is_streaming(self) -> bool {
        matches!(self, Verb::Watch | Verb::Walk | Verb::Getdir)
    }
}

/// Error codes reported by the remote end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrCode {
    Other = 127,
    TagInUse = 1,
    UnknownVerb = 2,
    Redirect = 3,
    TooLate = 4,
    RevMismatch = 5,
    BadPath = 6,
    MissingArg = 7,
    Notdir = 20,
    Isdir = 21,
    Noent = 22,
}

/// A request frame. The `tag` is assigned by the connection that sends it.
#[derive(Clone, PartialEq, Message)]
pub struct Request {
    #[prost(int32, optional, tag = "1")]
    pub tag: Option<i32>,
    #[prost(enumeration = "Verb", optional, tag = "2")]
    pub verb: Option<i32>,
    #[prost(string, optional, tag = "4")]
    pub path: Option<String>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub value: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "6")]
    pub other_tag: Option<i32>,
    #[prost(int32, optional, tag = "7")]
    pub offset: Option<i32>,
    #[prost(int32, optional, tag = "8")]
    pub limit: Option<i32>,
    #[prost(int64, optional, tag = "9")]
    pub rev: Option<i64>,
}

impl Request {
    /// An empty request for `verb`.
    pub fn new(verb: Verb) -> Self {
        Self {
            verb: Some(verb as i32),
            ..Default::default()
        }
    }

    pub fn get(path: &str, rev: Option<i64>) -> Self {
        Self {
            path: Some(path.to_string()),
            rev,
            ..Self::new(Verb::Get)
        }
    }

    pub fn set(path: &str, old_rev: i64, body: &[u8]) -> Self {
        Self {
            path: Some(path.to_string()),
            rev: Some(old_rev),
            value: Some(body.to_vec()),
            ..Self::new(Verb::Set)
        }
    }

    pub fn del(path: &str, rev: i64) -> Self {
        Self {
            path: Some(path.to_string()),
            rev: Some(rev),
            ..Self::new(Verb::Del)
        }
    }

    pub fn stat(path: &str, rev: Option<i64>) -> Self {
        Self {
            path: Some(path.to_string()),
            rev,
            ..Self::new(Verb::Stat)
        }
    }

    pub fn current_rev() -> Self {
        Self::new(Verb::Rev)
    }

    pub fn nop() -> Self {
        Self::new(Verb::Nop)
    }

    pub fn watch(glob: &str, from_rev: Option<i64>) -> Self {
        Self {
            path: Some(glob.to_string()),
            rev: from_rev,
            ..Self::new(Verb::Watch)
        }
    }

    pub fn walk(glob: &str, rev: Option<i64>, offset: Option<i32>, limit: Option<i32>) -> Self {
        Self {
            path: Some(glob.to_string()),
            rev,
            offset,
            limit,
            ..Self::new(Verb::Walk)
        }
    }

    pub fn getdir(path: &str, offset: i32, limit: i32, rev: Option<i64>) -> Self {
        Self {
            path: Some(path.to_string()),
            rev,
            offset: Some(offset),
            limit: Some(limit),
            ..Self::new(Verb::Getdir)
        }
    }

    /// Ask the remote end to stop the stream running under `other_tag`.
    pub fn cancel(other_tag: i32) -> Self {
        Self {
            other_tag: Some(other_tag),
            ..Self::new(Verb::Cancel)
        }
    }

    /// The decoded verb, if it is one this client knows.
    pub fn known_verb(&self) -> Option<Verb> {
        self.verb.and_then(|v| Verb::try_from(v).ok())
    }
}

/// A response frame, correlated to its request by `tag`.
#[derive(Clone, PartialEq, Message)]
pub struct Response {
    #[prost(int32, optional, tag = "1")]
    pub tag: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub flags: Option<i32>,
    #[prost(int64, optional, tag = "3")]
    pub rev: Option<i64>,
    #[prost(string, optional, tag = "5")]
    pub path: Option<String>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub value: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "8")]
    pub len: Option<i32>,
    #[prost(enumeration = "ErrCode", optional, tag = "100")]
    pub err_code: Option<i32>,
    #[prost(string, optional, tag = "101")]
    pub err_detail: Option<String>,
}

impl Response {
    pub fn flag_bits(&self) -> i32 {
        self.flags.unwrap_or_default()
    }

    pub fn has_flag(&self, bit: i32) -> bool {
        self.flag_bits() & bit != 0
    }

    /// Whether the remote reported that another node should be used.
    pub fn is_redirect(&self) -> bool {
        self.err_code == Some(ErrCode::Redirect as i32)
    }
}
