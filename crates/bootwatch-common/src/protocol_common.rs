use std::{backtrace::Backtrace, io};

use bytemuck::{Pod, Zeroable};
use snafu::Snafu;

/// Align `x` up to the next multiple of 2^`align_pow` bytes.
#[inline]
pub const fn align_up_pow2(num_bytes: usize, align_pow: u32) -> usize {
    let align = 1usize << align_pow; // the actual alignment
    (num_bytes + (align - 1)/* round up */) & !(align - 1/* truncate down */)
}

// netlink messages are padded out to 4 bytes
pub const NLMSG_ALIGN_SHIFT: u32 = 2;

/// `struct inotify_event` without the trailing flexible name.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Zeroable, Pod)]
pub struct InotifyEventHeader {
    pub wd: i32,
    pub mask: u32,
    pub cookie: u32,
    pub name_len: u32, // bytes of NUL-padded name following the header
}

/// `struct nlmsghdr`
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Zeroable, Pod)]
pub struct NlMsgHeader {
    pub len: u32, // includes this header
    pub ty: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

/// `struct ifaddrmsg`
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Zeroable, Pod)]
pub struct IfAddrMsgHeader {
    pub family: u8,
    pub prefix_len: u8,
    pub flags: u8,
    pub scope: u8,
    pub index: i32,
}

/// `struct rtattr`
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Zeroable, Pod)]
pub struct RtAttrHeader {
    pub len: u16, // includes this header
    pub ty: u16,
}

pub const INOTIFY_EVENT_HDR_LEN: usize = size_of::<InotifyEventHeader>();
pub const NLMSG_HDR_LEN: usize = size_of::<NlMsgHeader>();
pub const IFADDRMSG_LEN: usize = size_of::<IfAddrMsgHeader>();
pub const RTATTR_HDR_LEN: usize = size_of::<RtAttrHeader>();

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum WatchError {
    #[snafu(display("kernel resource error in {op}: {source}"))]
    KernelResource {
        op: &'static str,
        source: io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("malformed record at offset {offset}: {reason}"))]
    MalformedRecord {
        offset: usize,
        reason: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("read failed {attempts} times in a row: {source}"))]
    ReadRetriesExhausted {
        attempts: u32,
        source: io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("watch session is closed"))]
    SessionClosed { backtrace: Backtrace },
    #[snafu(display("event stream was already taken from this session"))]
    EventsTaken { backtrace: Backtrace },
    #[snafu(display("reader task failed: {source}"))]
    ReaderJoin {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
}

impl WatchError {
    /// Descriptor creation, bind or (de)registration failure.
    pub fn is_kernel_resource(&self) -> bool {
        matches!(
            self,
            WatchError::KernelResource { .. }
                | WatchError::ReadRetriesExhausted { .. }
        )
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, WatchError::MalformedRecord { .. })
    }
}
