//! Shared types between the kernel driver and the userspace agent
//!
//! This crate defines the ringbuffer record layout that the driver emits and
//! the agent consumes. Everything here must be:
//! - `#[repr(C)]` for a stable memory layout across the ABI boundary
//! - `no_std` compatible (the driver side links against core only)
//!
//! The driver emits one `RawEvent` per syscall event. Field presence depends
//! on the event type; absent fields are zeroed and surfaced as `None` by the
//! agent-side extractor.

#![cfg_attr(not(feature = "userspace"), no_std)]

/// Event type ordinals, mirroring the driver's event table.
///
/// Names follow the syscall-name convention used by the driver: a trailing
/// `>` marks the enter event, a trailing `<` the exit event. Only exit
/// events carry a result code and fd info.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    ConnectEnter = 0,
    ConnectExit = 1,
    AcceptEnter = 2,
    AcceptExit = 3,
    CloseEnter = 4,
    CloseExit = 5,
    ShutdownEnter = 6,
    ShutdownExit = 7,
    ListenEnter = 8,
    ListenExit = 9,
    GetsockoptEnter = 10,
    GetsockoptExit = 11,
    ExecveEnter = 12,
    ExecveExit = 13,
}

/// Upper bound on event type ordinals; sized with headroom so the dispatch
/// bitmap does not need to change when the driver grows new events.
pub const MAX_EVENT_TYPES: usize = 32;

impl EventType {
    /// Resolve a driver ordinal to an event type.
    pub fn from_ordinal(ordinal: u16) -> Option<Self> {
        Some(match ordinal {
            0 => Self::ConnectEnter,
            1 => Self::ConnectExit,
            2 => Self::AcceptEnter,
            3 => Self::AcceptExit,
            4 => Self::CloseEnter,
            5 => Self::CloseExit,
            6 => Self::ShutdownEnter,
            7 => Self::ShutdownExit,
            8 => Self::ListenEnter,
            9 => Self::ListenExit,
            10 => Self::GetsockoptEnter,
            11 => Self::GetsockoptExit,
            12 => Self::ExecveEnter,
            13 => Self::ExecveExit,
            _ => return None,
        })
    }

    pub const fn ordinal(self) -> u16 {
        self as u16
    }

    /// Driver-convention name, e.g. `"connect<"` for the connect exit event.
    pub const fn name(self) -> &'static str {
        match self {
            Self::ConnectEnter => "connect>",
            Self::ConnectExit => "connect<",
            Self::AcceptEnter => "accept>",
            Self::AcceptExit => "accept<",
            Self::CloseEnter => "close>",
            Self::CloseExit => "close<",
            Self::ShutdownEnter => "shutdown>",
            Self::ShutdownExit => "shutdown<",
            Self::ListenEnter => "listen>",
            Self::ListenExit => "listen<",
            Self::GetsockoptEnter => "getsockopt>",
            Self::GetsockoptExit => "getsockopt<",
            Self::ExecveEnter => "execve>",
            Self::ExecveExit => "execve<",
        }
    }

    /// Resolve a driver-convention name (`"accept<"`) to an event type.
    pub fn from_name(name: &str) -> Option<Self> {
        let mut ordinal = 0u16;
        while let Some(ty) = Self::from_ordinal(ordinal) {
            if ty.name() == name {
                return Some(ty);
            }
            ordinal += 1;
        }
        None
    }

    /// True for syscall-exit events (the only ones carrying `res` and fd info).
    pub const fn is_exit(self) -> bool {
        self.ordinal() & 1 == 1
    }
}

/// `RawFdInfo::role` values.
pub const FD_ROLE_NONE: u8 = 0;
pub const FD_ROLE_CLIENT: u8 = 1;
pub const FD_ROLE_SERVER: u8 = 2;

/// `RawFdInfo::l4proto` values (driver-internal numbering, not IPPROTO_*).
pub const FD_L4_NONE: u8 = 0;
pub const FD_L4_TCP: u8 = 1;
pub const FD_L4_UDP: u8 = 2;
pub const FD_L4_OTHER: u8 = 3;

/// `RawFdInfo::family` values.
pub const FD_FAMILY_NONE: u8 = 0;
pub const FD_FAMILY_V4: u8 = 4;
pub const FD_FAMILY_V6: u8 = 6;

pub const COMM_LEN: usize = 16;
pub const EXE_LEN: usize = 128;
pub const ARGS_LEN: usize = 128;

/// Socket fd information attached to network syscall exit events.
///
/// Addresses are in network byte order. For `family == FD_FAMILY_V4` only
/// the first four bytes of each address are meaningful. The client side is
/// the connection initiator, the server side the listener, regardless of
/// which side this process is on; `role` says which one is local.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RawFdInfo {
    pub role: u8,
    pub l4proto: u8,
    pub family: u8,
    pub _pad: u8,
    pub client_port: u16,
    pub server_port: u16,
    pub client_addr: [u8; 16],
    pub server_addr: [u8; 16],
}

/// One ringbuffer record.
///
/// `cpu` identifies the per-CPU ringbuffer partition the event came from;
/// ordering is only guaranteed within a partition. `comm`, `exe` and `args`
/// are NUL-padded; `args` separates arguments with NUL bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RawEvent {
    pub event_type: u16,
    pub cpu: u16,
    pub tid: u32,
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
    pub _reserved: u32,
    pub ts_ns: u64,
    pub res: i64,
    pub container_start_ts: u64,
    pub fd: RawFdInfo,
    pub comm: [u8; COMM_LEN],
    pub exe: [u8; EXE_LEN],
    pub args: [u8; ARGS_LEN],
}

impl RawFdInfo {
    pub const fn zeroed() -> Self {
        Self {
            role: FD_ROLE_NONE,
            l4proto: FD_L4_NONE,
            family: FD_FAMILY_NONE,
            _pad: 0,
            client_port: 0,
            server_port: 0,
            client_addr: [0; 16],
            server_addr: [0; 16],
        }
    }
}

impl RawEvent {
    /// An all-absent record; the driver never emits one, but the extractor
    /// treats zeroed fields as absent so this is a convenient test base.
    pub const fn zeroed() -> Self {
        Self {
            event_type: 0,
            cpu: 0,
            tid: 0,
            pid: 0,
            uid: 0,
            gid: 0,
            _reserved: 0,
            ts_ns: 0,
            res: 0,
            container_start_ts: 0,
            fd: RawFdInfo::zeroed(),
            comm: [0; COMM_LEN],
            exe: [0; EXE_LEN],
            args: [0; ARGS_LEN],
        }
    }
}

const _: () = {
    assert!(
        core::mem::size_of::<RawFdInfo>() == 40,
        "RawFdInfo must be exactly 40 bytes"
    );
    assert!(
        core::mem::size_of::<RawEvent>() == 360,
        "RawEvent must be exactly 360 bytes"
    );
    assert!(
        core::mem::align_of::<RawEvent>() == 8,
        "RawEvent must be 8-byte aligned"
    );
};
