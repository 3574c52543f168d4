//! Event extractor facade
//!
//! Pulls named fields out of a `RawEvent` without allocating on the hot
//! path. Accessors return `None` when the field is not present on that
//! event type; string accessors borrow from the event buffer and stay valid
//! until the next event read into the same slot.

use std::sync::Arc;

use spyglass_common::{EventType, RawEvent, FD_L4_TCP, FD_L4_UDP, FD_ROLE_CLIENT, FD_ROLE_SERVER};

use crate::containers::ContainerLookup;
use crate::net::{Address, Endpoint, L4Proto, ProcessInfo, Role};

/// Decoded socket fd info from an exit event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdInfo {
    pub role: Option<Role>,
    pub proto: L4Proto,
    pub client: Endpoint,
    pub server: Endpoint,
}

pub struct EventExtractor {
    containers: Arc<dyn ContainerLookup>,
}

impl EventExtractor {
    pub fn new(containers: Arc<dyn ContainerLookup>) -> Self {
        Self { containers }
    }

    pub fn event_type(&self, evt: &RawEvent) -> Option<EventType> {
        EventType::from_ordinal(evt.event_type)
    }

    /// Syscall result; only exit events carry one.
    pub fn res(&self, evt: &RawEvent) -> Option<i64> {
        match self.event_type(evt) {
            Some(ty) if ty.is_exit() => Some(evt.res),
            _ => None,
        }
    }

    pub fn ts_nanos(&self, evt: &RawEvent) -> u64 {
        evt.ts_ns
    }

    pub fn ts_micros(&self, evt: &RawEvent) -> u64 {
        evt.ts_ns / 1_000
    }

    /// Container id of the emitting thread; `None` for host processes.
    pub fn container_id(&self, evt: &RawEvent) -> Option<String> {
        self.containers.container_id_for(evt.tid)
    }

    pub fn comm<'e>(&self, evt: &'e RawEvent) -> Option<&'e str> {
        cstr(&evt.comm)
    }

    pub fn exe<'e>(&self, evt: &'e RawEvent) -> Option<&'e str> {
        cstr(&evt.exe)
    }

    /// Argument vector joined with spaces. Allocates; not used on filter
    /// paths, only when building originator process info.
    pub fn args(&self, evt: &RawEvent) -> String {
        let len = evt
            .args
            .iter()
            .rposition(|&b| b != 0)
            .map(|p| p + 1)
            .unwrap_or(0);
        String::from_utf8_lossy(&evt.args[..len])
            .split('\0')
            .filter(|a| !a.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Socket info, absent on events without a socket fd.
    pub fn fd_info(&self, evt: &RawEvent) -> Option<FdInfo> {
        let fd = &evt.fd;
        let role = match fd.role {
            FD_ROLE_CLIENT => Some(Role::Client),
            FD_ROLE_SERVER => Some(Role::Server),
            _ => None,
        };
        let proto = match fd.l4proto {
            FD_L4_TCP => L4Proto::Tcp,
            FD_L4_UDP => L4Proto::Udp,
            _ => L4Proto::Other,
        };

        // Family none means the fd was not a socket (or the driver could
        // not resolve it); nothing to extract.
        let client_addr = Address::from_raw(fd.family, &fd.client_addr)?;
        let server_addr = Address::from_raw(fd.family, &fd.server_addr);

        Some(FdInfo {
            role,
            proto,
            client: Endpoint::new(client_addr, fd.client_port),
            server: match server_addr {
                Some(addr) => Endpoint::new(addr, fd.server_port),
                None => Endpoint::unbound(fd.server_port),
            },
        })
    }

    /// Process info of the emitting thread, for endpoint originators.
    pub fn process_info(&self, evt: &RawEvent) -> ProcessInfo {
        ProcessInfo {
            name: self.comm(evt).unwrap_or_default().to_string(),
            exe_path: self.exe(evt).unwrap_or_default().to_string(),
            args: self.args(evt),
            pid: evt.pid,
            uid: evt.uid,
            gid: evt.gid,
            container_start_ts: evt.container_start_ts,
        }
    }
}

/// NUL-padded fixed buffer to `&str`; `None` when empty or not UTF-8.
fn cstr(buf: &[u8]) -> Option<&str> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    if end == 0 {
        return None;
    }
    std::str::from_utf8(&buf[..end]).ok()
}
