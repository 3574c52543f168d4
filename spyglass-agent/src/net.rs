//! Network address and connection identity model
//!
//! Value types for everything the trackers key on: addresses, endpoints,
//! connection tuples and container-attributed connections. Identity (`Eq` +
//! `Hash`) is always over the full value, and the `Ord` derives give deltas
//! a deterministic order in outbound messages.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use spyglass_common::{FD_FAMILY_V4, FD_FAMILY_V6};

/// An IP address in network byte order.
///
/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are normalized to IPv4 at
/// construction so the two spellings share one identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl Address {
    pub fn from_v4_octets(octets: [u8; 4]) -> Self {
        Self::V4(Ipv4Addr::from(octets))
    }

    pub fn from_v6_octets(octets: [u8; 16]) -> Self {
        let addr = Ipv6Addr::from(octets);
        match addr.to_ipv4_mapped() {
            Some(v4) => Self::V4(v4),
            None => Self::V6(addr),
        }
    }

    /// Decode from a driver fd record: family selector plus a 16-byte buffer
    /// of which only the first 4 bytes are meaningful for IPv4.
    pub fn from_raw(family: u8, octets: &[u8; 16]) -> Option<Self> {
        match family {
            FD_FAMILY_V4 => Some(Self::from_v4_octets([
                octets[0], octets[1], octets[2], octets[3],
            ])),
            FD_FAMILY_V6 => Some(Self::from_v6_octets(*octets)),
            _ => None,
        }
    }

    /// Decode from the wire encoding: 4 or 16 network-order bytes.
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            4 => Some(Self::from_v4_octets([bytes[0], bytes[1], bytes[2], bytes[3]])),
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(bytes);
                Some(Self::from_v6_octets(octets))
            }
            _ => None,
        }
    }

    pub fn to_wire(self) -> Vec<u8> {
        match self {
            Self::V4(a) => a.octets().to_vec(),
            Self::V6(a) => a.octets().to_vec(),
        }
    }

    pub fn is_loopback(&self) -> bool {
        match self {
            Self::V4(a) => a.is_loopback(),
            Self::V6(a) => a.is_loopback(),
        }
    }

    pub fn is_unspecified(&self) -> bool {
        match self {
            Self::V4(a) => a.is_unspecified(),
            Self::V6(a) => a.is_unspecified(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(a) => write!(f, "{}", a),
            Self::V6(a) => write!(f, "{}", a),
        }
    }
}

/// One side of a connection. `address == None` means the driver did not
/// report one; `port == 0` is legal (ephemeral, pre-bind).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub address: Option<Address>,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: Address, port: u16) -> Self {
        Self {
            address: Some(address),
            port,
        }
    }

    pub fn unbound(port: u16) -> Self {
        Self {
            address: None,
            port,
        }
    }

    /// True when there is no usable address: absent or all-zero.
    pub fn is_unspecified(&self) -> bool {
        match self.address {
            Some(addr) => addr.is_unspecified(),
            None => true,
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.address.is_some_and(|a| a.is_loopback())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(Address::V6(a)) => write!(f, "[{}]:{}", a, self.port),
            Some(Address::V4(a)) => write!(f, "{}:{}", a, self.port),
            None => write!(f, "*:{}", self.port),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum L4Proto {
    Tcp,
    Udp,
    Other,
}

impl fmt::Display for L4Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::Other => write!(f, "OTHER"),
        }
    }
}

/// Which side of the tuple the observed process is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Client,
    Server,
}

/// A connection with client and server identified at ingest from kernel fd
/// info. The tuple is always stored client/server, never from/to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionTuple {
    pub client: Endpoint,
    pub server: Endpoint,
    pub proto: L4Proto,
    pub role: Role,
}

impl ConnectionTuple {
    /// The endpoint on this host.
    pub fn local(&self) -> &Endpoint {
        match self.role {
            Role::Client => &self.client,
            Role::Server => &self.server,
        }
    }

    /// The endpoint on the other host (or other process).
    pub fn remote(&self) -> &Endpoint {
        match self.role {
            Role::Client => &self.server,
            Role::Server => &self.client,
        }
    }
}

/// Deduplication identity for the connection tracker: the full struct.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Connection {
    pub container_id: String,
    pub tuple: ConnectionTuple,
}

impl Connection {
    pub fn new(container_id: impl Into<String>, tuple: ConnectionTuple) -> Self {
        Self {
            container_id: container_id.into(),
            tuple,
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.tuple.role {
            Role::Client => "client",
            Role::Server => "server",
        };
        write!(
            f,
            "[{}] {} -> {} {} {}",
            self.container_id, self.tuple.client, self.tuple.server, self.tuple.proto, role
        )
    }
}

/// Process owning a bound socket at observation time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessInfo {
    pub name: String,
    pub exe_path: String,
    pub args: String,
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
    pub container_start_ts: u64,
}

// Wire conversions. The protobuf encoding is the only serialized form the
// model crosses, so round-tripping through these must preserve identity.

impl Endpoint {
    pub fn to_proto(self) -> spyglass_proto::Endpoint {
        spyglass_proto::Endpoint {
            address: self.address.map(Address::to_wire).unwrap_or_default(),
            port: u32::from(self.port),
        }
    }

    pub fn from_proto(msg: &spyglass_proto::Endpoint) -> Self {
        Self {
            address: Address::from_wire(&msg.address),
            port: msg.port as u16,
        }
    }
}

impl L4Proto {
    pub fn to_proto(self) -> spyglass_proto::L4Protocol {
        match self {
            Self::Tcp => spyglass_proto::L4Protocol::Tcp,
            Self::Udp => spyglass_proto::L4Protocol::Udp,
            Self::Other => spyglass_proto::L4Protocol::Unknown,
        }
    }

    pub fn from_proto(proto: spyglass_proto::L4Protocol) -> Self {
        match proto {
            spyglass_proto::L4Protocol::Tcp => Self::Tcp,
            spyglass_proto::L4Protocol::Udp => Self::Udp,
            spyglass_proto::L4Protocol::Unknown => Self::Other,
        }
    }
}

impl Connection {
    pub fn to_proto(&self) -> spyglass_proto::Connection {
        spyglass_proto::Connection {
            container_id: self.container_id.clone(),
            client: Some(self.tuple.client.to_proto()),
            server: Some(self.tuple.server.to_proto()),
            protocol: self.tuple.proto.to_proto() as i32,
            role: match self.tuple.role {
                Role::Client => spyglass_proto::Role::Client,
                Role::Server => spyglass_proto::Role::Server,
            } as i32,
        }
    }

    pub fn from_proto(msg: &spyglass_proto::Connection) -> Option<Self> {
        let role = match spyglass_proto::Role::try_from(msg.role).ok()? {
            spyglass_proto::Role::Client => Role::Client,
            spyglass_proto::Role::Server => Role::Server,
            spyglass_proto::Role::Unknown => return None,
        };
        let proto = L4Proto::from_proto(spyglass_proto::L4Protocol::try_from(msg.protocol).ok()?);
        Some(Self {
            container_id: msg.container_id.clone(),
            tuple: ConnectionTuple {
                client: Endpoint::from_proto(msg.client.as_ref()?),
                server: Endpoint::from_proto(msg.server.as_ref()?),
                proto,
                role,
            },
        })
    }
}

impl ProcessInfo {
    pub fn to_proto(&self) -> spyglass_proto::ProcessInfo {
        spyglass_proto::ProcessInfo {
            name: self.name.clone(),
            exe_path: self.exe_path.clone(),
            args: self.args.clone(),
            pid: self.pid,
            uid: self.uid,
            gid: self.gid,
            container_start_ts: self.container_start_ts,
        }
    }
}
