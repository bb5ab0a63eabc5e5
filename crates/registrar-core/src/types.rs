//! Core types for the user-location registry

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Expiry value marking a contact deleted but not yet swept
pub const EXPIRED_TIME: i64 = 10;

/// q-value of a contact registered without one
pub const Q_UNSPECIFIED: f32 = -1.0;

/// Supported-methods bitmap meaning "all methods"
pub const ALL_METHODS: u32 = 0xFFFF_FFFF;

// ============ Clock ============

/// Logical clock the registry compares expiry values against
pub trait Clock: Send + Sync {
    /// Current time in seconds since the Unix epoch
    fn now(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Clock moved by hand, for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ============ Sockets ============

/// SIP transport protocols
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
    Sctp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
            Transport::Ws => "ws",
            Transport::Wss => "wss",
            Transport::Sctp => "sctp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Some(Transport::Udp),
            "tcp" => Some(Transport::Tcp),
            "tls" => Some(Transport::Tls),
            "ws" => Some(Transport::Ws),
            "wss" => Some(Transport::Wss),
            "sctp" => Some(Transport::Sctp),
            _ => None,
        }
    }
}

/// A local listening socket, owned by the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketInfo {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
}

impl SocketInfo {
    pub fn new(transport: Transport, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
        }
    }

    /// Canonical `proto:host:port` form stored in the socket column
    pub fn sock_str(&self) -> String {
        format!("{}:{}:{}", self.transport.as_str(), self.host, self.port)
    }

    /// Parse `proto:host:port`; IPv6 hosts may be bracketed
    pub fn parse(s: &str) -> Option<Self> {
        let (proto, rest) = s.split_once(':')?;
        let transport = Transport::parse(proto)?;
        let (host, port) = rest.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let port = port.parse().ok()?;
        Some(Self::new(transport, host, port))
    }
}

impl fmt::Display for SocketInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sock_str())
    }
}

/// Reference to a socket; the registry never owns socket lifetime
pub type SocketRef = Arc<SocketInfo>;

/// Resolves a stored socket string back to a registered local socket
pub trait SocketResolver: Send + Sync {
    fn resolve(&self, sock_str: &str) -> Option<SocketRef>;
}

/// Resolver over a fixed list of sockets
#[derive(Debug, Default, Clone)]
pub struct StaticSocketResolver {
    sockets: Vec<SocketRef>,
}

impl StaticSocketResolver {
    pub fn new(sockets: Vec<SocketInfo>) -> Self {
        Self {
            sockets: sockets.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn get(&self, sock_str: &str) -> Option<SocketRef> {
        self.resolve(sock_str)
    }
}

impl SocketResolver for StaticSocketResolver {
    fn resolve(&self, sock_str: &str) -> Option<SocketRef> {
        let wanted = SocketInfo::parse(sock_str)?;
        self.sockets.iter().find(|s| ***s == wanted).cloned()
    }
}

// ============ Contacts ============

/// Persistence state of a contact
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContactState {
    /// Not yet written to the store
    New,
    /// Identical to the stored row
    Sync,
    /// Modified since the last store write
    Dirty,
}

impl ContactState {
    /// Whether a row for this contact exists in the store
    pub fn is_persisted(&self) -> bool {
        !matches!(self, ContactState::New)
    }
}

/// One device binding of an address-of-record
#[derive(Debug, Clone)]
pub struct Contact {
    /// Domain table the contact lives in
    pub domain: String,

    /// Address-of-record the contact belongs to
    pub aor: String,

    /// Contact URI
    pub uri: String,

    pub callid: String,
    pub cseq: u32,

    /// Preference weight
    pub q: f32,

    /// Absolute expiry, 0 for permanent
    pub expires: i64,

    pub last_modified: i64,

    /// Source address when behind NAT
    pub received: Option<String>,

    /// Path header (RFC 3327)
    pub path: Option<String>,

    pub user_agent: String,

    /// Supported-methods bitmap
    pub methods: u32,

    /// Internal flags
    pub flags: u32,

    /// Custom branch flags
    pub cflags: u32,

    /// Socket the registration was received on
    pub socket: Option<SocketRef>,

    /// Record-unique id
    pub ruid: String,

    /// `+sip.instance` value (RFC 5626)
    pub instance: Option<String>,

    pub reg_id: u32,

    pub(crate) state: ContactState,
}

impl Contact {
    pub fn state(&self) -> ContactState {
        self.state
    }

    /// Permanent contacts never expire
    pub fn is_permanent(&self) -> bool {
        self.expires == 0
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires != 0 && self.expires <= now
    }

    /// Usable for routing at `now`
    pub fn is_valid(&self, now: i64) -> bool {
        !self.is_expired(now)
    }
}

/// Registration data applied to a contact on insert or update
#[derive(Debug, Clone)]
pub struct ContactInfo {
    /// New contact URI; only applied on update when an instance is present
    pub uri: Option<String>,
    pub expires: i64,
    pub q: f32,
    pub callid: Option<String>,
    pub cseq: u32,
    pub user_agent: String,
    pub received: Option<String>,
    pub path: Option<String>,
    pub socket: Option<SocketRef>,
    pub methods: u32,
    pub flags: u32,
    pub cflags: u32,
    /// Generated on insert when absent
    pub ruid: Option<String>,
    pub instance: Option<String>,
    pub reg_id: u32,
    pub last_modified: i64,
}

impl Default for ContactInfo {
    fn default() -> Self {
        Self {
            uri: None,
            expires: 0,
            q: Q_UNSPECIFIED,
            callid: None,
            cseq: 0,
            user_agent: String::new(),
            received: None,
            path: None,
            socket: None,
            methods: ALL_METHODS,
            flags: 0,
            cflags: 0,
            ruid: None,
            instance: None,
            reg_id: 0,
            last_modified: 0,
        }
    }
}

impl ContactInfo {
    /// Info for a registration with the given expiry and sequence data
    pub fn new(expires: i64, callid: impl Into<String>, cseq: u32) -> Self {
        Self {
            expires,
            callid: Some(callid.into()),
            cseq,
            ..Default::default()
        }
    }

    pub fn with_q(mut self, q: f32) -> Self {
        self.q = q;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>, reg_id: u32) -> Self {
        self.instance = Some(instance.into());
        self.reg_id = reg_id;
        self
    }

    pub fn with_ruid(mut self, ruid: impl Into<String>) -> Self {
        self.ruid = Some(ruid.into());
        self
    }

    pub fn with_received(mut self, received: impl Into<String>) -> Self {
        self.received = Some(received.into());
        self
    }

    pub fn with_socket(mut self, socket: SocketRef) -> Self {
        self.socket = Some(socket);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_last_modified(mut self, last_modified: i64) -> Self {
        self.last_modified = last_modified;
        self
    }
}

/// Result of matching a request against a record's contacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Matching contact, identified by ruid
    Found(String),
    NotFound,
    /// Older CSeq than stored, the request must be rejected
    Invalid,
    /// Retransmission of the last accepted request
    Skip,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_roundtrip() {
        let sock = SocketInfo::new(Transport::Udp, "10.0.0.1", 5060);
        assert_eq!(sock.sock_str(), "udp:10.0.0.1:5060");
        assert_eq!(SocketInfo::parse("udp:10.0.0.1:5060"), Some(sock));
        assert_eq!(
            SocketInfo::parse("tcp:[2001:db8::1]:5061").map(|s| s.host),
            Some("[2001:db8::1]".to_string())
        );
        assert!(SocketInfo::parse("bogus").is_none());
        assert!(SocketInfo::parse("xyz:1.2.3.4:5060").is_none());
    }

    #[test]
    fn test_static_resolver() {
        let resolver = StaticSocketResolver::new(vec![SocketInfo::new(
            Transport::Tcp,
            "192.168.1.1",
            5060,
        )]);
        assert!(resolver.resolve("tcp:192.168.1.1:5060").is_some());
        assert!(resolver.resolve("udp:192.168.1.1:5060").is_none());
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(30);
        assert_eq!(clock.now(), 1_030);
        clock.set(5);
        assert_eq!(clock.now(), 5);
    }

    #[test]
    fn test_expiry_rules() {
        let info = ContactInfo::new(0, "cid", 1);
        let contact = Contact {
            domain: "location".into(),
            aor: "alice".into(),
            uri: "sip:alice@h".into(),
            callid: info.callid.clone().unwrap_or_default(),
            cseq: info.cseq,
            q: info.q,
            expires: 0,
            last_modified: 0,
            received: None,
            path: None,
            user_agent: String::new(),
            methods: ALL_METHODS,
            flags: 0,
            cflags: 0,
            socket: None,
            ruid: "r1".into(),
            instance: None,
            reg_id: 0,
            state: ContactState::New,
        };
        assert!(contact.is_permanent());
        assert!(!contact.is_expired(i64::MAX));

        let expiring = Contact {
            expires: 100,
            ..contact
        };
        assert!(expiring.is_valid(99));
        assert!(expiring.is_expired(100));
    }
}
