//! Connection identity: a coarse device fingerprint taken from the
//! user-agent, and the policy deciding which origin addresses get admin
//! rights.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OsFamily {
    Windows,
    #[serde(rename = "macOS")]
    MacOs,
    Linux,
    Android,
    #[serde(rename = "iOS")]
    Ios,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BrowserFamily {
    Firefox,
    Edge,
    Opera,
    Chrome,
    Safari,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub os: OsFamily,
    pub browser: BrowserFamily,
}

/// Derives the OS and browser family from a raw user-agent string.
///
/// Mobile platforms are checked before the desktop ones they embed
/// (Android agents contain "Linux", iOS agents contain "Mac OS"), and Edge
/// and Opera before Chrome for the same reason.
pub fn resolve_device(user_agent: &str) -> DeviceInfo {
    let os = if user_agent.contains("Windows") {
        OsFamily::Windows
    } else if user_agent.contains("Android") {
        OsFamily::Android
    } else if user_agent.contains("iPhone") || user_agent.contains("iPad") {
        OsFamily::Ios
    } else if user_agent.contains("Mac OS") {
        OsFamily::MacOs
    } else if user_agent.contains("Linux") {
        OsFamily::Linux
    } else {
        OsFamily::Unknown
    };

    let browser = if user_agent.contains("Firefox") {
        BrowserFamily::Firefox
    } else if user_agent.contains("Edg/") {
        BrowserFamily::Edge
    } else if user_agent.contains("OPR") || user_agent.contains("Opera") {
        BrowserFamily::Opera
    } else if user_agent.contains("Chrome") {
        BrowserFamily::Chrome
    } else if user_agent.contains("Safari") {
        BrowserFamily::Safari
    } else {
        BrowserFamily::Unknown
    };

    DeviceInfo { os, browser }
}

/// Folds IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) back to IPv4 so
/// ban lists and admin checks see one form per host.
pub fn canonical_ip(addr: IpAddr) -> IpAddr {
    addr.to_canonical()
}

/// Stand-in origin for connections whose peer address is unknown.
pub const UNKNOWN_ORIGIN: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Decides whether a connection from `addr` gets admin rights
/// (ghost observing, closing any room, listing all rooms).
pub trait AuthorizationPolicy: Send + Sync {
    fn is_admin(&self, addr: IpAddr) -> bool;
}

/// The machine running the server is the admin.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackPolicy;

impl AuthorizationPolicy for LoopbackPolicy {
    fn is_admin(&self, addr: IpAddr) -> bool {
        canonical_ip(addr).is_loopback()
    }
}

/// Loopback plus an explicit set of addresses.
#[derive(Debug, Clone, Default)]
pub struct AllowListPolicy {
    addrs: HashSet<IpAddr>,
}

impl AllowListPolicy {
    pub fn new(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addrs: addrs.into_iter().map(canonical_ip).collect(),
        }
    }
}

impl AuthorizationPolicy for AllowListPolicy {
    fn is_admin(&self, addr: IpAddr) -> bool {
        let addr = canonical_ip(addr);
        addr.is_loopback() || self.addrs.contains(&addr)
    }
}
