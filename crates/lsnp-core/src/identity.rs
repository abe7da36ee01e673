//! Peer identity — the `name@ipv4` form every header field uses.
//!
//! The name is chosen at setup and is not authenticated; the IP is the
//! sender's outbound interface address. The pair is the registry key: the
//! same name on a different IP is a different peer.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// A peer identifier: `name@A.B.C.D`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId {
    name: String,
    ip: Ipv4Addr,
}

impl UserId {
    pub fn new(name: impl Into<String>, ip: Ipv4Addr) -> Result<Self, IdentityError> {
        let name = name.into();
        if name.is_empty() {
            return Err(IdentityError::EmptyName);
        }
        if name.contains('@') || name.contains('|') || name.contains(char::is_whitespace) {
            return Err(IdentityError::BadName(name));
        }
        Ok(Self { name, ip })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.ip)
    }
}

impl FromStr for UserId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split on the LAST '@' so a future name charset can't smuggle one in.
        let (name, ip) = s
            .rsplit_once('@')
            .ok_or_else(|| IdentityError::MissingAt(s.to_string()))?;
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| IdentityError::BadIp(ip.to_string()))?;
        UserId::new(name, ip)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("user id {0:?} has no '@' separator")]
    MissingAt(String),

    #[error("user id has empty name")]
    EmptyName,

    #[error("user name {0:?} contains a reserved character")]
    BadName(String),

    #[error("user id has invalid IPv4 address {0:?}")]
    BadIp(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let id: UserId = "alice@192.168.1.10".parse().unwrap();
        assert_eq!(id.name(), "alice");
        assert_eq!(id.ip(), Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(id.to_string(), "alice@192.168.1.10");
    }

    #[test]
    fn same_name_different_ip_is_different_peer() {
        let a: UserId = "alice@192.168.1.10".parse().unwrap();
        let b: UserId = "alice@192.168.1.99".parse().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_garbage() {
        assert!("alice".parse::<UserId>().is_err());
        assert!("alice@not-an-ip".parse::<UserId>().is_err());
        assert!("@192.168.1.10".parse::<UserId>().is_err());
        assert!("al ice@192.168.1.10".parse::<UserId>().is_err());
        assert!("a|b@192.168.1.10".parse::<UserId>().is_err());
    }
}
