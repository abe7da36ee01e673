//! Capability tokens — scope tags, not credentials.
//!
//! A token is `user_id|expires_epoch|scope`, minted by the sender and
//! attached to every scoped frame. It is not signed: the protocol assumes a
//! cooperative LAN, and the token's job is to declare which frame family
//! the sender intends, with an expiry so captured traffic goes stale.
//!
//! The only state is the revocation set: once a REVOKE for a user id is
//! seen, every token naming that user checks as revoked regardless of
//! expiry.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashSet;

use crate::identity::UserId;

/// Clock skew tolerated when checking expiry. Peers are assumed loosely
/// NTP-synchronized; a token is still honored this many seconds past its
/// stated expiry.
pub const CLOCK_SKEW_SECS: u64 = 30;

// ── Scope ─────────────────────────────────────────────────────────────────────

/// Which frame family a token authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Broadcast,
    Chat,
    Presence,
    File,
    Game,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Broadcast => "broadcast",
            Scope::Chat => "chat",
            Scope::Presence => "presence",
            Scope::File => "file",
            Scope::Game => "game",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "broadcast" => Ok(Scope::Broadcast),
            "chat" => Ok(Scope::Chat),
            "presence" => Ok(Scope::Presence),
            "file" => Ok(Scope::File),
            "game" => Ok(Scope::Game),
            other => Err(TokenError::UnknownScope(other.to_string())),
        }
    }
}

// ── Token ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub user_id: UserId,
    pub expires_at: u64,
    pub scope: Scope,
}

/// Outcome of checking a parsed token against a required scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Valid,
    Expired,
    ScopeMismatch,
    Revoked,
}

impl Token {
    /// Mint a token for `user_id` expiring `ttl_secs` from now.
    pub fn mint(user_id: UserId, scope: Scope, ttl_secs: u64) -> Self {
        Self {
            user_id,
            expires_at: now_epoch() + ttl_secs,
            scope,
        }
    }

    /// Check scope, expiry (with skew tolerance), and revocation. Order
    /// matters only for reporting; any failure means the frame is dropped.
    pub fn check(&self, required: Scope, now: u64, revoked: &RevocationSet) -> TokenStatus {
        if revoked.contains(&self.user_id) {
            return TokenStatus::Revoked;
        }
        if self.scope != required {
            return TokenStatus::ScopeMismatch;
        }
        if now > self.expires_at + CLOCK_SKEW_SECS {
            return TokenStatus::Expired;
        }
        TokenStatus::Valid
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.user_id, self.expires_at, self.scope)
    }
}

impl FromStr for Token {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('|');
        let (user, expiry, scope) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(u), Some(e), Some(sc), None) => (u, e, sc),
            _ => return Err(TokenError::Malformed(s.to_string())),
        };
        let user_id: UserId = user
            .parse()
            .map_err(|_| TokenError::Malformed(s.to_string()))?;
        let expires_at: u64 = expiry
            .parse()
            .map_err(|_| TokenError::Malformed(s.to_string()))?;
        let scope: Scope = scope.parse()?;
        Ok(Token {
            user_id,
            expires_at,
            scope,
        })
    }
}

/// Seconds since the Unix epoch. Token expiry must compare across hosts,
/// so this is wall clock, not a monotonic instant.
pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Revocation ────────────────────────────────────────────────────────────────

/// User ids whose tokens are no longer honored. Shared across the dispatcher
/// and presence tasks; grows only, cleared on restart.
#[derive(Debug, Clone, Default)]
pub struct RevocationSet {
    revoked: Arc<DashSet<UserId>>,
}

impl RevocationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self, user_id: UserId) -> bool {
        self.revoked.insert(user_id)
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.revoked.contains(user_id)
    }

    pub fn len(&self) -> usize {
        self.revoked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token {0:?}")]
    Malformed(String),

    #[error("unknown scope {0:?}")]
    UnknownScope(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserId {
        "alice@192.168.1.10".parse().unwrap()
    }

    #[test]
    fn serialize_parse_round_trip() {
        let token = Token {
            user_id: alice(),
            expires_at: 1_700_000_000,
            scope: Scope::File,
        };
        let s = token.to_string();
        assert_eq!(s, "alice@192.168.1.10|1700000000|file");
        assert_eq!(s.parse::<Token>().unwrap(), token);
    }

    #[test]
    fn check_matrix() {
        let revoked = RevocationSet::new();
        let token = Token {
            user_id: alice(),
            expires_at: 1000,
            scope: Scope::Chat,
        };

        assert_eq!(token.check(Scope::Chat, 999, &revoked), TokenStatus::Valid);
        assert_eq!(
            token.check(Scope::File, 999, &revoked),
            TokenStatus::ScopeMismatch
        );
        assert_eq!(
            token.check(Scope::Chat, 1000 + CLOCK_SKEW_SECS + 1, &revoked),
            TokenStatus::Expired
        );
    }

    #[test]
    fn skew_tolerance_window() {
        let revoked = RevocationSet::new();
        let token = Token {
            user_id: alice(),
            expires_at: 1000,
            scope: Scope::Presence,
        };
        // Just inside the skew window: still valid.
        assert_eq!(
            token.check(Scope::Presence, 1000 + CLOCK_SKEW_SECS, &revoked),
            TokenStatus::Valid
        );
    }

    #[test]
    fn revocation_overrides_everything() {
        let revoked = RevocationSet::new();
        revoked.revoke(alice());
        let token = Token {
            user_id: alice(),
            expires_at: u64::MAX - CLOCK_SKEW_SECS,
            scope: Scope::Chat,
        };
        assert_eq!(token.check(Scope::Chat, 0, &revoked), TokenStatus::Revoked);
    }

    #[test]
    fn malformed_tokens_rejected() {
        assert!("".parse::<Token>().is_err());
        assert!("alice@1.2.3.4|notanumber|chat".parse::<Token>().is_err());
        assert!("alice@1.2.3.4|123|warp".parse::<Token>().is_err());
        assert!("alice@1.2.3.4|123|chat|extra".parse::<Token>().is_err());
        assert!("nobody|123|chat".parse::<Token>().is_err());
    }

    #[test]
    fn mint_sets_future_expiry() {
        let token = Token::mint(alice(), Scope::Game, 3600);
        assert!(token.expires_at > now_epoch());
        assert_eq!(token.scope, Scope::Game);
    }
}
