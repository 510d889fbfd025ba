use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Verification level supplied by upstream auth middleware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    None,
    Basic,
    Verified,
}

impl TrustTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustTier::None => "none",
            TrustTier::Basic => "basic",
            TrustTier::Verified => "verified",
        }
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(TrustTier::None),
            "basic" => Ok(TrustTier::Basic),
            "verified" => Ok(TrustTier::Verified),
            other => Err(anyhow::anyhow!("Unknown trust tier: {}", other)),
        }
    }
}

/// Authenticated-request context handed in by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityContext {
    pub identity_id: String,
    pub trust_tier: TrustTier,
    pub is_authenticated: bool,
}

impl IdentityContext {
    pub fn authenticated(identity_id: impl Into<String>, trust_tier: TrustTier) -> Self {
        Self {
            identity_id: identity_id.into(),
            trust_tier,
            is_authenticated: true,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            identity_id: String::new(),
            trust_tier: TrustTier::None,
            is_authenticated: false,
        }
    }
}

/// Key under which quota and breaker state is tracked.
///
/// Users and client IPs live in separate key spaces so an IP can never
/// collide with a user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentityKey {
    User(String),
    Ip(IpAddr),
}

impl IdentityKey {
    pub fn resolve(context: &IdentityContext, client_ip: IpAddr) -> Self {
        if context.is_authenticated && !context.identity_id.is_empty() {
            IdentityKey::User(context.identity_id.clone())
        } else {
            IdentityKey::Ip(client_ip)
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, IdentityKey::User(_))
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::User(id) => write!(f, "user:{}", id),
            IdentityKey::Ip(ip) => write!(f, "ip:{}", ip),
        }
    }
}
