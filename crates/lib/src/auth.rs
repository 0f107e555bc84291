//! Identity probe and user profile.
//!
//! Any failure of the probe degrades to a guest identity; it is never surfaced as an error.

use crate::history::{HistoryClient, UserClaim, UserInfo};

const EMAIL_CLAIM: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress";
const GUEST_NAME: &str = "User";
const GUEST_EMAIL: &str = "user@email.com";

/// Profile derived from the identity claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub fullname: String,
    pub firstname: String,
    pub email: String,
    pub preferred_username: String,
}

impl User {
    pub fn guest() -> Self {
        Self {
            fullname: GUEST_NAME.to_string(),
            firstname: GUEST_NAME.to_string(),
            email: GUEST_EMAIL.to_string(),
            preferred_username: GUEST_EMAIL.to_string(),
        }
    }

    /// Placeholder identities used by test deployments; never stamped on messages.
    pub fn is_dummy(&self) -> bool {
        self.fullname.eq_ignore_ascii_case("dummy") || self.email.eq_ignore_ascii_case("dummy")
    }

    /// Greeting shown above an empty chat ("Hi, Jane!" or "Hi!").
    pub fn greeting(&self) -> String {
        if self.firstname.is_empty() {
            "Hi!".to_string()
        } else {
            format!("Hi, {}!", self.firstname)
        }
    }
}

/// Result of the identity probe.
#[derive(Debug, Clone)]
pub struct Identity {
    pub claims: Vec<UserInfo>,
    /// True when the probe itself failed and `claims` is the built-in guest claim set.
    pub is_guest: bool,
}

impl Identity {
    /// No claim sets at all means the deployment has no identity provider configured.
    /// Loopback deployments are exempt.
    pub fn needs_auth_setup(&self, loopback: bool) -> bool {
        self.claims.is_empty() && !loopback
    }

    pub fn user(&self) -> User {
        define_user(&self.claims)
    }
}

fn guest_claims() -> Vec<UserInfo> {
    vec![UserInfo {
        user_claims: vec![
            UserClaim {
                typ: EMAIL_CLAIM.to_string(),
                val: "sample_user_email_schema@email.com".to_string(),
            },
            UserClaim {
                typ: "name".to_string(),
                val: GUEST_NAME.to_string(),
            },
            UserClaim {
                typ: "preferred_username".to_string(),
                val: "sample_user_email_preferred@email.com".to_string(),
            },
        ],
        ..UserInfo::default()
    }]
}

/// Probe `/.auth/me`. Errors are logged and replaced with the guest claim set.
pub async fn fetch_identity(client: &HistoryClient) -> Identity {
    match client.user_info().await {
        Ok(claims) => Identity {
            claims,
            is_guest: false,
        },
        Err(e) => {
            log::warn!("identity probe failed, continuing as guest: {}", e);
            Identity {
                claims: guest_claims(),
                is_guest: true,
            }
        }
    }
}

fn claim<'a>(info: &'a UserInfo, typ: &str) -> Option<&'a str> {
    info.user_claims
        .iter()
        .find(|c| c.typ == typ)
        .map(|c| c.val.as_str())
        .filter(|v| !v.trim().is_empty())
}

/// Build the profile from the first claim set. Directory names come as "Last, First"
/// and are turned around to "First Last".
pub fn define_user(claims: &[UserInfo]) -> User {
    let Some(info) = claims.first() else {
        return User::guest();
    };
    let name = claim(info, "name").unwrap_or(GUEST_NAME);
    let (firstname, fullname) = match name.split_once(',') {
        Some((last, first)) if !first.trim().is_empty() => {
            let first = first.trim();
            (first.to_string(), format!("{} {}", first, last.trim()))
        }
        _ => {
            let name = name.trim();
            let first = name.split_whitespace().next().unwrap_or(GUEST_NAME);
            (first.to_string(), name.to_string())
        }
    };
    User {
        fullname,
        firstname,
        email: claim(info, EMAIL_CLAIM).unwrap_or(GUEST_EMAIL).to_string(),
        preferred_username: claim(info, "preferred_username")
            .unwrap_or(GUEST_EMAIL)
            .to_string(),
    }
}
