use specta::Type;

use crate::error::SupervisorError;

/// Token → identity lookup owned by whoever handles login.
pub trait IdentityResolver: Send + Sync {
    /// Friendly user name for a session token, if it maps to an allowed user.
    fn identity_for(&self, token: &str) -> Option<String>;
    fn is_admin(&self, token: &str) -> bool;
}

/// The caller of a supervisor operation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, Type)]
pub struct Requester {
    pub user: String,
    pub is_admin: bool,
}

impl Requester {
    pub fn new(user: impl Into<String>, is_admin: bool) -> Self {
        Self {
            user: user.into(),
            is_admin,
        }
    }

    pub fn resolve(
        resolver: &dyn IdentityResolver,
        token: Option<&str>,
    ) -> Result<Self, SupervisorError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(SupervisorError::Unauthorized)?;
        let user = resolver
            .identity_for(token)
            .ok_or(SupervisorError::Unauthorized)?;
        Ok(Self::new(user, resolver.is_admin(token)))
    }

    pub fn require_admin(&self) -> Result<(), SupervisorError> {
        if self.is_admin {
            Ok(())
        } else {
            Err(SupervisorError::Unauthorized)
        }
    }
}
