//! Resolved staff identity, handed in by the external authenticator.

use serde::{Deserialize, Serialize};

/// A staff profile as resolved by the identity-check collaborator.
///
/// The engine never performs the check itself; it only consumes the
/// resolved object, using `email` for copy-recipient resolution and
/// `is_admin` as the single gate on bulk operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffIdentity {
    /// Display name.
    pub name: String,
    /// Fixed-format staff identifier (6-digit numeric).
    pub id: String,
    /// Staff mailbox, when the directory has one.
    pub email: Option<String>,
    /// Whether the administrator view is available to this profile.
    pub is_admin: bool,
}

impl StaffIdentity {
    /// Construct an identity object (normally done by the host layer).
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            email: None,
            is_admin: false,
        }
    }

    /// Attach a staff mailbox.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Mark the profile as an administrator.
    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }
}
