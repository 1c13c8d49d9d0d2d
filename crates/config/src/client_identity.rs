//! Runtime client identity type.
//!
//! Authentication happens before admission control. Whatever layer authenticates
//! the caller stores this type in the request extensions, and the admission layer
//! reads the principal and its group from there.

/// Represents the authenticated principal and its group membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// The principal identifier (e.g., user ID, API key ID)
    pub client_id: String,
    /// The group the principal belongs to (e.g., "default", "vip")
    pub group: Option<String>,
}

impl ClientIdentity {
    /// Create an identity for a principal with an optional group.
    pub fn new(client_id: impl Into<String>, group: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            group,
        }
    }
}
