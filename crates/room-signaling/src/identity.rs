use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The local participant's addressable handle.
///
/// `primary` is the locally issued alias used on the wire; `canonical` is the
/// registry identifier, present once the identity has been reconciled against
/// durable storage. Either form addresses the same participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    primary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    canonical: Option<String>,
}

impl Identity {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            canonical: None,
        }
    }

    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn with_canonical(mut self, canonical: impl Into<String>) -> Self {
        self.canonical = Some(canonical.into());
        self
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn canonical(&self) -> Option<&str> {
        self.canonical.as_deref()
    }

    /// True when `id` names this participant in either representation.
    pub fn matches(&self, id: &str) -> bool {
        id == self.primary || self.canonical.as_deref() == Some(id)
    }
}

pub trait IdentityProvider: Send + Sync {
    fn current_identity(&self) -> Identity;
}

impl IdentityProvider for Identity {
    fn current_identity(&self) -> Identity {
        self.clone()
    }
}

/// Process-wide identity that may be refreshed after construction.
#[derive(Debug)]
pub struct SharedIdentity {
    current: RwLock<Identity>,
}

impl SharedIdentity {
    pub fn new(identity: Identity) -> Self {
        Self {
            current: RwLock::new(identity),
        }
    }

    /// Attach the canonical identifier once the identity store has confirmed it.
    pub fn reconcile(&self, canonical: impl Into<String>) {
        let canonical = canonical.into();
        let mut guard = self.current.write();
        tracing::debug!(
            primary = %guard.primary,
            canonical = %canonical,
            "identity reconciled"
        );
        guard.canonical = Some(canonical);
    }

    pub fn replace(&self, identity: Identity) {
        *self.current.write() = identity;
    }
}

impl IdentityProvider for SharedIdentity {
    fn current_identity(&self) -> Identity {
        self.current.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_either_representation() {
        let identity = Identity::new("alias-1").with_canonical("user-42");
        assert!(identity.matches("alias-1"));
        assert!(identity.matches("user-42"));
        assert!(!identity.matches("someone-else"));
    }

    #[test]
    fn reconcile_adds_canonical_form() {
        let shared = SharedIdentity::new(Identity::new("alias-1"));
        assert!(!shared.current_identity().matches("user-42"));
        shared.reconcile("user-42");
        let current = shared.current_identity();
        assert_eq!(current.primary(), "alias-1");
        assert_eq!(current.canonical(), Some("user-42"));
        assert!(current.matches("user-42"));
    }

    #[test]
    fn generated_identities_are_distinct() {
        assert_ne!(Identity::generate(), Identity::generate());
    }
}
