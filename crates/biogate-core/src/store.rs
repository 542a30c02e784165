//! Template persistence seam.
//!
//! The engine never writes templates itself: enrollment and update return a
//! proposed template and the caller hands it to [`TemplateStore::propose`].

use crate::types::{EnrolledTemplate, Identity};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("version conflict for {identity}: stored v{stored}, proposed v{proposed}")]
    Conflict { identity: Identity, stored: u32, proposed: u32 },
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Read access to enrolled templates plus a write path for accepted proposals.
pub trait TemplateStore: Send + Sync {
    fn fetch(&self, identity: &Identity) -> Result<Option<EnrolledTemplate>, StoreError>;

    /// Persist a template produced by enrollment or update. Implementations
    /// reject a proposal whose version does not advance the stored one.
    fn propose(&self, template: &EnrolledTemplate) -> Result<(), StoreError>;

    fn remove(&self, identity: &Identity) -> Result<bool, StoreError>;
}

/// In-process template store.
#[derive(Debug, Default)]
pub struct MemoryTemplateStore {
    templates: RwLock<HashMap<Identity, EnrolledTemplate>>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }
}

impl TemplateStore for MemoryTemplateStore {
    fn fetch(&self, identity: &Identity) -> Result<Option<EnrolledTemplate>, StoreError> {
        Ok(self.templates.read().get(identity).cloned())
    }

    fn propose(&self, template: &EnrolledTemplate) -> Result<(), StoreError> {
        let mut templates = self.templates.write();
        if let Some(stored) = templates.get(&template.identity) {
            if template.version <= stored.version {
                return Err(StoreError::Conflict {
                    identity: template.identity.clone(),
                    stored: stored.version,
                    proposed: template.version,
                });
            }
        }
        templates.insert(template.identity.clone(), template.clone());
        Ok(())
    }

    fn remove(&self, identity: &Identity) -> Result<bool, StoreError> {
        Ok(self.templates.write().remove(identity).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FaceEncoding;
    use chrono::Utc;
    use uuid::Uuid;

    fn template(identity: &str, version: u32) -> EnrolledTemplate {
        EnrolledTemplate {
            id: Uuid::new_v4(),
            identity: identity.into(),
            face: FaceEncoding::new(vec![0.1, 0.2]),
            voice: None,
            version,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_propose_and_fetch() {
        let store = MemoryTemplateStore::new();
        assert!(store.fetch(&"alice".into()).unwrap().is_none());
        store.propose(&template("alice", 1)).unwrap();
        assert_eq!(store.fetch(&"alice".into()).unwrap().unwrap().version, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_stale_version_conflicts() {
        let store = MemoryTemplateStore::new();
        store.propose(&template("bob", 2)).unwrap();
        assert_eq!(
            store.propose(&template("bob", 2)),
            Err(StoreError::Conflict { identity: "bob".into(), stored: 2, proposed: 2 })
        );
        store.propose(&template("bob", 3)).unwrap();
        assert_eq!(store.fetch(&"bob".into()).unwrap().unwrap().version, 3);
    }

    #[test]
    fn test_remove() {
        let store = MemoryTemplateStore::new();
        store.propose(&template("carol", 1)).unwrap();
        assert!(store.remove(&"carol".into()).unwrap());
        assert!(!store.remove(&"carol".into()).unwrap());
        assert!(store.is_empty());
    }
}
