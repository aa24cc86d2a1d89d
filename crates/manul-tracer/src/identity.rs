//! Stable message identities across calls
//!
//! Chat clients resend the whole conversation on every call. To store each
//! turn once, a turn seen again with the same role, position and content gets
//! the identifier it was given the first time.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{MessageContent, Role};

/// Key a turn is recognised by
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    role: Role,
    position: usize,
    digest: [u8; 32],
}

impl MessageKey {
    /// Build the key for a turn at `position`
    pub fn new(role: &Role, content: Option<&MessageContent>, position: usize) -> Self {
        Self {
            role: role.clone(),
            position,
            digest: content_digest(content),
        }
    }
}

/// Hex SHA-256 of the canonical content, as stored alongside each message
pub fn content_hash(content: Option<&MessageContent>) -> String {
    hex::encode(content_digest(content))
}

fn content_digest(content: Option<&MessageContent>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    // variant tag keeps text from colliding with a block list rendering to the same JSON
    match content {
        Some(MessageContent::Text(text)) => {
            hasher.update([1u8]);
            hasher.update(text.as_bytes());
        }
        Some(parts @ MessageContent::Parts(_)) => {
            hasher.update([2u8]);
            hasher.update(parts.canonical().as_bytes());
        }
        None => hasher.update([0u8]),
    }
    hasher.finalize().into()
}

/// Session-scoped cache of message identifiers.
///
/// Not synchronized; the traced transport keeps it behind its session lock.
#[derive(Debug, Default)]
pub struct MessageIdentityResolver {
    ids: HashMap<MessageKey, String>,
}

impl MessageIdentityResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier for the turn, minting a new one on first sight
    pub fn resolve(
        &mut self,
        role: &Role,
        content: Option<&MessageContent>,
        position: usize,
    ) -> String {
        self.ids
            .entry(MessageKey::new(role, content, position))
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone()
    }

    /// Number of distinct turns seen
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether no turn has been seen
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Forget every identifier
    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn text(s: &str) -> MessageContent {
        MessageContent::Text(s.to_string())
    }

    #[test]
    fn test_same_turn_gets_same_id() {
        let mut resolver = MessageIdentityResolver::new();
        let a = resolver.resolve(&Role::User, Some(&text("hello")), 0);
        let b = resolver.resolve(&Role::User, Some(&text("hello")), 0);
        assert_eq!(a, b);
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn test_any_difference_gets_new_id() {
        let mut resolver = MessageIdentityResolver::new();
        let base = resolver.resolve(&Role::User, Some(&text("hello")), 0);

        assert_ne!(base, resolver.resolve(&Role::User, Some(&text("hello")), 1));
        assert_ne!(base, resolver.resolve(&Role::Assistant, Some(&text("hello")), 0));
        assert_ne!(base, resolver.resolve(&Role::User, Some(&text("hello!")), 0));
        assert_ne!(base, resolver.resolve(&Role::User, None, 0));
        assert_eq!(resolver.len(), 5);
    }

    #[test]
    fn test_missing_and_empty_content_differ() {
        assert_ne!(content_hash(None), content_hash(Some(&text(""))));
    }

    #[test]
    fn test_text_and_blocks_with_same_rendering_differ() {
        let blocks = MessageContent::Parts(vec![serde_json::json!({"type": "text", "text": "hi"})]);
        let lookalike = text(&blocks.canonical());

        let mut resolver = MessageIdentityResolver::new();
        let a = resolver.resolve(&Role::User, Some(&blocks), 0);
        let b = resolver.resolve(&Role::User, Some(&lookalike), 0);
        assert_ne!(a, b);
        assert_ne!(content_hash(Some(&blocks)), content_hash(Some(&lookalike)));
    }

    #[test]
    fn test_clear_forgets_ids() {
        let mut resolver = MessageIdentityResolver::new();
        let first = resolver.resolve(&Role::System, Some(&text("rules")), 0);
        resolver.clear();
        assert!(resolver.is_empty());
        assert_ne!(first, resolver.resolve(&Role::System, Some(&text("rules")), 0));
    }

    proptest! {
        #[test]
        fn resolve_is_idempotent(content in ".*", position in 0usize..64) {
            let mut resolver = MessageIdentityResolver::new();
            let first = resolver.resolve(&Role::User, Some(&text(&content)), position);
            let second = resolver.resolve(&Role::User, Some(&text(&content)), position);
            prop_assert_eq!(first, second);
            prop_assert_eq!(resolver.len(), 1);
        }

        #[test]
        fn different_content_gets_different_id(
            a in ".{0,24}",
            b in ".{0,24}",
            blocks in proptest::bool::ANY,
            position in 0usize..64,
        ) {
            prop_assume!(a != b || blocks);
            let first = text(&a);
            let second = if blocks {
                MessageContent::Parts(vec![serde_json::json!({"type": "text", "text": b})])
            } else {
                text(&b)
            };

            let mut resolver = MessageIdentityResolver::new();
            let x = resolver.resolve(&Role::User, Some(&first), position);
            let y = resolver.resolve(&Role::User, Some(&second), position);
            prop_assert_ne!(x, y);
        }
    }
}
