// src/key.rs
//
// Composite entity keys
//
// RULES:
// - A key is an ordered sequence of 1 to 4 typed components
// - Positional (untyped) lookups are validated before touching the store
// - Validation failures are caller errors, never persistence errors

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Maximum number of components a composite key may carry.
pub const MAX_KEY_ARITY: usize = 4;

/// One component of a composite key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyPart {
    Int(i64),
    Text(String),
    Uuid(Uuid),
    Bytes(Vec<u8>),
}

impl KeyPart {
    pub fn kind(&self) -> KeyKind {
        match self {
            KeyPart::Int(_) => KeyKind::Int,
            KeyPart::Text(_) => KeyKind::Text,
            KeyPart::Uuid(_) => KeyKind::Uuid,
            KeyPart::Bytes(_) => KeyKind::Bytes,
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(v) => write!(f, "{}", v),
            KeyPart::Text(v) => write!(f, "{}", v),
            KeyPart::Uuid(v) => write!(f, "{}", v),
            KeyPart::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// The type of a key component, used for positional validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyKind {
    Int,
    Text,
    Uuid,
    Bytes,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyKind::Int => "int",
            KeyKind::Text => "text",
            KeyKind::Uuid => "uuid",
            KeyKind::Bytes => "bytes",
        };
        write!(f, "{}", name)
    }
}

/// Key validation failures. Always raised before any store interaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("expected {expected} key component(s), got {actual}")]
    Arity { expected: usize, actual: usize },

    #[error("key component {position} has kind {actual}, expected {expected}")]
    Kind {
        position: usize,
        expected: KeyKind,
        actual: KeyKind,
    },
}

/// An ordered sequence of 1-4 key components identifying one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey {
    parts: Vec<KeyPart>,
}

impl CompositeKey {
    /// Builds a key from raw parts. Arity is validated; component kinds are
    /// whatever the caller supplied (typed validation happens against an
    /// entity's declared key via [`validate_parts`]).
    pub fn from_parts(parts: Vec<KeyPart>) -> Result<Self, KeyError> {
        if parts.is_empty() || parts.len() > MAX_KEY_ARITY {
            return Err(KeyError::Arity {
                expected: MAX_KEY_ARITY,
                actual: parts.len(),
            });
        }
        Ok(Self { parts })
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    pub fn arity(&self) -> usize {
        self.parts.len()
    }

    /// Canonical text encoding, used as the storage key by the SQLite
    /// backend. Stable across runs for equal keys.
    pub fn canonical(&self) -> String {
        // serde_json keeps sequence order, so equal keys encode identically
        serde_json::to_string(&self.parts).unwrap_or_default()
    }

    /// Inverse of [`CompositeKey::canonical`].
    pub fn from_canonical(text: &str) -> Result<Self, serde_json::Error> {
        let parts: Vec<KeyPart> = serde_json::from_str(text)?;
        Ok(Self { parts })
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, ")")
    }
}

/// A type usable as one key component.
pub trait KeyComponent {
    const KIND: KeyKind;

    fn to_part(&self) -> KeyPart;
}

impl KeyComponent for i32 {
    const KIND: KeyKind = KeyKind::Int;

    fn to_part(&self) -> KeyPart {
        KeyPart::Int(i64::from(*self))
    }
}

impl KeyComponent for i64 {
    const KIND: KeyKind = KeyKind::Int;

    fn to_part(&self) -> KeyPart {
        KeyPart::Int(*self)
    }
}

impl KeyComponent for u32 {
    const KIND: KeyKind = KeyKind::Int;

    fn to_part(&self) -> KeyPart {
        KeyPart::Int(i64::from(*self))
    }
}

impl KeyComponent for String {
    const KIND: KeyKind = KeyKind::Text;

    fn to_part(&self) -> KeyPart {
        KeyPart::Text(self.clone())
    }
}

impl KeyComponent for Uuid {
    const KIND: KeyKind = KeyKind::Uuid;

    fn to_part(&self) -> KeyPart {
        KeyPart::Uuid(*self)
    }
}

impl KeyComponent for Vec<u8> {
    const KIND: KeyKind = KeyKind::Bytes;

    fn to_part(&self) -> KeyPart {
        KeyPart::Bytes(self.clone())
    }
}

/// A typed entity key: a single component or a tuple of 2-4 components.
///
/// Declares the expected component kinds so that positional lookups can be
/// validated before any store interaction.
pub trait EntityKey: Send + Sync {
    const KINDS: &'static [KeyKind];

    fn encode(&self) -> CompositeKey;
}

impl EntityKey for i32 {
    const KINDS: &'static [KeyKind] = &[KeyKind::Int];

    fn encode(&self) -> CompositeKey {
        CompositeKey {
            parts: vec![self.to_part()],
        }
    }
}

impl EntityKey for i64 {
    const KINDS: &'static [KeyKind] = &[KeyKind::Int];

    fn encode(&self) -> CompositeKey {
        CompositeKey {
            parts: vec![self.to_part()],
        }
    }
}

impl EntityKey for u32 {
    const KINDS: &'static [KeyKind] = &[KeyKind::Int];

    fn encode(&self) -> CompositeKey {
        CompositeKey {
            parts: vec![self.to_part()],
        }
    }
}

impl EntityKey for String {
    const KINDS: &'static [KeyKind] = &[KeyKind::Text];

    fn encode(&self) -> CompositeKey {
        CompositeKey {
            parts: vec![self.to_part()],
        }
    }
}

impl EntityKey for Uuid {
    const KINDS: &'static [KeyKind] = &[KeyKind::Uuid];

    fn encode(&self) -> CompositeKey {
        CompositeKey {
            parts: vec![self.to_part()],
        }
    }
}

impl EntityKey for Vec<u8> {
    const KINDS: &'static [KeyKind] = &[KeyKind::Bytes];

    fn encode(&self) -> CompositeKey {
        CompositeKey {
            parts: vec![self.to_part()],
        }
    }
}

impl<A: KeyComponent + Send + Sync, B: KeyComponent + Send + Sync> EntityKey for (A, B) {
    const KINDS: &'static [KeyKind] = &[A::KIND, B::KIND];

    fn encode(&self) -> CompositeKey {
        CompositeKey {
            parts: vec![self.0.to_part(), self.1.to_part()],
        }
    }
}

impl<A, B, C> EntityKey for (A, B, C)
where
    A: KeyComponent + Send + Sync,
    B: KeyComponent + Send + Sync,
    C: KeyComponent + Send + Sync,
{
    const KINDS: &'static [KeyKind] = &[A::KIND, B::KIND, C::KIND];

    fn encode(&self) -> CompositeKey {
        CompositeKey {
            parts: vec![self.0.to_part(), self.1.to_part(), self.2.to_part()],
        }
    }
}

impl<A, B, C, D> EntityKey for (A, B, C, D)
where
    A: KeyComponent + Send + Sync,
    B: KeyComponent + Send + Sync,
    C: KeyComponent + Send + Sync,
    D: KeyComponent + Send + Sync,
{
    const KINDS: &'static [KeyKind] = &[A::KIND, B::KIND, C::KIND, D::KIND];

    fn encode(&self) -> CompositeKey {
        CompositeKey {
            parts: vec![
                self.0.to_part(),
                self.1.to_part(),
                self.2.to_part(),
                self.3.to_part(),
            ],
        }
    }
}

/// Validates positionally supplied parts against the declared key shape of
/// `K` and builds the composite key. Count is checked first, then the kind
/// of every component in order.
pub fn validate_parts<K: EntityKey>(parts: &[KeyPart]) -> Result<CompositeKey, KeyError> {
    if parts.len() != K::KINDS.len() {
        return Err(KeyError::Arity {
            expected: K::KINDS.len(),
            actual: parts.len(),
        });
    }
    for (position, (part, expected)) in parts.iter().zip(K::KINDS.iter()).enumerate() {
        if part.kind() != *expected {
            return Err(KeyError::Kind {
                position,
                expected: *expected,
                actual: part.kind(),
            });
        }
    }
    Ok(CompositeKey {
        parts: parts.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_component_key_encodes_one_part() {
        let key = 42i64.encode();
        assert_eq!(key.arity(), 1);
        assert_eq!(key.parts()[0], KeyPart::Int(42));
    }

    #[test]
    fn tuple_keys_preserve_component_order() {
        let key = (7u32, "shelf-a".to_string()).encode();
        assert_eq!(key.arity(), 2);
        assert_eq!(key.parts()[0], KeyPart::Int(7));
        assert_eq!(key.parts()[1], KeyPart::Text("shelf-a".to_string()));
    }

    #[test]
    fn four_part_key_is_the_maximum() {
        let key = (1i64, 2i64, 3i64, 4i64).encode();
        assert_eq!(key.arity(), 4);

        let too_many = vec![KeyPart::Int(0); 5];
        assert!(matches!(
            CompositeKey::from_parts(too_many),
            Err(KeyError::Arity { actual: 5, .. })
        ));
    }

    #[test]
    fn canonical_roundtrip() {
        let key = (Uuid::new_v4(), 9i64).encode();
        let text = key.canonical();
        let back = CompositeKey::from_canonical(&text).unwrap();
        assert_eq!(key, back);
    }

    #[test]
    fn validate_parts_rejects_wrong_arity() {
        let parts = vec![KeyPart::Int(1)];
        let err = validate_parts::<(i64, String)>(&parts).unwrap_err();
        assert_eq!(
            err,
            KeyError::Arity {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn validate_parts_rejects_wrong_kind() {
        let parts = vec![KeyPart::Text("oops".to_string())];
        let err = validate_parts::<i64>(&parts).unwrap_err();
        assert_eq!(
            err,
            KeyError::Kind {
                position: 0,
                expected: KeyKind::Int,
                actual: KeyKind::Text
            }
        );
    }

    #[test]
    fn validate_parts_accepts_matching_shape() {
        let parts = vec![KeyPart::Int(3), KeyPart::Text("row".to_string())];
        let key = validate_parts::<(i64, String)>(&parts).unwrap();
        assert_eq!(key, (3i64, "row".to_string()).encode());
    }
}
