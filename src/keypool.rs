//! Ordered provider credentials with a shared rotating cursor.
//!
//! A [`KeyPool`] is built once at startup and handed to every component that
//! needs credentials for one provider. The cursor is the only mutable state
//! shared between concurrent requests. Rotation is compare-and-advance: a
//! caller rotates away from the key index it actually used, so two requests
//! failing on the same key advance the cursor once, not twice.

use std::sync::{Mutex, PoisonError};

/// A key handed out by the pool, tagged with its position.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub index: usize,
    pub key: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("index", &self.index)
            .field("key", &mask_key(&self.key))
            .finish()
    }
}

pub struct KeyPool {
    name: String,
    keys: Vec<String>,
    cursor: Mutex<usize>,
}

impl KeyPool {
    /// Build a pool from raw keys. Keys are trimmed and empty entries dropped.
    pub fn new(name: impl Into<String>, keys: impl IntoIterator<Item = String>) -> Self {
        let name = name.into();
        let keys: Vec<String> = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();

        if keys.is_empty() {
            tracing::warn!(pool = %name, "no API keys configured");
        } else {
            let masked: Vec<String> = keys.iter().map(|k| mask_key(k)).collect();
            tracing::info!(pool = %name, count = keys.len(), keys = ?masked, "key pool loaded");
        }

        Self {
            name,
            keys,
            cursor: Mutex::new(0),
        }
    }

    /// Load keys from `plural_var` (comma-separated), falling back to the
    /// single-key `singular_var`.
    pub fn from_env(name: impl Into<String>, plural_var: &str, singular_var: &str) -> Self {
        let plural = std::env::var(plural_var).unwrap_or_default();
        let mut keys = parse_key_list(&plural);
        if keys.is_empty() {
            keys = parse_key_list(&std::env::var(singular_var).unwrap_or_default());
        }
        Self::new(name, keys)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The key under the cursor, or `None` for an empty pool.
    pub fn current(&self) -> Option<Credential> {
        if self.keys.is_empty() {
            return None;
        }
        let index = *self.lock();
        Some(Credential {
            index,
            key: self.keys[index].clone(),
        })
    }

    /// Advance the cursor past `failed_index` if it still points there.
    ///
    /// Returns the cursor after the call. A no-op when another caller has
    /// already rotated away from that key.
    pub fn rotate_from(&self, failed_index: usize) -> usize {
        let mut cursor = self.lock();
        if *cursor == failed_index && !self.keys.is_empty() {
            *cursor = next_index(*cursor, self.keys.len());
            tracing::info!(
                pool = %self.name,
                from = failed_index,
                to = *cursor,
                "rotated API key"
            );
        }
        *cursor
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, usize> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Position after `current` in a ring of `len` keys.
pub fn next_index(current: usize, len: usize) -> usize {
    if len == 0 {
        0
    } else {
        (current + 1) % len
    }
}

/// Split a comma-separated key list.
pub fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

/// `abcd...wxyz` form for logs.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(keys: &[&str]) -> KeyPool {
        KeyPool::new("test", keys.iter().map(|k| k.to_string()))
    }

    #[test]
    fn test_next_index_wraps() {
        assert_eq!(next_index(0, 3), 1);
        assert_eq!(next_index(2, 3), 0);
        assert_eq!(next_index(0, 0), 0);
    }

    #[test]
    fn test_parse_key_list_trims_and_drops_empty() {
        assert_eq!(
            parse_key_list(" a , b,, c ,"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(parse_key_list("").is_empty());
    }

    #[test]
    fn test_empty_pool_has_no_current() {
        let p = pool(&[]);
        assert!(p.is_empty());
        assert!(p.current().is_none());
    }

    #[test]
    fn test_rotate_from_advances_once() {
        let p = pool(&["k0", "k1", "k2"]);
        assert_eq!(p.current().unwrap().index, 0);
        assert_eq!(p.rotate_from(0), 1);
        // A second caller that also failed on key 0 must not skip key 1.
        assert_eq!(p.rotate_from(0), 1);
        assert_eq!(p.current().unwrap().key, "k1");
    }

    #[test]
    fn test_rotate_wraps_around() {
        let p = pool(&["k0", "k1"]);
        p.rotate_from(0);
        p.rotate_from(1);
        assert_eq!(p.current().unwrap().index, 0);
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("AIzaSyABCDEFGH1234"), "AIza...1234");
        assert_eq!(mask_key("short"), "****");
    }

    #[test]
    fn test_credential_debug_is_masked() {
        let cred = Credential {
            index: 0,
            key: "AIzaSyABCDEFGH1234".to_string(),
        };
        let dbg = format!("{:?}", cred);
        assert!(!dbg.contains("ABCDEFGH"));
    }
}
