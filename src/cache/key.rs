//! Cache key construction and pattern matching.
//!
//! Keys are composed of entity kind, identifier and (for queries) a hash of
//! the full filter/sort/limit signature, so two queries differing in any
//! parameter never collide.

use sha2::{Digest, Sha256};

/// Key for a single-document read.
pub fn document_key(collection: &str, id: &str) -> String {
  format!("doc:{collection}:{id}")
}

/// Key for a first-page collection query. `signature` is the canonical
/// string form of the filters, ordering and limit.
pub fn query_key(collection: &str, signature: &str) -> String {
  format!("query:{collection}:{}", hash_signature(signature))
}

/// Key for a blob download-URL lookup.
pub fn blob_key(path: &str) -> String {
  format!("blob:{path}")
}

/// Pattern matching every cached query over a collection.
pub fn collection_pattern(collection: &str) -> String {
  format!("query:{collection}:*")
}

/// SHA256 for stable, fixed-length key components.
fn hash_signature(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

/// Match `key` against `pattern`. A pattern without `*` matches as a prefix;
/// `*` matches any run of characters (including none).
pub fn key_matches(pattern: &str, key: &str) -> bool {
  if !pattern.contains('*') {
    return key.starts_with(pattern);
  }

  let mut remaining = key;
  let mut segments = pattern.split('*');

  // First segment is anchored at the start.
  if let Some(first) = segments.next() {
    if !remaining.starts_with(first) {
      return false;
    }
    remaining = &remaining[first.len()..];
  }

  let rest: Vec<&str> = segments.collect();
  for (i, segment) in rest.iter().enumerate() {
    if segment.is_empty() {
      continue;
    }
    let last = i == rest.len() - 1 && !pattern.ends_with('*');
    if last {
      // Last segment is anchored at the end.
      return remaining.ends_with(segment);
    }
    match remaining.find(segment) {
      Some(pos) => remaining = &remaining[pos + segment.len()..],
      None => return false,
    }
  }

  true
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bare_pattern_matches_prefix() {
    assert!(key_matches("flashcard-sets-42", "flashcard-sets-42:recent"));
    assert!(key_matches("doc:users:", "doc:users:alice"));
    assert!(!key_matches("doc:users:", "doc:decks:alice"));
  }

  #[test]
  fn star_matches_any_run() {
    assert!(key_matches("query:decks:*", "query:decks:abc123"));
    assert!(key_matches("doc:*:alice", "doc:users:alice"));
    assert!(!key_matches("doc:*:alice", "doc:users:bob"));
    assert!(key_matches("*alice*", "doc:users:alice:profile"));
  }

  #[test]
  fn query_keys_differ_by_signature() {
    let a = query_key("decks", "owner=alice|order=created:desc|limit=20");
    let b = query_key("decks", "owner=alice|order=created:desc|limit=21");
    assert_ne!(a, b);
    assert!(key_matches(&collection_pattern("decks"), &a));
    assert!(!key_matches(&collection_pattern("cards"), &a));
  }
}
