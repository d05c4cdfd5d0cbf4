use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// A content-addressed identifier for a registered query: `(surql, params, client_id)`
/// hashed with BLAKE3 and folded against the client id so the same query text
/// registered by two different clients never collides.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryHash(pub [u8; 32]);

impl QueryHash {
    pub fn derive(surql: &str, params: &serde_json::Value, client_id: Uuid) -> Self {
        #[derive(Serialize)]
        struct Canonical<'a> {
            surql: &'a str,
            params: &'a serde_json::Value,
        }

        let canonical = serde_json::to_vec(&Canonical { surql, params })
            .expect("json serialization of query canonical form cannot fail");
        let digest = blake3::hash(&canonical);
        let mut bytes = *digest.as_bytes();
        let client_bytes = client_id.as_bytes();
        for (i, b) in bytes.iter_mut().enumerate() {
            *b ^= client_bytes[i % client_bytes.len()];
        }
        QueryHash(bytes)
    }

    pub fn to_hex(self) -> String {
        hex_encode(&self.0)
    }
}

impl fmt::Debug for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryHash({})", self.to_hex())
    }
}

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// BLAKE3 over the canonical `record_id + ':' + version` sequence, newline-joined.
/// Two record-version arrays with identical ordered contents always hash equal;
/// any reordering or value change changes the hash.
pub fn record_sequence_hash<'a>(records: impl IntoIterator<Item = (&'a str, u64)>) -> blake3::Hash {
    let mut canonical = String::new();
    for (id, version) in records {
        if !canonical.is_empty() {
            canonical.push('\n');
        }
        canonical.push_str(id);
        canonical.push(':');
        canonical.push_str(&version.to_string());
    }
    blake3::hash(canonical.as_bytes())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_hash_is_stable_across_calls() {
        let client = Uuid::new_v4();
        let a = QueryHash::derive("SELECT * FROM thread", &json!({}), client);
        let b = QueryHash::derive("SELECT * FROM thread", &json!({}), client);
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn query_hash_differs_by_client() {
        let surql = "SELECT * FROM thread";
        let params = json!({});
        let a = QueryHash::derive(surql, &params, Uuid::new_v4());
        let b = QueryHash::derive(surql, &params, Uuid::new_v4());
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn record_sequence_hash_equal_for_identical_sequences() {
        let seq = vec![("thread:A1", 1u64), ("thread:A2", 2u64)];
        let h1 = record_sequence_hash(seq.iter().map(|(id, v)| (*id, *v)));
        let h2 = record_sequence_hash(seq.iter().map(|(id, v)| (*id, *v)));
        assert_eq!(h1, h2);
    }

    #[test]
    fn record_sequence_hash_differs_for_reordered_sequences() {
        let a = record_sequence_hash(vec![("thread:A1", 1u64), ("thread:A2", 2u64)]);
        let b = record_sequence_hash(vec![("thread:A2", 2u64), ("thread:A1", 1u64)]);
        assert_ne!(a, b);
    }
}
