//! Module that allows to (de-)serialize a `HashMap` with non-string keys with `serde`.
//!
//! JSON object keys must be strings, so a map keyed by a tuple such as
//! `(node, port)` cannot be serialized as a JSON map directly. This module
//! serializes such maps as a sequence of `{"k": ..., "v": ...}` entries
//! instead. Annotate the field with `#[serde(with = "fabsim_utils::serde::tuple_keyed")]`.

use std::{collections::HashMap, hash::Hash};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Deserialize, Serialize)]
struct Entry<K, V> {
    k: K,
    v: V,
}

/// Serialize a `HashMap` with an arbitrary serializable key as an entry sequence.
///
/// Entries are emitted in sorted key order so that serialization is
/// deterministic for a given map content.
pub fn serialize<K, V, S>(map: &HashMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    K: Serialize + Ord,
    V: Serialize,
    S: Serializer,
{
    let mut entries: Vec<(&K, &V)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    serializer.collect_seq(entries.into_iter().map(|(k, v)| Entry { k, v }))
}

/// Deserialize a `HashMap` with an arbitrary deserializable key from an entry sequence.
pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<HashMap<K, V>, D::Error>
where
    K: Deserialize<'de> + Eq + Hash,
    V: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Ok(Vec::<Entry<K, V>>::deserialize(deserializer)?
        .into_iter()
        .map(|entry| (entry.k, entry.v))
        .collect())
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super")]
        map: HashMap<(usize, usize), u64>,
    }

    #[test]
    fn roundtrip_tuple_keys() {
        let mut map = HashMap::new();
        map.insert((0, 1), 17);
        map.insert((3, 0), 4);
        let x = Wrapper { map };

        let ser = serde_json::to_string(&x).unwrap();
        assert_eq!(ser, r#"{"map":[{"k":[0,1],"v":17},{"k":[3,0],"v":4}]}"#);

        let de: Wrapper = serde_json::from_str(&ser).unwrap();
        assert_eq!(de, x);
    }

    #[test]
    fn sorted_output_is_stable() {
        let mut map = HashMap::new();
        for i in 0..16 {
            map.insert((i, i % 3), i as u64);
        }
        let x = Wrapper { map };
        let a = serde_json::to_string(&x).unwrap();
        let b = serde_json::to_string(&x).unwrap();
        assert_eq!(a, b);
    }
}
