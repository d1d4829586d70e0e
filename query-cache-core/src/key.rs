//! Deterministic key construction for index buckets, result roots, and pages.
//!
//! `KeyBuilder` holds no state; it groups the three key-derivation functions
//! the rest of the crate calls so their names read the way the spec names
//! them (`KeyBuilder::index_key`, not a free-floating `index_key`).

use crate::request::{CacheRequest, Qual, Value, NO_LIMIT};

/// Deterministic fingerprinting of index keys, result-root keys, and page
/// keys.
pub struct KeyBuilder;

impl KeyBuilder {
    /// `index__{conn}_{table}`, sanitized.
    #[must_use]
    pub fn index_key(connection_name: &str, table: &str) -> String {
        Self::sanitize(&format!("index__{connection_name}_{table}"))
    }

    /// `{conn}_{table}_{quals}_{columns}_{limit}`, sanitized.
    ///
    /// Deterministic: two requests equal in (connection, table, quals,
    /// columns, limit) produce identical roots regardless of `QualMap`
    /// insertion order or `call_id`.
    #[must_use]
    pub fn result_key_root(req: &CacheRequest) -> String {
        let quals_part = Self::format_quals(&req.quals);
        let quals_segment = if quals_part.is_empty() {
            String::new()
        } else {
            format!("_{quals_part}")
        };
        Self::sanitize(&format!(
            "{}_{}{}_{}_{}",
            req.connection_name,
            req.table,
            quals_segment,
            req.columns.join(","),
            req.limit
        ))
    }

    /// `{root}-p{i}`.
    #[must_use]
    pub fn page_key(root: &str, index: u64) -> String {
        format!("{root}-p{index}")
    }

    /// Sort qual-map keys lexicographically, then concatenate
    /// `field-operator-value` tuples in sorted order. This intentionally
    /// diverges from the original Go implementation's quadratic-looking
    /// string accumulation (an acknowledged Open Question in the spec): the
    /// only contractual requirement is determinism and collision
    /// resistance across distinct qual maps, and cross-version cache-key
    /// compatibility is explicitly not required since the cache is rebuilt
    /// on every process start.
    fn format_quals(quals: &crate::request::QualMap) -> String {
        if quals.is_empty() {
            return String::new();
        }
        let mut keys: Vec<&String> = quals.keys().collect();
        keys.sort();

        let mut parts = Vec::new();
        for key in keys {
            let mut entries = quals[key].clone();
            entries.sort_by(|a, b| Self::qual_repr(a).cmp(&Self::qual_repr(b)));
            for q in &entries {
                parts.push(Self::qual_repr(q));
            }
        }
        parts.join("-")
    }

    fn qual_repr(q: &Qual) -> String {
        format!("{}-{}-{}", q.field_name, q.operator, Self::value_repr(&q.value))
    }

    fn value_repr(value: &Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => format!("{b:x?}"),
        }
    }

    /// Strip newlines and tabs from a candidate key.
    fn sanitize(s: &str) -> String {
        s.chars().filter(|c| *c != '\n' && *c != '\t').collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CacheRequest, QualMap};

    fn qual(field: &str, op: &str, value: Value) -> Qual {
        Qual {
            field_name: field.to_string(),
            operator: op.to_string(),
            value,
        }
    }

    #[test]
    fn index_key_depends_only_on_connection_and_table() {
        assert_eq!(
            KeyBuilder::index_key("aws", "ec2"),
            KeyBuilder::index_key("aws", "ec2")
        );
        assert_ne!(
            KeyBuilder::index_key("aws", "ec2"),
            KeyBuilder::index_key("aws", "s3")
        );
    }

    #[test]
    fn result_key_root_is_invariant_under_qual_map_reordering() {
        let mut quals_a = QualMap::new();
        quals_a.insert(
            "region".to_string(),
            vec![qual("region", "=", Value::Text("us-east-1".into()))],
        );
        quals_a.insert(
            "zone".to_string(),
            vec![qual("zone", "=", Value::Text("a".into()))],
        );

        let mut quals_b = QualMap::new();
        quals_b.insert(
            "zone".to_string(),
            vec![qual("zone", "=", Value::Text("a".into()))],
        );
        quals_b.insert(
            "region".to_string(),
            vec![qual("region", "=", Value::Text("us-east-1".into()))],
        );

        let req_a = CacheRequest {
            quals: quals_a,
            ..CacheRequest::new("aws", "ec2", vec!["id".into()], "call-a")
        };
        let req_b = CacheRequest {
            quals: quals_b,
            ..CacheRequest::new("aws", "ec2", vec!["id".into()], "call-b")
        };

        assert_eq!(
            KeyBuilder::result_key_root(&req_a),
            KeyBuilder::result_key_root(&req_b)
        );
    }

    #[test]
    fn result_key_root_differs_for_distinct_quals() {
        let mut quals_a = QualMap::new();
        quals_a.insert(
            "region".to_string(),
            vec![qual("region", "=", Value::Text("us-east-1".into()))],
        );
        let mut quals_b = QualMap::new();
        quals_b.insert(
            "region".to_string(),
            vec![qual("region", "=", Value::Text("us-west-2".into()))],
        );

        let req_a = CacheRequest {
            quals: quals_a,
            ..CacheRequest::new("aws", "ec2", vec!["id".into()], "call-a")
        };
        let req_b = CacheRequest {
            quals: quals_b,
            ..CacheRequest::new("aws", "ec2", vec!["id".into()], "call-b")
        };

        assert_ne!(
            KeyBuilder::result_key_root(&req_a),
            KeyBuilder::result_key_root(&req_b)
        );
    }

    #[test]
    fn page_key_uses_root_and_index() {
        assert_eq!(KeyBuilder::page_key("root", 0), "root-p0");
        assert_eq!(KeyBuilder::page_key("root", 7), "root-p7");
    }

    #[test]
    fn sanitize_strips_newlines_and_tabs() {
        let mut req = CacheRequest::new("aws\n", "ec2\t", vec!["id".into()], "call-1");
        req.limit = NO_LIMIT;
        let key = KeyBuilder::result_key_root(&req);
        assert!(!key.contains('\n'));
        assert!(!key.contains('\t'));
    }

    proptest::proptest! {
        /// `result_key_root` must not depend on the order qual-map entries
        /// happen to be inserted or iterated in, for arbitrary field/value
        /// combinations.
        #[test]
        fn result_key_root_is_invariant_under_arbitrary_qual_reordering(
            fields in proptest::collection::hash_set("[a-z]{1,8}", 1..6)
                .prop_map(|s| s.into_iter().collect::<Vec<_>>()),
            values in proptest::collection::vec(proptest::prelude::any::<i64>(), 1..6),
        ) {
            let pairs: Vec<(String, i64)> = fields.into_iter().zip(values).collect();

            let mut forward = QualMap::new();
            for (field, value) in &pairs {
                forward.insert(field.clone(), vec![qual(field, "=", Value::Int(*value))]);
            }
            let mut reversed = QualMap::new();
            for (field, value) in pairs.iter().rev() {
                reversed.insert(field.clone(), vec![qual(field, "=", Value::Int(*value))]);
            }

            let req_forward = CacheRequest {
                quals: forward,
                ..CacheRequest::new("aws", "ec2", vec!["id".into()], "call-a")
            };
            let req_reversed = CacheRequest {
                quals: reversed,
                ..CacheRequest::new("aws", "ec2", vec!["id".into()], "call-b")
            };

            proptest::prop_assert_eq!(
                KeyBuilder::result_key_root(&req_forward),
                KeyBuilder::result_key_root(&req_reversed)
            );
        }
    }
}
