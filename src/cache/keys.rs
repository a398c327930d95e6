//! Cache key generators.
//!
//! Every key and every invalidation glob is built here, so the shape of a
//! key and the pattern that clears it are defined side by side. Structured
//! inputs are reduced to a fixed-length digest of their canonical JSON form,
//! which makes logically equal inputs produce equal keys regardless of
//! field order.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex characters kept from the SHA-256 digest.
pub const HASH_LEN: usize = 16;

pub const TAG_NAMESPACE: &str = "tag";
pub const DEPENDENCY_NAMESPACE: &str = "dep";

/// One typed component of a key.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPart {
    Text(String),
    Int(i64),
    Bool(bool),
    Json(Value),
}

impl KeyPart {
    /// Builds a structured part from anything serializable.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Self {
        Self::Json(serde_json::to_value(value).unwrap_or(Value::Null))
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Int(int) => Value::from(*int),
            Self::Bool(flag) => Value::Bool(*flag),
            Self::Json(value) => value.clone(),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for KeyPart {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u64> for KeyPart {
    fn from(value: u64) -> Self {
        i64::try_from(value)
            .map(Self::Int)
            .unwrap_or_else(|_| Self::Text(value.to_string()))
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Value> for KeyPart {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Identifier accepted by the scalar generators (`user:42`, `product:abc`).
pub trait KeyId {
    fn key_id(&self) -> String;
}

macro_rules! impl_key_id {
    ($($ty:ty),*) => {
        $(impl KeyId for $ty {
            fn key_id(&self) -> String {
                self.to_string()
            }
        })*
    };
}

impl_key_id!(i32, i64, u32, u64, usize, str, String, uuid::Uuid);

impl<T: KeyId + ?Sized> KeyId for &T {
    fn key_id(&self) -> String {
        (**self).key_id()
    }
}

// ============================================================================
// Hashing
// ============================================================================

/// Serializes with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    // Emitted by hand so the order holds whatever `Map` is backed by.
    fn emit(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                out.push('{');
                for (index, (key, inner)) in entries.into_iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String(key.clone()).to_string());
                    out.push(':');
                    emit(inner, out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (index, inner) in items.iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    emit(inner, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    emit(value, &mut out);
    out
}

fn digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(HASH_LEN);
    hex
}

/// Digest of one structured value.
pub fn hash_value(value: &Value) -> String {
    digest(&canonical_json(value))
}

/// Digest of an ordered list of parts.
pub fn hash_parts(parts: &[KeyPart]) -> String {
    let array = Value::Array(parts.iter().map(KeyPart::to_value).collect());
    hash_value(&array)
}

/// Joins parts with `:`; scalar parts are inlined, structured ones hashed.
pub fn compose(parts: &[KeyPart]) -> String {
    parts
        .iter()
        .map(|part| match part {
            KeyPart::Text(text) => text.clone(),
            KeyPart::Int(int) => int.to_string(),
            KeyPart::Bool(flag) => flag.to_string(),
            KeyPart::Json(Value::String(text)) => text.clone(),
            KeyPart::Json(value @ (Value::Number(_) | Value::Bool(_))) => value.to_string(),
            KeyPart::Json(Value::Null) => "null".to_string(),
            KeyPart::Json(value) => hash_value(value),
        })
        .collect::<Vec<_>>()
        .join(":")
}

fn empty_or_hash(value: &Value) -> String {
    match value {
        Value::Null => "all".to_string(),
        Value::Object(map) if map.is_empty() => "all".to_string(),
        other => hash_value(other),
    }
}

// ============================================================================
// Generators
// ============================================================================

pub fn user(id: impl KeyId) -> String {
    format!("user:{}", id.key_id())
}

/// A user-owned sub-resource: `user:<id>:<scope>`.
pub fn user_scoped(id: impl KeyId, scope: &str) -> String {
    format!("user:{}:{scope}", id.key_id())
}

pub fn resource(name: &str, id: impl KeyId) -> String {
    format!("{name}:{}", id.key_id())
}

/// `list:<resource>:<page>:<limit>:<filters digest|all>`.
pub fn list(resource: &str, page: u32, limit: u32, filters: &Value) -> String {
    format!(
        "list:{resource}:{page}:{limit}:{}",
        empty_or_hash(filters)
    )
}

/// `search:<resource>:<term digest>:<options digest|all>`. The term is
/// hashed so arbitrary user input never leaks into key syntax.
pub fn search(resource: &str, term: &str, options: &Value) -> String {
    let normalized = term.trim().to_lowercase();
    format!(
        "search:{resource}:{}:{}",
        hash_value(&Value::String(normalized)),
        empty_or_hash(options)
    )
}

/// `endpoint:<METHOD>:<path>:<query digest|all>`. Query pairs are sorted so
/// parameter order does not matter.
pub fn endpoint(method: &str, path: &str, query: Option<&str>) -> String {
    let mut pairs: Vec<(&str, &str)> = query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect();
    pairs.sort();

    let suffix = if pairs.is_empty() {
        "all".to_string()
    } else {
        let value = Value::Array(
            pairs
                .into_iter()
                .map(|(key, value)| Value::from(vec![key, value]))
                .collect(),
        );
        hash_value(&value)
    };
    format!("endpoint:{}:{path}:{suffix}", method.to_ascii_uppercase())
}

pub fn session(id: &str) -> String {
    format!("session:{id}")
}

/// `count:<resource>:<filters digest|all>`.
pub fn count(resource: &str, filters: &Value) -> String {
    format!("count:{resource}:{}", empty_or_hash(filters))
}

pub fn tag(tag: &str) -> String {
    format!("{TAG_NAMESPACE}:{tag}")
}

pub fn dependency(key: &str) -> String {
    format!("{DEPENDENCY_NAMESPACE}:{key}")
}

// ============================================================================
// Invalidation globs
// ============================================================================

pub fn resource_pattern(name: &str) -> String {
    format!("{name}:*")
}

pub fn list_pattern(resource: &str) -> String {
    format!("list:{resource}:*")
}

pub fn search_pattern(resource: &str) -> String {
    format!("search:{resource}:*")
}

pub fn user_pattern(id: impl KeyId) -> String {
    format!("user:{}:*", id.key_id())
}

pub fn count_pattern(resource: &str) -> String {
    format!("count:{resource}:*")
}

/// Every cached variant of one endpoint, whatever its query or vary headers.
pub fn endpoint_pattern(method: &str, path: &str) -> String {
    format!("endpoint:{}:{path}:*", method.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::glob_match;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"d": [1, {"z": 0, "y": 1}], "c": null}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":null,"d":[1,{"y":1,"z":0}]},"b":1}"#
        );
    }

    #[test]
    fn equal_inputs_hash_equally() {
        let a = json!({"status": "active", "region": "north"});
        let b = json!({"region": "north", "status": "active"});
        assert_eq!(hash_value(&a), hash_value(&b));
        assert_eq!(hash_value(&a).len(), HASH_LEN);
        assert_ne!(hash_value(&a), hash_value(&json!({"region": "south"})));
    }

    #[test]
    fn part_types_are_distinguished() {
        assert_ne!(
            hash_parts(&[KeyPart::from("1")]),
            hash_parts(&[KeyPart::from(1i64)])
        );
        assert_ne!(
            hash_parts(&["a".into(), "b".into()]),
            hash_parts(&["b".into(), "a".into()])
        );
    }

    #[test]
    fn compose_inlines_scalars_and_hashes_structures() {
        let key = compose(&[
            "orders".into(),
            7u32.into(),
            true.into(),
            KeyPart::json(&json!({"x": 1})),
        ]);
        assert_eq!(key, format!("orders:7:true:{}", hash_value(&json!({"x": 1}))));
    }

    #[test]
    fn generators_produce_expected_shapes() {
        assert_eq!(user(42), "user:42");
        assert_eq!(user_scoped(42, "orders"), "user:42:orders");
        assert_eq!(resource("product", 42), "product:42");
        assert_eq!(session("abc"), "session:abc");
        assert_eq!(list("product", 1, 20, &json!({})), "list:product:1:20:all");
        assert_eq!(count("lease", &Value::Null), "count:lease:all");
        assert_eq!(tag("outlets"), "tag:outlets");
        assert_eq!(dependency("product:42"), "dep:product:42");
    }

    #[test]
    fn search_term_is_normalized() {
        assert_eq!(
            search("product", "  Gas ", &Value::Null),
            search("product", "gas", &Value::Null)
        );
    }

    #[test]
    fn endpoint_pattern_covers_all_variants() {
        let pattern = endpoint_pattern("get", "/api/products");
        assert!(glob_match(&pattern, &endpoint("GET", "/api/products", None)));
        assert!(glob_match(
            &pattern,
            &endpoint("GET", "/api/products", Some("page=1"))
        ));
        assert!(!glob_match(
            &pattern,
            &endpoint("GET", "/api/products/1", None)
        ));
    }

    #[test]
    fn endpoint_query_order_is_irrelevant() {
        assert_eq!(
            endpoint("get", "/api/products", Some("page=2&limit=10")),
            endpoint("GET", "/api/products", Some("limit=10&page=2"))
        );
        assert_eq!(
            endpoint("GET", "/api/products", None),
            "endpoint:GET:/api/products:all"
        );
    }

    #[test]
    fn patterns_cover_their_generators() {
        let filters = json!({"status": "open"});
        assert!(glob_match(&list_pattern("product"), &list("product", 3, 50, &filters)));
        assert!(glob_match(&search_pattern("product"), &search("product", "x", &filters)));
        assert!(glob_match(&user_pattern(9), &user_scoped(9, "cart")));
        assert!(glob_match(&count_pattern("lease"), &count("lease", &filters)));
        assert!(glob_match(&resource_pattern("product"), &resource("product", 42)));
        assert!(!glob_match(&list_pattern("product"), &resource("product", 42)));
    }
}
