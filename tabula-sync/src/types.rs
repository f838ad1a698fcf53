//! Shared data model: committed operations, snapshots, submission context
//! and persistence query types.
//!
//! Everything here is plain serde data; ownership of operations and
//! snapshots stays with the persistence layer, the pipeline only passes
//! them through for the duration of one request.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::ot::{OtOperation, JSON0};

fn is_false(b: &bool) -> bool {
    !*b
}

/// What a [`RawOperation`] does to its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Edit,
    Delete,
    Unknown,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a create operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateData {
    #[serde(rename = "type")]
    pub type_name: String,
    pub data: Value,
}

/// One committed (or to-be-committed) change to a document.
///
/// Exactly one of `op`, `create`, `del` is meaningful. `v` is the version
/// this operation produces; a create produces version 1.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawOperation {
    /// Source (connection) id.
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub v: u64,
    /// Collection, stamped by the pipeline before fanout.
    #[serde(default)]
    pub c: String,
    /// Document id, stamped by the pipeline before fanout.
    #[serde(default)]
    pub d: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<Vec<OtOperation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<CreateData>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub del: bool,
}

impl RawOperation {
    pub fn create(v: u64, data: Value) -> Self {
        Self {
            v,
            create: Some(CreateData {
                type_name: JSON0.to_string(),
                data,
            }),
            ..Self::default()
        }
    }

    pub fn edit(v: u64, ops: Vec<OtOperation>) -> Self {
        Self {
            v,
            op: Some(ops),
            ..Self::default()
        }
    }

    pub fn delete(v: u64) -> Self {
        Self {
            v,
            del: true,
            ..Self::default()
        }
    }

    pub fn with_source(mut self, src: impl Into<String>, seq: u64) -> Self {
        self.src = src.into();
        self.seq = seq;
        self
    }

    /// Create payload wins over the delete flag, which wins over edits.
    pub fn kind(&self) -> OperationKind {
        if self.create.is_some() {
            OperationKind::Create
        } else if self.del {
            OperationKind::Delete
        } else if self.op.as_ref().is_some_and(|ops| !ops.is_empty()) {
            OperationKind::Edit
        } else {
            OperationKind::Unknown
        }
    }

    /// The edit list, empty for create/delete operations.
    pub fn edits(&self) -> &[OtOperation] {
        self.op.as_deref().unwrap_or(&[])
    }
}

/// Materialized document at version `v`.
///
/// `type_name` is `None` for a document that does not exist (never created
/// or deleted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub v: u64,
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<Value>,
}

impl Snapshot {
    pub fn new(id: impl Into<String>, v: u64, data: Value) -> Self {
        Self {
            id: id.into(),
            v,
            type_name: Some(JSON0.to_string()),
            data,
            m: None,
        }
    }

    /// Snapshot of a document that does not exist at version `v`.
    pub fn missing(id: impl Into<String>, v: u64) -> Self {
        Self {
            id: id.into(),
            v,
            type_name: None,
            data: Value::Null,
            m: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.type_name.is_some()
    }
}

/// Current version of a document and the kind of its last operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionAndType {
    pub version: u64,
    #[serde(rename = "type")]
    pub kind: OperationKind,
}

/// A live connection as seen by the submission pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: format!("conn_{}", Uuid::new_v4().simple()),
            user_id: user_id.into(),
            session_id: session_id.into(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Connection with no authenticated user and a fresh session.
    pub fn anonymous() -> Self {
        Self::new("anonymous", Uuid::new_v4().to_string())
    }
}

/// Who is submitting, plus free-form middleware data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub connection: ConnectionInfo,
    #[serde(default)]
    pub custom: HashMap<String, Value>,
}

impl Agent {
    pub fn new(connection: ConnectionInfo) -> Self {
        Self {
            connection,
            custom: HashMap::new(),
        }
    }
}

/// Unit of work passed through the submit middleware chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitContext {
    pub agent: Agent,
    pub collection: String,
    pub id: String,
    pub op: Option<RawOperation>,
    #[serde(default)]
    pub source: String,
}

impl SubmitContext {
    pub fn new(
        agent: Agent,
        collection: impl Into<String>,
        id: impl Into<String>,
        op: RawOperation,
    ) -> Self {
        Self {
            agent,
            collection: collection.into(),
            id: id.into(),
            op: Some(op),
            source: String::new(),
        }
    }
}

/// `collection → document id → operation`.
pub type RawOpMap = HashMap<String, HashMap<String, RawOperation>>;

/// Build a single-entry [`RawOpMap`].
pub fn single_op_map(collection: &str, id: &str, op: RawOperation) -> RawOpMap {
    let mut docs = HashMap::new();
    docs.insert(id.to_string(), op);
    let mut map = HashMap::new();
    map.insert(collection.to_string(), docs);
    map
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

/// Field-equality query with ordering and paging.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub skip: usize,
}

impl Query {
    pub fn matches(&self, data: &Value) -> bool {
        self.fields
            .iter()
            .all(|(field, expected)| data.get(field) == Some(expected))
    }
}

/// Result of a [`Query`]: matching snapshots plus optional extra data.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub snapshots: Vec<Snapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

/// Field inclusion map. Empty means "all fields".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Projection(pub HashMap<String, bool>);

impl Projection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(|f| (f.into(), true)).collect())
    }

    pub fn is_all(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only included top-level fields of an object document.
    pub fn apply(&self, data: &Value) -> Value {
        match data {
            Value::Object(map) if !self.is_all() => Value::Object(
                map.iter()
                    .filter(|(k, _)| self.0.get(*k).copied().unwrap_or(false))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_kind_derivation() {
        assert_eq!(RawOperation::create(1, json!({})).kind(), OperationKind::Create);
        assert_eq!(RawOperation::delete(3).kind(), OperationKind::Delete);
        assert_eq!(
            RawOperation::edit(2, vec![OtOperation::insert(vec![], json!(1))]).kind(),
            OperationKind::Edit
        );
        assert_eq!(RawOperation::edit(2, vec![]).kind(), OperationKind::Unknown);
        assert_eq!(RawOperation::default().kind(), OperationKind::Unknown);
    }

    #[test]
    fn test_create_takes_precedence() {
        let mut op = RawOperation::create(1, json!({"a": 1}));
        op.del = true;
        assert_eq!(op.kind(), OperationKind::Create);
    }

    #[test]
    fn test_raw_operation_wire_shape() {
        let op = RawOperation::create(1, json!({"name": "Ann"})).with_source("conn_1", 4);
        let encoded = serde_json::to_value(&op).unwrap();
        assert_eq!(
            encoded,
            json!({
                "src": "conn_1", "seq": 4, "v": 1, "c": "", "d": "",
                "create": {"type": "json0", "data": {"name": "Ann"}}
            })
        );

        let decoded: RawOperation =
            serde_json::from_value(json!({"v": 2, "op": [{"p": ["a"], "oi": 1}]})).unwrap();
        assert_eq!(decoded.kind(), OperationKind::Edit);
        assert_eq!(decoded.edits().len(), 1);
    }

    #[test]
    fn test_projection_apply() {
        let data = json!({"name": "Ann", "age": 3, "city": "Oslo"});
        assert_eq!(Projection::all().apply(&data), data);
        assert_eq!(
            Projection::fields(["name", "city"]).apply(&data),
            json!({"name": "Ann", "city": "Oslo"})
        );
        assert_eq!(Projection::fields(["name"]).apply(&json!(5)), json!(5));
    }

    #[test]
    fn test_query_matches() {
        let mut q = Query::default();
        assert!(q.matches(&json!({"a": 1})));
        q.fields.insert("status".into(), json!("open"));
        assert!(q.matches(&json!({"status": "open", "x": 1})));
        assert!(!q.matches(&json!({"status": "done"})));
        assert!(!q.matches(&json!(null)));
    }

    #[test]
    fn test_anonymous_connection() {
        let conn = ConnectionInfo::anonymous();
        assert_eq!(conn.user_id, "anonymous");
        assert!(conn.id.starts_with("conn_"));
        assert!(!conn.session_id.is_empty());
    }

    #[test]
    fn test_single_op_map() {
        let map = single_op_map("record_t", "r1", RawOperation::delete(2));
        assert_eq!(map["record_t"]["r1"].v, 2);
    }
}
