//! Persistence collaborator contract and an in-process implementation.
//!
//! The sync core never stores documents itself. Everything goes through a
//! [`Database`]; [`MemoryDatabase`] is the reference implementation used
//! by the binary and the tests. It enforces compare-and-commit: an
//! operation is accepted only when its `v` is exactly one past the current
//! document version, which gives single-writer ordering per document.
//!
//! ```text
//!   collection ──► id ──► StoredDocument
//!                            ├── snapshot (v, type, data)
//!                            ├── history  [RawOperation; v]
//!                            └── last_kind (create/edit/delete)
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::error::{Result, SyncError};
use crate::ot::OtEngine;
use crate::types::{
    OperationKind, Projection, Query, QueryResult, RawOperation, Snapshot, SortOrder,
    VersionAndType,
};

/// Storage backend the submission pipeline orchestrates.
#[async_trait]
pub trait Database: Send + Sync {
    /// Snapshot at the current version. A document that was never created
    /// (or is deleted) yields a snapshot with no type and null data.
    async fn get_snapshot(&self, collection: &str, id: &str, projection: &Projection)
        -> Result<Snapshot>;

    async fn get_snapshot_bulk(
        &self,
        collection: &str,
        ids: &[String],
        projection: &Projection,
    ) -> Result<HashMap<String, Snapshot>>;

    /// Stored operations producing versions in `[from, to)`; `to = None`
    /// means "up to the current version".
    async fn get_ops(
        &self,
        collection: &str,
        id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<RawOperation>>;

    async fn query(&self, collection: &str, query: &Query, projection: &Projection)
        -> Result<QueryResult>;

    async fn commit(&self, collection: &str, id: &str, op: &RawOperation) -> Result<()>;

    /// Current version and the kind of the last committed operation.
    async fn version_and_type(&self, collection: &str, id: &str) -> Result<VersionAndType>;

    async fn close(&self) -> Result<()>;
}

struct StoredDocument {
    snapshot: Snapshot,
    history: Vec<RawOperation>,
    last_kind: OperationKind,
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, HashMap<String, StoredDocument>>,
    closed: bool,
}

impl MemoryState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SyncError::Closed("database"));
        }
        Ok(())
    }

    fn document(&self, collection: &str, id: &str) -> Option<&StoredDocument> {
        self.collections.get(collection).and_then(|docs| docs.get(id))
    }
}

/// In-memory [`Database`] with per-document history and version checks.
pub struct MemoryDatabase {
    state: RwLock<MemoryState>,
    engine: OtEngine,
    commits: AtomicU64,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_engine(OtEngine::new())
    }

    pub fn with_engine(engine: OtEngine) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            engine,
            commits: AtomicU64::new(0),
        }
    }

    /// Number of successful commits since construction.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Number of stored documents (including deleted ones) in `collection`.
    pub async fn document_count(&self, collection: &str) -> usize {
        self.state
            .read()
            .await
            .collections
            .get(collection)
            .map_or(0, HashMap::len)
    }

    fn projected(snapshot: &Snapshot, projection: &Projection) -> Snapshot {
        let mut out = snapshot.clone();
        out.data = projection.apply(&snapshot.data);
        out
    }

    /// Compute the snapshot that `op` produces from `current`.
    fn next_snapshot(
        &self,
        collection: &str,
        id: &str,
        current: Option<&Snapshot>,
        op: &RawOperation,
    ) -> Result<Snapshot> {
        let exists = current.is_some_and(Snapshot::exists);
        let not_found = || SyncError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        };

        match op.kind() {
            OperationKind::Create => {
                if exists {
                    return Err(SyncError::Commit {
                        collection: collection.to_string(),
                        id: id.to_string(),
                        reason: "document already exists".into(),
                    });
                }
                let create = op.create.as_ref().ok_or_else(not_found)?;
                if !self.engine.has_type(&create.type_name) {
                    return Err(SyncError::UnknownType(create.type_name.clone()));
                }
                Ok(Snapshot {
                    id: id.to_string(),
                    v: op.v,
                    type_name: Some(create.type_name.clone()),
                    data: create.data.clone(),
                    m: None,
                })
            }
            OperationKind::Edit => {
                let current = current.filter(|s| s.exists()).ok_or_else(not_found)?;
                let type_name = current.type_name.as_deref().unwrap_or_default();
                let data = self.engine.apply_all(&current.data, op.edits(), type_name)?;
                Ok(Snapshot {
                    id: id.to_string(),
                    v: op.v,
                    type_name: current.type_name.clone(),
                    data,
                    m: current.m.clone(),
                })
            }
            OperationKind::Delete => {
                if !exists {
                    return Err(not_found());
                }
                Ok(Snapshot::missing(id, op.v))
            }
            OperationKind::Unknown => Err(SyncError::validation(
                "operation carries no create, edit or delete payload",
            )),
        }
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (None, None) => CmpOrdering::Equal,
        (None, Some(_)) => CmpOrdering::Less,
        (Some(_), None) => CmpOrdering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn get_snapshot(
        &self,
        collection: &str,
        id: &str,
        projection: &Projection,
    ) -> Result<Snapshot> {
        let state = self.state.read().await;
        state.ensure_open()?;
        Ok(match state.document(collection, id) {
            Some(doc) => Self::projected(&doc.snapshot, projection),
            None => Snapshot::missing(id, 0),
        })
    }

    async fn get_snapshot_bulk(
        &self,
        collection: &str,
        ids: &[String],
        projection: &Projection,
    ) -> Result<HashMap<String, Snapshot>> {
        let state = self.state.read().await;
        state.ensure_open()?;
        Ok(ids
            .iter()
            .map(|id| {
                let snapshot = match state.document(collection, id) {
                    Some(doc) => Self::projected(&doc.snapshot, projection),
                    None => Snapshot::missing(id.as_str(), 0),
                };
                (id.clone(), snapshot)
            })
            .collect())
    }

    async fn get_ops(
        &self,
        collection: &str,
        id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<RawOperation>> {
        let state = self.state.read().await;
        state.ensure_open()?;
        let Some(doc) = state.document(collection, id) else {
            return Ok(Vec::new());
        };
        Ok(doc
            .history
            .iter()
            .filter(|op| op.v >= from && to.map_or(true, |to| op.v < to))
            .cloned()
            .collect())
    }

    async fn query(
        &self,
        collection: &str,
        query: &Query,
        projection: &Projection,
    ) -> Result<QueryResult> {
        let state = self.state.read().await;
        state.ensure_open()?;

        let mut matched: Vec<&Snapshot> = state
            .collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .map(|doc| &doc.snapshot)
                    .filter(|s| s.exists() && query.matches(&s.data))
                    .collect()
            })
            .unwrap_or_default();

        matched.sort_by(|a, b| a.id.cmp(&b.id));
        for sort in query.sort.iter().rev() {
            matched.sort_by(|a, b| {
                let ord = compare_values(a.data.get(&sort.field), b.data.get(&sort.field));
                match sort.order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            });
        }

        let total = matched.len();
        let snapshots = matched
            .into_iter()
            .skip(query.skip)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|s| Self::projected(s, projection))
            .collect();

        Ok(QueryResult {
            snapshots,
            extra: Some(json!({ "total": total })),
        })
    }

    async fn commit(&self, collection: &str, id: &str, op: &RawOperation) -> Result<()> {
        let mut state = self.state.write().await;
        state.ensure_open()?;

        let current = state.document(collection, id);
        let version = current.map_or(0, |doc| doc.snapshot.v);
        if op.v != version + 1 {
            return Err(SyncError::VersionConflict {
                collection: collection.to_string(),
                id: id.to_string(),
                expected: version + 1,
                actual: op.v,
            });
        }

        let snapshot = self.next_snapshot(collection, id, current.map(|d| &d.snapshot), op)?;

        let mut stored = op.clone();
        stored.c = collection.to_string();
        stored.d = id.to_string();

        let docs = state.collections.entry(collection.to_string()).or_default();
        match docs.get_mut(id) {
            Some(doc) => {
                doc.snapshot = snapshot;
                doc.history.push(stored);
                doc.last_kind = op.kind();
            }
            None => {
                docs.insert(
                    id.to_string(),
                    StoredDocument {
                        snapshot,
                        history: vec![stored],
                        last_kind: op.kind(),
                    },
                );
            }
        }

        self.commits.fetch_add(1, Ordering::Relaxed);
        log::trace!("Committed {collection}/{id} at v{}", op.v);
        Ok(())
    }

    async fn version_and_type(&self, collection: &str, id: &str) -> Result<VersionAndType> {
        let state = self.state.read().await;
        state.ensure_open()?;
        Ok(match state.document(collection, id) {
            Some(doc) => VersionAndType {
                version: doc.snapshot.v,
                kind: doc.last_kind,
            },
            None => VersionAndType {
                version: 0,
                kind: OperationKind::Unknown,
            },
        })
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.closed = true;
        state.collections.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::OtOperation;
    use crate::types::SortField;

    const C: &str = "record_tbl1";

    async fn seeded() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        for (id, name, age) in [("r1", "Ann", 31), ("r2", "Bo", 25), ("r3", "Cy", 40)] {
            db.commit(C, id, &RawOperation::create(1, json!({"name": name, "age": age, "team": "a"})))
                .await
                .unwrap();
        }
        db
    }

    #[tokio::test]
    async fn test_create_then_snapshot() {
        let db = MemoryDatabase::new();
        db.commit(C, "r1", &RawOperation::create(1, json!({"name": "Ann"})))
            .await
            .unwrap();

        let snap = db.get_snapshot(C, "r1", &Projection::all()).await.unwrap();
        assert_eq!(snap.v, 1);
        assert_eq!(snap.type_name.as_deref(), Some("json0"));
        assert_eq!(snap.data, json!({"name": "Ann"}));
        assert_eq!(db.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_snapshot() {
        let db = MemoryDatabase::new();
        let snap = db.get_snapshot(C, "nope", &Projection::all()).await.unwrap();
        assert!(!snap.exists());
        assert_eq!(snap.v, 0);
        assert_eq!(snap.data, Value::Null);
    }

    #[tokio::test]
    async fn test_edit_applies_ot() {
        let db = MemoryDatabase::new();
        db.commit(C, "r1", &RawOperation::create(1, json!({"tags": []})))
            .await
            .unwrap();
        let edit = RawOperation::edit(
            2,
            vec![
                OtOperation::insert(vec!["tags".into(), 0usize.into()], json!("x")),
                OtOperation::insert(vec!["name".into()], json!("Ann")),
            ],
        );
        db.commit(C, "r1", &edit).await.unwrap();

        let snap = db.get_snapshot(C, "r1", &Projection::all()).await.unwrap();
        assert_eq!(snap.v, 2);
        assert_eq!(snap.data, json!({"tags": ["x"], "name": "Ann"}));
    }

    #[tokio::test]
    async fn test_version_conflict() {
        let db = MemoryDatabase::new();
        db.commit(C, "r1", &RawOperation::create(1, json!({})))
            .await
            .unwrap();
        let err = db
            .commit(C, "r1", &RawOperation::edit(5, vec![OtOperation::insert(vec!["a".into()], json!(1))]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::VersionConflict {
                collection: C.into(),
                id: "r1".into(),
                expected: 2,
                actual: 5,
            }
        );
        assert_eq!(db.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_create_requires_version_one() {
        let db = MemoryDatabase::new();
        let err = db
            .commit(C, "r1", &RawOperation::create(3, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::VersionConflict { expected: 1, .. }));
    }

    #[tokio::test]
    async fn test_edit_missing_document() {
        let db = MemoryDatabase::new();
        let err = db
            .commit(C, "r1", &RawOperation::edit(1, vec![OtOperation::insert(vec!["a".into()], json!(1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_and_recreate() {
        let db = MemoryDatabase::new();
        db.commit(C, "r1", &RawOperation::create(1, json!({"a": 1})))
            .await
            .unwrap();
        db.commit(C, "r1", &RawOperation::delete(2)).await.unwrap();

        let vt = db.version_and_type(C, "r1").await.unwrap();
        assert_eq!(vt, VersionAndType { version: 2, kind: OperationKind::Delete });
        assert!(!db.get_snapshot(C, "r1", &Projection::all()).await.unwrap().exists());

        db.commit(C, "r1", &RawOperation::create(3, json!({"a": 2})))
            .await
            .unwrap();
        let snap = db.get_snapshot(C, "r1", &Projection::all()).await.unwrap();
        assert_eq!(snap.v, 3);
        assert_eq!(snap.data, json!({"a": 2}));
    }

    #[tokio::test]
    async fn test_get_ops_range() {
        let db = MemoryDatabase::new();
        db.commit(C, "r1", &RawOperation::create(1, json!({"n": 0})))
            .await
            .unwrap();
        for v in 2..=4 {
            let op = RawOperation::edit(
                v,
                vec![OtOperation::replace(vec!["n".into()], json!(v - 2), json!(v - 1))],
            );
            db.commit(C, "r1", &op).await.unwrap();
        }

        let all = db.get_ops(C, "r1", 0, None).await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.iter().all(|op| op.c == C && op.d == "r1"));

        let mid = db.get_ops(C, "r1", 2, Some(4)).await.unwrap();
        assert_eq!(mid.iter().map(|op| op.v).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_query_filter_sort_page() {
        let db = seeded().await;

        let mut q = Query::default();
        q.fields.insert("team".into(), json!("a"));
        q.sort.push(SortField {
            field: "age".into(),
            order: SortOrder::Desc,
        });
        q.skip = 1;
        q.limit = Some(1);

        let result = db.query(C, &q, &Projection::fields(["name"])).await.unwrap();
        assert_eq!(result.snapshots.len(), 1);
        assert_eq!(result.snapshots[0].data, json!({"name": "Ann"}));
        assert_eq!(result.extra, Some(json!({"total": 3})));
    }

    #[tokio::test]
    async fn test_snapshot_bulk() {
        let db = seeded().await;
        let ids = vec!["r1".to_string(), "zz".to_string()];
        let bulk = db.get_snapshot_bulk(C, &ids, &Projection::all()).await.unwrap();
        assert_eq!(bulk.len(), 2);
        assert!(bulk["r1"].exists());
        assert!(!bulk["zz"].exists());
    }

    #[tokio::test]
    async fn test_closed_database_rejects() {
        let db = seeded().await;
        db.close().await.unwrap();
        assert_eq!(
            db.get_snapshot(C, "r1", &Projection::all()).await.unwrap_err(),
            SyncError::Closed("database")
        );
        assert!(db.commit(C, "r9", &RawOperation::create(1, json!({}))).await.is_err());
    }
}
