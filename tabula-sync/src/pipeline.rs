//! Submission pipeline: middleware, commit and fanout.
//!
//! ```text
//!   SubmitContext
//!        │
//!        ▼
//!   "submit" chain: validate ─► mw₁ ─► mw₂ ─► …      (sync, sequential)
//!        │ Err → rejected, reported to caller
//!        ▼
//!   Database::commit                                  (async collaborator)
//!        │ Err → surfaced, no retry
//!        ▼
//!   publish_ops_map ─► PubSub::publish                (best-effort, logged)
//!        ├── {collection}, {collection}.{doc}
//!        └── record_{id}, field_{id}    (structural edits only)
//! ```
//!
//! The service does not serialize concurrent commits on one document; the
//! [`Database`] must reject stale versions (see `MemoryDatabase`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::channel::{self, CollectionKey};
use crate::database::Database;
use crate::error::{Result, SyncError};
use crate::ot::{OtEngine, OtOperation};
use crate::pubsub::PubSub;
use crate::types::{
    single_op_map, ConnectionInfo, OperationKind, Projection, Query, QueryResult, RawOpMap,
    RawOperation, Snapshot, SubmitContext, VersionAndType,
};

/// Name of the submit middleware chain.
pub const SUBMIT: &str = "submit";

/// Pipeline middleware. Return `next.run(ctx)` to continue the chain or an
/// error to abort it.
pub type MiddlewareFn = Arc<dyn Fn(&SubmitContext, Next<'_>) -> Result<()> + Send + Sync>;

/// Continuation handed to each middleware.
pub struct Next<'a> {
    chain: &'a [MiddlewareFn],
}

impl<'a> Next<'a> {
    pub fn run(self, ctx: &SubmitContext) -> Result<()> {
        match self.chain.split_first() {
            Some((middleware, rest)) => middleware(ctx, Next { chain: rest }),
            None => Ok(()),
        }
    }
}

/// Built-in first stage of the submit chain.
fn validate_submission(ctx: &SubmitContext, next: Next<'_>) -> Result<()> {
    if ctx.op.is_none() {
        return Err(SyncError::validation("operation is required"));
    }
    if ctx.collection.is_empty() {
        return Err(SyncError::validation("collection is required"));
    }
    if ctx.id.is_empty() {
        return Err(SyncError::validation("document id is required"));
    }
    next.run(ctx)
}

/// Operational counters exposed by [`SyncService::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub connections: usize,
    pub middlewares: usize,
    pub closing: bool,
}

/// The submission pipeline.
pub struct SyncService {
    db: Arc<dyn Database>,
    pubsub: Arc<dyn PubSub>,
    engine: OtEngine,
    middlewares: RwLock<HashMap<String, Vec<MiddlewareFn>>>,
    connections: RwLock<HashMap<String, ConnectionInfo>>,
    closing: AtomicBool,
}

impl SyncService {
    pub fn new(db: Arc<dyn Database>, pubsub: Arc<dyn PubSub>) -> Self {
        Self::with_engine(db, pubsub, OtEngine::new())
    }

    pub fn with_engine(db: Arc<dyn Database>, pubsub: Arc<dyn PubSub>, engine: OtEngine) -> Self {
        let service = Self {
            db,
            pubsub,
            engine,
            middlewares: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            closing: AtomicBool::new(false),
        };
        service.push_middleware(SUBMIT, Arc::new(validate_submission));
        service
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(SyncError::Closed("sync service"));
        }
        Ok(())
    }

    pub fn pubsub(&self) -> &Arc<dyn PubSub> {
        &self.pubsub
    }

    pub fn engine(&self) -> &OtEngine {
        &self.engine
    }

    // ── connections ──────────────────────────────────────────────

    /// Create and register an anonymous connection.
    pub fn get_connection(&self) -> Result<ConnectionInfo> {
        let conn = ConnectionInfo::anonymous();
        self.register_connection(conn.clone())?;
        Ok(conn)
    }

    pub fn register_connection(&self, conn: ConnectionInfo) -> Result<()> {
        self.ensure_open()?;
        log::debug!("Pipeline connection {} registered for user {}", conn.id, conn.user_id);
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.id.clone(), conn);
        Ok(())
    }

    pub fn remove_connection(&self, id: &str) -> Option<ConnectionInfo> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    // ── middleware ───────────────────────────────────────────────

    /// Append `middleware` to the chain named `event`.
    pub fn use_middleware(&self, event: &str, middleware: MiddlewareFn) -> Result<()> {
        self.ensure_open()?;
        self.push_middleware(event, middleware);
        Ok(())
    }

    fn push_middleware(&self, event: &str, middleware: MiddlewareFn) {
        let mut chains = self.middlewares.write().unwrap_or_else(PoisonError::into_inner);
        let chain = chains.entry(event.to_string()).or_default();
        chain.push(middleware);
        log::debug!("Registered middleware #{} for {event}", chain.len());
    }

    /// Run `ctx` through the submit chain. Persists nothing.
    pub fn on_submit(&self, ctx: &SubmitContext) -> Result<()> {
        self.ensure_open()?;
        let chain: Vec<MiddlewareFn> = self
            .middlewares
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(SUBMIT)
            .cloned()
            .unwrap_or_default();
        Next { chain: &chain }.run(ctx)
    }

    /// Middleware, commit, then fanout. Returns the committed operation
    /// stamped with its collection and document id.
    pub async fn submit(&self, ctx: &SubmitContext) -> Result<RawOperation> {
        self.on_submit(ctx)?;

        let mut op = ctx
            .op
            .clone()
            .ok_or_else(|| SyncError::validation("operation is required"))?;
        op.c = ctx.collection.clone();
        op.d = ctx.id.clone();

        self.db.commit(&ctx.collection, &ctx.id, &op).await?;
        log::debug!(
            "Committed {} on {}/{} at v{}",
            op.kind(),
            ctx.collection,
            ctx.id,
            op.v
        );

        if let Err(e) = self.publish_ops_map(&[single_op_map(&ctx.collection, &ctx.id, op.clone())]) {
            log::error!("Fanout failed for {}/{}: {e}", ctx.collection, ctx.id);
        }
        Ok(op)
    }

    // ── fanout ───────────────────────────────────────────────────

    /// Publish committed operations to their collection and document
    /// channels. Per-channel failures are logged and skipped.
    pub fn publish_ops_map(&self, maps: &[RawOpMap]) -> Result<()> {
        self.ensure_open()?;
        for map in maps {
            for (collection, docs) in map {
                for (doc_id, op) in docs {
                    let mut op = op.clone();
                    op.c = collection.clone();
                    op.d = doc_id.clone();

                    let channels = channel::operation_channels(collection, doc_id);
                    match self.pubsub.publish(&channels, &op) {
                        Ok(()) => log::debug!("Published v{} to {channels:?}", op.v),
                        Err(e) => {
                            log::error!("Failed to publish {collection}/{doc_id}: {e}");
                            continue;
                        }
                    }

                    if channel::is_structural(&op) {
                        match CollectionKey::parse(collection) {
                            Ok(key) => self.publish_related_channels(key.entity_id(), &op),
                            Err(e) => log::warn!("Skipping related channels: {e}"),
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn publish_related_channels(&self, entity_id: &str, op: &RawOperation) {
        for ch in channel::related_channels(entity_id) {
            if let Err(e) = self.pubsub.publish(std::slice::from_ref(&ch), op) {
                log::error!("Failed to publish to related channel {ch}: {e}");
            }
        }
    }

    /// Publish straight to `record_{table_id}`.
    pub fn publish_record_channel(&self, table_id: &str, op: &RawOperation) -> Result<()> {
        self.ensure_open()?;
        self.pubsub.publish(&[channel::record_channel(table_id)], op)
    }

    // ── persistence delegates ────────────────────────────────────

    pub async fn get_snapshot(
        &self,
        collection: &str,
        id: &str,
        projection: &Projection,
    ) -> Result<Snapshot> {
        self.ensure_open()?;
        self.db.get_snapshot(collection, id, projection).await
    }

    pub async fn get_snapshot_bulk(
        &self,
        collection: &str,
        ids: &[String],
        projection: &Projection,
    ) -> Result<HashMap<String, Snapshot>> {
        self.ensure_open()?;
        self.db.get_snapshot_bulk(collection, ids, projection).await
    }

    /// Operations for `[from, to)` synthesized from the current snapshot.
    ///
    /// Per-version diffs are not retained, so an edited document yields one
    /// operation per version with the current contents attached to the last
    /// one only. A document whose last operation was a create yields a single
    /// create carrying the whole snapshot.
    pub async fn get_ops(
        &self,
        collection: &str,
        id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<RawOperation>> {
        self.ensure_open()?;
        let current = self.db.version_and_type(collection, id).await?;
        if current.kind == OperationKind::Delete || from > current.version {
            return Ok(Vec::new());
        }

        let snapshot = self.db.get_snapshot(collection, id, &Projection::all()).await?;
        if snapshot.data.is_null() {
            return Ok(Vec::new());
        }

        let src = Uuid::new_v4().simple().to_string();
        if current.kind == OperationKind::Create {
            let mut op = RawOperation::create(current.version, snapshot.data).with_source(src, 1);
            if let (Some(create), Some(type_name)) = (op.create.as_mut(), snapshot.type_name) {
                create.type_name = type_name;
            }
            return Ok(vec![op]);
        }

        let head = current.version + 1;
        let end = to.map_or(head, |to| to.min(head));
        if from >= end {
            return Ok(Vec::new());
        }
        let gap = end - from;
        let edits = ops_from_snapshot(&snapshot.data);

        Ok((0..gap)
            .map(|i| {
                let mut op = RawOperation {
                    v: from + i,
                    ..RawOperation::default()
                }
                .with_source(src.clone(), 1);
                if i + 1 == gap && !edits.is_empty() {
                    op.op = Some(edits.clone());
                }
                op
            })
            .collect())
    }

    /// Stored operations as recorded by the database.
    pub async fn get_raw_ops(
        &self,
        collection: &str,
        id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<RawOperation>> {
        self.ensure_open()?;
        self.db.get_ops(collection, id, from, to).await
    }

    pub async fn query(
        &self,
        collection: &str,
        query: &Query,
        projection: &Projection,
    ) -> Result<QueryResult> {
        self.ensure_open()?;
        self.db.query(collection, query, projection).await
    }

    pub async fn version_and_type(&self, collection: &str, id: &str) -> Result<VersionAndType> {
        self.ensure_open()?;
        self.db.version_and_type(collection, id).await
    }

    pub async fn commit(&self, collection: &str, id: &str, op: &RawOperation) -> Result<()> {
        self.ensure_open()?;
        self.db.commit(collection, id, op).await
    }

    // ── OT delegates ─────────────────────────────────────────────

    pub fn apply(&self, doc: &Value, op: &OtOperation, type_name: &str) -> Result<Value> {
        self.engine.apply(doc, op, type_name)
    }

    pub fn transform(
        &self,
        a: &OtOperation,
        b: &OtOperation,
        type_name: &str,
    ) -> Result<(OtOperation, OtOperation)> {
        self.engine.transform(a, b, type_name)
    }

    pub fn validate(&self, op: &OtOperation, doc: &Value, type_name: &str) -> Result<()> {
        self.engine.validate(op, doc, type_name)
    }

    // ── lifecycle ────────────────────────────────────────────────

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            connections: self
                .connections
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            middlewares: self
                .middlewares
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .map(Vec::len)
                .sum(),
            closing: self.closing.load(Ordering::Acquire),
        }
    }

    /// Reject further work, drop connections and close both collaborators.
    /// Registered middleware is kept and still counted by [`stats`](Self::stats).
    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let pubsub = self.pubsub.close();
        let db = self.db.close().await;
        log::info!("Sync service closed");
        pubsub.and(db)
    }
}

/// One `{p: [key], oi: value}` per top-level field of an object document.
fn ops_from_snapshot(data: &Value) -> Vec<OtOperation> {
    match data {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| OtOperation::insert(vec![k.as_str().into()], v.clone()))
            .collect(),
        _ => Vec::new(),
    }
}
