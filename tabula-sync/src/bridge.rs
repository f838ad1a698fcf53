//! Bridge between the live-connection transport and the submission pipeline.
//!
//! ```text
//!   inbound WireMessage
//!        │
//!        ├── ping / subscribe / unsubscribe      ─► reply
//!        ├── query   ─► SyncService::query       ─► queryResponse
//!        ├── presence / cursor                   ─► CollaborationService
//!        └── submit  ─► SubmitContext ─► SyncService::submit
//!                                             │
//!                             route by CollectionKey::doc_type
//!                   ┌────────────┬────────────┼─────────────┐
//!                   ▼            ▼            ▼             ▼
//!             publish_record  publish_field publish_view publish_document
//!                   └────────────┴──── op ────┴─────────────┘
//!                          {collection}, {collection}.{doc}
//! ```
//!
//! Committed operations are re-encoded as minimal wire edit lists:
//! create → `[{p: [], oi: data}]`, edit → the edit list verbatim,
//! delete → `[{p: [], od: null}]`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::channel::{self, CollectionKey, DocumentType};
use crate::error::{Result, SyncError};
use crate::hub::Transport;
use crate::ot::OtOperation;
use crate::pipeline::{MiddlewareFn, Next, SyncService, SUBMIT};
use crate::presence::CollaborationService;
use crate::protocol::{
    CursorRequest, DocumentOperation, MessageType, PresenceRequest, QueryRequest, QueryResponse,
    SubmitRequest, SubmitResponse, SubscriptionAck, WireError, WireMessage,
};
use crate::pubsub::SubscriberFn;
use crate::types::{Agent, ConnectionInfo, OperationKind, RawOperation, SubmitContext};

/// Source tag on operations the server publishes.
pub const SERVER_SOURCE: &str = "server";

/// Submit middleware: log every submission and reject ones with no payload.
fn log_submission(ctx: &SubmitContext, next: Next<'_>) -> Result<()> {
    let kind = ctx
        .op
        .as_ref()
        .map_or(OperationKind::Unknown, RawOperation::kind);
    log::debug!(
        "Submit {kind} on {}/{} from {}",
        ctx.collection,
        ctx.id,
        ctx.agent.connection.id
    );
    if kind == OperationKind::Unknown {
        return Err(SyncError::validation(
            "operation carries no create, edit or delete payload",
        ));
    }
    next.run(ctx)
}

/// Minimal wire edit list for a committed operation.
pub fn wire_ops(op: &RawOperation) -> Vec<OtOperation> {
    match op.kind() {
        OperationKind::Create => op
            .create
            .as_ref()
            .map(|c| vec![OtOperation::insert(Vec::new(), c.data.clone())])
            .unwrap_or_default(),
        OperationKind::Edit => op.edits().to_vec(),
        OperationKind::Delete => vec![OtOperation::delete(Vec::new(), Value::Null)],
        OperationKind::Unknown => Vec::new(),
    }
}

fn op_message(collection: &str, document: &str, ops: Vec<OtOperation>) -> Result<WireMessage> {
    let payload = DocumentOperation {
        op: ops,
        source: Some(SERVER_SOURCE.to_string()),
    };
    Ok(WireMessage::with_data(MessageType::Op, &payload)?
        .on_document(collection, Some(document.to_string())))
}

fn require_collection(msg: &WireMessage) -> Result<&str> {
    match msg.collection.as_deref() {
        Some(c) if !c.is_empty() => Ok(c),
        _ => Err(SyncError::validation("collection is required")),
    }
}

fn require_document(msg: &WireMessage) -> Result<&str> {
    match msg.document.as_deref() {
        Some(d) if !d.is_empty() => Ok(d),
        _ => Err(SyncError::validation("document is required")),
    }
}

/// Turns wire messages into pipeline calls and committed operations into
/// wire messages.
pub struct TransportBridge {
    service: Arc<SyncService>,
    transport: Arc<dyn Transport>,
    collaboration: Arc<CollaborationService>,
    seq: AtomicU64,
}

impl TransportBridge {
    /// Installs the submission-logging middleware on `service`.
    pub fn new(
        service: Arc<SyncService>,
        transport: Arc<dyn Transport>,
        collaboration: Arc<CollaborationService>,
    ) -> Self {
        let middleware: MiddlewareFn = Arc::new(log_submission);
        if let Err(e) = service.use_middleware(SUBMIT, middleware) {
            log::warn!("Submission logging not installed: {e}");
        }
        Self {
            service,
            transport,
            collaboration,
            seq: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &Arc<SyncService> {
        &self.service
    }

    pub fn collaboration(&self) -> &Arc<CollaborationService> {
        &self.collaboration
    }

    // ───────────────────────────────────────────────────────────────
    // Inbound
    // ───────────────────────────────────────────────────────────────

    /// Decode and handle one text frame. Returns the reply for the sender.
    pub async fn handle_text(&self, conn: &ConnectionInfo, text: &str) -> Option<WireMessage> {
        match WireMessage::decode(text) {
            Ok(msg) => self.handle_message(conn, msg).await,
            Err(e) => {
                log::warn!("Undecodable message from {}: {e}", conn.id);
                Some(WireMessage::from_error(&e))
            }
        }
    }

    /// Handle one decoded message. Failures become an `error` reply
    /// carrying the request id.
    pub async fn handle_message(&self, conn: &ConnectionInfo, msg: WireMessage) -> Option<WireMessage> {
        let id = msg.id.clone();
        match self.dispatch(conn, &msg).await {
            Ok(reply) => reply.map(|r| r.reply_to(id)),
            Err(e) => {
                log::debug!("{} from {} rejected: {e}", msg.msg_type, conn.id);
                Some(WireMessage::from_error(&e).reply_to(id))
            }
        }
    }

    async fn dispatch(&self, conn: &ConnectionInfo, msg: &WireMessage) -> Result<Option<WireMessage>> {
        match &msg.msg_type {
            MessageType::Ping => Ok(Some(WireMessage::pong())),
            MessageType::Connect => Ok(Some(Self::connected_message(conn))),
            MessageType::Subscribe => self.subscribe(conn, msg).map(Some),
            MessageType::Unsubscribe => self.unsubscribe(conn, msg).map(Some),
            MessageType::Query => self.query(msg).await.map(Some),
            MessageType::Submit => self.submit(conn, msg).await.map(Some),
            MessageType::Presence => self.presence(conn, msg).map(|_| None),
            MessageType::Cursor => self.cursor(conn, msg).map(|_| None),
            MessageType::Disconnect => {
                self.collaboration.remove_session(&conn.user_id, &conn.session_id);
                Ok(None)
            }
            other => Err(SyncError::Protocol(format!("unsupported message type {other}"))),
        }
    }

    fn subscribe(&self, conn: &ConnectionInfo, msg: &WireMessage) -> Result<WireMessage> {
        let collection = require_collection(msg)?;
        let channel = channel::subscription_channel(collection, msg.document.as_deref());
        self.transport.subscribe(&conn.id, &channel)?;
        let ack = SubscriptionAck {
            channel,
            status: "subscribed".into(),
        };
        WireMessage::with_data(MessageType::Subscribe, &ack)
    }

    fn unsubscribe(&self, conn: &ConnectionInfo, msg: &WireMessage) -> Result<WireMessage> {
        let collection = require_collection(msg)?;
        let channel = channel::subscription_channel(collection, msg.document.as_deref());
        self.transport.unsubscribe(&conn.id, &channel)?;
        let ack = SubscriptionAck {
            channel,
            status: "unsubscribed".into(),
        };
        WireMessage::with_data(MessageType::Unsubscribe, &ack)
    }

    async fn query(&self, msg: &WireMessage) -> Result<WireMessage> {
        let collection = require_collection(msg)?;
        let request: QueryRequest = msg.data_as()?;
        let response = match self
            .service
            .query(collection, &request.query, &request.projection)
            .await
        {
            Ok(result) => QueryResponse {
                data: result.snapshots,
                extra: result.extra,
                error: None,
            },
            Err(e) => QueryResponse {
                error: Some(WireError::from(&e)),
                ..QueryResponse::default()
            },
        };
        Ok(WireMessage::with_data(MessageType::QueryResponse, &response)?
            .on_document(collection, None))
    }

    /// Every submission failure, malformed requests included, is answered
    /// with a `submitResponse` (or `conflict`) carrying the error.
    async fn submit(&self, conn: &ConnectionInfo, msg: &WireMessage) -> Result<WireMessage> {
        let (msg_type, response) = match self.commit_submission(conn, msg).await {
            Ok(v) => (
                MessageType::SubmitResponse,
                SubmitResponse {
                    v: Some(v),
                    error: None,
                },
            ),
            Err(e) => {
                let msg_type = match e {
                    SyncError::VersionConflict { .. } => MessageType::Conflict,
                    _ => MessageType::SubmitResponse,
                };
                (
                    msg_type,
                    SubmitResponse {
                        v: None,
                        error: Some(WireError::from(&e)),
                    },
                )
            }
        };
        Ok(WireMessage::with_data(msg_type, &response)?.on_document(
            msg.collection.clone().unwrap_or_default(),
            msg.document.clone(),
        ))
    }

    async fn commit_submission(&self, conn: &ConnectionInfo, msg: &WireMessage) -> Result<u64> {
        let collection = require_collection(msg)?;
        let document = require_document(msg)?;
        let request: SubmitRequest = msg.data_as()?;

        let v = match request.v {
            Some(v) => v,
            None => self.service.version_and_type(collection, document).await?.version + 1,
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let op = RawOperation {
            v,
            op: request.op,
            create: request.create,
            del: request.del,
            ..RawOperation::default()
        }
        .with_source(conn.id.clone(), seq);

        let mut ctx = SubmitContext::new(Agent::new(conn.clone()), collection, document, op);
        ctx.source = request.source.unwrap_or_else(|| conn.id.clone());
        Ok(self.process_submit(&ctx).await?.v)
    }

    fn presence(&self, conn: &ConnectionInfo, msg: &WireMessage) -> Result<()> {
        let collection = require_collection(msg)?;
        let request: PresenceRequest = msg.data_as()?;
        if request.leave {
            self.collaboration.remove_user_presence(collection, &conn.user_id);
        } else {
            self.collaboration.update_user_presence(
                collection,
                &conn.user_id,
                &conn.session_id,
                request.data,
            )?;
        }
        Ok(())
    }

    fn cursor(&self, conn: &ConnectionInfo, msg: &WireMessage) -> Result<()> {
        let collection = require_collection(msg)?;
        let request: CursorRequest = msg.data_as()?;
        match request.position {
            Some(position) => {
                self.collaboration.update_user_cursor(
                    collection,
                    &conn.user_id,
                    &conn.session_id,
                    position,
                    request.selection,
                )?;
            }
            None => {
                self.collaboration.remove_user_cursor(collection, &conn.user_id);
            }
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────
    // Submission and routing
    // ───────────────────────────────────────────────────────────────

    /// Run `ctx` through the pipeline, then route the committed operation
    /// to its wire channels.
    pub async fn process_submit(&self, ctx: &SubmitContext) -> Result<RawOperation> {
        let committed = self.service.submit(ctx).await?;
        if let Err(e) = self.route(&ctx.collection, &ctx.id, &committed) {
            log::error!("Routing {}/{} failed: {e}", ctx.collection, ctx.id);
        }
        Ok(committed)
    }

    /// Dispatch `op` to the publish entry point for the collection's type.
    /// Returns the number of deliveries.
    pub fn route(&self, collection: &str, document: &str, op: &RawOperation) -> Result<usize> {
        let ops = wire_ops(op);
        log::debug!(
            "Routing {} on {collection}/{document} ({} wire ops)",
            op.kind(),
            ops.len()
        );
        let key = match CollectionKey::parse(collection) {
            Ok(key) => key,
            Err(_) => return self.publish_document_op(collection, document, ops),
        };
        match key.doc_type() {
            DocumentType::Record => self.publish_record_op(key.entity_id(), document, ops),
            DocumentType::Field => self.publish_field_op(key.entity_id(), document, ops),
            DocumentType::View => self.publish_view_op(key.entity_id(), document, ops),
            _ => self.publish_document_op(collection, document, ops),
        }
    }

    /// Send an `op` message to `{collection}` and `{collection}.{document}`.
    pub fn publish_document_op(
        &self,
        collection: &str,
        document: &str,
        ops: Vec<OtOperation>,
    ) -> Result<usize> {
        let msg = op_message(collection, document, ops)?;
        Ok(channel::operation_channels(collection, document)
            .iter()
            .map(|ch| self.transport.broadcast_to_channel(ch, &msg, &[]))
            .sum())
    }

    pub fn publish_record_op(&self, table_id: &str, record_id: &str, ops: Vec<OtOperation>) -> Result<usize> {
        let collection = channel::record_channel(table_id);
        self.publish_document_op(&collection, record_id, ops)
    }

    pub fn publish_field_op(&self, table_id: &str, field_id: &str, ops: Vec<OtOperation>) -> Result<usize> {
        let collection = CollectionKey::new(DocumentType::Field, table_id).to_string();
        self.publish_document_op(&collection, field_id, ops)
    }

    pub fn publish_view_op(&self, table_id: &str, view_id: &str, ops: Vec<OtOperation>) -> Result<usize> {
        let collection = CollectionKey::new(DocumentType::View, table_id).to_string();
        self.publish_document_op(&collection, view_id, ops)
    }

    /// Relay every operation published on fanout `channel` to the transport
    /// channel of the same name.
    ///
    /// Not installed by default: operations submitted through this bridge are
    /// already routed to the transport.
    pub fn forward_fanout(&self, channel: &str) -> Result<()> {
        let transport = self.transport.clone();
        let callback: SubscriberFn = Arc::new(move |ch: &str, op: &RawOperation| -> Result<()> {
            let msg = op_message(&op.c, &op.d, wire_ops(op))?;
            let reached = transport.broadcast_to_channel(ch, &msg, &[]);
            log::trace!("Forwarded v{} on {ch} to {reached} connections", op.v);
            Ok(())
        });
        self.service.pubsub().subscribe(channel, callback)?;
        log::info!("Forwarding fanout channel {channel} to connections");
        Ok(())
    }

    /// `connected` greeting for a freshly accepted connection.
    pub fn connected_message(conn: &ConnectionInfo) -> WireMessage {
        let mut msg = WireMessage::new(MessageType::Connected);
        msg.data = Some(json!({
            "connection_id": conn.id,
            "user_id": conn.user_id,
            "session_id": conn.session_id,
        }));
        msg
    }
}
