//! # tabula-sync — Real-time document synchronization for tabular data
//!
//! Clients edit records, fields and views concurrently; every change goes
//! through one submission pipeline and is fanned out to everyone watching.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket (JSON)  ┌─────────────┐
//! │   Client    │ ◄─────────────────► │ SyncServer  │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴────────┐
//!                                     │TransportBridge│
//!                                     └──┬─────────┬──┘
//!                                        │         │
//!                           ┌────────────┴──┐  ┌───┴──────────────────┐
//!                           │ SyncService   │  │ CollaborationService │
//!                           │ mw → commit   │  │ presence · cursors   │
//!                           └──┬─────────┬──┘  └───┬──────────────────┘
//!                              │         │         │
//!                        ┌─────┴───┐ ┌───┴────┐ ┌──┴────────────┐
//!                        │Database │ │ PubSub │ │ ConnectionHub │
//!                        └─────────┘ └────────┘ └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ot`] — JSON operational transform (`json0`) and the type registry
//! - [`types`] — Operations, snapshots, connections, queries
//! - [`channel`] — Collection keys and channel naming
//! - [`database`] — Persistence collaborator and an in-memory implementation
//! - [`pubsub`] — Channel fanout with isolated concurrent delivery
//! - [`pipeline`] — Middleware, commit and publish
//! - [`protocol`] — JSON wire envelope and payloads
//! - [`hub`] — Live connections, subscriptions and outbound queues
//! - [`bridge`] — Wire messages ⇄ pipeline
//! - [`presence`] — Presence and cursor state with expiry
//! - [`server`] — WebSocket server

pub mod bridge;
pub mod channel;
pub mod database;
pub mod error;
pub mod hub;
pub mod ot;
pub mod pipeline;
pub mod presence;
pub mod protocol;
pub mod pubsub;
pub mod server;
pub mod types;

// Re-exports for convenience
pub use bridge::TransportBridge;
pub use channel::{CollectionKey, DocumentType};
pub use database::{Database, MemoryDatabase};
pub use error::{Result, SyncError};
pub use hub::{ConnectionHub, HubStats, Transport};
pub use ot::{Json0, OtEngine, OtOperation, OtType, PathSegment, JSON0};
pub use pipeline::{MiddlewareFn, Next, ServiceStats, SyncService, SUBMIT};
pub use presence::{
    CollaborationService, CursorInfo, CursorStore, PresenceConfig, PresenceInfo, PresenceRelay,
    PresenceStore,
};
pub use protocol::{MessageType, WireError, WireMessage};
pub use pubsub::{FanoutStats, MemoryPubSub, PubSub, SubscriberFn};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use types::{
    Agent, ConnectionInfo, OperationKind, Projection, Query, RawOperation, Snapshot,
    SubmitContext,
};
