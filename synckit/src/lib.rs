//! # synckit — real-time collaborative document sync hub
//!
//! Clients connect over WebSocket, authenticate, subscribe to
//! documents, and exchange CRDT-style deltas. The hub never interprets
//! delta content: it stores opaque payloads, tracks their vector
//! clocks, enforces per-origin causal order, and fans updates out to
//! the other subscribers, who merge locally.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   JSON over WS    ┌──────────────┐
//! │  Client    │ ◄───────────────► │  SyncServer  │
//! │ (per user) │                   │ (this crate) │
//! └────────────┘                   └──────┬───────┘
//!                                         │
//!                   ┌─────────────────────┼──────────────────────┐
//!                   ▼                     ▼                      ▼
//!           ┌──────────────┐     ┌────────────────┐     ┌──────────────┐
//!           │ Coordinator  │     │ StorageAdapter │     │  PubSubBus   │
//!           │ (causality,  │     │ (memory or     │     │ (noop or     │
//!           │  fan-out)    │     │  Postgres)     │     │  redis)      │
//!           └──────────────┘     └────────────────┘     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire codec (snake_case `type`, camelCase fields)
//! - [`clock`] — vector clocks and the happens-before partial order
//! - [`auth`] — HS256 tokens, API keys, document-level RBAC
//! - [`storage`] — idempotent delta append behind one adapter trait
//! - [`awareness`] — ephemeral presence with TTL eviction
//! - [`pubsub`] — cross-node fan-out seam
//! - [`connection`] / [`registry`] — per-socket state and the
//!   subscription index
//! - [`coordinator`] — the sync state machine
//! - [`server`] — accept loop and lifecycle
//! - [`health`] — HTTP health endpoints

pub mod auth;
pub mod awareness;
pub mod clock;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod health;
pub mod protocol;
pub mod pubsub;
pub mod registry;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use auth::{Credential, HmacIdentityProvider, IdentityProvider, Permissions, Principal};
pub use awareness::{AwarenessEntry, AwarenessStore};
pub use clock::{ClockOrdering, VectorClock, SAFE_COUNTER_MAX};
pub use config::{Config, ConfigError, StorageProvider};
pub use connection::{ConnState, Connection};
pub use coordinator::SyncCoordinator;
pub use protocol::{AwarenessPeer, DeltaEnvelope, Message, ProtocolError};
pub use pubsub::{NoopPubSub, PubSubBus, RedisPubSub, RemoteEnvelope};
pub use registry::ConnectionManager;
pub use server::{ServerStats, SyncServer};
pub use storage::{
    MemoryStorage, RelationalStorage, StorageAdapter, StorageError, StoredDelta,
};
