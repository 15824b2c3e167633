//! Client core for the DPM list protocol, built on `dpmlink-api`.
//!
//! - **[`Client`]**: async facade. `read_many` / `write_many` run a full
//!   list exchange on a pooled session; `subscribe` hands a dedicated
//!   session to a background dispatch loop feeding a bounded buffer.
//!
//! - **[`blocking::Client`]**: the same operations for synchronous callers,
//!   driving a private runtime. Each subscription runs on its own thread.
//!
//! - **[`SessionPool`]**: idle sessions per kind (plain / settings-enabled)
//!   with LRU eviction and a global cap on open sessions.
//!
//! - **[`SubscriptionHandle`]**: stop flag, terminal error and drop
//!   counters shared by both drivers.

pub mod blocking;
pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod operations;
pub mod pool;
pub mod subscription;

// ── Primary re-exports ──────────────────────────────────────────────
pub use client::{AsyncSubscription, Client};
pub use config::{ClientConfig, DEFAULT_HOST};
pub use error::CoreError;
pub use model::{Reading, WriteResult};
pub use pool::{PoolStats, PooledSession, SessionKind, SessionPool};
pub use subscription::{Callback, CallbackError, ErrorHandler, SubscriptionHandle};

// Wire-level types callers need to build requests and inspect results.
pub use dpmlink_api::{
    CredentialProvider, DEFAULT_PORT, DeviceRequest, EventSpec, Property, Range, SignedToken,
    StaticCredentials, Status, Value, ValueType,
};
