//! Seams to the outside world: durable storage, the remote data service,
//! the realtime push feed, the location sensor and the network signal.
//!
//! Shells provide concrete implementations; the in-process ones here back
//! tests and simple embeddings.

mod kv;
mod location;
mod network;
mod push;
mod remote;

pub use self::kv::{
    KeyNamespace, KvError, KvKey, KvStore, MemoryKvStore, StorageErrorCode, MAX_VALUE_SIZE,
};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::kv::SqliteKvStore;
pub use self::location::{GeoProvider, GeoReadOptions, GpsError};
pub use self::network::Connectivity;
pub use self::push::{BroadcastPushChannel, PushChannel, PushError, PushMessage, Subscription};
pub use self::remote::{
    AppliedRecord, LocationReport, PositionSource, RemoteError, RemoteExecutor, TelemetrySink,
};
