//! Cache store for response snapshots
//!
//! Responses are persisted to disk, partitioned into generations that correspond
//! to deployed versions. Only the lifecycle controller and the control channel
//! create or delete generations; strategies read and write through a
//! [`GenerationHandle`].

mod store;

pub use store::{CacheStore, CachedEntry, GenerationHandle, GenerationMarker, StoreError};
