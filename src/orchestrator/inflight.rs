//! Per-key in-flight generations, so concurrent misses share one upstream call.

use super::request::Resolved;
use crate::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub(crate) type SharedGeneration = Shared<BoxFuture<'static, Result<Resolved>>>;

type Key = (String, String);

/// Whether the caller started the generation or joined an existing one.
pub(crate) enum Slot {
    Leader(SharedGeneration),
    Follower(SharedGeneration),
}

#[derive(Default)]
pub(crate) struct InFlight {
    map: Mutex<HashMap<Key, (u64, SharedGeneration)>>,
    next_ticket: AtomicU64,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Join the generation running for `(cache_key, input_hash)`, or register
    /// the one produced by `start`. `start` runs under the map lock, so it must
    /// not block; it receives the ticket the generation must hand back to
    /// [`InFlight::finish`].
    pub(crate) fn join_or_start<F>(&self, cache_key: &str, input_hash: &str, start: F) -> Slot
    where
        F: FnOnce(u64) -> BoxFuture<'static, Result<Resolved>>,
    {
        let key = (cache_key.to_string(), input_hash.to_string());
        let mut map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((_, running)) = map.get(&key) {
            return Slot::Follower(running.clone());
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let generation = start(ticket).shared();
        map.insert(key, (ticket, generation.clone()));
        Slot::Leader(generation)
    }

    /// Forget a finished generation. A newer generation registered under the
    /// same key is left alone.
    pub(crate) fn finish(&self, cache_key: &str, input_hash: &str, ticket: u64) {
        let key = (cache_key.to_string(), input_hash.to_string());
        let mut map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        if matches!(map.get(&key), Some((t, _)) if *t == ticket) {
            map.remove(&key);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
