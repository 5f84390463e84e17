// crates/tga-core/src/session_cache.rs
// ============================================================================
// Module: SessionCache
// Description: Bounded in-memory cache of verified capabilities, keyed by session.
// Purpose: Provide a fast path for repeat calls within one authorization window.
// Dependencies: crate::identifiers, rand, std::collections
// ============================================================================

//! ## Overview
//! The session cache is a pure optimization: every state transition still
//! writes to the log, and a cold lookup falls back to full verification. It
//! is inserted only at a successful `Authorized` transition, keyed by a
//! freshly generated 128-bit `session_id`, and bounded by a default capacity
//! of 1024 with least-recently-used eviction. On key rotation the whole
//! cache is flushed: `session_id` does not survive rotation.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;

use rand::RngCore;
use rand::rngs::OsRng;

use crate::identifiers::Digest;
use crate::identifiers::SessionId;
use crate::identifiers::TraceId;

/// Default bounded capacity for the session cache.
pub const DEFAULT_CAPACITY: usize = 1024;

// ============================================================================
// SECTION: Entry
// ============================================================================

/// One cached, verified capability binding.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// The capability hash this session was authorized under.
    pub capability_hash: Digest,
    /// The moment this entry is no longer valid, unix seconds.
    pub expires_at: i64,
    /// Traces this session is permitted to continue authorizing.
    pub trace_id_allow_list: Vec<TraceId>,
}

struct Slot {
    entry: SessionEntry,
    last_used: u64,
}

// ============================================================================
// SECTION: Cache
// ============================================================================

/// Bounded, least-recently-used cache of verified capability sessions.
pub struct SessionCache {
    capacity: usize,
    entries: HashMap<SessionId, Slot>,
    clock: u64,
}

impl SessionCache {
    /// Builds an empty cache with the given bounded capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: HashMap::new(), clock: 0 }
    }

    /// Inserts a freshly authorized session, generating a new random
    /// `session_id`, evicting the least-recently-used entry first if the
    /// cache is already at capacity.
    #[must_use]
    pub fn insert(&mut self, entry: SessionEntry) -> SessionId {
        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        let mut raw = [0_u8; 16];
        OsRng.fill_bytes(&mut raw);
        let session_id = SessionId::from_bytes(raw);
        self.clock += 1;
        self.entries.insert(session_id, Slot { entry, last_used: self.clock });
        session_id
    }

    /// Looks up a session, returning the entry only if it has not yet
    /// expired relative to `now`. An expired entry is evicted on lookup.
    pub fn lookup(&mut self, session_id: &SessionId, now: i64) -> Option<SessionEntry> {
        let expired = self.entries.get(session_id).is_some_and(|slot| slot.entry.expires_at <= now);
        if expired {
            self.entries.remove(session_id);
            return None;
        }
        self.clock += 1;
        let clock = self.clock;
        let slot = self.entries.get_mut(session_id)?;
        slot.last_used = clock;
        Some(slot.entry.clone())
    }

    /// Flushes the entire cache, used on Supervisor key rotation.
    pub fn clear_on_rotate(&mut self) {
        self.entries.clear();
    }

    /// Returns the number of currently cached sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the cache currently holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .entries
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(session_id, _)| *session_id)
        {
            self.entries.remove(&oldest);
        }
    }
}
