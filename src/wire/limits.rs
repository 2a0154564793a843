//! Protocol-wide constants. Grouped separately from `header.rs`/`message.rs`
//! the way the teacher's `net/types.rs` keeps its magic numbers in one spot.

use std::time::Duration;

/// Default UDP port for discovery and data traffic.
pub const DISCOVERY_PORT: u16 = 7645;

/// Cap on the data payload of any reply message.
pub const MAX_DATA: usize = 548;

/// Cap on the `count` field of a `LookupHash` request.
pub const MAX_HASH_LOOKUPS: usize = 8;

pub const STRING_LEN: usize = 32;
pub const QUERY_LEN: usize = crate::link::QUERY_LEN;

/// Cap on entries returned per `FileList` page.
pub const MAX_FILE_ENTRIES: usize = 8;

/// Announce interval is `ANNOUNCE_BASE_MS + uniform(0..ANNOUNCE_JITTER_MS)`.
pub const ANNOUNCE_BASE_MS: u64 = 4000;
pub const ANNOUNCE_JITTER_MS: u64 = 1024;

/// Pacing between datagrams in the announce task's link-broadcast sweep.
pub const LINK_BROADCAST_PACING: Duration = Duration::from_millis(10);

/// TTL refreshed to this value whenever a send-list/receive-cache entry is
/// touched; decremented by `TTL_DECREMENT` on every announce tick.
pub const TTL_INITIAL: i16 = 32;
pub const TTL_DECREMENT: i16 = 4;

/// File session inactivity timeout: `FILE_SESSION_TICKS` ticks of
/// `FILE_SESSION_TICK` each (40 * 100ms = 4s).
pub const FILE_SESSION_TICKS: u32 = 40;
pub const FILE_SESSION_TICK: Duration = Duration::from_millis(100);

/// Minimum spacing between persist-worker sweeps.
pub const PERSIST_COOLDOWN: Duration = Duration::from_secs(2);

/// Yield pacing between records within a single persist sweep.
pub const PERSIST_SWEEP_PACING: Duration = Duration::from_millis(20);
