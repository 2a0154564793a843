//! Send list / receive cache: the TTL-bearing runtime tables that drive
//! link publication and inbound dedup. Ported from `catbus.c`'s
//! `send_list`/`receive_cache` linked lists and the announce thread's TTL
//! sweep; the `Mutex<HashMap<...>>`-wrapped-in-a-manager shape follows the
//! teacher's `net/connection.rs` `ConnectionManager`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::codec::Type;
use crate::kv::KvStore;
use crate::link::store::QUERY_LEN;

/// TTL assigned/refreshed whenever a send-list or receive-cache entry is
/// touched; the announce tick decrements every entry by this much each
/// round (roughly 8 ticks, ~32s, to fully expire).
pub const TTL_INITIAL: i16 = 32;
pub const TTL_DECREMENT: i16 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SendKey {
    remote: SocketAddr,
    source_hash: u32,
    dest_hash: u32,
}

#[derive(Debug, Clone)]
struct SendEntry {
    sequence: u32,
    ttl: i16,
    publish_flag: bool,
    query: [u32; QUERY_LEN],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ReceiveKey {
    remote: SocketAddr,
    dest_hash: u32,
}

#[derive(Debug, Clone)]
struct ReceiveEntry {
    last_sequence: u32,
    ttl: i16,
}

/// One outbound `LinkData` datagram the publish worker should send.
pub struct PublishJob {
    pub remote: SocketAddr,
    pub source_hash: u32,
    pub dest_hash: u32,
    pub sequence: u32,
    pub query: [u32; QUERY_LEN],
}

pub struct LinkRuntime {
    send_list: Mutex<HashMap<SendKey, SendEntry>>,
    receive_cache: Mutex<HashMap<ReceiveKey, ReceiveEntry>>,
    publish_notify: std::sync::Arc<tokio::sync::Notify>,
}

impl Default for LinkRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkRuntime {
    pub fn new() -> Self {
        LinkRuntime {
            send_list: Mutex::new(HashMap::new()),
            receive_cache: Mutex::new(HashMap::new()),
            publish_notify: std::sync::Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn publish_wake_signal(&self) -> std::sync::Arc<tokio::sync::Notify> {
        self.publish_notify.clone()
    }

    /// Accept a remote peer as an outbound publish target for `source_hash`
    /// (dest-side `Link` handling: the sender told us they're the `Dest`
    /// for our `source_hash`, so we add them to our send list).
    pub fn add_send_target(&self, remote: SocketAddr, source_hash: u32, dest_hash: u32, query: [u32; QUERY_LEN]) {
        let key = SendKey { remote, source_hash, dest_hash };
        let mut list = self.send_list.lock().unwrap();
        list.entry(key)
            .and_modify(|e| e.ttl = TTL_INITIAL)
            .or_insert(SendEntry { sequence: 0, ttl: TTL_INITIAL, publish_flag: false, query });
    }

    /// Flag every send-list entry whose `source_hash` matches for
    /// publication and bump its sequence number, then wake the publish
    /// worker. Does not send synchronously.
    pub fn publish(&self, source_hash: u32) {
        let mut any = false;
        let mut list = self.send_list.lock().unwrap();
        for (key, entry) in list.iter_mut() {
            if key.source_hash == source_hash {
                entry.sequence = entry.sequence.wrapping_add(1);
                entry.publish_flag = true;
                any = true;
            }
        }
        drop(list);
        if any {
            self.publish_notify.notify_one();
        }
    }

    /// Drain every flagged send-list entry into a batch of jobs, clearing
    /// the flag as it goes. Called by the publish worker on wake.
    pub fn drain_publish_jobs(&self) -> Vec<PublishJob> {
        let mut list = self.send_list.lock().unwrap();
        let mut jobs = Vec::new();
        for (key, entry) in list.iter_mut() {
            if entry.publish_flag {
                entry.publish_flag = false;
                jobs.push(PublishJob {
                    remote: key.remote,
                    source_hash: key.source_hash,
                    dest_hash: key.dest_hash,
                    sequence: entry.sequence,
                    query: entry.query,
                });
            }
        }
        jobs
    }

    /// Announce-tick TTL sweep: decrement every send-list entry by 4 and
    /// republish surviving ones (the periodic republish side effect of
    /// the TTL system); actual removal of expired send-list entries is
    /// left to the publish worker, matching the original's division of
    /// labor between the announce thread and `publish_thread`.
    pub fn tick_send_list(&self) -> Vec<u32> {
        let mut list = self.send_list.lock().unwrap();
        let mut to_republish = Vec::new();
        for (key, entry) in list.iter_mut() {
            entry.ttl -= TTL_DECREMENT;
            if entry.ttl >= 0 {
                to_republish.push(key.source_hash);
            }
        }
        to_republish
    }

    /// Remove every send-list entry whose TTL has gone negative. Run by
    /// the publish worker after draining jobs.
    pub fn reap_expired_send_list(&self) {
        self.send_list.lock().unwrap().retain(|_, e| e.ttl >= 0);
    }

    /// Announce-tick TTL sweep for the receive cache; expired entries are
    /// removed directly here (no deferred worker needed — dropping one
    /// only loses dedup bookkeeping, it has no send-side effect).
    pub fn tick_receive_cache(&self) {
        self.receive_cache.lock().unwrap().retain(|_, e| {
            e.ttl -= TTL_DECREMENT;
            e.ttl >= 0
        });
    }

    /// Apply an inbound `LinkData` datagram: dedup against the receive
    /// cache by `(remote, dest_hash)`, and only actually write the value
    /// if the sequence number differs from what's cached. `wire_type` is
    /// the type carried in the message's own meta — the resolved fix for
    /// the original's hardcoded `TYPE_INT32` bug.
    pub fn apply_link_data(
        &self,
        kv: &KvStore,
        remote: SocketAddr,
        dest_hash: u32,
        wire_type: Type,
        sequence: u32,
        payload: &[u8],
    ) {
        let key = ReceiveKey { remote, dest_hash };
        let mut cache = self.receive_cache.lock().unwrap();

        let is_duplicate = match cache.get_mut(&key) {
            Some(entry) => {
                let dup = entry.last_sequence == sequence;
                entry.last_sequence = sequence;
                entry.ttl = TTL_INITIAL;
                dup
            }
            None => {
                cache.insert(key, ReceiveEntry { last_sequence: sequence, ttl: TTL_INITIAL });
                false
            }
        };
        drop(cache);

        if !is_duplicate {
            let _ = kv.set(dest_hash, wire_type, payload);
        }
    }
}
