//! Background tasks that run alongside the dispatcher: the announce loop
//! (periodic broadcast, TTL sweeps, link rebroadcast), the publish worker
//! (send list -> `LinkData` datagrams), and the persist worker (RAM ->
//! disk sweeps). Grounded on `catbus.c`'s three protothreads of the same
//! names, mapped onto the teacher's "one `tokio::spawn`'d loop per
//! concern, woken by a `Notify` or a `sleep`" task shape from
//! `net/connection.rs`'s `ConnectionManager`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::engine::Engine;
use crate::wire::header::Header;
use crate::wire::limits::{
    ANNOUNCE_BASE_MS, ANNOUNCE_JITTER_MS, FILE_SESSION_TICK, LINK_BROADCAST_PACING, PERSIST_COOLDOWN,
};
use crate::wire::message::{encode_payload, AnnouncePayload, LinkAddPayload, MsgType};

fn padded_query(tags: &[u32]) -> [u32; crate::link::QUERY_LEN] {
    let mut out = [0u32; crate::link::QUERY_LEN];
    for (i, t) in tags.iter().take(crate::link::QUERY_LEN).enumerate() {
        out[i] = *t;
    }
    out
}

/// Periodic announce loop: jittered broadcast, send-list/receive-cache TTL
/// sweep, and a paced rebroadcast of every valid link record so new peers
/// on the network can discover existing links.
pub async fn run_announce(engine: Arc<Engine>) {
    loop {
        let jitter = rand::thread_rng().gen_range(0..ANNOUNCE_JITTER_MS);
        tokio::time::sleep(Duration::from_millis(ANNOUNCE_BASE_MS + jitter)).await;

        if let Err(e) = broadcast_announce(&engine).await {
            warn!("announce broadcast failed: {e}");
        }

        for source_hash in engine.link_runtime.tick_send_list() {
            engine.link_runtime.publish(source_hash);
        }
        engine.link_runtime.tick_receive_cache();

        rebroadcast_links(&engine).await;
    }
}

async fn broadcast_announce(engine: &Engine) -> std::io::Result<()> {
    let header = Header::new(MsgType::Announce, engine.origin_id);
    let payload = AnnouncePayload { query: padded_query(&engine.meta_tags), data_port: engine.config.port };

    let mut buf = Vec::new();
    header.encode(&mut buf);
    encode_payload(&payload, &mut buf).map_err(std::io::Error::other)?;
    engine.broadcast_datagram(&buf).await
}

/// Stream every valid link record as a `LinkAdd`-shaped broadcast, paced so
/// a large link table doesn't burst the network in one datagram storm.
async fn rebroadcast_links(engine: &Engine) {
    for record in engine.links.valid_records() {
        let payload = LinkAddPayload {
            is_source: record.flags.contains(crate::link::LinkFlags::SOURCE),
            source_hash: record.source_hash,
            dest_hash: record.dest_hash,
            query: record.query,
            tag: record.tag,
        };
        let header = Header::new(MsgType::LinkAdd, engine.origin_id);
        let mut buf = Vec::new();
        header.encode(&mut buf);
        if encode_payload(&payload, &mut buf).is_ok() {
            let _ = engine.broadcast_datagram(&buf).await;
        }
        tokio::time::sleep(LINK_BROADCAST_PACING).await;
    }
}

/// Publish worker: wakes on `link_runtime.publish_wake_signal()`, drains
/// every flagged send-list entry into a `LinkData` datagram, then reaps
/// send-list entries whose TTL has lapsed.
pub async fn run_publish_worker(engine: Arc<Engine>) {
    let wake = engine.link_runtime.publish_wake_signal();
    loop {
        wake.notified().await;

        for job in engine.link_runtime.drain_publish_jobs() {
            let Some(meta) = engine.kv.lookup_hash(job.source_hash) else { continue };
            let mut data = vec![0u8; meta.ty.size() * meta.array_len.max(1) as usize];
            if engine.kv.get(job.source_hash, crate::codec::Type::None, &mut data).is_err() {
                continue;
            }

            let header = Header::new(MsgType::LinkData, engine.origin_id);
            let payload = crate::wire::message::LinkDataPayload {
                source_hash: job.source_hash,
                dest_hash: job.dest_hash,
                sequence: job.sequence,
                meta: crate::wire::message::WireKeyMeta { hash: meta.hash, ty: meta.ty, array_len: meta.array_len },
                data,
            };

            let mut buf = Vec::new();
            header.encode(&mut buf);
            if encode_payload(&payload, &mut buf).is_ok() {
                if let Err(e) = engine.send_datagram(&buf, job.remote).await {
                    warn!("failed to send link data to {}: {e}", job.remote);
                }
            }
        }

        engine.link_runtime.reap_expired_send_list();
    }
}

/// Persist worker: wakes on `kv.persist_wake_signal()`, sweeps every
/// persist-flagged static entry to disk, and enforces a minimum cooldown
/// between sweeps so a write-heavy client can't thrash the disk.
pub async fn run_persist_worker(engine: Arc<Engine>) {
    let wake = engine.kv.persist_wake_signal();
    loop {
        wake.notified().await;
        engine.kv.sweep_persist();
        tokio::time::sleep(PERSIST_COOLDOWN).await;
    }
}

/// File-session inactivity tick, run on its own short interval rather than
/// folded into the announce loop's multi-second cadence, matching the
/// original's separate, faster file-transfer timeout granularity.
pub async fn run_file_session_ticker(engine: Arc<Engine>) {
    loop {
        tokio::time::sleep(FILE_SESSION_TICK).await;
        engine.files.tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_query_zero_fills_short_tag_lists() {
        let q = padded_query(&[9]);
        assert_eq!(q[0], 9);
        assert_eq!(q[1], 0);
    }
}
