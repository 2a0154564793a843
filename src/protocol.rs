//! The protocol dispatcher: one UDP socket, one `recv_from` loop, one
//! `msg_type` match. Grounded on `catbus.c`'s `catbus_thread` and, for the
//! "decode, look up a handler, single error exit point" shape, the
//! teacher's `net/connection.rs` message-handling loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::Type;
use crate::engine::Engine;
use crate::error::{ErrorCode, ProtocolError};
use crate::kv::KeyMeta;
use crate::wire::header::{Header, HeaderFlags};
use crate::wire::limits::{MAX_DATA, MAX_FILE_ENTRIES, MAX_HASH_LOOKUPS, QUERY_LEN, STRING_LEN};
use crate::wire::message::*;
use crate::wire::{decode_payload, encode_payload, MsgType};

const META_PAGE_SIZE: usize = 16;

/// Run the dispatcher loop until the socket errors out or the process is
/// asked to shut down. One task, one socket, read-then-reply-then-loop —
/// this ordering is what makes it safe for this task specifically to both
/// receive and send on the shared socket (see `Engine::send_datagram`).
pub async fn run(engine: Arc<Engine>) -> std::io::Result<()> {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = engine.socket.recv_from(&mut buf).await?;
        let datagram = &buf[..n];

        let Some((header, body)) = Header::decode(datagram) else {
            debug!("dropped datagram with bad magic/version from {from}");
            continue;
        };
        if header.origin_id == engine.origin_id {
            continue; // hearing our own broadcast
        }

        match dispatch(&engine, &header, body, from).await {
            Ok(Some((reply_type, payload))) => {
                if let Err(e) = send_reply(&engine, reply_type, header.transaction_id, payload, from).await {
                    warn!("failed to send reply to {from}: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => {
                if !e.suppressed() {
                    let _ = send_error(&engine, header.transaction_id, e.code(), from).await;
                } else {
                    debug!("suppressed error reply to {from}: {e}");
                }
            }
        }
    }
}

async fn send_reply(
    engine: &Engine,
    msg_type: MsgType,
    transaction_id: u32,
    payload: Vec<u8>,
    to: SocketAddr,
) -> std::io::Result<()> {
    let header = Header::new(msg_type, engine.origin_id).with_transaction(transaction_id);
    let mut buf = Vec::with_capacity(payload.len() + 32);
    header.encode(&mut buf);
    buf.extend_from_slice(&payload);
    engine.send_datagram(&buf, to).await
}

async fn send_error(engine: &Engine, transaction_id: u32, code: ErrorCode, to: SocketAddr) -> std::io::Result<()> {
    let mut buf = Vec::new();
    encode_payload(&ErrorPayload { code }, &mut buf).ok();
    send_reply(engine, MsgType::Error, transaction_id, buf, to).await
}

fn padded_query(tags: &[u32]) -> [u32; QUERY_LEN] {
    let mut out = [0u32; QUERY_LEN];
    for (i, t) in tags.iter().take(QUERY_LEN).enumerate() {
        out[i] = *t;
    }
    out
}

fn padded_name(name: &str) -> [u8; STRING_LEN] {
    let mut out = [0u8; STRING_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(STRING_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn wire_meta(meta: &KeyMeta) -> WireKeyMeta {
    WireKeyMeta { hash: meta.hash, ty: meta.ty, array_len: meta.array_len }
}

/// Decode and run one message against engine state, returning an optional
/// `(msg_type, encoded payload)` reply for the caller to send back. Errors
/// propagate to the single dispatch-loop exit point above.
async fn dispatch(
    engine: &Arc<Engine>,
    header: &Header,
    body: &[u8],
    from: SocketAddr,
) -> Result<Option<(MsgType, Vec<u8>)>, ProtocolError> {
    match header.msg_type {
        MsgType::Announce => Ok(None),

        MsgType::Discover => {
            let req: DiscoverPayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            let wants_all = header.flags.contains(HeaderFlags::QUERY_ALL);
            if wants_all || engine.matches_meta(&req.query) {
                let payload = AnnouncePayload { query: padded_query(&engine.meta_tags), data_port: engine.config.port };
                let mut out = Vec::new();
                encode_payload(&payload, &mut out).map_err(|_| ProtocolError::Malformed)?;
                Ok(Some((MsgType::Announce, out)))
            } else {
                Ok(None)
            }
        }

        MsgType::LookupHash => {
            let req: LookupHashPayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            let names = req
                .hashes
                .iter()
                .take(MAX_HASH_LOOKUPS)
                .map(|&h| {
                    let name = engine
                        .kv
                        .lookup_hash(h)
                        .and_then(|m| m.name)
                        .or_else(|| engine.kv.lookup_name(h));
                    match name {
                        Some(n) => padded_name(&n),
                        None => [0u8; STRING_LEN],
                    }
                })
                .collect();
            let mut out = Vec::new();
            encode_payload(&ResolvedHashPayload { names }, &mut out).map_err(|_| ProtocolError::Malformed)?;
            Ok(Some((MsgType::ResolvedHash, out)))
        }

        MsgType::GetKeyMeta => {
            let req: GetKeyMetaPayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            let total = engine.kv.count();
            let page_count = total.div_ceil(META_PAGE_SIZE).max(1) as u16;
            let page = (req.start_index as usize / META_PAGE_SIZE) as u16;

            let items: Vec<WireKeyMeta> = (req.start_index as usize..total)
                .take(META_PAGE_SIZE)
                .filter_map(|i| engine.kv.lookup_index(i))
                .map(|m| wire_meta(&m))
                .collect();

            let mut out = Vec::new();
            encode_payload(
                &KeyMetaPayload { page, page_count, item_count: items.len() as u16, items },
                &mut out,
            )
            .map_err(|_| ProtocolError::Malformed)?;
            Ok(Some((MsgType::KeyMeta, out)))
        }

        MsgType::GetKeys => {
            let req: GetKeysPayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            let mut items = Vec::new();
            let mut size = 0usize;
            for hash in req.hashes {
                let Some(meta) = engine.kv.lookup_hash(hash) else { continue };
                let data_len = meta.ty.size() * meta.array_len.max(1) as usize;
                if size + data_len > MAX_DATA {
                    break;
                }
                let mut data = vec![0u8; data_len];
                if engine.kv.get(hash, Type::None, &mut data).is_err() {
                    continue;
                }
                size += data_len;
                items.push((wire_meta(&meta), data));
            }
            let mut out = Vec::new();
            encode_payload(&KeyDataPayload { items }, &mut out).map_err(|_| ProtocolError::Malformed)?;
            Ok(Some((MsgType::KeyData, out)))
        }

        MsgType::SetKeys => {
            let req: SetKeysPayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            let mut replies = Vec::new();
            for (meta, data) in req.items {
                let current = engine.kv.lookup_hash(meta.hash).ok_or(ProtocolError::Kv(crate::error::KvError::NotFound))?;
                if current.ty != meta.ty {
                    return Err(ProtocolError::Kv(crate::error::KvError::InvalidType));
                }
                engine.kv.set(meta.hash, meta.ty, &data)?;

                let data_len = current.ty.size() * current.array_len.max(1) as usize;
                let mut fresh = vec![0u8; data_len];
                engine.kv.get(meta.hash, Type::None, &mut fresh)?;
                replies.push((wire_meta(&current), fresh));
            }
            let mut out = Vec::new();
            encode_payload(&KeyDataPayload { items: replies }, &mut out).map_err(|_| ProtocolError::Malformed)?;
            Ok(Some((MsgType::KeyData, out)))
        }

        MsgType::Link => {
            let req: LinkPayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            if req.flags.contains(LinkMsgFlags::SOURCE) {
                let query_ok = req.query.iter().all(|&t| t == 0) || engine.matches_meta(&req.query);
                if query_ok && engine.kv.lookup_hash(req.dest_hash).is_some() {
                    let reply = LinkPayload {
                        flags: LinkMsgFlags::DEST,
                        source_hash: req.source_hash,
                        dest_hash: req.dest_hash,
                        query: req.query,
                        data_port: engine.config.port,
                    };
                    let mut out = Vec::new();
                    encode_payload(&reply, &mut out).map_err(|_| ProtocolError::Malformed)?;
                    return Ok(Some((MsgType::Link, out)));
                }
                Ok(None)
            } else if req.flags.contains(LinkMsgFlags::DEST) {
                if engine.kv.lookup_hash(req.source_hash).is_some() {
                    engine.link_runtime.add_send_target(from, req.source_hash, req.dest_hash, req.query);
                    info!("link established: {:08x} -> {:08x} @ {from}", req.source_hash, req.dest_hash);
                }
                Ok(None)
            } else {
                Ok(None)
            }
        }

        MsgType::LinkData => {
            let req: LinkDataPayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            engine.link_runtime.apply_link_data(&engine.kv, from, req.dest_hash, req.meta.ty, req.sequence, &req.data);
            Ok(None)
        }

        MsgType::LinkGet => {
            let req: LinkGetPayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            let record = engine.links.get(req.index as usize)?;
            let mut out = Vec::new();
            encode_payload(
                &LinkMetaPayload {
                    tag: record.tag,
                    flags: record.flags.0,
                    source_hash: record.source_hash,
                    dest_hash: record.dest_hash,
                    query: record.query,
                },
                &mut out,
            )
            .map_err(|_| ProtocolError::Malformed)?;
            Ok(Some((MsgType::LinkMeta, out)))
        }

        MsgType::LinkDelete => {
            let req: LinkDeletePayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            engine.links.purge(req.tag)?;
            Ok(None)
        }

        MsgType::LinkAdd => {
            let req: LinkAddPayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            engine.links.create(req.is_source, req.source_hash, req.dest_hash, req.query, req.tag)?;
            Ok(None)
        }

        MsgType::FileOpen => {
            let req: FileOpenPayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            let session_id = engine.files.open(&req.filename, req.mode)?;
            let mut out = Vec::new();
            encode_payload(&FileConfirmPayload { session_id, page_size: MAX_DATA as u32 }, &mut out)
                .map_err(|_| ProtocolError::Malformed)?;
            Ok(Some((MsgType::FileConfirm, out)))
        }

        MsgType::FileGet => {
            let req: FileGetPayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            let data = engine.files.get(req.session_id, req.offset, MAX_DATA)?;
            let mut out = Vec::new();
            encode_payload(&FileDataPayload { session_id: req.session_id, offset: req.offset, data }, &mut out)
                .map_err(|_| ProtocolError::Malformed)?;
            Ok(Some((MsgType::FileData, out)))
        }

        MsgType::FileData => {
            let req: FileDataPayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            let applied = engine.files.data(req.session_id, req.offset, &req.data)?;
            if applied {
                let next_offset = req.offset + req.data.len() as u32;
                let mut out = Vec::new();
                encode_payload(&FileGetPayload { session_id: req.session_id, offset: next_offset }, &mut out)
                    .map_err(|_| ProtocolError::Malformed)?;
                send_reply(engine, MsgType::FileGet, header.transaction_id, out, from).await.ok();
            }
            Ok(None)
        }

        MsgType::FileClose => {
            let req: FileClosePayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            engine.files.close(req.session_id)?;
            let mut out = Vec::new();
            encode_payload(&FileAckPayload { session_id: req.session_id }, &mut out).map_err(|_| ProtocolError::Malformed)?;
            Ok(Some((MsgType::FileAck, out)))
        }

        MsgType::FileDelete => {
            let req: FileDeletePayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            engine.files.delete(&req.filename)?;
            let mut out = Vec::new();
            encode_payload(&FileAckPayload { session_id: 0 }, &mut out).map_err(|_| ProtocolError::Malformed)?;
            Ok(Some((MsgType::FileAck, out)))
        }

        MsgType::FileCheck => {
            let req: FileCheckPayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            let path = engine.files.file_path(&req.filename);
            let engine = Arc::clone(engine);
            tokio::spawn(async move {
                match crate::filetransfer::stream_file_hash(&path).await {
                    Ok((hash, file_len)) => {
                        let mut out = Vec::new();
                        if encode_payload(&FileCheckResponsePayload { hash, file_len: file_len as u32 }, &mut out).is_ok() {
                            let _ = send_reply(&engine, MsgType::FileCheckResponse, 0, out, from).await;
                        }
                    }
                    Err(e) => debug!("file check failed for {}: {e}", path.display()),
                }
            });
            Ok(None)
        }

        MsgType::FileList => {
            let req: FileListPayload = decode_payload(body).map_err(|_| ProtocolError::Malformed)?;
            let (next_index, entries) = engine.files.list(req.start_index, MAX_FILE_ENTRIES);
            let items = entries.into_iter().map(|(filename, size)| FileListEntry { size, flags: 0, filename }).collect();
            let mut out = Vec::new();
            encode_payload(&FileListDataPayload { next_index, items }, &mut out).map_err(|_| ProtocolError::Malformed)?;
            Ok(Some((MsgType::FileListData, out)))
        }

        MsgType::Error => Ok(None),

        MsgType::ResolvedHash
        | MsgType::KeyMeta
        | MsgType::KeyData
        | MsgType::LinkMeta
        | MsgType::FileConfirm
        | MsgType::FileAck
        | MsgType::FileCheckResponse
        | MsgType::FileListData
        | MsgType::Unknown(_) => Err(ProtocolError::UnknownMsg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_query_truncates_and_zero_fills() {
        let q = padded_query(&[1, 2, 3]);
        assert_eq!(q[0], 1);
        assert_eq!(q[3], 0);
    }

    #[test]
    fn padded_name_truncates_to_string_len() {
        let long = "x".repeat(STRING_LEN + 10);
        let n = padded_name(&long);
        assert_eq!(n.len(), STRING_LEN);
    }
}
