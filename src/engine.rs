//! The engine: process-wide state threaded through every handler, matching
//! the original's global module state (send list, receive cache, sockets,
//! origin id) wrapped into one context object, and the teacher's `Node`/
//! `ConnectionManager` pattern of a single `Arc`-shared struct handed to
//! every spawned task.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::CatbusConfig;
use crate::filetransfer::FileSessions;
use crate::kv::{KvStore, NameFile, PersistStore, StaticTable};
use crate::link::{LinkRuntime, LinkStore};

/// The shared sending path. A `tokio::sync::Mutex` around the socket
/// stands in for the original's "wait for bytes_read == 0" discipline: the
/// dispatcher reads-then-replies without ever releasing this lock mid
/// handler, so a concurrent announce/publish send can never interleave
/// with (and corrupt) a dispatch reply.
pub struct Engine {
    pub config: CatbusConfig,
    pub socket: Arc<UdpSocket>,
    pub send_lock: AsyncMutex<()>,
    pub origin_id: u64,
    pub meta_tags: Vec<u32>,
    pub kv: KvStore,
    pub links: LinkStore,
    pub link_runtime: LinkRuntime,
    pub files: FileSessions,
}

impl Engine {
    pub async fn new(config: CatbusConfig, statics: StaticTable) -> std::io::Result<Arc<Engine>> {
        std::fs::create_dir_all(&config.data_dir)?;

        let socket = UdpSocket::bind((config.bind_addr, config.port)).await?;
        socket.set_broadcast(true)?;

        let names = NameFile::open_truncated(config.kv_names_path())?;
        let kv = KvStore::new_with_names(statics, names);
        let (persist, restored) = PersistStore::open(config.kv_data_path()).map_err(std::io::Error::other)?;
        kv.attach_persistence(persist, restored);

        let links = LinkStore::open(config.kvlinks_path()).map_err(std::io::Error::other)?;
        let origin_id: u64 = rand::thread_rng().r#gen();

        let engine = Arc::new(Engine {
            files: FileSessions::new(config.data_dir.clone()),
            meta_tags: config.tags.clone(),
            config,
            socket: Arc::new(socket),
            send_lock: AsyncMutex::new(()),
            origin_id,
            kv,
            links,
            link_runtime: LinkRuntime::new(),
        });

        Ok(engine)
    }

    pub async fn send_datagram(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<()> {
        let _guard = self.send_lock.lock().await;
        self.socket.send_to(buf, to).await?;
        Ok(())
    }

    pub async fn broadcast_datagram(&self, buf: &[u8]) -> std::io::Result<()> {
        let addr: SocketAddr = ([255, 255, 255, 255], self.config.port).into();
        self.send_datagram(buf, addr).await
    }

    pub fn matches_meta(&self, query: &[u32; crate::link::QUERY_LEN]) -> bool {
        crate::link::query_matches(query, &self.meta_tags)
    }
}
