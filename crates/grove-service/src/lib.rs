// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Headless Grove node: framed request dispatcher over a Unix socket.
//!
//! One [`HubState`] owns the stores and the watch registry; each accepted
//! connection runs its own handler task and serializes store access through
//! the shared mutex. Responses and watch frames leave through a per-connection
//! outbox so the socket writer never blocks the dispatcher.

pub mod config;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use grove_proto::{
    decode_payload, encode_frame, split_frame, Graph, PushStatus, Request, Wire,
};
use grove_store::{Key, KeyStore, MemoryNode, Tag, TagStore, ValueStore};
use grove_sync::{pull_keys, pull_tags, push_keys, push_tags, watch_delta};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Shared handle to the node state.
pub type SharedHub = Arc<Mutex<HubState>>;

/// Outbox capacity per connection. A full outbox backpressures the mutating
/// request until the subscriber drains.
const OUTBOX_CAPACITY: usize = 256;

struct WatcherState {
    tags: BTreeSet<Tag>,
    announced: BTreeMap<Tag, BTreeSet<Key>>,
}

/// The node's shared state: stores, connections, watch subscriptions.
#[derive(Default)]
pub struct HubState {
    node: MemoryNode,
    next_conn_id: u64,
    conns: HashMap<u64, mpsc::Sender<Vec<u8>>>,
    watchers: HashMap<u64, WatcherState>,
}

impl HubState {
    /// An empty node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbox, returning its id.
    pub fn add_conn(&mut self, tx: mpsc::Sender<Vec<u8>>) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        self.conns.insert(id, tx);
        id
    }

    /// Drop a connection and any watch subscription it held.
    pub fn remove_conn(&mut self, conn_id: u64) {
        self.conns.remove(&conn_id);
        self.watchers.remove(&conn_id);
    }

    async fn reply<T: Wire>(&self, conn_id: u64, msg: &T) -> Result<()> {
        let tx = self
            .conns
            .get(&conn_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing conn {conn_id}"))?;
        tx.send(encode_frame(msg))
            .await
            .map_err(|_| anyhow::anyhow!("conn {conn_id} outbox closed"))
    }

    /// Fan one watch frame out to every subscriber whose tags changed, and
    /// prune subscribers whose outbox is gone.
    async fn notify_watchers(&mut self) {
        let ids: Vec<u64> = self.watchers.keys().copied().collect();
        let mut dead: Vec<u64> = Vec::new();
        for id in ids {
            let delta = self.watchers.get(&id).and_then(|w| {
                watch_delta(&self.node.keys, &self.node.tags, &w.tags, &w.announced)
            });
            let Some((changed, graph)) = delta else {
                continue;
            };
            let frame = encode_frame(&(changed.clone(), graph));
            if let Some(w) = self.watchers.get_mut(&id) {
                for tag in &changed {
                    let current = self.node.tags.read(tag);
                    w.announced.insert(tag.clone(), current);
                }
            }
            let Some(tx) = self.conns.get(&id).cloned() else {
                dead.push(id);
                continue;
            };
            if tx.send(frame).await.is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            self.watchers.remove(&id);
        }
    }
}

/// Execute one decoded request for `conn_id`.
///
/// Returns `Ok(true)` when the request switched the connection into watch
/// mode. Store-contract errors without a defined wire failure path (anything
/// but push) bubble up as `Err`, which drops the connection.
pub async fn handle_message(req: Request, conn_id: u64, hub: &SharedHub) -> Result<bool> {
    let mut h = hub.lock().await;
    match req {
        Request::KeyAdd { key, preds } => {
            h.node.keys.add(key, &preds)?;
            h.reply(conn_id, &()).await?;
        }
        Request::KeyList => {
            let keys = h.node.keys.list();
            h.reply(conn_id, &keys).await?;
        }
        Request::KeyPred { key } => {
            let preds = h.node.keys.preds(&key);
            h.reply(conn_id, &preds).await?;
        }
        Request::ValueWrite { bytes } => {
            let key = h.node.values.write(&bytes);
            h.reply(conn_id, &key).await?;
        }
        Request::ValueRead { key } => {
            let value: Option<Vec<u8>> = h.node.values.read(&key).map(|v| v.to_vec());
            h.reply(conn_id, &value).await?;
        }
        Request::TagUpdate { tag, keys } => {
            h.node.tag_update(tag, keys)?;
            h.reply(conn_id, &()).await?;
            h.notify_watchers().await;
        }
        Request::TagRemove { tag } => {
            h.node.tags.remove(&tag);
            h.reply(conn_id, &()).await?;
            h.notify_watchers().await;
        }
        Request::TagRead { tag } => {
            let keys = h.node.tags.read(&tag);
            h.reply(conn_id, &keys).await?;
        }
        Request::TagList => {
            let tags = h.node.tags.list();
            h.reply(conn_id, &tags).await?;
        }
        Request::SyncPullKeys { roots, have } => {
            let graph: Graph = pull_keys(&h.node.keys, &h.node.tags, &roots, &have);
            h.reply(conn_id, &graph).await?;
        }
        Request::SyncPullTags => {
            let bundle = pull_tags(&h.node.tags);
            h.reply(conn_id, &bundle).await?;
        }
        Request::SyncPushKeys { graph, tags } => {
            let node = &mut h.node;
            let status = match push_keys(&mut node.keys, &mut node.tags, &graph, &tags) {
                Ok(()) => PushStatus::Ok,
                Err(err) => PushStatus::Rejected(err.to_string()),
            };
            let applied = status == PushStatus::Ok;
            h.reply(conn_id, &status).await?;
            if applied {
                h.notify_watchers().await;
            }
        }
        Request::SyncPushTags { tags } => {
            let node = &mut h.node;
            let status = match push_tags(&node.keys, &mut node.tags, &tags) {
                Ok(()) => PushStatus::Ok,
                Err(err) => PushStatus::Rejected(err.to_string()),
            };
            let applied = status == PushStatus::Ok;
            h.reply(conn_id, &status).await?;
            if applied {
                h.notify_watchers().await;
            }
        }
        Request::SyncWatch { tags } => {
            // Announce nothing retroactively: the baseline is the bindings
            // as of subscription, frames cover changes from here on.
            let announced = tags
                .iter()
                .map(|tag| (tag.clone(), h.node.tags.read(tag)))
                .collect();
            h.watchers
                .insert(conn_id, WatcherState { tags, announced });
            return Ok(true);
        }
    }
    Ok(false)
}

/// Drive one accepted connection until EOF or a protocol error.
pub async fn handle_client(stream: UnixStream, hub: SharedHub, max_frame: usize) -> Result<()> {
    let (mut reader, writer) = tokio::io::split(stream);

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOX_CAPACITY);
    let conn_id = {
        let mut h = hub.lock().await;
        h.add_conn(tx)
    };

    // Writer task: drains the outbox so replies and watch fan-out never
    // block on the socket inside the dispatcher.
    tokio::spawn(async move {
        let mut ws = writer;
        while let Some(buf) = rx.recv().await {
            if ws.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let mut watching = false;
    let mut read_buf = vec![0u8; 16 * 1024];
    let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
    let outcome: Result<()> = async {
        loop {
            let n = reader.read(&mut read_buf).await?;
            if n == 0 {
                break;
            }
            acc.extend_from_slice(&read_buf[..n]);

            // Drain as many complete frames as arrived.
            loop {
                let (req, used) = match split_frame(&acc, max_frame) {
                    Ok(None) => break,
                    Ok(Some((payload, used))) => (decode_payload::<Request>(payload)?, used),
                    Err(err) => return Err(err.into()),
                };
                acc.drain(..used);
                if watching {
                    anyhow::bail!("request received on a channel in watch mode");
                }
                debug!(conn = conn_id, action = req.action().label(), "dispatch");
                watching = handle_message(req, conn_id, &hub).await?;
            }
        }
        Ok(())
    }
    .await;

    let mut h = hub.lock().await;
    h.remove_conn(conn_id);
    outcome
}

/// Accept loop: one handler task per connection.
pub async fn serve(listener: UnixListener, hub: SharedHub, max_frame: usize) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, hub, max_frame).await {
                warn!(?err, "client handler error");
            }
        });
    }
}
