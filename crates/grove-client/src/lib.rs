// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Typed client for the Grove sync protocol.
//!
//! One [`GroveClient`] wraps one Unix-socket channel. Every operation writes
//! exactly one request frame and awaits exactly one response frame, in strict
//! FIFO — the wire carries no request ids, so a channel must never see
//! concurrent calls. Callers that need concurrency pool clients instead.
//! [`GroveClient::watch`] consumes the client: from that point the channel
//! belongs to the server's change stream.

use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::sync::Arc;

use grove_proto::{
    decode_payload, encode_frame, Graph, PushStatus, Request, TagBundle, Wire, WireError,
    MAX_FRAME_BYTES,
};
use grove_store::{Key, Tag};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Client-side failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Channel i/o failed.
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    /// The server's bytes did not decode.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The server closed the channel instead of responding — its signal for
    /// a request it could not honor.
    #[error("server closed the channel")]
    Closed,

    /// A push was rejected atomically; the server state is unchanged.
    #[error("push rejected: {0}")]
    Rejected(String),
}

async fn read_frame(
    stream: &mut UnixStream,
    max_frame: usize,
) -> Result<Option<Vec<u8>>, ClientError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame {
        return Err(WireError::FrameTooLarge {
            got: len,
            max: max_frame,
        }
        .into());
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// A connected Grove client.
pub struct GroveClient {
    stream: UnixStream,
    max_frame: usize,
}

impl GroveClient {
    /// Connect to a node's Unix socket.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        Ok(Self {
            stream: UnixStream::connect(path).await?,
            max_frame: MAX_FRAME_BYTES,
        })
    }

    /// Override the per-frame payload cap.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    async fn send(&mut self, req: &Request) -> Result<(), ClientError> {
        self.stream.write_all(&encode_frame(req)).await?;
        Ok(())
    }

    async fn call<R: Wire>(&mut self, req: &Request) -> Result<R, ClientError> {
        self.send(req).await?;
        let payload = read_frame(&mut self.stream, self.max_frame)
            .await?
            .ok_or(ClientError::Closed)?;
        Ok(decode_payload(&payload)?)
    }

    /// `key-add`: insert a key with its predecessor set.
    pub async fn key_add(&mut self, key: Key, preds: BTreeSet<Key>) -> Result<(), ClientError> {
        self.call(&Request::KeyAdd { key, preds }).await
    }

    /// `key-list`: all keys the node knows.
    pub async fn key_list(&mut self) -> Result<BTreeSet<Key>, ClientError> {
        self.call(&Request::KeyList).await
    }

    /// `key-pred`: the predecessor set of `key` (empty when absent).
    pub async fn key_pred(&mut self, key: Key) -> Result<BTreeSet<Key>, ClientError> {
        self.call(&Request::KeyPred { key }).await
    }

    /// `value-write`: store a value, receiving its content key.
    pub async fn value_write(&mut self, bytes: Vec<u8>) -> Result<Key, ClientError> {
        self.call(&Request::ValueWrite { bytes }).await
    }

    /// `value-read`: fetch a value, `None` when the node lacks it.
    pub async fn value_read(&mut self, key: Key) -> Result<Option<Vec<u8>>, ClientError> {
        self.call(&Request::ValueRead { key }).await
    }

    /// `tag-update`: bind a tag to a set of keys.
    pub async fn tag_update(&mut self, tag: Tag, keys: BTreeSet<Key>) -> Result<(), ClientError> {
        self.call(&Request::TagUpdate { tag, keys }).await
    }

    /// `tag-remove`: delete a tag.
    pub async fn tag_remove(&mut self, tag: Tag) -> Result<(), ClientError> {
        self.call(&Request::TagRemove { tag }).await
    }

    /// `tag-read`: the keys bound to a tag (empty when absent).
    pub async fn tag_read(&mut self, tag: Tag) -> Result<BTreeSet<Key>, ClientError> {
        self.call(&Request::TagRead { tag }).await
    }

    /// `tag-list`: all defined tags.
    pub async fn tag_list(&mut self) -> Result<BTreeSet<Tag>, ClientError> {
        self.call(&Request::TagList).await
    }

    /// `sync-pull-keys`: the subgraph under `roots` minus everything
    /// reachable from the node's bindings of the `have` tags.
    pub async fn pull_keys(
        &mut self,
        roots: BTreeSet<Key>,
        have: BTreeSet<Tag>,
    ) -> Result<Graph, ClientError> {
        self.call(&Request::SyncPullKeys { roots, have }).await
    }

    /// `sync-pull-tags`: snapshot of every tag binding.
    pub async fn pull_tags(&mut self) -> Result<TagBundle, ClientError> {
        self.call(&Request::SyncPullTags).await
    }

    /// `sync-push-keys`: ship a graph and propose tag bindings. Rejections
    /// surface as [`ClientError::Rejected`] with the node untouched.
    pub async fn push_keys(&mut self, graph: Graph, tags: TagBundle) -> Result<(), ClientError> {
        match self.call(&Request::SyncPushKeys { graph, tags }).await? {
            PushStatus::Ok => Ok(()),
            PushStatus::Rejected(reason) => Err(ClientError::Rejected(reason)),
        }
    }

    /// `sync-push-tags`: apply tag bindings in one critical section.
    pub async fn push_tags(&mut self, tags: TagBundle) -> Result<(), ClientError> {
        match self.call(&Request::SyncPushTags { tags }).await? {
            PushStatus::Ok => Ok(()),
            PushStatus::Rejected(reason) => Err(ClientError::Rejected(reason)),
        }
    }

    /// `sync-watch`: hand the channel over to the server's change stream
    /// for `tags`. Cancel by dropping the stream.
    pub async fn watch(mut self, tags: BTreeSet<Tag>) -> Result<WatchStream, ClientError> {
        self.send(&Request::SyncWatch { tags }).await?;
        Ok(WatchStream {
            stream: self.stream,
            max_frame: self.max_frame,
        })
    }
}

/// A server-driven stream of `(changed tags, new subgraph)` frames.
pub struct WatchStream {
    stream: UnixStream,
    max_frame: usize,
}

impl WatchStream {
    /// Await the next change frame; `Ok(None)` once the server closes.
    pub async fn next(&mut self) -> Result<Option<(BTreeSet<Tag>, Graph)>, ClientError> {
        match read_frame(&mut self.stream, self.max_frame).await? {
            None => Ok(None),
            Some(payload) => Ok(Some(decode_payload(&payload)?)),
        }
    }
}

/// Convenience: write a batch of values, returning their keys in input order.
///
/// Sugar over [`GroveClient::value_write`] for callers shipping a pushed
/// graph's values.
pub async fn write_values(
    client: &mut GroveClient,
    values: impl IntoIterator<Item = Arc<[u8]>>,
) -> Result<Vec<Key>, ClientError> {
    let mut keys = Vec::new();
    for value in values {
        keys.push(client.value_write(value.to_vec()).await?);
    }
    Ok(keys)
}
