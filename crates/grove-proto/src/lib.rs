// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Binary wire protocol for the Grove object store.
//!
//! `grove-proto` is transport-free: it defines the [`Wire`] codec, the stable
//! [`Action`] table, the typed [`Request`] payloads, and the graph/tag-bundle
//! message types that sync exchanges. Channels (Unix sockets today) live in
//! the service and client crates; this crate only produces and consumes
//! bytes.
//!
//! The action table is positional and frozen — the `u8` discriminant on the
//! wire is authoritative, human-readable labels exist for logs only.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

pub mod frame;
pub mod wire;

pub use frame::{decode_payload, encode_frame, split_frame, MAX_FRAME_BYTES};
pub use wire::{Cursor, Wire, WireError};

use std::collections::BTreeSet;
use std::path::PathBuf;

use grove_store::{Key, Tag};

/// Default Unix socket path for a Grove node.
///
/// Prefers a per-user runtime dir (XDG_RUNTIME_DIR) and falls back to `/tmp`
/// when unavailable.
pub fn default_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("grove.sock")
}

/// The protocol action table. Discriminants are stable and positional; the
/// wire byte IS the discriminant.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Insert a key with its predecessor set.
    KeyAdd = 0,
    /// List all known keys.
    KeyList = 1,
    /// Read the predecessor set of one key.
    KeyPred = 2,
    /// Store a value, returning its content key.
    ValueWrite = 3,
    /// Read a value by key.
    ValueRead = 4,
    /// Bind a tag to a set of keys.
    TagUpdate = 5,
    /// Delete a tag.
    TagRemove = 6,
    /// Read a tag's keys.
    TagRead = 7,
    /// List all tags.
    TagList = 8,
    /// Pull the reachability-closed subgraph under some roots.
    SyncPullKeys = 9,
    /// Pull a snapshot of all tags.
    SyncPullTags = 10,
    /// Push a graph plus proposed tag bindings.
    SyncPushKeys = 11,
    /// Push a set of tag bindings.
    SyncPushTags = 12,
    /// Subscribe to tag-change frames on this channel.
    SyncWatch = 13,
}

impl Action {
    /// Decode a discriminant byte.
    ///
    /// # Errors
    ///
    /// [`WireError::UnknownAction`] for bytes outside the table.
    pub fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            0 => Ok(Self::KeyAdd),
            1 => Ok(Self::KeyList),
            2 => Ok(Self::KeyPred),
            3 => Ok(Self::ValueWrite),
            4 => Ok(Self::ValueRead),
            5 => Ok(Self::TagUpdate),
            6 => Ok(Self::TagRemove),
            7 => Ok(Self::TagRead),
            8 => Ok(Self::TagList),
            9 => Ok(Self::SyncPullKeys),
            10 => Ok(Self::SyncPullTags),
            11 => Ok(Self::SyncPushKeys),
            12 => Ok(Self::SyncPushTags),
            13 => Ok(Self::SyncWatch),
            other => Err(WireError::UnknownAction(other)),
        }
    }

    /// Human-readable label for logs. Never travels on the wire.
    pub fn label(self) -> &'static str {
        match self {
            Self::KeyAdd => "key-add",
            Self::KeyList => "key-list",
            Self::KeyPred => "key-pred",
            Self::ValueWrite => "value-write",
            Self::ValueRead => "value-read",
            Self::TagUpdate => "tag-update",
            Self::TagRemove => "tag-remove",
            Self::TagRead => "tag-read",
            Self::TagList => "tag-list",
            Self::SyncPullKeys => "sync-pull-keys",
            Self::SyncPullTags => "sync-pull-tags",
            Self::SyncPushKeys => "sync-push-keys",
            Self::SyncPushTags => "sync-push-tags",
            Self::SyncWatch => "sync-watch",
        }
    }
}

impl Wire for Action {
    fn encoded_len(&self) -> usize {
        1
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }

    fn read(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        Self::from_byte(u8::read(cur)?)
    }
}

/// A reachability-closed slice of the predecessor DAG.
///
/// Every endpoint of every edge lies in `nodes`. Edges are ordered on the
/// wire (traversal discovery order) but are semantically a set; `nodes`
/// encodes canonically in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    /// The keys in this slice.
    pub nodes: BTreeSet<Key>,
    /// Predecessor edges `(key, parent)` restricted to `nodes`.
    pub edges: Vec<(Key, Key)>,
}

impl Graph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when every edge endpoint lies in `nodes`.
    pub fn is_closed(&self) -> bool {
        self.edges
            .iter()
            .all(|(from, to)| self.nodes.contains(from) && self.nodes.contains(to))
    }

    /// The predecessor set of `key` as described by this graph's edges.
    pub fn preds_of(&self, key: &Key) -> BTreeSet<Key> {
        self.edges
            .iter()
            .filter(|(from, _)| from == key)
            .map(|(_, to)| *to)
            .collect()
    }
}

impl Wire for Graph {
    fn encoded_len(&self) -> usize {
        self.nodes.encoded_len() + self.edges.encoded_len()
    }

    fn write(&self, out: &mut Vec<u8>) {
        self.nodes.write(out);
        self.edges.write(out);
    }

    fn read(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        let nodes = BTreeSet::read(cur)?;
        let edges = Vec::read(cur)?;
        Ok(Self { nodes, edges })
    }
}

/// A list of tag bindings, as exchanged by pull-tags and the push requests.
pub type TagBundle = Vec<(Tag, BTreeSet<Key>)>;

/// Structured outcome of a push request. Pushes are the one operation with a
/// defined failure path on the wire; every other store error closes the
/// channel instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStatus {
    /// The push was applied atomically.
    Ok,
    /// The push was rejected atomically; nothing was applied.
    Rejected(String),
}

impl Wire for PushStatus {
    fn encoded_len(&self) -> usize {
        match self {
            Self::Ok => 1,
            Self::Rejected(reason) => 1 + reason.encoded_len(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Self::Ok => out.push(0),
            Self::Rejected(reason) => {
                out.push(1);
                reason.write(out);
            }
        }
    }

    fn read(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        match u8::read(cur)? {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Rejected(String::read(cur)?)),
            tag => Err(WireError::BadOptionTag(tag)),
        }
    }
}

/// One decoded request: the action plus its typed payload.
///
/// The in-memory representation is decoupled from the wire — `Wire::write`
/// emits the action byte followed by the payload fields in table order, and
/// `Wire::read` dispatches on the action byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `key-add (K, Set<K>) → unit`
    KeyAdd {
        /// The key to insert.
        key: Key,
        /// Its predecessor set.
        preds: BTreeSet<Key>,
    },
    /// `key-list ∅ → Set<K>`
    KeyList,
    /// `key-pred K → Set<K>`
    KeyPred {
        /// The key to look up.
        key: Key,
    },
    /// `value-write V → K`
    ValueWrite {
        /// The value bytes.
        bytes: Vec<u8>,
    },
    /// `value-read K → Option<V>`
    ValueRead {
        /// The key to read.
        key: Key,
    },
    /// `tag-update (T, Set<K>) → unit`
    TagUpdate {
        /// The tag to bind.
        tag: Tag,
        /// The keys to bind it to.
        keys: BTreeSet<Key>,
    },
    /// `tag-remove T → unit`
    TagRemove {
        /// The tag to delete.
        tag: Tag,
    },
    /// `tag-read T → Set<K>`
    TagRead {
        /// The tag to read.
        tag: Tag,
    },
    /// `tag-list ∅ → Set<T>`
    TagList,
    /// `sync-pull-keys (Set<K>, Set<T>) → graph`
    SyncPullKeys {
        /// Roots to pull from.
        roots: BTreeSet<Key>,
        /// Tags whose history the caller already has.
        have: BTreeSet<Tag>,
    },
    /// `sync-pull-tags ∅ → List<(T, Set<K>)>`
    SyncPullTags,
    /// `sync-push-keys (graph, List<(T, Set<K>)>) → status`
    SyncPushKeys {
        /// The graph to push.
        graph: Graph,
        /// Proposed tag bindings.
        tags: TagBundle,
    },
    /// `sync-push-tags List<(T, Set<K>)> → status`
    SyncPushTags {
        /// Tag bindings to apply in one critical section.
        tags: TagBundle,
    },
    /// `sync-watch Set<T> → stream of (Set<T>, graph)`
    SyncWatch {
        /// Tags to watch.
        tags: BTreeSet<Tag>,
    },
}

impl Request {
    /// The action this request dispatches to.
    pub fn action(&self) -> Action {
        match self {
            Self::KeyAdd { .. } => Action::KeyAdd,
            Self::KeyList => Action::KeyList,
            Self::KeyPred { .. } => Action::KeyPred,
            Self::ValueWrite { .. } => Action::ValueWrite,
            Self::ValueRead { .. } => Action::ValueRead,
            Self::TagUpdate { .. } => Action::TagUpdate,
            Self::TagRemove { .. } => Action::TagRemove,
            Self::TagRead { .. } => Action::TagRead,
            Self::TagList => Action::TagList,
            Self::SyncPullKeys { .. } => Action::SyncPullKeys,
            Self::SyncPullTags => Action::SyncPullTags,
            Self::SyncPushKeys { .. } => Action::SyncPushKeys,
            Self::SyncPushTags { .. } => Action::SyncPushTags,
            Self::SyncWatch { .. } => Action::SyncWatch,
        }
    }
}

impl Wire for Request {
    fn encoded_len(&self) -> usize {
        1 + match self {
            Self::KeyAdd { key, preds } => key.encoded_len() + preds.encoded_len(),
            Self::KeyList | Self::TagList | Self::SyncPullTags => 0,
            Self::KeyPred { key } | Self::ValueRead { key } => key.encoded_len(),
            Self::ValueWrite { bytes } => bytes.encoded_len(),
            Self::TagUpdate { tag, keys } => tag.encoded_len() + keys.encoded_len(),
            Self::TagRemove { tag } | Self::TagRead { tag } => tag.encoded_len(),
            Self::SyncPullKeys { roots, have } => roots.encoded_len() + have.encoded_len(),
            Self::SyncPushKeys { graph, tags } => graph.encoded_len() + tags.encoded_len(),
            Self::SyncPushTags { tags } => tags.encoded_len(),
            Self::SyncWatch { tags } => tags.encoded_len(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        self.action().write(out);
        match self {
            Self::KeyAdd { key, preds } => {
                key.write(out);
                preds.write(out);
            }
            Self::KeyList | Self::TagList | Self::SyncPullTags => {}
            Self::KeyPred { key } | Self::ValueRead { key } => key.write(out),
            Self::ValueWrite { bytes } => bytes.write(out),
            Self::TagUpdate { tag, keys } => {
                tag.write(out);
                keys.write(out);
            }
            Self::TagRemove { tag } | Self::TagRead { tag } => tag.write(out),
            Self::SyncPullKeys { roots, have } => {
                roots.write(out);
                have.write(out);
            }
            Self::SyncPushKeys { graph, tags } => {
                graph.write(out);
                tags.write(out);
            }
            Self::SyncPushTags { tags } => tags.write(out),
            Self::SyncWatch { tags } => tags.write(out),
        }
    }

    fn read(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        let action = Action::read(cur)?;
        Ok(match action {
            Action::KeyAdd => Self::KeyAdd {
                key: Key::read(cur)?,
                preds: BTreeSet::read(cur)?,
            },
            Action::KeyList => Self::KeyList,
            Action::KeyPred => Self::KeyPred {
                key: Key::read(cur)?,
            },
            Action::ValueWrite => Self::ValueWrite {
                bytes: Vec::read(cur)?,
            },
            Action::ValueRead => Self::ValueRead {
                key: Key::read(cur)?,
            },
            Action::TagUpdate => Self::TagUpdate {
                tag: Tag::read(cur)?,
                keys: BTreeSet::read(cur)?,
            },
            Action::TagRemove => Self::TagRemove {
                tag: Tag::read(cur)?,
            },
            Action::TagRead => Self::TagRead {
                tag: Tag::read(cur)?,
            },
            Action::TagList => Self::TagList,
            Action::SyncPullKeys => Self::SyncPullKeys {
                roots: BTreeSet::read(cur)?,
                have: BTreeSet::read(cur)?,
            },
            Action::SyncPullTags => Self::SyncPullTags,
            Action::SyncPushKeys => Self::SyncPushKeys {
                graph: Graph::read(cur)?,
                tags: Vec::read(cur)?,
            },
            Action::SyncPushTags => Self::SyncPushTags {
                tags: Vec::read(cur)?,
            },
            Action::SyncWatch => Self::SyncWatch {
                tags: BTreeSet::read(cur)?,
            },
        })
    }
}
