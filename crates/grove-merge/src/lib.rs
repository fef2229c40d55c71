// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Three-way merge engine.
//!
//! Reconciles two branch heads against their lowest common ancestor with a
//! per-path resolver table. Resolvers are pure functions of
//! `(old, ours, theirs)`; the engine finds the base, runs the resolver,
//! writes the merged value, and records a two-parent commit. Advancing a tag
//! to the merged key is the caller's step.

use std::collections::BTreeSet;
use std::sync::Arc;

use grove_store::{Key, KeyStore, StoreError, ValueStore};
use grove_sync::ancestors;

/// Merge failures. `Conflict` is the recoverable one — everything else is a
/// precondition the caller got wrong.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// The resolver could not reconcile the two sides.
    #[error("[MERGE_CONFLICT] {path}: {reason}")]
    Conflict {
        /// The path whose resolver gave up.
        path: String,
        /// The resolver's explanation.
        reason: String,
    },

    /// No resolver is registered for the path (not even a default).
    #[error("[NO_RESOLVER] no resolver registered for path {0:?}")]
    NoResolver(String),

    /// A head has no stored value to merge.
    #[error("[MISSING_VALUE] no value stored for {0}")]
    MissingValue(Key),

    /// A head key is absent from the key store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A pure three-way resolver: `(old, ours, theirs) → merged bytes`.
pub type Resolver =
    Arc<dyn Fn(Option<&[u8]>, &[u8], &[u8]) -> Result<Vec<u8>, MergeError> + Send + Sync>;

/// Resolver dispatch table keyed by path prefix.
///
/// Lookup picks the longest registered prefix of the queried path; register
/// under `""` to install a default. Registering the same prefix twice
/// replaces the earlier resolver.
#[derive(Clone, Default)]
pub struct Resolvers {
    table: Vec<(String, Resolver)>,
}

impl Resolvers {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `resolver` for every path starting with `prefix`.
    pub fn register(&mut self, prefix: impl Into<String>, resolver: Resolver) {
        let prefix = prefix.into();
        self.table.retain(|(p, _)| *p != prefix);
        self.table.push((prefix, resolver));
    }

    /// The resolver for `path`: longest matching prefix wins.
    pub fn lookup(&self, path: &str) -> Option<&Resolver> {
        self.table
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, resolver)| resolver)
    }
}

impl std::fmt::Debug for Resolvers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefixes: Vec<&str> = self.table.iter().map(|(p, _)| p.as_str()).collect();
        f.debug_struct("Resolvers").field("prefixes", &prefixes).finish()
    }
}

/// The lowest common ancestors of `a` and `b` (both inclusive): common
/// ancestors that are not strict ancestors of another common ancestor.
///
/// Multiple LCAs are possible in a DAG; callers wanting one deterministic
/// base take the least key (see [`merge`]).
pub fn lowest_common_ancestors<KS: KeyStore>(keys: &KS, a: &Key, b: &Key) -> BTreeSet<Key> {
    let of_a = ancestors(keys, BTreeSet::from([*a]));
    let of_b = ancestors(keys, BTreeSet::from([*b]));
    let common: BTreeSet<Key> = of_a.intersection(&of_b).copied().collect();

    common
        .iter()
        .copied()
        .filter(|c| {
            !common
                .iter()
                .any(|d| d != c && ancestors(keys, BTreeSet::from([*d])).contains(c))
        })
        .collect()
}

/// Three-way merge of heads `a` and `b` for `path`.
///
/// Degenerate cases first: equal heads or one head already containing the
/// other fast-forward without creating a commit. Otherwise the base is the
/// least lowest common ancestor (`None` base when the histories are
/// unrelated), the resolver produces the merged bytes, and the result is a
/// fresh commit with `preds = {a, b}`.
pub fn merge<KS: KeyStore, VS: ValueStore>(
    keys: &mut KS,
    values: &mut VS,
    resolvers: &Resolvers,
    path: &str,
    a: Key,
    b: Key,
) -> Result<Key, MergeError> {
    if !keys.contains(&a) {
        return Err(MergeError::Store(StoreError::UnknownKey(a)));
    }
    if !keys.contains(&b) {
        return Err(MergeError::Store(StoreError::UnknownKey(b)));
    }
    if a == b {
        return Ok(a);
    }
    if ancestors(keys, BTreeSet::from([a])).contains(&b) {
        return Ok(a);
    }
    if ancestors(keys, BTreeSet::from([b])).contains(&a) {
        return Ok(b);
    }

    let base = lowest_common_ancestors(keys, &a, &b).into_iter().next();
    let old = base.and_then(|k| values.read(&k));

    let ours = values.read(&a).ok_or(MergeError::MissingValue(a))?;
    let theirs = values.read(&b).ok_or(MergeError::MissingValue(b))?;
    let resolver = resolvers
        .lookup(path)
        .ok_or_else(|| MergeError::NoResolver(path.to_owned()))?;

    let merged = resolver(old.as_deref(), &ours, &theirs)?;
    let merged_key = values.write(&merged);
    keys.add(merged_key, &BTreeSet::from([a, b]))?;
    Ok(merged_key)
}
