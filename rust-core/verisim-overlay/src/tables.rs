// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Outstanding write tables
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Writes in flight against the shared or the dedicated log are indexed by
// ASN so that truncation can ask for the lowest outstanding ASN. Entries are
// shared handles; the table never owns the write itself.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use verisim_logstore::{Asn, Version, ASN_MAX, ASN_NULL};

/// Table entry for one in-flight write.
#[derive(Debug)]
pub struct OutstandingWrite {
    /// ASN being written.
    pub asn: Asn,
    /// Version being written.
    pub version: Version,
    truncation_pending: AtomicU64,
}

impl OutstandingWrite {
    /// A new entry with no deferred truncation.
    pub fn new(asn: Asn, version: Version) -> Arc<Self> {
        Arc::new(Self {
            asn,
            version,
            truncation_pending: AtomicU64::new(ASN_NULL),
        })
    }

    /// Deferred truncation point recorded against this write, if any.
    pub fn truncation_pending(&self) -> Option<Asn> {
        match self.truncation_pending.load(Ordering::Acquire) {
            ASN_NULL => None,
            asn => Some(asn),
        }
    }

    /// Take the deferred truncation point, clearing it.
    pub fn take_truncation_pending(&self) -> Option<Asn> {
        match self.truncation_pending.swap(ASN_NULL, Ordering::AcqRel) {
            ASN_NULL => None,
            asn => Some(asn),
        }
    }
}

/// An ASN-ordered index of in-flight writes.
#[derive(Debug, Default)]
pub struct OutstandingWrites {
    entries: Mutex<BTreeMap<(Asn, u64), Arc<OutstandingWrite>>>,
    next_key: AtomicU64,
}

/// Handle identifying an entry for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableKey(Asn, u64);

impl OutstandingWrites {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<(Asn, u64), Arc<OutstandingWrite>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `write`; the returned key removes it again.
    pub fn add(&self, write: Arc<OutstandingWrite>) -> TableKey {
        let unique = self.next_key.fetch_add(1, Ordering::Relaxed);
        let key = (write.asn, unique);
        self.lock().insert(key, write);
        TableKey(key.0, key.1)
    }

    /// Remove the entry for `key`. Returns false if it was not present.
    pub fn remove(&self, key: TableKey) -> bool {
        self.lock().remove(&(key.0, key.1)).is_some()
    }

    /// Lowest outstanding ASN, or `ASN_MAX` when nothing is outstanding.
    pub fn lowest_asn(&self) -> Asn {
        self.lock()
            .keys()
            .next()
            .map(|(asn, _)| *asn)
            .unwrap_or(ASN_MAX)
    }

    /// True if a write to `asn` is outstanding.
    pub fn contains_asn(&self, asn: Asn) -> bool {
        self.lock()
            .range((asn, 0)..=(asn, u64::MAX))
            .next()
            .is_some()
    }

    /// Defer a truncation to `point` onto the first outstanding write above
    /// it. Returns the ASN of that write, or `None` if no write qualifies.
    pub fn set_truncation_pending(&self, point: Asn) -> Option<Asn> {
        let entries = self.lock();
        let write = entries.values().find(|write| write.asn > point)?;
        write.truncation_pending.store(point, Ordering::Release);
        Some(write.asn)
    }

    /// Number of outstanding writes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
