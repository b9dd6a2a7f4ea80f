//! Client-side routing table.
//!
//! Read-mostly map from (group, key) to the owning node. Entries form a ring
//! per group: a key belongs to the entry with the greatest `id_begin` not
//! above it, wrapping to the group's last entry for keys below every begin.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::RwLock;

use strand_proto::body::RouteEntry;
use strand_proto::KeyId;

#[derive(Default)]
pub struct RouteTable {
    /// Sorted by (group, id_begin, addr).
    entries: RwLock<Vec<RouteEntry>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge advertised entries in, replacing duplicates.
    pub fn apply(&self, new_entries: &[RouteEntry]) {
        let mut entries = self.entries.write().unwrap();
        entries.extend_from_slice(new_entries);
        entries.sort_by(|a, b| {
            (a.group, a.id_begin, a.addr, a.backend_id)
                .cmp(&(b.group, b.id_begin, b.addr, b.backend_id))
        });
        entries.dedup_by(|a, b| {
            a.group == b.group
                && a.id_begin == b.id_begin
                && a.addr == b.addr
                && a.backend_id == b.backend_id
        });
    }

    /// Drop every entry advertised by `addr`; used on peer loss.
    pub fn forget(&self, addr: SocketAddr) {
        self.entries.write().unwrap().retain(|e| e.addr != addr);
    }

    /// Owning entry for `key` within `group`.
    pub fn locate(&self, group: u32, key: &KeyId) -> Option<RouteEntry> {
        let entries = self.entries.read().unwrap();
        let lo = entries.partition_point(|e| e.group < group);
        let hi = entries.partition_point(|e| e.group <= group);
        let ring = &entries[lo..hi];
        if ring.is_empty() {
            return None;
        }
        let idx = ring.partition_point(|e| e.id_begin <= *key);
        // partition_point == 0 means the key sorts below every begin: wrap.
        Some(ring[idx.checked_sub(1).unwrap_or(ring.len() - 1)])
    }

    /// Every distinct peer address known to the table.
    pub fn members(&self) -> Vec<SocketAddr> {
        let entries = self.entries.read().unwrap();
        let set: BTreeSet<SocketAddr> = entries.iter().map(|e| e.addr).collect();
        set.into_iter().collect()
    }

    /// Backends advertised by one node, as (backend id, group) pairs.
    pub fn backends_on(&self, addr: SocketAddr) -> Vec<(u32, u32)> {
        let entries = self.entries.read().unwrap();
        let mut out: Vec<(u32, u32)> = entries
            .iter()
            .filter(|e| e.addr == addr)
            .map(|e| (e.backend_id, e.group))
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn has_group(&self, group: u32) -> bool {
        let entries = self.entries.read().unwrap();
        let lo = entries.partition_point(|e| e.group < group);
        entries.get(lo).map(|e| e.group) == Some(group)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    pub fn dump(&self) -> Vec<RouteEntry> {
        self.entries.read().unwrap().clone()
    }
}
