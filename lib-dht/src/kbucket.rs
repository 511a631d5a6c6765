//! K-buckets and their liveness accounting.

use std::fmt;
use std::net::SocketAddr;

use crate::constants;
use crate::id::Id;
use crate::node_info::NodeInfo;
use crate::prefix::Prefix;

/// One slot of the routing table: a node plus everything we know about how
/// alive it is. `reachable` only turns true after a verified response on the
/// entry's current address.
#[derive(Clone)]
pub struct KBucketEntry {
    node: NodeInfo,
    created: u64,
    last_seen: u64,
    last_send: u64,
    failed_requests: i32,
    reachable: bool,
}

impl KBucketEntry {
    pub fn new(node: NodeInfo, now: u64) -> Self {
        KBucketEntry {
            node,
            created: now,
            last_seen: now,
            last_send: 0,
            failed_requests: 0,
            reachable: false,
        }
    }

    pub fn id(&self) -> &Id {
        self.node.id()
    }

    pub fn addr(&self) -> &SocketAddr {
        self.node.addr()
    }

    pub fn node(&self) -> &NodeInfo {
        &self.node
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn failed_requests(&self) -> i32 {
        self.failed_requests
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// Only verified entries may be handed out in FIND_NODE responses.
    pub fn is_eligible_for_nodes_list(&self) -> bool {
        self.reachable
    }

    /// A verified response arrived on the current address.
    pub fn signal_response(&mut self, now: u64) {
        self.last_seen = now;
        self.failed_requests = 0;
        self.reachable = true;
    }

    /// Any message arrived from this node (request or response).
    pub fn signal_activity(&mut self, now: u64) {
        self.last_seen = now;
    }

    pub fn signal_request(&mut self, now: u64) {
        self.last_send = now;
    }

    pub fn signal_request_timeout(&mut self) {
        self.failed_requests += 1;
    }

    pub fn is_bad(&self) -> bool {
        if self.reachable {
            self.failed_requests >= constants::KBUCKET_MAX_TIMEOUTS
        } else {
            self.failed_requests >= constants::KBUCKET_UNVERIFIED_MAX_TIMEOUTS
        }
    }

    /// Quiet for a long time with failures on the books.
    pub fn is_old_and_stale(&self, now: u64) -> bool {
        self.failed_requests >= constants::KBUCKET_UNVERIFIED_MAX_TIMEOUTS
            && now.saturating_sub(self.last_seen) > constants::KBUCKET_OLD_AND_STALE_TIME
    }

    pub fn needs_ping(&self, now: u64) -> bool {
        now.saturating_sub(self.last_seen) > constants::KBUCKET_PING_TIME
            && now.saturating_sub(self.last_send) > constants::KBUCKET_PING_TIME
    }

    /// A bad entry can be dropped without promoting a replacement.
    pub fn removable_without_replacement(&self) -> bool {
        self.is_bad()
    }

    /// Fold a newer sighting of the same node (same id and address) in.
    pub fn merge(&mut self, other: &KBucketEntry) {
        debug_assert_eq!(self.id(), other.id());
        self.created = self.created.min(other.created);
        self.last_seen = self.last_seen.max(other.last_seen);
        self.last_send = self.last_send.max(other.last_send);
        if other.reachable {
            self.reachable = true;
            self.failed_requests = 0;
        }
        if other.node.version() != 0 {
            self.node.set_version(other.node.version());
        }
    }
}

impl fmt::Debug for KBucketEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KBucketEntry({} @ {}, reachable={}, failed={})",
            self.id(),
            self.addr(),
            self.reachable,
            self.failed_requests
        )
    }
}

/// A fixed-capacity bucket plus an equal-capacity replacement cache.
pub struct KBucket {
    prefix: Prefix,
    home: bool,
    entries: Vec<KBucketEntry>,
    cache: Vec<KBucketEntry>,
    last_refresh: u64,
}

impl KBucket {
    pub fn new(prefix: Prefix, home: bool) -> Self {
        KBucket {
            prefix,
            home,
            entries: Vec::with_capacity(constants::MAX_ENTRIES_PER_BUCKET),
            cache: Vec::with_capacity(constants::MAX_ENTRIES_PER_BUCKET),
            last_refresh: 0,
        }
    }

    pub fn prefix(&self) -> &Prefix {
        &self.prefix
    }

    pub fn is_home(&self) -> bool {
        self.home
    }

    pub fn entries(&self) -> &[KBucketEntry] {
        &self.entries
    }

    pub fn cached_entries(&self) -> &[KBucketEntry] {
        &self.cache
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= constants::MAX_ENTRIES_PER_BUCKET
    }

    pub fn exists(&self, id: &Id) -> bool {
        self.entries.iter().any(|e| e.id() == id)
    }

    pub fn get(&self, id: &Id) -> Option<&KBucketEntry> {
        self.entries.iter().find(|e| e.id() == id)
    }

    pub fn needs_replacement(&self) -> bool {
        self.entries.iter().any(|e| e.is_bad())
    }

    pub fn needs_refresh(&self, now: u64) -> bool {
        now.saturating_sub(self.last_refresh) > constants::BUCKET_REFRESH_INTERVAL
            && (!self.is_full() || self.entries.iter().any(|e| e.needs_ping(now)))
    }

    pub fn update_refresh_timer(&mut self, now: u64) {
        self.last_refresh = now;
    }

    pub fn random_entry(&self) -> Option<&KBucketEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let i = lib_crypto::random::u32_below(self.entries.len() as u32) as usize;
        self.entries.get(i)
    }

    /// Insert or refresh an entry. The caller has already decided this bucket
    /// must not split for it.
    pub fn put(&mut self, entry: KBucketEntry) {
        debug_assert!(self.prefix.is_prefix_of(entry.id()));

        if let Some(existing) = self.entries.iter_mut().find(|e| e.id() == entry.id()) {
            if existing.addr() == entry.addr() {
                existing.merge(&entry);
                return;
            }
            // same id, different address: trust the verified entry until it
            // times out, replace an unverified one outright
            if existing.is_reachable() {
                return;
            }
            *existing = entry;
            return;
        }

        if !self.is_full() {
            self.remove_from_cache(entry.id());
            self.entries.push(entry);
            return;
        }

        if entry.is_reachable() {
            if let Some(pos) = self.entries.iter().position(|e| e.is_bad()) {
                self.entries.remove(pos);
                self.remove_from_cache(entry.id());
                self.entries.push(entry);
                return;
            }
        }

        self.put_cache(entry);
    }

    fn put_cache(&mut self, entry: KBucketEntry) {
        if let Some(existing) = self.cache.iter_mut().find(|e| e.id() == entry.id()) {
            if existing.addr() == entry.addr() {
                existing.merge(&entry);
            } else if !existing.is_reachable() {
                *existing = entry;
            }
            return;
        }
        if self.cache.len() >= constants::MAX_ENTRIES_PER_BUCKET {
            // keep verified replacements over unverified ones
            match self.cache.iter().position(|e| !e.is_reachable()) {
                Some(pos) => {
                    self.cache.remove(pos);
                }
                None => return,
            }
        }
        self.cache.push(entry);
    }

    fn remove_from_cache(&mut self, id: &Id) {
        self.cache.retain(|e| e.id() != id);
    }

    /// Promote the most trustworthy cached replacement.
    fn promote_from_cache(&mut self) {
        if self.is_full() || self.cache.is_empty() {
            return;
        }
        let pos = self
            .cache
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| (e.is_reachable(), e.last_seen()))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let entry = self.cache.remove(pos);
        self.entries.push(entry);
    }

    /// Drop `id` if it has gone bad (or unconditionally with `force`) and
    /// backfill from the replacement cache.
    pub fn remove_if_bad(&mut self, id: &Id, force: bool) {
        if let Some(pos) = self.entries.iter().position(|e| e.id() == id) {
            if force || self.entries[pos].is_bad() {
                self.entries.remove(pos);
                self.promote_from_cache();
            }
        }
    }

    pub fn on_timeout(&mut self, id: &Id) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id() == id) {
            entry.signal_request_timeout();
            // entries are only replaced when a replacement is on hand
            if entry.is_bad() && !self.cache.is_empty() {
                self.remove_if_bad(id, false);
            }
            return;
        }
        let mut bad_cached = None;
        if let Some(entry) = self.cache.iter_mut().find(|e| e.id() == id) {
            entry.signal_request_timeout();
            if entry.is_bad() {
                bad_cached = Some(*entry.id());
            }
        }
        if let Some(id) = bad_cached {
            self.remove_from_cache(&id);
        }
    }

    pub fn on_send(&mut self, id: &Id, now: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id() == id) {
            entry.signal_request(now);
        }
    }

    /// Entries a maintenance pass should ping: quiet main entries plus one
    /// unverified cache probe.
    pub fn ping_candidates(&self, now: u64, probe_cache: bool) -> Vec<NodeInfo> {
        let mut out: Vec<NodeInfo> = self
            .entries
            .iter()
            .filter(|e| e.needs_ping(now) || e.is_bad())
            .map(|e| e.node().clone())
            .collect();
        if probe_cache {
            if let Some(probe) = self.cache.iter().find(|e| !e.is_reachable()) {
                out.push(probe.node().clone());
            }
        }
        out
    }

    /// Split into the two child buckets; the child covering `local_id`
    /// becomes the new home bucket.
    pub fn split(self, local_id: &Id) -> (KBucket, KBucket) {
        let pl = self.prefix.split_branch(false);
        let ph = self.prefix.split_branch(true);
        let mut low = KBucket::new(pl, pl.is_prefix_of(local_id));
        let mut high = KBucket::new(ph, ph.is_prefix_of(local_id));

        for entry in self.entries {
            if low.prefix.is_prefix_of(entry.id()) {
                low.put(entry);
            } else {
                high.put(entry);
            }
        }
        for entry in self.cache {
            if low.prefix.is_prefix_of(entry.id()) {
                low.put_cache(entry);
            } else {
                high.put_cache(entry);
            }
        }
        (low, high)
    }

    /// Entries that survive a merge (everything not trivially removable).
    pub fn effective_size(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.removable_without_replacement())
            .count()
    }

    pub fn drain(self) -> (Vec<KBucketEntry>, Vec<KBucketEntry>) {
        (self.entries, self.cache)
    }

    pub fn retain_entries<F: FnMut(&KBucketEntry) -> bool>(&mut self, f: F) {
        self.entries.retain(f);
    }
}

impl fmt::Debug for KBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KBucket({}, home={}, entries={}, cached={})",
            self.prefix,
            self.home,
            self.entries.len(),
            self.cache.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), port)
    }

    fn reachable_entry(port: u16, now: u64) -> KBucketEntry {
        let mut e = KBucketEntry::new(NodeInfo::new(Id::random(), addr(port)), now);
        e.signal_response(now);
        e
    }

    #[test]
    fn capacity_overflow_goes_to_cache() {
        let mut bucket = KBucket::new(Prefix::all(), true);
        for i in 0..constants::MAX_ENTRIES_PER_BUCKET {
            bucket.put(reachable_entry(1000 + i as u16, 1));
        }
        assert!(bucket.is_full());

        bucket.put(reachable_entry(2000, 1));
        assert_eq!(bucket.size(), constants::MAX_ENTRIES_PER_BUCKET);
        assert_eq!(bucket.cached_entries().len(), 1);
    }

    #[test]
    fn bad_entry_is_replaced_by_cache_promotion() {
        let mut bucket = KBucket::new(Prefix::all(), true);
        for i in 0..constants::MAX_ENTRIES_PER_BUCKET {
            bucket.put(reachable_entry(1000 + i as u16, 1));
        }
        let replacement = reachable_entry(2000, 1);
        let replacement_id = *replacement.id();
        bucket.put(replacement);

        let victim = *bucket.entries()[0].id();
        for _ in 0..constants::KBUCKET_MAX_TIMEOUTS {
            bucket.on_timeout(&victim);
        }
        assert!(!bucket.exists(&victim));
        assert!(bucket.exists(&replacement_id));
    }

    #[test]
    fn verified_entry_survives_address_change_attempt() {
        let mut bucket = KBucket::new(Prefix::all(), true);
        let entry = reachable_entry(1000, 1);
        let id = *entry.id();
        bucket.put(entry);

        let hijack = KBucketEntry::new(NodeInfo::new(id, addr(4444)), 2);
        bucket.put(hijack);
        assert_eq!(bucket.get(&id).unwrap().addr(), &addr(1000));
    }

    #[test]
    fn response_resets_failures() {
        let mut entry = reachable_entry(1000, 1);
        entry.signal_request_timeout();
        entry.signal_request_timeout();
        assert_eq!(entry.failed_requests(), 2);
        entry.signal_response(2);
        assert_eq!(entry.failed_requests(), 0);
        assert!(entry.is_reachable());
    }
}
