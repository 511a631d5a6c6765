//! The routing table: an ordered list of non-overlapping buckets whose
//! prefixes tile the whole id space.

use std::cmp::Ordering;
use std::fs;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use ciborium::value::Value as Cbor;
use tracing::{debug, info, warn};

use crate::constants;
use crate::id::Id;
use crate::kbucket::{KBucket, KBucketEntry};
use crate::node_info::NodeInfo;
use crate::prefix::Prefix;

/// Work a maintenance pass wants done by the task layer.
#[derive(Debug, Default)]
pub struct MaintenanceActions {
    /// Entries to ping (stale or unverified replacements).
    pub pings: Vec<NodeInfo>,
    /// Random targets to look up, one per bucket due a refresh.
    pub refresh_targets: Vec<Id>,
}

pub struct RoutingTable {
    local_id: Id,
    buckets: Vec<KBucket>,
    last_maintenance: u64,
}

impl RoutingTable {
    pub fn new(local_id: Id) -> Self {
        RoutingTable {
            local_id,
            buckets: vec![KBucket::new(Prefix::all(), true)],
            last_maintenance: 0,
        }
    }

    pub fn local_id(&self) -> &Id {
        &self.local_id
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn num_entries(&self) -> usize {
        self.buckets.iter().map(KBucket::size).sum()
    }

    fn index_of(&self, id: &Id) -> usize {
        self.buckets
            .binary_search_by(|bucket| {
                if bucket.prefix().is_prefix_of(id) {
                    Ordering::Equal
                } else {
                    bucket.prefix().first_id().cmp(id)
                }
            })
            .unwrap_or_else(|i| i.saturating_sub(1))
    }

    pub fn bucket_of(&self, id: &Id) -> &KBucket {
        &self.buckets[self.index_of(id)]
    }

    pub fn entry(&self, id: &Id) -> Option<&KBucketEntry> {
        self.bucket_of(id).get(id)
    }

    pub fn random_entry(&self) -> Option<&KBucketEntry> {
        let occupied: Vec<&KBucket> = self.buckets.iter().filter(|b| b.size() > 0).collect();
        if occupied.is_empty() {
            return None;
        }
        let i = lib_crypto::random::u32_below(occupied.len() as u32) as usize;
        occupied[i].random_entry()
    }

    fn needs_split(&self, index: usize, entry: &KBucketEntry) -> bool {
        let bucket = &self.buckets[index];
        bucket.prefix().is_splittable()
            && bucket.is_full()
            && entry.is_reachable()
            && !bucket.exists(entry.id())
            && !bucket.needs_replacement()
            && bucket.prefix().is_prefix_of(&self.local_id)
    }

    fn split(&mut self, index: usize) {
        let bucket = self.buckets.remove(index);
        debug!(prefix = %bucket.prefix(), "splitting bucket");
        let (low, high) = bucket.split(&self.local_id);
        self.buckets.insert(index, high);
        self.buckets.insert(index, low);
    }

    pub fn put(&mut self, entry: KBucketEntry) {
        if entry.id() == &self.local_id {
            return;
        }
        loop {
            let index = self.index_of(entry.id());
            if self.needs_split(index, &entry) {
                self.split(index);
                continue;
            }
            self.buckets[index].put(entry);
            return;
        }
    }

    pub fn remove(&mut self, id: &Id) {
        let index = self.index_of(id);
        self.buckets[index].remove_if_bad(id, true);
    }

    pub fn on_timeout(&mut self, id: &Id) {
        let index = self.index_of(id);
        self.buckets[index].on_timeout(id);
    }

    pub fn on_send(&mut self, id: &Id, now: u64) {
        let index = self.index_of(id);
        self.buckets[index].on_send(id, now);
    }

    /// The `count` closest verified nodes to `target`, nearest first.
    pub fn closest_nodes(&self, target: &Id, count: usize) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries().iter())
            .filter(|e| e.is_eligible_for_nodes_list())
            .map(|e| e.node().clone())
            .collect();
        nodes.sort_by(|a, b| target.three_way_compare(a.id(), b.id()));
        nodes.truncate(count);
        nodes
    }

    /// All entries, verified or not, nearest first. Seeds lookups.
    pub fn closest_entries(&self, target: &Id, count: usize) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries().iter())
            .map(|e| e.node().clone())
            .collect();
        nodes.sort_by(|a, b| target.three_way_compare(a.id(), b.id()));
        nodes.truncate(count);
        nodes
    }

    /// Merge adjacent sibling buckets whose surviving entries fit one bucket.
    /// Merged entries must fit without re-splitting, otherwise merge/split
    /// would oscillate.
    fn merge_buckets(&mut self) {
        let mut i = 1;
        while i < self.buckets.len() {
            let (a, b) = (&self.buckets[i - 1], &self.buckets[i]);
            if a.prefix().is_sibling_of(b.prefix())
                && a.effective_size() + b.effective_size() <= constants::MAX_ENTRIES_PER_BUCKET
            {
                let second = self.buckets.remove(i);
                let first = self.buckets.remove(i - 1);
                let parent = first.prefix().parent();
                let mut merged = KBucket::new(parent, parent.is_prefix_of(&self.local_id));

                let (entries_a, cache_a) = first.drain();
                let (entries_b, cache_b) = second.drain();
                for entry in entries_a.into_iter().chain(entries_b) {
                    if !entry.removable_without_replacement() {
                        merged.put(entry);
                    }
                }
                for entry in cache_a.into_iter().chain(cache_b) {
                    merged.put(entry);
                }
                debug!(prefix = %merged.prefix(), "merged sibling buckets");
                self.buckets.insert(i - 1, merged);
                i = i.saturating_sub(1).max(1);
            } else {
                i += 1;
            }
        }
    }

    /// Periodic upkeep: merge siblings, scrub misfiled and local entries,
    /// collect ping/refresh work. Rate-limited internally.
    pub fn maintenance(&mut self, now: u64, bootstrap_ids: &[Id]) -> MaintenanceActions {
        let mut actions = MaintenanceActions::default();
        if now.saturating_sub(self.last_maintenance)
            < constants::ROUTING_TABLE_MAINTENANCE_INTERVAL
        {
            return actions;
        }
        self.last_maintenance = now;

        self.merge_buckets();

        let local_id = self.local_id;
        let mut misfiled: Vec<KBucketEntry> = Vec::new();
        for bucket in &mut self.buckets {
            let was_full = bucket.is_full();
            let prefix = *bucket.prefix();

            // drop ourselves, and bootstrap seeds when space is tight
            bucket.retain_entries(|e| {
                e.id() != &local_id && !(was_full && bootstrap_ids.contains(e.id()))
            });

            // re-file entries that no longer match after a merge
            let mut moved = Vec::new();
            bucket.retain_entries(|e| {
                if prefix.is_prefix_of(e.id()) {
                    true
                } else {
                    moved.push(e.clone());
                    false
                }
            });
            misfiled.extend(moved);

            if bucket.needs_refresh(now) {
                bucket.update_refresh_timer(now);
                actions.refresh_targets.push(prefix.random_id());
            }
            actions.pings.extend(bucket.ping_candidates(now, true));
        }
        for entry in misfiled {
            self.put(entry);
        }
        actions
    }

    /// Write every entry to `path` as a CBOR snapshot.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if self.num_entries() == 0 {
            debug!("skipping save of empty routing table");
            return Ok(());
        }

        let entries: Vec<Cbor> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries().iter())
            .map(|e| {
                let ip = match e.addr().ip() {
                    IpAddr::V4(ip) => ip.octets().to_vec(),
                    IpAddr::V6(ip) => ip.octets().to_vec(),
                };
                Cbor::Array(vec![
                    Cbor::Bytes(e.id().as_bytes().to_vec()),
                    Cbor::Bytes(ip),
                    Cbor::Integer(e.addr().port().into()),
                    Cbor::Integer(e.node().version().into()),
                    Cbor::Integer(e.created().into()),
                    Cbor::Integer(e.last_seen().into()),
                ])
            })
            .collect();

        let root = Cbor::Map(vec![
            (
                Cbor::Text("timestamp".into()),
                Cbor::Integer(crate::time::now_millis().into()),
            ),
            (Cbor::Text("entries".into()), Cbor::Array(entries)),
        ]);

        let mut buf = Vec::new();
        ciborium::ser::into_writer(&root, &mut buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut file = fs::File::create(path)?;
        file.write_all(&buf)?;
        Ok(())
    }

    /// Re-insert a saved snapshot. Restored entries are unverified until
    /// they answer on their recorded address.
    pub fn load(&mut self, path: &Path, now: u64) {
        let data = match fs::read(path) {
            Ok(data) if !data.is_empty() => data,
            Ok(_) => return,
            Err(_) => return,
        };

        let root: Cbor = match ciborium::de::from_reader(&data[..]) {
            Ok(root) => root,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable routing table snapshot");
                return;
            }
        };

        let Cbor::Map(fields) = root else {
            warn!(path = %path.display(), "malformed routing table snapshot");
            return;
        };

        let mut timestamp = 0u64;
        let mut loaded = 0usize;
        for (key, value) in fields {
            match (key, value) {
                (Cbor::Text(k), Cbor::Integer(ts)) if k == "timestamp" => {
                    timestamp = i128::from(ts).max(0) as u64;
                }
                (Cbor::Text(k), Cbor::Array(entries)) if k == "entries" => {
                    for record in entries {
                        if let Some(entry) = Self::entry_from_cbor(record, now) {
                            self.put(entry);
                            loaded += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        info!(
            count = loaded,
            age_minutes = now.saturating_sub(timestamp) / 60_000,
            "loaded routing table snapshot"
        );
    }

    fn entry_from_cbor(record: Cbor, now: u64) -> Option<KBucketEntry> {
        let Cbor::Array(fields) = record else {
            return None;
        };
        if fields.len() != 6 {
            return None;
        }

        let id = match &fields[0] {
            Cbor::Bytes(raw) => Id::from_bytes(raw).ok()?,
            _ => return None,
        };
        let ip: IpAddr = match &fields[1] {
            Cbor::Bytes(raw) if raw.len() == 4 => {
                IpAddr::from(<[u8; 4]>::try_from(raw.as_slice()).ok()?)
            }
            Cbor::Bytes(raw) if raw.len() == 16 => {
                IpAddr::from(<[u8; 16]>::try_from(raw.as_slice()).ok()?)
            }
            _ => return None,
        };
        let port = match &fields[2] {
            Cbor::Integer(port) => u16::try_from(i128::from(*port)).ok()?,
            _ => return None,
        };
        let version = match &fields[3] {
            Cbor::Integer(version) => u32::try_from(i128::from(*version)).ok()?,
            _ => return None,
        };

        let node = NodeInfo::with_version(id, SocketAddr::new(ip, port), version);
        Some(KBucketEntry::new(node, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ID_BITS;
    use std::net::Ipv4Addr;

    fn entry_for(id: Id, port: u16, now: u64, reachable: bool) -> KBucketEntry {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), port);
        let mut e = KBucketEntry::new(NodeInfo::new(id, addr), now);
        if reachable {
            e.signal_response(now);
        }
        e
    }

    fn assert_tiling(table: &RoutingTable) {
        // prefixes must tile the id space: ordered, non-overlapping, no gaps
        for _ in 0..256 {
            let id = Id::random();
            let matching = table
                .buckets()
                .iter()
                .filter(|b| b.prefix().is_prefix_of(&id))
                .count();
            assert_eq!(matching, 1, "id {} matched {} buckets", id, matching);
        }
        for window in table.buckets().windows(2) {
            assert!(window[0].prefix().first_id() < window[1].prefix().first_id());
        }
    }

    #[test]
    fn put_and_remove_keep_the_tiling() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);
        let mut ids = Vec::new();

        for i in 0..200u16 {
            let id = Id::random();
            ids.push(id);
            table.put(entry_for(id, 1024 + i, 1, true));
        }
        assert_tiling(&table);

        for id in ids.iter().take(100) {
            table.remove(id);
        }
        assert_tiling(&table);
    }

    #[test]
    fn bucket_capacity_is_respected() {
        let mut table = RoutingTable::new(Id::random());
        for i in 0..500u16 {
            table.put(entry_for(Id::random(), 1024 + i, 1, true));
        }
        for bucket in table.buckets() {
            assert!(bucket.size() <= constants::MAX_ENTRIES_PER_BUCKET);
        }
    }

    #[test]
    fn only_home_chain_splits() {
        let mut local = Id::zero();
        local.set_bit(0, false);
        let mut table = RoutingTable::new(local);

        // flood with ids in the high half: the non-home half may not split
        for i in 0..100u16 {
            let mut id = Id::random();
            id.set_bit(0, true);
            table.put(entry_for(id, 1024 + i, 1, true));
        }
        let high_buckets = table
            .buckets()
            .iter()
            .filter(|b| b.prefix().depth() >= 0 && b.prefix().id().bit(0))
            .count();
        assert!(high_buckets <= 1, "non-home subtree split {} times", high_buckets);
    }

    #[test]
    fn closest_nodes_are_sorted_and_verified_only() {
        let mut table = RoutingTable::new(Id::random());
        for i in 0..64u16 {
            table.put(entry_for(Id::random(), 1024 + i, 1, i % 2 == 0));
        }
        let target = Id::random();
        let closest = table.closest_nodes(&target, 8);
        assert!(closest.len() <= 8);
        for pair in closest.windows(2) {
            assert_ne!(
                target.three_way_compare(pair[0].id(), pair[1].id()),
                Ordering::Greater
            );
        }
        for node in &closest {
            assert!(table.entry(node.id()).unwrap().is_reachable());
        }
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dht4.cache");

        let mut table = RoutingTable::new(Id::random());
        for i in 0..6u16 {
            table.put(entry_for(Id::random(), 1024 + i, 1, true));
        }
        table.save(&path).unwrap();

        let mut restored = RoutingTable::new(Id::random());
        restored.load(&path, 2);
        assert_eq!(restored.num_entries(), 6);
        // restored entries are unverified until they respond again
        for bucket in restored.buckets() {
            for entry in bucket.entries() {
                assert!(!entry.is_reachable());
            }
        }
    }

    #[test]
    fn depth_never_exceeds_id_bits() {
        let table = RoutingTable::new(Id::random());
        for bucket in table.buckets() {
            assert!(bucket.prefix().depth() < ID_BITS as i32);
        }
    }
}
