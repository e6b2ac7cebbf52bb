use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone)]
struct PinnedEntry {
    endpoint_id: String,
    last_access: Instant,
    ttl: Duration,
    seq: u64,
}

impl PinnedEntry {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_access) > self.ttl
    }
}

/// Sessions of one VMR: hash index plus access order (oldest sequence first).
#[derive(Debug, Default)]
struct VmrSessions {
    entries: HashMap<String, PinnedEntry>,
    by_access: BTreeMap<u64, String>,
}

impl VmrSessions {
    fn remove(&mut self, client_key: &str) -> Option<PinnedEntry> {
        let entry = self.entries.remove(client_key)?;
        self.by_access.remove(&entry.seq);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn evict_least_recent(&mut self) -> Option<String> {
        let (_, key) = self.by_access.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    fn live_count(&self, now: Instant) -> usize {
        self.entries.values().filter(|e| !e.expired(now)).count()
    }
}

/// Sticky (vmr, client) → endpoint map with sliding expiry and per-VMR LRU
/// bounds. Partitions are independent; no operation takes a table-wide lock.
#[derive(Debug, Default)]
pub struct SessionAffinityTable {
    partitions: DashMap<String, VmrSessions>,
    next_seq: AtomicU64,
}

impl SessionAffinityTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Pinned endpoint for the client, refreshing its last access on a hit.
    pub fn try_get_pinned_endpoint(&self, vmr_id: &str, client_key: &str) -> Option<String> {
        if vmr_id.is_empty() || client_key.is_empty() {
            return None;
        }
        let now = Instant::now();
        let mut part = self.partitions.get_mut(vmr_id)?;

        let expired = part.entries.get(client_key)?.expired(now);
        if expired {
            part.remove(client_key);
            return None;
        }

        let seq = self.next_seq();
        let sessions = &mut *part;
        let entry = sessions.entries.get_mut(client_key)?;
        sessions.by_access.remove(&entry.seq);
        entry.seq = seq;
        entry.last_access = now;
        sessions.by_access.insert(seq, client_key.to_string());
        Some(entry.endpoint_id.clone())
    }

    /// Insert or overwrite a pin. `max_entries == 0` leaves the VMR unbounded.
    pub fn set_pinned_endpoint(
        &self,
        vmr_id: &str,
        client_key: &str,
        endpoint_id: &str,
        timeout_ms: u64,
        max_entries: usize,
    ) {
        if vmr_id.is_empty() || client_key.is_empty() || endpoint_id.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut part = self.partitions.entry(vmr_id.to_string()).or_default();
        let seq = self.next_seq();

        part.remove(client_key);
        part.entries.insert(
            client_key.to_string(),
            PinnedEntry {
                endpoint_id: endpoint_id.to_string(),
                last_access: now,
                ttl: Duration::from_millis(timeout_ms),
                seq,
            },
        );
        part.by_access.insert(seq, client_key.to_string());

        if max_entries > 0 && part.entries.len() > max_entries {
            let purged = part.purge_expired(now);
            let mut evicted = 0usize;
            while part.entries.len() > max_entries {
                if part.evict_least_recent().is_none() {
                    break;
                }
                evicted += 1;
            }
            tracing::debug!(vmr_id, purged, evicted, "session table over capacity");
        }
    }

    pub fn remove_pinned_endpoint(&self, vmr_id: &str, client_key: &str) -> bool {
        self.partitions
            .get_mut(vmr_id)
            .map(|mut part| part.remove(client_key).is_some())
            .unwrap_or(false)
    }

    /// Drop every session of a VMR. Returns how many were removed.
    pub fn remove_all_for_vmr(&self, vmr_id: &str) -> usize {
        self.partitions
            .remove(vmr_id)
            .map(|(_, part)| part.entries.len())
            .unwrap_or(0)
    }

    /// Drop every session pinned to an endpoint, across all VMRs.
    pub fn remove_all_for_endpoint(&self, endpoint_id: &str) -> usize {
        let mut removed = 0;
        for mut part in self.partitions.iter_mut() {
            let keys: Vec<String> = part
                .entries
                .iter()
                .filter(|(_, e)| e.endpoint_id == endpoint_id)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                part.remove(key);
            }
            removed += keys.len();
        }
        removed
    }

    /// VMRs that currently hold a session partition.
    pub fn vmr_ids(&self) -> Vec<String> {
        self.partitions.iter().map(|part| part.key().clone()).collect()
    }

    pub fn get_session_count(&self, vmr_id: &str) -> usize {
        let now = Instant::now();
        self.partitions
            .get(vmr_id)
            .map(|part| part.live_count(now))
            .unwrap_or(0)
    }

    /// Sweep expired sessions and drop empty partitions.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        self.partitions.retain(|_, part| {
            purged += part.purge_expired(now);
            !part.entries.is_empty()
        });
        purged
    }
}
