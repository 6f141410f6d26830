//! Three-tier balance cache in front of the store.
//!
//! Lookups cascade hot → warm → cold → store. Warm and cold hits are promoted
//! to hot; store reads land in cold. Each tier keeps insertion order, and
//! overflow demotes the oldest entry one tier colder (cold overflow drops it).
//! Entries past their tier TTL are demoted lazily on access and eagerly by
//! [`TieredCache::sweep`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use super::tier::{Tier, TierSizes};
use crate::clock::{Millis, SharedClock};
use crate::config::{CacheConfig, TierConfig};
use crate::ledger::{Address, Balance};
use crate::stats::{CacheStats, StatsCollector};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Copy)]
struct Slot {
    balance: Balance,
    /// When the entry entered its current tier.
    stamp: Millis,
    /// Position in the tier's insertion order.
    seq: u64,
}

/// One tier of one shard.
#[derive(Debug)]
struct TierBand {
    entries: HashMap<Address, Slot>,
    order: BTreeMap<u64, Address>,
    capacity: usize,
    ttl_ms: u64,
}

impl TierBand {
    fn new(config: TierConfig, shards: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            capacity: config.capacity.div_ceil(shards).max(1),
            ttl_ms: config.ttl_ms,
        }
    }

    fn is_expired(&self, slot: &Slot, now: Millis) -> bool {
        now.saturating_sub(slot.stamp) >= self.ttl_ms
    }

    fn get(&self, address: &Address) -> Option<&Slot> {
        self.entries.get(address)
    }

    fn remove(&mut self, address: &Address) -> Option<Slot> {
        let slot = self.entries.remove(address)?;
        self.order.remove(&slot.seq);
        Some(slot)
    }

    /// Insert at the newest position. Returns the oldest entry if that pushed
    /// the band over capacity.
    fn insert(&mut self, address: Address, slot: Slot) -> Option<(Address, Slot)> {
        if let Some(old) = self.entries.insert(address.clone(), slot) {
            self.order.remove(&old.seq);
        }
        self.order.insert(slot.seq, address);

        if self.entries.len() <= self.capacity {
            return None;
        }
        let (_, oldest) = self.order.pop_first()?;
        let evicted = self.entries.remove(&oldest)?;
        Some((oldest, evicted))
    }

    /// Entries whose TTL has passed, oldest first. The whole band is checked:
    /// a wall clock that steps back leaves newer entries with older stamps.
    fn expired(&self, now: Millis) -> Vec<Address> {
        self.order
            .values()
            .filter(|address| {
                self.entries
                    .get(*address)
                    .is_some_and(|slot| self.is_expired(slot, now))
            })
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Entries moved by a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub demoted: usize,
    pub dropped: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.demoted += other.demoted;
        self.dropped += other.dropped;
    }
}

/// One independently locked partition of the cache.
#[derive(Debug)]
struct CacheShard {
    bands: [TierBand; 3],
    next_seq: u64,
}

impl CacheShard {
    fn new(config: &CacheConfig, shards: usize) -> Self {
        Self {
            bands: [
                TierBand::new(config.hot, shards),
                TierBand::new(config.warm, shards),
                TierBand::new(config.cold, shards),
            ],
            next_seq: 0,
        }
    }

    fn band(&self, tier: Tier) -> &TierBand {
        &self.bands[tier.level()]
    }

    fn band_mut(&mut self, tier: Tier) -> &mut TierBand {
        &mut self.bands[tier.level()]
    }

    /// Insert into `tier` with a fresh stamp, cascading overflow colder.
    /// Returns how many entries were demoted and dropped on the way.
    fn push(&mut self, tier: Tier, address: Address, balance: Balance, now: Millis) -> SweepReport {
        let mut report = SweepReport::default();
        let mut next = Some((tier, address, balance));

        while let Some((tier, address, balance)) = next.take() {
            let seq = self.next_seq;
            self.next_seq += 1;
            let slot = Slot {
                balance,
                stamp: now,
                seq,
            };

            if let Some((victim, evicted)) = self.band_mut(tier).insert(address, slot) {
                match tier.demote() {
                    Some(colder) => {
                        report.demoted += 1;
                        next = Some((colder, victim, evicted.balance));
                    }
                    None => report.dropped += 1,
                }
            }
        }
        report
    }

    /// Move an entry that outlived its tier one tier colder (or drop it).
    fn age_out(&mut self, tier: Tier, address: &Address, now: Millis) -> SweepReport {
        let Some(slot) = self.band_mut(tier).remove(address) else {
            return SweepReport::default();
        };
        match tier.demote() {
            Some(colder) => {
                let mut report = self.push(colder, address.clone(), slot.balance, now);
                report.demoted += 1;
                report
            }
            None => SweepReport {
                demoted: 0,
                dropped: 1,
            },
        }
    }

    fn lookup(&mut self, address: &Address, now: Millis) -> Option<(Tier, Balance)> {
        for tier in Tier::ALL {
            let band = self.band(tier);
            let Some(slot) = band.get(address).copied() else {
                continue;
            };

            if band.is_expired(&slot, now) {
                self.age_out(tier, address, now);
                continue;
            }

            if tier != Tier::Hot {
                self.band_mut(tier).remove(address);
                self.push(Tier::Hot, address.clone(), slot.balance, now);
            }
            return Some((tier, slot.balance));
        }
        None
    }

    fn peek(&self, address: &Address, now: Millis) -> Option<(Tier, Balance)> {
        Tier::ALL.into_iter().find_map(|tier| {
            let band = self.band(tier);
            band.get(address)
                .filter(|slot| !band.is_expired(slot, now))
                .map(|slot| (tier, slot.balance))
        })
    }

    fn contains(&self, address: &Address) -> Option<Balance> {
        self.bands
            .iter()
            .find_map(|band| band.get(address).map(|slot| slot.balance))
    }

    fn remove(&mut self, address: &Address) -> bool {
        let mut removed = false;
        for band in &mut self.bands {
            removed |= band.remove(address).is_some();
        }
        removed
    }

    fn set(&mut self, address: &Address, balance: Balance, tier: Tier, now: Millis) {
        self.remove(address);
        self.push(tier, address.clone(), balance, now);
    }

    fn sweep(&mut self, now: Millis) -> SweepReport {
        let mut report = SweepReport::default();
        for tier in Tier::ALL {
            for address in self.band(tier).expired(now) {
                report.merge(self.age_out(tier, &address, now));
            }
        }
        report
    }

    fn sizes(&self) -> TierSizes {
        let mut sizes = TierSizes::default();
        for tier in Tier::ALL {
            sizes.add(tier, self.band(tier).len());
        }
        sizes
    }
}

/// Sharded hot/warm/cold cache of account balances.
pub struct TieredCache {
    shards: Vec<Mutex<CacheShard>>,
    store: Arc<dyn Store>,
    clock: SharedClock,
    stats: Arc<StatsCollector>,
}

impl TieredCache {
    pub fn new(
        config: &CacheConfig,
        store: Arc<dyn Store>,
        clock: SharedClock,
        stats: Arc<StatsCollector>,
    ) -> Self {
        let shards = config.shards.max(1);
        Self {
            shards: (0..shards)
                .map(|_| Mutex::new(CacheShard::new(config, shards)))
                .collect(),
            store,
            clock,
            stats,
        }
    }

    fn shard(&self, address: &Address) -> &Mutex<CacheShard> {
        &self.shards[address.shard(self.shards.len())]
    }

    /// Balance of `address`, reading through to the store on a full miss.
    /// Addresses the store has never seen read as zero.
    pub async fn get(&self, address: &Address) -> Result<Balance, StoreError> {
        let hit = self
            .shard(address)
            .lock()
            .lookup(address, self.clock.now_ms());
        if let Some((tier, balance)) = hit {
            self.stats.record_cache_hit(tier);
            return Ok(balance);
        }

        self.stats.record_store_read();
        let loaded = self
            .store
            .read_balance(address)
            .await?
            .unwrap_or(Decimal::ZERO);

        let mut shard = self.shard(address).lock();
        if let Some(cached) = shard.contains(address) {
            // A write-through landed while the store read was in flight.
            return Ok(cached);
        }
        shard.push(Tier::Cold, address.clone(), loaded, self.clock.now_ms());
        Ok(loaded)
    }

    /// Insert or overwrite `address` in `tier`, removing it from the others.
    pub fn set(&self, address: &Address, balance: Balance, tier: Tier) {
        let now = self.clock.now_ms();
        self.shard(address).lock().set(address, balance, tier, now);
    }

    /// Remove `address` from every tier. Returns whether anything was cached.
    pub fn invalidate(&self, address: &Address) -> bool {
        let removed = self.shard(address).lock().remove(address);
        if removed {
            debug!(address = %address, "Invalidated cached balance");
        }
        removed
    }

    /// Tier and balance of a live entry, without promoting or aging it.
    pub fn peek(&self, address: &Address) -> Option<(Tier, Balance)> {
        self.shard(address)
            .lock()
            .peek(address, self.clock.now_ms())
    }

    /// Demote or drop every entry past its tier TTL.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now_ms();
        let mut report = SweepReport::default();
        for shard in &self.shards {
            report.merge(shard.lock().sweep(now));
        }
        let sizes = self.sizes();
        self.stats.set_cache_sizes(sizes);
        report
    }

    pub fn sizes(&self) -> TierSizes {
        let mut sizes = TierSizes::default();
        for shard in &self.shards {
            let shard_sizes = shard.lock().sizes();
            for tier in Tier::ALL {
                sizes.add(tier, shard_sizes.get(tier));
            }
        }
        sizes
    }

    /// Hit counters and current sizes.
    pub fn stats(&self) -> CacheStats {
        let sizes = self.sizes();
        self.stats.set_cache_sizes(sizes);
        self.stats.cache_stats(sizes)
    }
}
