//! Keyed object cache with per-key critical sections and invalidate-on-write.

mod section;

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use section::{CriticalSection, FlightResult, Joined, LeadGuard};
pub use section::Populated;

/// Keys of the connection-definition cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// The sorted list of every connection name.
    AllConnections,
    Connection(String),
}

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    invalidations: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Backing-store loader invocations.
    pub loads: u64,
    pub invalidations: u64,
}

impl CacheStats {
    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

struct Entries<K, V> {
    values: HashMap<K, Populated<V>>,
    /// Bumped by every invalidation; a population that overlapped a bump is not installed.
    epoch: u64,
}

type SectionMap<K, V, E> = HashMap<K, Arc<CriticalSection<V, E>>>;
type Flight<'c, K, V, E> = (SectionHandle<'c, K, V, E>, u64);

/// Read-through cache whose entries are immutable once populated.
///
/// Concurrent misses on one key share a single backing fetch. Writers call
/// [`CacheCoordinator::invalidate`] after their transaction commits; entries are never updated
/// in place.
pub struct CacheCoordinator<K, V, E> {
    entries: Mutex<Entries<K, V>>,
    sections: Mutex<SectionMap<K, V, E>>,
    stats: CacheStats,
}

impl<K, V, E> Default for CacheCoordinator<K, V, E>
where
    K: Eq + Hash + Clone,
    E: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> CacheCoordinator<K, V, E>
where
    K: Eq + Hash + Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries {
                values: HashMap::new(),
                epoch: 0,
            }),
            sections: Mutex::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    /// Returns the cached entry without ever fetching. `Some(None)` is a cached absence.
    pub fn lookup(&self, key: &K) -> Option<Populated<V>> {
        let found = self.peek(key);
        let counter = if found.is_some() {
            &self.stats.hits
        } else {
            &self.stats.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Returns the entry for `key`, running `loader` on a miss.
    ///
    /// Only one caller per key runs the loader at a time; the rest block and receive its
    /// result, including its error. A failed load leaves the key unpopulated. A caller never
    /// adopts a load that started before the most recent invalidation.
    pub fn get<F>(&self, key: &K, mut loader: F) -> Result<Populated<V>, E>
    where
        F: FnMut(&K) -> Result<Option<V>, E>,
    {
        loop {
            if let Some(found) = self.lookup(key) {
                return Ok(found);
            }

            let epoch = self.epoch();
            let section = self.enter(key);
            let outcome = match section.join(epoch, || self.peek(key)) {
                Joined::Cached(found) => Some(Ok(found)),
                Joined::Lead(id) => Some(self.lead(key, &section, id, epoch, &mut loader)),
                Joined::Follow(id) => match section.wait(id) {
                    FlightResult::Done(result) => Some(result),
                    FlightResult::Abandoned => None,
                },
                Joined::Superseded(id) => {
                    section.wait(id);
                    None
                }
            };
            drop(section);

            if let Some(result) = outcome {
                return result;
            }
        }
    }

    /// Bulk variant of [`CacheCoordinator::get`].
    ///
    /// Missing keys are loaded in chunks of at most `max_batch`. Keys the loader does not
    /// return are cached as absent. Every key this caller leads is settled before it waits on
    /// keys led by others, so overlapping bulk reads cannot deadlock.
    pub fn get_many<F>(
        &self,
        keys: &[K],
        max_batch: usize,
        mut loader: F,
    ) -> Result<HashMap<K, Populated<V>>, E>
    where
        F: FnMut(&[K]) -> Result<HashMap<K, V>, E>,
    {
        let mut found = HashMap::with_capacity(keys.len());
        let mut seen = HashSet::with_capacity(keys.len());
        let mut leads: Vec<Flight<'_, K, V, E>> = Vec::new();
        let mut follows: Vec<Flight<'_, K, V, E>> = Vec::new();
        let mut superseded: Vec<Flight<'_, K, V, E>> = Vec::new();

        let epoch = self.epoch();
        for key in keys {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(value) = self.lookup(key) {
                found.insert(key.clone(), value);
                continue;
            }
            let section = self.enter(key);
            match section.join(epoch, || self.peek(key)) {
                Joined::Cached(value) => {
                    found.insert(key.clone(), value);
                }
                Joined::Lead(id) => leads.push((section, id)),
                Joined::Follow(id) => follows.push((section, id)),
                Joined::Superseded(id) => superseded.push((section, id)),
            }
        }

        let led = self.lead_many(&leads, epoch, max_batch, &mut loader);
        drop(leads);
        match led {
            Ok(loaded) => found.extend(loaded),
            Err(err) => {
                for (section, id) in follows.into_iter().chain(superseded) {
                    section.withdraw(id);
                }
                return Err(err);
            }
        }

        let mut first_error = None;
        let mut retry = Vec::new();
        for (section, id) in follows {
            match section.wait(id) {
                FlightResult::Done(Ok(value)) => {
                    found.insert(section.key.clone(), value);
                }
                FlightResult::Done(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                FlightResult::Abandoned => retry.push(section.key.clone()),
            }
        }
        for (section, id) in superseded {
            section.wait(id);
            retry.push(section.key.clone());
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        for key in retry {
            let value = self.get(&key, |k| {
                loader(std::slice::from_ref(k)).map(|mut rows| rows.remove(k))
            })?;
            found.insert(key, value);
        }
        Ok(found)
    }

    /// Drops the given entries. Call only after the write that made them stale has committed.
    pub fn invalidate<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let mut entries = self.lock_entries();
        entries.epoch += 1;
        for key in keys {
            entries.values.remove(key);
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn clear(&self) {
        let mut entries = self.lock_entries();
        entries.epoch += 1;
        let dropped = entries.values.len() as u64;
        entries.values.clear();
        self.stats
            .invalidations
            .fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    #[cfg(test)]
    fn section_count(&self) -> usize {
        self.lock_sections().len()
    }

    fn lock_entries(&self) -> MutexGuard<'_, Entries<K, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peek(&self, key: &K) -> Option<Populated<V>> {
        self.lock_entries().values.get(key).cloned()
    }

    fn epoch(&self) -> u64 {
        self.lock_entries().epoch
    }

    fn install(&self, epoch: u64, populated: &[(K, Populated<V>)]) {
        let mut entries = self.lock_entries();
        if entries.epoch != epoch {
            tracing::debug!(
                event = "cache_population_discarded",
                keys = populated.len(),
                "discarded cache population that overlapped an invalidation"
            );
            return;
        }
        for (key, value) in populated {
            entries.values.insert(key.clone(), value.clone());
        }
    }

    fn lock_sections(&self) -> MutexGuard<'_, SectionMap<K, V, E>> {
        self.sections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, key: &K) -> SectionHandle<'_, K, V, E> {
        let section = Arc::clone(
            self.lock_sections()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(CriticalSection::new())),
        );
        SectionHandle {
            cache: self,
            key: key.clone(),
            section,
        }
    }

    fn lead<F>(
        &self,
        key: &K,
        section: &CriticalSection<V, E>,
        id: u64,
        epoch: u64,
        loader: &mut F,
    ) -> Result<Populated<V>, E>
    where
        F: FnMut(&K) -> Result<Option<V>, E>,
    {
        let guard = LeadGuard::new(section, id);
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        let result = loader(key).map(|value| value.map(Arc::new));
        if let Ok(value) = &result {
            self.install(epoch, &[(key.clone(), value.clone())]);
        }
        guard.settle(result.clone());
        result
    }

    fn lead_many<F>(
        &self,
        leads: &[Flight<'_, K, V, E>],
        epoch: u64,
        max_batch: usize,
        loader: &mut F,
    ) -> Result<HashMap<K, Populated<V>>, E>
    where
        F: FnMut(&[K]) -> Result<HashMap<K, V>, E>,
    {
        let mut guards: HashMap<K, LeadGuard<'_, V, E>> = leads
            .iter()
            .map(|(section, id)| (section.key.clone(), LeadGuard::new(section, *id)))
            .collect();
        let keys: Vec<K> = leads.iter().map(|(section, _)| section.key.clone()).collect();
        let mut loaded = HashMap::with_capacity(keys.len());

        for chunk in keys.chunks(max_batch.max(1)) {
            self.stats.loads.fetch_add(1, Ordering::Relaxed);
            match loader(chunk) {
                Ok(mut rows) => {
                    let populated: Vec<(K, Populated<V>)> = chunk
                        .iter()
                        .map(|key| (key.clone(), rows.remove(key).map(Arc::new)))
                        .collect();
                    self.install(epoch, &populated);
                    for (key, value) in populated {
                        if let Some(guard) = guards.remove(&key) {
                            guard.settle(Ok(value.clone()));
                        }
                        loaded.insert(key, value);
                    }
                }
                Err(err) => {
                    for (_, guard) in guards.drain() {
                        guard.settle(Err(err.clone()));
                    }
                    return Err(err);
                }
            }
        }
        Ok(loaded)
    }
}

/// A caller's hold on one key's critical section.
///
/// Dropping the handle forgets the section once no other caller holds it, including when a
/// loader unwinds.
struct SectionHandle<'c, K, V, E>
where
    K: Eq + Hash + Clone,
    E: Clone,
{
    cache: &'c CacheCoordinator<K, V, E>,
    key: K,
    section: Arc<CriticalSection<V, E>>,
}

impl<K, V, E> Deref for SectionHandle<'_, K, V, E>
where
    K: Eq + Hash + Clone,
    E: Clone,
{
    type Target = CriticalSection<V, E>;

    fn deref(&self) -> &Self::Target {
        &self.section
    }
}

impl<K, V, E> Drop for SectionHandle<'_, K, V, E>
where
    K: Eq + Hash + Clone,
    E: Clone,
{
    fn drop(&mut self) {
        let mut sections = self.cache.lock_sections();
        // The map and this handle are the last two holders.
        if sections.get(&self.key).is_some_and(|existing| {
            Arc::ptr_eq(existing, &self.section) && Arc::strong_count(existing) == 2
        }) {
            sections.remove(&self.key);
        }
    }
}
