use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// A cached value; `None` is a cached "absent from the store".
pub type Populated<V> = Option<Arc<V>>;

/// What a population flight handed to its followers.
pub(super) enum FlightResult<V, E> {
    Done(Result<Populated<V>, E>),
    /// The leader unwound before settling; followers must start over.
    Abandoned,
}

impl<V, E: Clone> Clone for FlightResult<V, E> {
    fn clone(&self) -> Self {
        match self {
            Self::Done(result) => Self::Done(result.clone()),
            Self::Abandoned => Self::Abandoned,
        }
    }
}

pub(super) enum Joined<V> {
    /// Another flight populated the key before this caller got in.
    Cached(Populated<V>),
    Lead(u64),
    Follow(u64),
    /// The flight in progress began before the latest invalidation. The caller waits for it
    /// to settle, discards its result and starts over.
    Superseded(u64),
}

struct InFlight {
    id: u64,
    /// Cache epoch the flight was started under.
    epoch: u64,
    followers: usize,
}

struct Settled<V, E> {
    result: FlightResult<V, E>,
    remaining: usize,
}

struct SectionState<V, E> {
    next_flight: u64,
    in_flight: Option<InFlight>,
    settled: HashMap<u64, Settled<V, E>>,
}

/// Serializes population of one cache key.
///
/// At most one flight is in progress at a time. Each follower is bound to the flight it
/// joined and receives exactly that flight's result, so a failure reaches every waiter
/// even if a newer flight has already started.
pub(super) struct CriticalSection<V, E> {
    state: Mutex<SectionState<V, E>>,
    settled: Condvar,
}

impl<V, E: Clone> CriticalSection<V, E> {
    pub(super) fn new() -> Self {
        Self {
            state: Mutex::new(SectionState {
                next_flight: 0,
                in_flight: None,
                settled: HashMap::new(),
            }),
            settled: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SectionState<V, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Follows the in-flight population, or leads a new one when `cached` finds no entry.
    ///
    /// `epoch` is the cache epoch the caller observed before joining; a flight started under
    /// another epoch is never followed. `cached` runs under the section lock, after any earlier
    /// flight has installed its value.
    pub(super) fn join<F>(&self, epoch: u64, cached: F) -> Joined<V>
    where
        F: FnOnce() -> Option<Populated<V>>,
    {
        let mut state = self.lock();
        if let Some(flight) = state.in_flight.as_mut() {
            flight.followers += 1;
            if flight.epoch != epoch {
                return Joined::Superseded(flight.id);
            }
            return Joined::Follow(flight.id);
        }
        if let Some(found) = cached() {
            return Joined::Cached(found);
        }
        let id = state.next_flight;
        state.next_flight += 1;
        state.in_flight = Some(InFlight {
            id,
            epoch,
            followers: 0,
        });
        Joined::Lead(id)
    }

    pub(super) fn settle(&self, id: u64, result: FlightResult<V, E>) {
        let mut state = self.lock();
        match state.in_flight.take() {
            Some(flight) if flight.id == id => {
                if flight.followers > 0 {
                    state.settled.insert(
                        id,
                        Settled {
                            result,
                            remaining: flight.followers,
                        },
                    );
                }
            }
            other => state.in_flight = other,
        }
        drop(state);
        self.settled.notify_all();
    }

    /// Blocks until flight `id` settles and takes this follower's copy of its result.
    pub(super) fn wait(&self, id: u64) -> FlightResult<V, E> {
        let mut state = self.lock();
        loop {
            if let Some(entry) = state.settled.get_mut(&id) {
                entry.remaining -= 1;
                let result = entry.result.clone();
                if entry.remaining == 0 {
                    state.settled.remove(&id);
                }
                return result;
            }
            state = self
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Gives up a follower slot without waiting for the result.
    pub(super) fn withdraw(&self, id: u64) {
        let mut state = self.lock();
        if let Some(entry) = state.settled.get_mut(&id) {
            entry.remaining -= 1;
            if entry.remaining == 0 {
                state.settled.remove(&id);
            }
            return;
        }
        if let Some(flight) = state.in_flight.as_mut() {
            if flight.id == id {
                flight.followers = flight.followers.saturating_sub(1);
            }
        }
    }
}

/// Settles a led flight exactly once, marking it abandoned if the leader unwinds.
pub(super) struct LeadGuard<'a, V, E: Clone> {
    section: &'a CriticalSection<V, E>,
    id: u64,
    settled: bool,
}

impl<'a, V, E: Clone> LeadGuard<'a, V, E> {
    pub(super) fn new(section: &'a CriticalSection<V, E>, id: u64) -> Self {
        Self {
            section,
            id,
            settled: false,
        }
    }

    pub(super) fn settle(mut self, result: Result<Populated<V>, E>) {
        self.section.settle(self.id, FlightResult::Done(result));
        self.settled = true;
    }
}

impl<V, E: Clone> Drop for LeadGuard<'_, V, E> {
    fn drop(&mut self) {
        if !self.settled {
            self.section.settle(self.id, FlightResult::Abandoned);
        }
    }
}
