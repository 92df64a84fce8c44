// src/barrier.rs
//! Cyclic barrier shared by the sampling threads of one test.
//!
//! The coordinator opens a tick by bumping the generation; every active
//! worker performs exactly one read and arrives with its value. The tick is
//! complete once all current parties have arrived. A worker whose read
//! fails withdraws, which lowers the party count for every later tick and
//! leaves a sentinel in its slot.
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use crate::types::{Reading, SensorKind};

struct BarrierState {
    generation: u64,
    parties: usize,
    arrived: usize,
    slots: Vec<Option<Reading>>,
    active: Vec<bool>,
    shutdown: bool,
}

/// Values of one completed tick, by slot.
#[derive(Debug, Clone)]
pub struct Tick {
    pub values: Vec<Reading>,
    pub active: Vec<bool>,
}

pub struct TickBarrier {
    kinds: Vec<SensorKind>,
    state: Mutex<BarrierState>,
    workers: Condvar,
    coordinator: Condvar,
}

impl TickBarrier {
    pub fn new(kinds: Vec<SensorKind>) -> Self {
        let n = kinds.len();
        Self {
            kinds,
            state: Mutex::new(BarrierState {
                generation: 0,
                parties: n,
                arrived: 0,
                slots: vec![None; n],
                active: vec![true; n],
                shutdown: false,
            }),
            workers: Condvar::new(),
            coordinator: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn parties(&self) -> usize {
        self.lock().parties
    }

    /// Blocks a worker until a generation newer than `seen` opens.
    /// Returns `None` once the barrier is shut down.
    pub fn await_tick(&self, seen: u64) -> Option<u64> {
        let mut state = self.lock();
        while !state.shutdown && state.generation <= seen {
            state = self
                .workers
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        (!state.shutdown).then_some(state.generation)
    }

    /// Deposits a worker's reading for `generation`; stale arrivals are dropped.
    pub fn arrive(&self, slot: usize, generation: u64, reading: Reading) {
        let mut state = self.lock();
        if state.shutdown || state.generation != generation || !state.active[slot] {
            return;
        }
        if state.slots[slot].is_none() {
            state.slots[slot] = Some(reading);
            state.arrived += 1;
        }
        if state.arrived >= state.parties {
            self.coordinator.notify_all();
        }
    }

    /// Removes a worker from this and every later tick.
    pub fn withdraw(&self, slot: usize) {
        let mut state = self.lock();
        if !state.active[slot] {
            return;
        }
        state.active[slot] = false;
        state.parties -= 1;
        if state.slots[slot].take().is_some() {
            state.arrived -= 1;
        }
        self.coordinator.notify_all();
    }

    /// Opens the next tick and wakes every waiting worker.
    pub fn release(&self) -> u64 {
        let mut state = self.lock();
        state.generation += 1;
        state.arrived = 0;
        state.slots.iter_mut().for_each(|s| *s = None);
        self.workers.notify_all();
        state.generation
    }

    /// Waits for every party of the open tick.
    ///
    /// `cancelled` is polled every `poll`; when it reports true the partial
    /// tick is discarded and `None` is returned.
    pub fn collect(&self, poll: Duration, cancelled: impl Fn() -> bool) -> Option<Tick> {
        let mut state = self.lock();
        while state.arrived < state.parties {
            if state.shutdown || cancelled() {
                return None;
            }
            state = self
                .coordinator
                .wait_timeout(state, poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let values = state
            .slots
            .iter()
            .zip(&self.kinds)
            .map(|(slot, kind)| slot.unwrap_or_else(|| Reading::sentinel(*kind)))
            .collect();
        Some(Tick {
            values,
            active: state.active.clone(),
        })
    }

    /// Releases every worker for good.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        self.workers.notify_all();
        self.coordinator.notify_all();
    }
}
