// Capacity-managed admission: per-encoder slot pools under a global cap

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::config::{Config, EncodersConfig};

use super::command::Encoder;
use super::detect::DetectedEncoders;
use super::process::CancelToken;

/// How long a blocked acquire sleeps between cancel checks.
const ACQUIRE_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Returned from `acquire` when shutdown fires while waiting for capacity.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("shutdown requested while waiting for an encoder slot")]
pub struct Cancelled;

#[derive(Debug)]
struct Slot {
    max_concurrent: usize,
    in_flight: usize,
    completed: u64,
    failed: u64,
    // FIFO tickets: a waiter may only take capacity when its ticket is at the
    // head, so pool admission is strictly arrival-ordered.
    ticket_head: u64,
    ticket_tail: u64,
}

#[derive(Debug)]
struct SchedState {
    slots: BTreeMap<Encoder, Slot>,
    total_in_flight: usize,
}

/// Grants one in-flight unit per acquire. No task may spawn an encoder
/// subprocess without holding a lease.
#[derive(Debug)]
pub struct Scheduler {
    state: Mutex<SchedState>,
    capacity_freed: Condvar,
    global_cap: usize,
}

impl Scheduler {
    /// One slot pool per detected encoder, sized from config; undetected
    /// encoders get no pool and contribute nothing to the budget.
    pub fn new(cfg: &Config, detected: &DetectedEncoders) -> Arc<Self> {
        Self::with_pools(
            &cfg.encoders,
            detected.available(),
            cfg.scheduler.max_total_concurrent,
        )
    }

    pub fn with_pools(
        encoders: &EncodersConfig,
        available: &[Encoder],
        global_cap: usize,
    ) -> Arc<Self> {
        let slots = available
            .iter()
            .map(|&encoder| {
                (
                    encoder,
                    Slot {
                        max_concurrent: encoders.pool(encoder).max_concurrent,
                        in_flight: 0,
                        completed: 0,
                        failed: 0,
                        ticket_head: 0,
                        ticket_tail: 0,
                    },
                )
            })
            .collect();

        Arc::new(Self {
            state: Mutex::new(SchedState {
                slots,
                total_in_flight: 0,
            }),
            capacity_freed: Condvar::new(),
            global_cap,
        })
    }

    /// Block until this encoder's pool and the global cap both admit one more
    /// task, or until the cancel token fires. Admission per pool is FIFO.
    pub fn acquire(
        self: &Arc<Self>,
        encoder: Encoder,
        cancel: &CancelToken,
    ) -> Result<Lease, Cancelled> {
        let mut state = self.state.lock().unwrap();

        let ticket = {
            let slot = state
                .slots
                .get_mut(&encoder)
                .unwrap_or_else(|| panic!("no slot pool for {encoder}"));
            let t = slot.ticket_tail;
            slot.ticket_tail += 1;
            t
        };

        loop {
            if cancel.is_cancelled() {
                // Cancellation is global shutdown: every waiter aborts, so
                // advancing the head past an abandoned ticket cannot starve a
                // live waiter.
                let slot = state.slots.get_mut(&encoder).unwrap();
                if slot.ticket_head == ticket {
                    slot.ticket_head += 1;
                    self.capacity_freed.notify_all();
                }
                return Err(Cancelled);
            }

            // Global cap first so a busy large pool cannot starve small ones.
            let global_free = state.total_in_flight < self.global_cap;
            let slot = state.slots.get_mut(&encoder).unwrap();
            let at_head = slot.ticket_head == ticket;
            let pool_free = slot.in_flight < slot.max_concurrent;

            if global_free && at_head && pool_free {
                slot.ticket_head += 1;
                slot.in_flight += 1;
                state.total_in_flight += 1;
                debug!(
                    encoder = %encoder,
                    in_flight = state.total_in_flight,
                    "lease granted"
                );
                return Ok(Lease {
                    scheduler: Arc::clone(self),
                    encoder,
                    released: false,
                });
            }

            let (next, _timeout) = self
                .capacity_freed
                .wait_timeout(state, ACQUIRE_WAIT_SLICE)
                .unwrap();
            state = next;
        }
    }

    fn release(&self, encoder: Encoder, outcome: Option<bool>) {
        let mut state = self.state.lock().unwrap();
        state.total_in_flight -= 1;
        let slot = state.slots.get_mut(&encoder).unwrap();
        slot.in_flight -= 1;
        match outcome {
            Some(true) => slot.completed += 1,
            Some(false) => slot.failed += 1,
            None => {}
        }
        drop(state);
        self.capacity_freed.notify_all();
    }

    /// Consistent snapshot of every counter, taken under the one lock.
    pub fn stats(&self) -> SchedulerSnapshot {
        let state = self.state.lock().unwrap();
        SchedulerSnapshot {
            global_cap: self.global_cap,
            total_in_flight: state.total_in_flight,
            slots: state
                .slots
                .iter()
                .map(|(&encoder, slot)| {
                    (
                        encoder,
                        SlotSnapshot {
                            max_concurrent: slot.max_concurrent,
                            in_flight: slot.in_flight,
                            completed: slot.completed,
                            failed: slot.failed,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub global_cap: usize,
    pub total_in_flight: usize,
    pub slots: BTreeMap<Encoder, SlotSnapshot>,
}

#[derive(Debug, Clone, Copy)]
pub struct SlotSnapshot {
    pub max_concurrent: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
}

/// One unit of in-flight capacity. Releasing is idempotent; dropping an
/// unfinished lease releases without recording an outcome.
#[derive(Debug)]
pub struct Lease {
    scheduler: Arc<Scheduler>,
    encoder: Encoder,
    released: bool,
}

impl Lease {
    pub fn encoder(&self) -> Encoder {
        self.encoder
    }

    /// Release and record whether the attempt succeeded.
    pub fn finish(mut self, success: bool) {
        if !self.released {
            self.released = true;
            self.scheduler.release(self.encoder, Some(success));
        }
    }

    /// Release without touching the completed/failed counters (attempt was
    /// skipped or cancelled).
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.scheduler.release(self.encoder, None);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
