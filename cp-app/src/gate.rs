//! Process-wide send gate.
//!
//! One dispatch-and-send sequence may be active at a time. Auxiliary blocking
//! calls (image descriptions, pending sticker timers) hold dispatch closed
//! while they run. Both flags live behind a single lock so reservation is one
//! atomic check-and-set.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct GateState {
    dispatch_holds: usize,
    send_in_progress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateSnapshot {
    pub dispatch_allowed: bool,
    pub send_in_progress: bool,
    pub dispatch_holds: usize,
}

#[derive(Debug, Default)]
pub struct SendGate {
    state: Mutex<GateState>,
}

impl SendGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks a send as in progress if dispatch is allowed and nothing else is sending.
    pub fn try_acquire_send_slot(&self) -> bool {
        let mut state = self.lock();
        if state.dispatch_holds > 0 || state.send_in_progress {
            return false;
        }
        state.send_in_progress = true;
        true
    }

    pub fn release_send_slot(&self) {
        self.lock().send_in_progress = false;
    }

    /// Guard form of [`Self::try_acquire_send_slot`]; the slot is released on drop.
    pub fn try_reserve(self: &Arc<Self>) -> Option<SendSlot> {
        self.try_acquire_send_slot().then(|| SendSlot {
            gate: Arc::clone(self),
        })
    }

    /// Closes dispatch until the returned guard is dropped. Holds nest.
    pub fn hold_dispatch(self: &Arc<Self>) -> DispatchHold {
        self.lock().dispatch_holds += 1;
        DispatchHold {
            gate: Arc::clone(self),
        }
    }

    pub fn dispatch_allowed(&self) -> bool {
        self.lock().dispatch_holds == 0
    }

    pub fn send_in_progress(&self) -> bool {
        self.lock().send_in_progress
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let state = self.lock();
        GateSnapshot {
            dispatch_allowed: state.dispatch_holds == 0,
            send_in_progress: state.send_in_progress,
            dispatch_holds: state.dispatch_holds,
        }
    }
}

/// Proof that the caller owns the send slot.
#[derive(Debug)]
pub struct SendSlot {
    gate: Arc<SendGate>,
}

impl SendSlot {
    /// True while no auxiliary call holds dispatch closed.
    pub fn dispatch_allowed(&self) -> bool {
        self.gate.dispatch_allowed()
    }
}

impl Drop for SendSlot {
    fn drop(&mut self) {
        self.gate.release_send_slot();
    }
}

#[derive(Debug)]
pub struct DispatchHold {
    gate: Arc<SendGate>,
}

impl Drop for DispatchHold {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        state.dispatch_holds = state.dispatch_holds.saturating_sub(1);
    }
}
