//! API admission control
//!
//! A bounded slot pool fronts the capture handler. Past the high-water mark
//! warnings are emitted; with no slot free the gateway answers 503 with
//! Retry-After.

use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

pub struct ApiAdmission {
    slots: Arc<ArrayQueue<()>>,
    capacity: usize,
    high_water: usize,
}

/// Occupied admission slot; returned to the pool on drop.
pub struct AdmissionTicket {
    slots: Arc<ArrayQueue<()>>,
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        let _ = self.slots.push(());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStatus {
    pub capacity: usize,
    pub in_flight: usize,
    pub high_water: usize,
}

impl ApiAdmission {
    pub fn new(capacity: usize, high_water_fraction: f64) -> Self {
        let slots = Arc::new(ArrayQueue::new(capacity.max(1)));
        for _ in 0..capacity.max(1) {
            let _ = slots.push(());
        }
        Self {
            slots,
            capacity: capacity.max(1),
            high_water: ((capacity.max(1) as f64) * high_water_fraction) as usize,
        }
    }

    /// Claim a slot, or None at full capacity.
    pub fn try_enter(&self) -> Option<AdmissionTicket> {
        self.slots.pop()?;
        let in_flight = self.in_flight();
        if in_flight >= self.high_water {
            warn!(
                in_flight,
                capacity = self.capacity,
                "API admission past high-water mark"
            );
        }
        Some(AdmissionTicket {
            slots: Arc::clone(&self.slots),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.slots.len()
    }

    pub fn status(&self) -> AdmissionStatus {
        AdmissionStatus {
            capacity: self.capacity,
            in_flight: self.in_flight(),
            high_water: self.high_water,
        }
    }
}
