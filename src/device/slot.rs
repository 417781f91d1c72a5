//! # Downlink Delivery Slot
//!
//! The per-device rendezvous between the routing fabric and a device
//! waiting in a receive window. One PHY payload per window: the first
//! push wins, later pushes and pushes onto a closed slot are refused, so
//! the fabric can report precisely whether anybody was listening.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::lorawan::phy::PhyPayload;

#[derive(Debug, Default)]
struct SlotState {
    open: bool,
    payload: Option<PhyPayload>,
}

/// One-shot handoff with a deadline, re-armed for every receive window.
#[derive(Debug, Default)]
pub struct DownlinkSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl DownlinkSlot {
    pub fn new() -> Self {
        DownlinkSlot::default()
    }

    /// Arms the slot for a new window, clearing any stale payload.
    pub fn open(&self) {
        let mut state = self.state.lock().expect("slot lock poisoned");
        state.open = true;
        state.payload = None;
    }

    /// Offers a PHY payload to the waiting device.
    ///
    /// Returns false when the slot is closed or already holds this
    /// window's payload.
    pub fn push(&self, phy: PhyPayload) -> bool {
        {
            let mut state = self.state.lock().expect("slot lock poisoned");
            if !state.open || state.payload.is_some() {
                return false;
            }
            state.payload = Some(phy);
        }
        self.notify.notify_waiters();
        true
    }

    /// Closes the window and wakes any waiter empty-handed. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().expect("slot lock poisoned");
            state.open = false;
        }
        self.notify.notify_waiters();
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().expect("slot lock poisoned").open
    }

    /// Waits until a payload arrives, the slot closes, or the window
    /// duration elapses. Consumes the payload.
    pub async fn recv(&self, window: Duration) -> Option<PhyPayload> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("slot lock poisoned");
                if let Some(phy) = state.payload.take() {
                    return Some(phy);
                }
                if !state.open {
                    return None;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // Deadline: one final check in case a push raced the timer.
                let mut state = self.state.lock().expect("slot lock poisoned");
                return state.payload.take();
            }
        }
    }
}
