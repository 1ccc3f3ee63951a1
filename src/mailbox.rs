//! Single-slot mailboxes between the device loops and the synchronizer.
//!
//! A mailbox holds at most one [`Reading`]. Pushing overwrites whatever is there, so the
//! writer never blocks and never fails; draining takes the value out, so each reading is
//! observed at most once. Intermediate readings pushed between two drains are lost,
//! which is what makes the synchronizer "latest wins".
//!
//! The two halves are split like a channel so each side has exactly one owner: the
//! sender moves into the reader loop, the receiver into the synchronizer.

use crate::measurement::Reading;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug)]
struct Slot<T> {
    latest: Option<Reading<T>>,
    overwritten: u64,
}

/// Create a connected mailbox pair.
pub fn channel<T>() -> (MailboxSender<T>, MailboxReceiver<T>) {
    let slot = Arc::new(Mutex::new(Slot {
        latest: None,
        overwritten: 0,
    }));
    (
        MailboxSender { slot: slot.clone() },
        MailboxReceiver { slot },
    )
}

/// Writing half, owned by a device loop.
#[derive(Debug)]
pub struct MailboxSender<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> MailboxSender<T> {
    /// Store `reading`, replacing an undrained one.
    pub fn push(&self, reading: Reading<T>) {
        let mut slot = self.slot.lock();
        if slot.latest.replace(reading).is_some() {
            slot.overwritten += 1;
        }
    }
}

/// Reading half, owned by the synchronizer.
#[derive(Debug)]
pub struct MailboxReceiver<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> MailboxReceiver<T> {
    /// Take the newest reading pushed since the previous drain, if any.
    pub fn drain_latest(&mut self) -> Option<Reading<T>> {
        self.slot.lock().latest.take()
    }

    /// Readings replaced before they were drained.
    pub fn overwritten(&self) -> u64 {
        self.slot.lock().overwritten
    }
}
