//! Completion state shared across the two execution contexts.

use core::sync::atomic::{AtomicBool, Ordering};

/// State shared between the relay and the USB completion context.
///
/// Allocate a `static` object and supply it to
/// [`Bridge::new`](crate::Bridge::new). Make sure that states are not
/// shared across bridges; otherwise, the bridge constructor panics.
///
/// ```
/// use usbd_ecm::BridgeState;
///
/// static BRIDGE_STATE: BridgeState = BridgeState::new();
/// ```
pub struct BridgeState {
    tx_done: AtomicBool,
    claimed: AtomicBool,
}

impl BridgeState {
    pub const fn new() -> Self {
        BridgeState {
            tx_done: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
        }
    }

    /// Claim the state. Returns `false` if it was already claimed.
    pub(crate) fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::SeqCst)
    }

    /// Arm the flag for a new transfer.
    pub(crate) fn begin_tx(&self) {
        self.tx_done.store(false, Ordering::Release);
    }

    /// Mark the transfer drained. Single writer: the completion
    /// context. The release store pairs with the acquire load in
    /// [`tx_done`](Self::tx_done) so the waiter observes a finished
    /// transfer, never a torn one.
    pub(crate) fn finish_tx(&self) {
        self.tx_done.store(true, Ordering::Release);
    }

    pub(crate) fn tx_done(&self) -> bool {
        self.tx_done.load(Ordering::Acquire)
    }
}
