//! The frame relay between the USB function and the network stack.
//!
//! [`Bridge::transmit`] is deliberately synchronous: the network stack
//! hands over one frame and regains control only once the completion
//! callback reports that the transfer drained (or the submission was
//! refused outright). [`Bridge::receive`] is the opposite: it never
//! waits, and reports an empty poll as a normal outcome.

use crate::netif::RxDispatch;
use crate::state::BridgeState;
use crate::{EcmTransport, SubmitError};

/// How long [`Bridge::transmit`] polls the completion flag.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxWait {
    /// Poll until the completion callback fires, however long that
    /// takes. A transfer the bus never completes blocks the caller
    /// indefinitely.
    Unbounded,
    /// Give up with [`TxError::Timeout`] after this many polls.
    Bounded(u32),
}

/// Transmit failure.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxError {
    /// The transport refused the frame; nothing was submitted and the
    /// caller may retry.
    Rejected(SubmitError),
    /// The completion callback did not fire within the configured
    /// bound. The frame is still in flight; the transport keeps
    /// rejecting new submissions until it drains.
    Timeout,
}

/// Receive failure.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RxError {
    /// The stack's input path refused the frame. The frame buffer has
    /// already been released.
    Forward,
}

/// Outcome of a successful receive poll.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Received {
    /// A frame of this length was delivered to the stack.
    Frame(usize),
    /// Nothing was buffered.
    Empty,
}

/// The frame relay.
///
/// One bridge serves one USB Ethernet function. The bridge itself lives
/// in the network-driving context; the [`Completion`] handle it mints
/// is the only piece the USB completion context touches.
///
/// Note that the blocking transmit relies on the USB device being
/// serviced from an execution context that can preempt the caller (an
/// interrupt, typically). In a single-context design where nothing
/// pumps the device during the wait, use [`TxWait::Bounded`].
pub struct Bridge<'a, D: RxDispatch> {
    state: &'a BridgeState,
    dispatch: &'a D,
    tx_wait: TxWait,
}

impl<'a, D: RxDispatch> Bridge<'a, D> {
    /// Create the relay over a shared state allocation.
    ///
    /// # Panics
    ///
    /// Panics if `state` is already claimed by another bridge.
    pub fn new(state: &'a BridgeState, dispatch: &'a D, tx_wait: TxWait) -> Self {
        assert!(state.claim(), "Bridge state already claimed");
        Bridge {
            state,
            dispatch,
            tx_wait,
        }
    }

    /// The handle the USB completion context uses to signal the relay.
    ///
    /// Hand it to exactly one transport: the completion flag is a
    /// single-writer signal.
    pub fn completion(&self) -> Completion<'a> {
        Completion {
            state: self.state,
            dispatch: self.dispatch,
        }
    }

    /// Relay one frame to the USB function and wait for it to drain.
    ///
    /// The completion flag is armed before submission; only the
    /// completion callback can release the wait, so a successful return
    /// means the transfer really finished. A refused submission returns
    /// immediately without waiting.
    pub fn transmit<T: EcmTransport>(&self, transport: &mut T, frame: &[u8]) -> Result<(), TxError> {
        self.state.begin_tx();
        transport.submit(frame).map_err(TxError::Rejected)?;

        let mut budget = match self.tx_wait {
            TxWait::Bounded(polls) => Some(polls),
            TxWait::Unbounded => None,
        };
        while !self.state.tx_done() {
            if let Some(polls) = budget.as_mut() {
                if *polls == 0 {
                    warn!("relay: tx wait exhausted");
                    return Err(TxError::Timeout);
                }
                *polls -= 1;
            }
            core::hint::spin_loop();
        }
        Ok(())
    }

    /// Pull the next buffered frame and hand it to the stack's input
    /// path.
    ///
    /// Never blocks; an empty poll is [`Received::Empty`]. The frame
    /// buffer is released exactly once whether `deliver` accepts the
    /// frame or not.
    pub fn receive<T: EcmTransport>(
        &self,
        transport: &mut T,
        deliver: impl FnOnce(&[u8]) -> Result<(), ()>,
    ) -> Result<Received, RxError> {
        match transport.take_received(|frame| deliver(frame).map(|()| frame.len())) {
            None => Ok(Received::Empty),
            Some(Ok(len)) => Ok(Received::Frame(len)),
            Some(Err(())) => Err(RxError::Forward),
        }
    }
}

/// Signals raised by the USB completion context.
///
/// Both methods are safe to call from a context that preempts the
/// relay, including interrupt handlers.
pub struct Completion<'a> {
    state: &'a BridgeState,
    dispatch: &'a dyn RxDispatch,
}

impl Completion<'_> {
    /// The submitted frame drained.
    pub fn tx_complete(&self, _len: usize) {
        trace!("relay: tx complete {}", _len);
        self.state.finish_tx();
    }

    /// A full frame is assembled and waiting to be taken.
    pub fn rx_complete(&self, len: usize) {
        self.dispatch.frame_ready(len);
    }
}
