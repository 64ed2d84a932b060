//! Network-stack integration.
//!
//! Two kinds of driving loop exist for this function. A polled loop
//! simply runs the interface on a cadence and discovers received
//! frames on its next pass. An event-driven loop sleeps until the USB
//! completion context trips a readiness latch. Both consume the same
//! capability, [`RxDispatch`]; pick the implementation when wiring the
//! [`Bridge`](crate::Bridge).
//!
//! [`EcmDevice`] adapts the class and relay to [`smoltcp::phy::Device`]
//! so an `Interface` can run on top of the link.

use core::sync::atomic::{AtomicBool, Ordering};

use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use usb_device::bus::UsbBus;

use crate::bridge::{Bridge, Received};
use crate::class::{CdcEcmClass, LinkState};
use crate::MAX_FRAME_LEN;

/// How the completion context announces a buffered receive frame.
///
/// Invoked once per assembled frame, from the USB completion context.
pub trait RxDispatch: Sync {
    fn frame_ready(&self, len: usize);
}

/// Frames wait for the next poll; no signal is raised.
pub struct PollDispatch;

impl RxDispatch for PollDispatch {
    fn frame_ready(&self, _len: usize) {}
}

/// Latches readiness so a driving loop can sleep between frames.
///
/// ```
/// use usbd_ecm::{EventDispatch, RxDispatch};
///
/// static DISPATCH: EventDispatch = EventDispatch::new();
///
/// // Completion context:
/// DISPATCH.frame_ready(60);
///
/// // Driving loop:
/// assert!(DISPATCH.take_ready());
/// assert!(!DISPATCH.take_ready());
/// ```
pub struct EventDispatch {
    ready: AtomicBool,
}

impl EventDispatch {
    pub const fn new() -> Self {
        EventDispatch {
            ready: AtomicBool::new(false),
        }
    }

    /// Clears and returns the latch.
    pub fn take_ready(&self) -> bool {
        self.ready.swap(false, Ordering::Acquire)
    }
}

impl RxDispatch for EventDispatch {
    fn frame_ready(&self, _len: usize) {
        self.ready.store(true, Ordering::Release);
    }
}

/// Frame scratch memory for [`EcmDevice`].
///
/// Outlives the per-poll device adapter so tokens have somewhere to
/// stage frames. One allocation serves one interface.
pub struct DeviceBuffers {
    rx: [u8; MAX_FRAME_LEN],
    tx: [u8; MAX_FRAME_LEN],
}

impl DeviceBuffers {
    pub const fn new() -> Self {
        DeviceBuffers {
            rx: [0; MAX_FRAME_LEN],
            tx: [0; MAX_FRAME_LEN],
        }
    }
}

impl Default for DeviceBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// `smoltcp` device over the function and relay.
///
/// Construct one around each interface poll; the borrows are released
/// when the poll returns, freeing the class for the USB interrupt
/// again. Configure the interface with the *device-side* MAC address
/// ([`MacAddress::flipped_last`](crate::MacAddress::flipped_last)).
pub struct EcmDevice<'a, 'b, B: UsbBus, D: RxDispatch> {
    class: &'b mut CdcEcmClass<'a, B>,
    bridge: &'b Bridge<'a, D>,
    buffers: &'b mut DeviceBuffers,
}

impl<'a, 'b, B: UsbBus, D: RxDispatch> EcmDevice<'a, 'b, B, D> {
    pub fn new(
        class: &'b mut CdcEcmClass<'a, B>,
        bridge: &'b Bridge<'a, D>,
        buffers: &'b mut DeviceBuffers,
    ) -> Self {
        EcmDevice {
            class,
            bridge,
            buffers,
        }
    }
}

impl<'a, B: UsbBus, D: RxDispatch> Device for EcmDevice<'a, '_, B, D> {
    type RxToken<'t> = EcmRxToken<'t>
    where
        Self: 't;
    type TxToken<'t> = EcmTxToken<'a, 't, B, D>
    where
        Self: 't;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        if self.class.link_state() != LinkState::Connected || !self.class.tx_idle() {
            return None;
        }

        let DeviceBuffers { rx, tx } = &mut *self.buffers;
        let received = self.bridge.receive(&mut *self.class, |frame| {
            rx[..frame.len()].copy_from_slice(frame);
            Ok(())
        });
        let len = match received {
            Ok(Received::Frame(len)) => len,
            _ => return None,
        };

        Some((
            EcmRxToken {
                frame: &mut rx[..len],
            },
            EcmTxToken {
                class: &mut *self.class,
                bridge: self.bridge,
                frame: tx,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        if self.class.link_state() == LinkState::Connected && self.class.tx_idle() {
            Some(EcmTxToken {
                class: &mut *self.class,
                bridge: self.bridge,
                frame: &mut self.buffers.tx,
            })
        } else {
            None
        }
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = MAX_FRAME_LEN;
        caps.max_burst_size = Some(1);
        caps.medium = Medium::Ethernet;
        caps
    }
}

pub struct EcmRxToken<'t> {
    frame: &'t mut [u8],
}

impl phy::RxToken for EcmRxToken<'_> {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(self.frame)
    }
}

pub struct EcmTxToken<'a, 't, B: UsbBus, D: RxDispatch> {
    class: &'t mut CdcEcmClass<'a, B>,
    bridge: &'t Bridge<'a, D>,
    frame: &'t mut [u8; MAX_FRAME_LEN],
}

impl<B: UsbBus, D: RxDispatch> phy::TxToken for EcmTxToken<'_, '_, B, D> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let result = f(&mut self.frame[..len]);
        // The token interface has no way to report a refused or timed
        // out transfer; the frame is dropped, as any saturated link
        // drops, and the stack's own retransmissions recover.
        if self.bridge.transmit(self.class, &self.frame[..len]).is_err() {
            warn!("netif: outbound frame dropped");
        }
        result
    }
}
