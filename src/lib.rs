//! CDC-ECM (Ethernet-over-USB) for the `usb-device` ecosystem
//!
//! `usbd-ecm` presents a virtual Ethernet adapter to a USB host. It
//! implements the two interfaces of an ECM function, relays Ethernet
//! frames between the bulk pipe and a [`smoltcp`] network interface,
//! and carries the static address configuration a gadget-style network
//! needs (a DHCP lease pool and a fixed-hostname name rule, handed to
//! external servers).
//!
//! The pieces, bottom to top:
//!
//! - [`CdcEcmClass`] registers the communication and data interfaces
//!   with a [`usb_device::bus::UsbBus`] and moves frames over the bulk
//!   endpoints. It implements [`EcmTransport`], the seam the relay
//!   drives.
//! - [`Bridge`] is the frame relay: [`Bridge::transmit`] blocks until
//!   the completion callback reports the transfer drained, and
//!   [`Bridge::receive`] pulls buffered frames into the stack.
//! - [`EcmDevice`] adapts both to [`smoltcp::phy::Device`].
//!
//! The host's virtual NIC enumerates with the MAC address carried in
//! the string descriptor; the device side of the link uses
//! [`MacAddress::flipped_last`] so the two ends never share an address.
//!
//! # Example
//!
//! Construction and wiring, with the platform's `UsbBus` implementation
//! elided:
//!
//! ```no_run
//! # use usb_device::bus::{PollResult, UsbBus, UsbBusAllocator};
//! # use usb_device::endpoint::{EndpointAddress, EndpointType};
//! # use usb_device::{UsbDirection, UsbError};
//! # struct StubBus;
//! # impl UsbBus for StubBus {
//! #     fn alloc_ep(&mut self, dir: UsbDirection, addr: Option<EndpointAddress>, _: EndpointType, _: u16, _: u8) -> usb_device::Result<EndpointAddress> {
//! #         Ok(addr.unwrap_or(EndpointAddress::from_parts(1, dir)))
//! #     }
//! #     fn enable(&mut self) {}
//! #     fn reset(&self) {}
//! #     fn set_device_address(&self, _: u8) {}
//! #     fn write(&self, _: EndpointAddress, buf: &[u8]) -> usb_device::Result<usize> { Ok(buf.len()) }
//! #     fn read(&self, _: EndpointAddress, _: &mut [u8]) -> usb_device::Result<usize> { Err(UsbError::WouldBlock) }
//! #     fn set_stalled(&self, _: EndpointAddress, _: bool) {}
//! #     fn is_stalled(&self, _: EndpointAddress) -> bool { false }
//! #     fn suspend(&self) {}
//! #     fn resume(&self) {}
//! #     fn poll(&self) -> PollResult { PollResult::None }
//! # }
//! # fn platform_bus() -> UsbBusAllocator<StubBus> { UsbBusAllocator::new(StubBus) }
//! use usb_device::device::StringDescriptors;
//! use usb_device::prelude::*;
//! use usbd_ecm::{Bridge, BridgeState, CdcEcmClass, MacAddress, PollDispatch, TxWait};
//!
//! static BRIDGE_STATE: BridgeState = BridgeState::new();
//! static DISPATCH: PollDispatch = PollDispatch;
//!
//! let host_mac = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
//!
//! let allocator = platform_bus();
//! let bridge = Bridge::new(&BRIDGE_STATE, &DISPATCH, TxWait::Unbounded);
//!
//! let mut tx_mem = [0; usbd_ecm::TX_BUFFER_LEN];
//! let mut rx_mem = [0; usbd_ecm::RX_BUFFER_LEN];
//! let mut ecm = CdcEcmClass::new(
//!     &allocator,
//!     host_mac,
//!     64,
//!     bridge.completion(),
//!     &mut tx_mem,
//!     &mut rx_mem,
//! );
//!
//! let mut device = UsbDeviceBuilder::new(&allocator, UsbVidPid(0xffff, 0xffff))
//!     .strings(&[StringDescriptors::default()
//!         .manufacturer("usbd-ecm")
//!         .product("usbd-ecm network adapter")
//!         .serial_number("2022123456")])
//!     .unwrap()
//!     .device_class(0xef) // composite device, interface association
//!     .device_sub_class(0x02)
//!     .device_protocol(0x01)
//!     .max_packet_size_0(64)
//!     .unwrap()
//!     .build();
//!
//! // Service the device, usually from the USB interrupt. Once the host
//! // selects the data interface, call `ecm.connect()` and drive the
//! // network stack with an `EcmDevice`.
//! loop {
//!     device.poll(&mut [&mut ecm]);
//! }
//! ```
//!
//! [`smoltcp`]: https://crates.io/crates/smoltcp

#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
mod log;

mod bridge;
mod class;
mod config;
mod frame;
mod mac;
mod netif;
mod state;
#[cfg(test)]
mod test_bus;

pub use bridge::{Bridge, Completion, Received, RxError, TxError, TxWait};
pub use class::{CdcEcmClass, ConnectionSpeed, LinkState, PacketFilter, USB_CLASS_CDC};
pub use config::{bring_up, BringUpError, DhcpLease, DhcpPool, DnsRule, NetConfig, RetryBudget};
pub use frame::{RX_BUFFER_LEN, TX_BUFFER_LEN};
pub use mac::MacAddress;
pub use netif::{DeviceBuffers, EcmDevice, EcmRxToken, EcmTxToken, EventDispatch, PollDispatch, RxDispatch};
pub use state::BridgeState;

/// Ethernet maximum segment size moved across the link: a 14-byte
/// header plus the 1500-byte MTU.
pub const MAX_FRAME_LEN: usize = 1514;

/// Low-level frame primitives of a USB Ethernet function.
///
/// [`CdcEcmClass`] is the in-tree implementation; the trait is the seam
/// that lets [`Bridge`] (and the tests) drive any transport.
pub trait EcmTransport {
    /// Submit one Ethernet frame for transmission.
    ///
    /// `Ok(())` means the transfer was accepted and a completion
    /// callback will fire once it drains. Rejection reports why without
    /// disturbing any transfer already in flight; the caller may retry.
    fn submit(&mut self, frame: &[u8]) -> Result<(), SubmitError>;

    /// Hand the next fully received frame to `f`.
    ///
    /// Returns `None` without blocking when no frame is buffered. The
    /// frame is released when `f` returns, whatever its outcome.
    fn take_received<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Option<R>;
}

/// Why a transmit submission was refused.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SubmitError {
    /// A previous frame has not finished draining.
    InFlight,
    /// The host has not brought the link up.
    NotConnected,
    /// The frame exceeds the maximum segment size.
    Oversized,
}
