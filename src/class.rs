//! CDC-ECM function implementation.
//!
//! The class registers the two interfaces of an Ethernet Control Model
//! function: a communication interface carrying the functional
//! descriptors and the interrupt notification endpoint, and a data
//! interface whose alternate setting 1 holds the bulk pipe. Frames
//! cross the bulk pipe as runs of max-packet-size packets closed by a
//! short packet (a zero-length one when the frame lands exactly on a
//! packet boundary).
//!
//! The transfer pumps run from the `usb-device` callbacks, so they
//! execute wherever the device is polled — usually the USB interrupt.
//! The [`Completion`] handle is how finished transfers reach the relay
//! on the other side of that context boundary.

use usb_device::class_prelude::*;

use crate::bridge::Completion;
use crate::frame::{FrameAssembler, FrameWriter, RxProgress, StageError};
use crate::frame::{RX_BUFFER_LEN, TX_BUFFER_LEN};
use crate::mac::MacAddress;
use crate::{EcmTransport, SubmitError, MAX_FRAME_LEN};

/// This should be used as `device_class` when building the `UsbDevice`,
/// unless the device is a composite with interface association
/// descriptors (class 0xEF).
pub const USB_CLASS_CDC: u8 = 0x02;

const USB_CLASS_CDC_DATA: u8 = 0x0a;
const CDC_SUBCLASS_ECM: u8 = 0x06;
const CDC_PROTOCOL_NONE: u8 = 0x00;

const CS_INTERFACE: u8 = 0x24;
const CDC_TYPE_HEADER: u8 = 0x00;
const CDC_TYPE_UNION: u8 = 0x06;
const CDC_TYPE_ETHERNET: u8 = 0x0f;

const REQ_TYPE_DEVICE_TO_HOST: u8 = 0xa1;
const REQ_SET_ETHERNET_PACKET_FILTER: u8 = 0x43;

const NOTE_NETWORK_CONNECTION: u8 = 0x00;
const NOTE_CONNECTION_SPEED_CHANGE: u8 = 0x2a;

const MAX_SEGMENT_SIZE: u16 = MAX_FRAME_LEN as u16;

bitflags::bitflags! {
    /// Ethernet packet filter bitmap set by the host through
    /// SetEthernetPacketFilter.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PacketFilter: u16 {
        const PROMISCUOUS = 1 << 0;
        const ALL_MULTICAST = 1 << 1;
        const DIRECTED = 1 << 2;
        const BROADCAST = 1 << 3;
        const MULTICAST = 1 << 4;
    }
}

/// Link state of the function, as seen by the host.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkState {
    /// Data interface alternate setting 0: no endpoints, no traffic.
    Disabled,
    /// Data interface selected, connection notification not delivered.
    Disconnected,
    /// Host was told the link is up; frames may flow.
    Connected,
}

/// Up/down bit rates reported through ConnectionSpeedChange.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConnectionSpeed {
    pub download_bit_rate: u32,
    pub upload_bit_rate: u32,
}

enum NotifyState {
    Idle,
    InProgress(Notification),
}

enum Notification {
    Connection(bool),
    Speed(ConnectionSpeed),
}

/// USB CDC-ECM class with a single-frame pipe in each direction.
pub struct CdcEcmClass<'a, B: UsbBus> {
    comm_if: InterfaceNumber,
    notify_ep: EndpointIn<'a, B>,
    data_if: InterfaceNumber,
    mac_string: heapless::String<12>,
    mac_string_idx: StringIndex,
    link: LinkState,
    notify: NotifyState,
    filter: PacketFilter,
    speed: Option<ConnectionSpeed>,
    completion: Completion<'a>,
    tx_ep: EndpointIn<'a, B>,
    tx_frame: FrameWriter<'a>,
    rx_ep: EndpointOut<'a, B>,
    rx_frame: FrameAssembler<'a>,
}

impl<'a, B: UsbBus> CdcEcmClass<'a, B> {
    /// Create the function.
    ///
    /// `host_mac` is the address the host's virtual NIC will adopt; it
    /// reaches the host through the MAC string descriptor. Use its
    /// [`flipped_last`](MacAddress::flipped_last) counterpart on the
    /// device side of the link. `max_packet_size` is the bulk packet
    /// size for the bus speed: 64 for full speed, 512 for high speed.
    pub fn new(
        alloc: &'a UsbBusAllocator<B>,
        host_mac: MacAddress,
        max_packet_size: u16,
        completion: Completion<'a>,
        tx_mem: &'a mut [u8; TX_BUFFER_LEN],
        rx_mem: &'a mut [u8; RX_BUFFER_LEN],
    ) -> Self {
        let mac_string_idx = alloc.string();

        CdcEcmClass {
            comm_if: alloc.interface(),
            notify_ep: alloc.interrupt(16, 255),
            data_if: alloc.interface(),
            mac_string: host_mac.descriptor_string(),
            mac_string_idx,
            link: LinkState::Disabled,
            notify: NotifyState::Idle,
            filter: PacketFilter::empty(),
            speed: None,
            completion,
            tx_ep: alloc.bulk(max_packet_size),
            tx_frame: FrameWriter::new(tx_mem),
            rx_ep: alloc.bulk(max_packet_size),
            rx_frame: FrameAssembler::new(rx_mem),
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    /// The filter bitmap most recently set by the host.
    pub fn packet_filter(&self) -> PacketFilter {
        self.filter
    }

    /// The speed most recently acknowledged by the host.
    pub fn connection_speed(&self) -> Option<ConnectionSpeed> {
        self.speed
    }

    /// No transmit is staged or in flight.
    pub fn tx_idle(&self) -> bool {
        self.tx_frame.is_idle()
    }

    /// Tell the host the link is up.
    ///
    /// Call once the host has selected the data interface (the link
    /// state reads [`LinkState::Disconnected`]). The state advances to
    /// [`LinkState::Connected`] when the notification transfer
    /// completes.
    pub fn connect(&mut self) -> usb_device::Result<()> {
        self.notify_connection(true)
    }

    /// Tell the host the link is down.
    pub fn disconnect(&mut self) -> usb_device::Result<()> {
        self.notify_connection(false)
    }

    fn notify_connection(&mut self, connect: bool) -> usb_device::Result<()> {
        if self.link == LinkState::Disabled {
            return Err(UsbError::WouldBlock);
        }
        if !matches!(self.notify, NotifyState::Idle) {
            return Err(UsbError::WouldBlock);
        }

        let mut data = [0u8; 8];
        data[0] = REQ_TYPE_DEVICE_TO_HOST;
        data[1] = NOTE_NETWORK_CONNECTION;
        data[2..4].copy_from_slice(&u16::from(connect).to_le_bytes());
        data[4..6].copy_from_slice(&u16::from(u8::from(self.data_if)).to_le_bytes());
        self.notify_ep.write(&data)?;

        debug!("ecm: connection notification, up: {}", connect);
        self.notify = NotifyState::InProgress(Notification::Connection(connect));
        Ok(())
    }

    /// Report the link bit rates to the host.
    pub fn set_connection_speed(
        &mut self,
        download_bit_rate: u32,
        upload_bit_rate: u32,
    ) -> usb_device::Result<()> {
        if self.link == LinkState::Disabled {
            return Err(UsbError::WouldBlock);
        }
        if !matches!(self.notify, NotifyState::Idle) {
            return Err(UsbError::WouldBlock);
        }

        let mut data = [0u8; 16];
        data[0] = REQ_TYPE_DEVICE_TO_HOST;
        data[1] = NOTE_CONNECTION_SPEED_CHANGE;
        data[4..6].copy_from_slice(&u16::from(u8::from(self.data_if)).to_le_bytes());
        data[6..8].copy_from_slice(&8u16.to_le_bytes());
        data[8..12].copy_from_slice(&download_bit_rate.to_le_bytes());
        data[12..16].copy_from_slice(&upload_bit_rate.to_le_bytes());
        self.notify_ep.write(&data)?;

        debug!("ecm: speed notification");
        self.notify = NotifyState::InProgress(Notification::Speed(ConnectionSpeed {
            download_bit_rate,
            upload_bit_rate,
        }));
        Ok(())
    }

    /// Push staged chunks into the bulk IN endpoint until it pushes
    /// back. Runs on submission and again on every IN completion; the
    /// relay is signalled from the completion path once the final
    /// packet has actually drained.
    fn pump_tx(&mut self) {
        let max_packet = self.tx_ep.max_packet_size() as usize;
        while let Some(chunk) = self.tx_frame.next_chunk(max_packet) {
            match self.tx_ep.write(chunk) {
                Ok(written) => self.tx_frame.advance(written, max_packet),
                Err(UsbError::WouldBlock) => return,
                Err(_e) => {
                    // The transfer is gone; nothing will complete it.
                    // Drop the frame so the pipe can make progress.
                    warn!("ecm: tx error, frame dropped");
                    self.tx_frame.abort();
                    return;
                }
            }
        }
    }

    fn tx_ep_complete(&mut self) {
        if self.tx_frame.finished() {
            let len = self.tx_frame.finish();
            trace!("ecm: tx frame drained, {} bytes", len);
            self.completion.tx_complete(len);
        } else {
            self.pump_tx();
        }
    }

    /// Drain the bulk OUT endpoint into the assembler. Stops while a
    /// completed frame waits to be taken; the host sees NAKs until the
    /// network side catches up.
    fn pump_rx(&mut self) {
        let max_packet = self.rx_ep.max_packet_size() as usize;
        loop {
            let Some(buf) = self.rx_frame.packet_buf(max_packet) else {
                return;
            };
            match self.rx_ep.read(buf) {
                Ok(read) => match self.rx_frame.commit(read, max_packet) {
                    RxProgress::Partial => continue,
                    RxProgress::Complete(len) => {
                        trace!("ecm: rx frame assembled, {} bytes", len);
                        self.completion.rx_complete(len);
                        return;
                    }
                    RxProgress::Dropped => {
                        warn!("ecm: rx frame dropped");
                        continue;
                    }
                },
                Err(UsbError::WouldBlock) => return,
                Err(_e) => {
                    warn!("ecm: rx error");
                    self.rx_frame.reset();
                    return;
                }
            }
        }
    }

    fn notify_done(&mut self) {
        match core::mem::replace(&mut self.notify, NotifyState::Idle) {
            NotifyState::Idle => {
                warn!("ecm: stray notification completion");
            }
            NotifyState::InProgress(Notification::Connection(true)) => {
                debug!("ecm: link up");
                self.link = LinkState::Connected;
            }
            NotifyState::InProgress(Notification::Connection(false)) => {
                debug!("ecm: link down");
                self.link = LinkState::Disconnected;
            }
            NotifyState::InProgress(Notification::Speed(speed)) => {
                self.speed = Some(speed);
            }
        }
    }

    fn select_data_alt(&mut self, alt: u8) {
        match alt {
            0 => {
                debug!("ecm: data interface idle");
                self.link = LinkState::Disabled;
                self.notify = NotifyState::Idle;
                self.tx_frame.abort();
                self.rx_frame.reset();
            }
            _ => {
                debug!("ecm: data interface selected");
                self.link = LinkState::Disconnected;
            }
        }
    }
}

#[cfg(test)]
impl<B: UsbBus> CdcEcmClass<'_, B> {
    pub(crate) fn force_link(&mut self, link: LinkState) {
        self.link = link;
    }

    pub(crate) fn tx_endpoint(&self) -> EndpointAddress {
        self.tx_ep.address()
    }

    pub(crate) fn rx_endpoint(&self) -> EndpointAddress {
        self.rx_ep.address()
    }
}

impl<B: UsbBus> EcmTransport for CdcEcmClass<'_, B> {
    fn submit(&mut self, frame: &[u8]) -> Result<(), SubmitError> {
        if self.link != LinkState::Connected {
            return Err(SubmitError::NotConnected);
        }
        self.tx_frame.stage(frame).map_err(|error| match error {
            StageError::Busy => SubmitError::InFlight,
            StageError::Oversized => SubmitError::Oversized,
        })?;
        self.pump_tx();
        Ok(())
    }

    fn take_received<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let taken = self.rx_frame.take(f);
        if taken.is_some() {
            // The endpoint may have parked packets while the frame
            // waited; pick them up now rather than on the next poll.
            self.pump_rx();
        }
        taken
    }
}

impl<B: UsbBus> UsbClass<B> for CdcEcmClass<'_, B> {
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> usb_device::Result<()> {
        writer.iad(
            self.comm_if,
            2,
            USB_CLASS_CDC,
            CDC_SUBCLASS_ECM,
            CDC_PROTOCOL_NONE,
            None,
        )?;

        // Communication interface and its functional descriptors
        writer.interface(self.comm_if, USB_CLASS_CDC, CDC_SUBCLASS_ECM, CDC_PROTOCOL_NONE)?;
        writer.write(
            CS_INTERFACE,
            &[
                CDC_TYPE_HEADER,
                0x10, // bcdCDC 1.10
                0x01,
            ],
        )?;
        writer.write(
            CS_INTERFACE,
            &[
                CDC_TYPE_UNION,
                self.comm_if.into(), // bControlInterface
                self.data_if.into(), // bSubordinateInterface0
            ],
        )?;
        let segment = MAX_SEGMENT_SIZE.to_le_bytes();
        writer.write(
            CS_INTERFACE,
            &[
                CDC_TYPE_ETHERNET,
                self.mac_string_idx.into(), // iMACAddress
                0x00,                       // bmEthernetStatistics
                0x00,
                0x00,
                0x00,
                segment[0], // wMaxSegmentSize
                segment[1],
                0x00, // wNumberMCFilters
                0x00,
                0x00, // bNumberPowerFilters
            ],
        )?;
        writer.endpoint(&self.notify_ep)?;

        // Data interface: idle alternate, then the bulk pipe
        writer.interface_alt(self.data_if, 0, USB_CLASS_CDC_DATA, 0x00, CDC_PROTOCOL_NONE, None)?;
        writer.interface_alt(self.data_if, 1, USB_CLASS_CDC_DATA, 0x00, CDC_PROTOCOL_NONE, None)?;
        writer.endpoint(&self.tx_ep)?;
        writer.endpoint(&self.rx_ep)?;

        Ok(())
    }

    fn get_string(&self, index: StringIndex, _lang_id: LangID) -> Option<&str> {
        (index == self.mac_string_idx).then_some(self.mac_string.as_str())
    }

    fn reset(&mut self) {
        debug!("ecm: bus reset");
        self.link = LinkState::Disabled;
        self.notify = NotifyState::Idle;
        self.filter = PacketFilter::empty();
        self.speed = None;
        self.tx_frame.abort();
        self.rx_frame.reset();
    }

    fn get_alt_setting(&mut self, interface: InterfaceNumber) -> Option<u8> {
        (u8::from(interface) == u8::from(self.data_if)).then_some(match self.link {
            LinkState::Disabled => 0,
            _ => 1,
        })
    }

    fn set_alt_setting(&mut self, interface: InterfaceNumber, alternative: u8) -> bool {
        if u8::from(interface) != u8::from(self.data_if) || alternative > 1 {
            return false;
        }
        self.select_data_alt(alternative);
        true
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = xfer.request();
        if req.recipient != control::Recipient::Interface
            || req.index != u16::from(u8::from(self.comm_if))
        {
            return;
        }

        match (req.request_type, req.request) {
            (control::RequestType::Class, REQ_SET_ETHERNET_PACKET_FILTER) => {
                self.filter = PacketFilter::from_bits_truncate(req.value);
                debug!("ecm: packet filter {}", req.value);
                xfer.accept().ok();
            }
            _ => {
                warn!("ecm: unhandled communication class request {}", req.request);
            }
        }
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = xfer.request();
        if req.recipient != control::Recipient::Interface {
            return;
        }
        if req.index == u16::from(u8::from(self.comm_if))
            && req.request_type == control::RequestType::Class
        {
            // GetEthernetStatistic and friends: the statistics bitmap
            // in the functional descriptor advertises none.
            warn!("ecm: unhandled communication class request {}", req.request);
        }
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if addr == self.tx_ep.address() {
            self.tx_ep_complete();
        } else if addr == self.notify_ep.address() {
            self.notify_done();
        }
    }

    fn endpoint_out(&mut self, addr: EndpointAddress) {
        if addr == self.rx_ep.address() {
            self.pump_rx();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CdcEcmClass, LinkState, PacketFilter};
    use crate::bridge::{Bridge, TxWait};
    use crate::netif::PollDispatch;
    use crate::state::BridgeState;
    use crate::test_bus::{BusHandle, TestBus};
    use crate::{EcmTransport, SubmitError, RX_BUFFER_LEN, TX_BUFFER_LEN};
    use crate::MacAddress;
    use usb_device::bus::UsbBusAllocator;
    use usb_device::class::UsbClass;

    const MPS: u16 = 64;

    struct Fixture {
        allocator: UsbBusAllocator<TestBus>,
        bus: BusHandle,
        state: BridgeState,
    }

    impl Fixture {
        fn new() -> Self {
            let (allocator, bus) = TestBus::allocator();
            Fixture {
                allocator,
                bus,
                state: BridgeState::new(),
            }
        }
    }

    fn build_class<'a>(
        fixture: &'a Fixture,
        tx_mem: &'a mut [u8; TX_BUFFER_LEN],
        rx_mem: &'a mut [u8; RX_BUFFER_LEN],
    ) -> CdcEcmClass<'a, TestBus> {
        static DISPATCH: PollDispatch = PollDispatch;
        let bridge = Bridge::new(&fixture.state, &DISPATCH, TxWait::Unbounded);
        let completion = bridge.completion();
        let class = CdcEcmClass::new(
            &fixture.allocator,
            MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            MPS,
            completion,
            tx_mem,
            rx_mem,
        );
        crate::test_bus::enable_bus(&fixture.allocator);
        class
    }

    #[test]
    fn submit_requires_connection() {
        let fixture = Fixture::new();
        let (mut tx_mem, mut rx_mem) = ([0; TX_BUFFER_LEN], [0; RX_BUFFER_LEN]);
        let mut class = build_class(&fixture, &mut tx_mem, &mut rx_mem);

        assert_eq!(class.submit(&[0; 60]), Err(SubmitError::NotConnected));
    }

    #[test]
    fn submit_segments_and_signals_completion() {
        let fixture = Fixture::new();
        let (mut tx_mem, mut rx_mem) = ([0; TX_BUFFER_LEN], [0; RX_BUFFER_LEN]);
        let mut class = build_class(&fixture, &mut tx_mem, &mut rx_mem);
        class.link = LinkState::Connected;

        let bus = &fixture.bus;
        let tx_addr = class.tx_ep.address();

        // 128 bytes at a 64-byte packet size: two full packets and a
        // zero-length terminator, one endpoint write at a time.
        class.submit(&[0x11; 128]).unwrap();
        assert!(!fixture.state.tx_done());
        assert_eq!(class.submit(&[0; 60]), Err(SubmitError::InFlight));

        assert_eq!(bus.drain_in(tx_addr).unwrap().len(), 64);
        class.endpoint_in_complete(tx_addr);
        assert!(!fixture.state.tx_done());

        assert_eq!(bus.drain_in(tx_addr).unwrap().len(), 64);
        class.endpoint_in_complete(tx_addr);
        assert!(!fixture.state.tx_done());

        assert_eq!(bus.drain_in(tx_addr).unwrap().len(), 0);
        class.endpoint_in_complete(tx_addr);

        assert!(fixture.state.tx_done());
        assert!(class.tx_idle());
    }

    #[test]
    fn submit_short_frame_is_a_single_packet() {
        let fixture = Fixture::new();
        let (mut tx_mem, mut rx_mem) = ([0; TX_BUFFER_LEN], [0; RX_BUFFER_LEN]);
        let mut class = build_class(&fixture, &mut tx_mem, &mut rx_mem);
        class.link = LinkState::Connected;

        let bus = &fixture.bus;
        let tx_addr = class.tx_ep.address();

        class.submit(&[0x22; 60]).unwrap();
        let packet = bus.drain_in(tx_addr).unwrap();
        assert_eq!(packet, [0x22; 60]);

        class.endpoint_in_complete(tx_addr);
        assert!(fixture.state.tx_done());
    }

    #[test]
    fn received_packets_assemble_into_a_frame() {
        let fixture = Fixture::new();
        let (mut tx_mem, mut rx_mem) = ([0; TX_BUFFER_LEN], [0; RX_BUFFER_LEN]);
        let mut class = build_class(&fixture, &mut tx_mem, &mut rx_mem);
        class.link = LinkState::Connected;

        let bus = &fixture.bus;
        let rx_addr = class.rx_ep.address();

        bus.push_out(rx_addr, &[0x33; 64]);
        bus.push_out(rx_addr, &[0x44; 60]);
        class.endpoint_out(rx_addr);

        let frame = class
            .take_received(|frame| {
                assert_eq!(&frame[..64], &[0x33; 64][..]);
                assert_eq!(&frame[64..], &[0x44; 60][..]);
                frame.len()
            })
            .unwrap();
        assert_eq!(frame, 124);

        // Taken exactly once.
        assert!(class.take_received(|frame| frame.len()).is_none());
    }

    #[test]
    fn completed_frame_parks_until_taken() {
        let fixture = Fixture::new();
        let (mut tx_mem, mut rx_mem) = ([0; TX_BUFFER_LEN], [0; RX_BUFFER_LEN]);
        let mut class = build_class(&fixture, &mut tx_mem, &mut rx_mem);
        class.link = LinkState::Connected;

        let bus = &fixture.bus;
        let rx_addr = class.rx_ep.address();

        bus.push_out(rx_addr, &[0x55; 60]);
        bus.push_out(rx_addr, &[0x66; 60]);
        class.endpoint_out(rx_addr);

        // The first frame is complete; the second stays in the
        // endpoint until the first is taken.
        assert_eq!(class.take_received(|f| f[0]), Some(0x55));
        assert_eq!(class.take_received(|f| f[0]), Some(0x66));
        assert!(class.take_received(|_| ()).is_none());
    }

    #[test]
    fn connect_notification_advances_link_state() {
        let fixture = Fixture::new();
        let (mut tx_mem, mut rx_mem) = ([0; TX_BUFFER_LEN], [0; RX_BUFFER_LEN]);
        let mut class = build_class(&fixture, &mut tx_mem, &mut rx_mem);

        // Nothing to notify while the data interface is idle.
        assert!(class.connect().is_err());

        class.select_data_alt(1);
        assert_eq!(class.link_state(), LinkState::Disconnected);

        class.connect().unwrap();
        let bus = &fixture.bus;
        let notify_addr = class.notify_ep.address();
        let note = bus.drain_in(notify_addr).unwrap();
        assert_eq!(note[0], 0xa1);
        assert_eq!(note[1], 0x00); // NetworkConnection
        assert_eq!(note[2], 0x01); // connected

        class.endpoint_in_complete(notify_addr);
        assert_eq!(class.link_state(), LinkState::Connected);
    }

    #[test]
    fn reset_drops_everything() {
        let fixture = Fixture::new();
        let (mut tx_mem, mut rx_mem) = ([0; TX_BUFFER_LEN], [0; RX_BUFFER_LEN]);
        let mut class = build_class(&fixture, &mut tx_mem, &mut rx_mem);
        class.link = LinkState::Connected;
        class.filter = PacketFilter::BROADCAST;

        class.submit(&[0; 100]).unwrap();

        class.reset();
        assert_eq!(class.link_state(), LinkState::Disabled);
        assert!(class.tx_idle());
        assert!(class.packet_filter().is_empty());
    }

    #[test]
    fn mac_string_is_exposed() {
        let fixture = Fixture::new();
        let (mut tx_mem, mut rx_mem) = ([0; TX_BUFFER_LEN], [0; RX_BUFFER_LEN]);
        let class = build_class(&fixture, &mut tx_mem, &mut rx_mem);

        assert_eq!(
            class.get_string(class.mac_string_idx, usb_device::LangID::EN_US),
            Some("AABBCCDDEEFF")
        );
    }
}
