//! An in-memory `UsbBus` for host-side tests.
//!
//! IN endpoints hold at most one pending packet, so classes see the
//! same `WouldBlock` back-pressure a real controller applies. Tests
//! drain pending packets and raise the matching completion callbacks
//! themselves.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::vec::Vec;

use usb_device::bus::{PollResult, UsbBus, UsbBusAllocator};
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::{UsbDirection, UsbError};

#[derive(Default)]
struct Inner {
    next_in: u8,
    next_out: u8,
    /// One slot per IN endpoint; `Some` while a packet awaits draining.
    in_pending: BTreeMap<u8, Option<Vec<u8>>>,
    out_queues: BTreeMap<u8, VecDeque<Vec<u8>>>,
    written: Vec<(u8, Vec<u8>)>,
}

pub struct TestBus {
    inner: Arc<Mutex<Inner>>,
}

/// Test-side view of the bus, valid while the allocator lives.
pub struct BusHandle {
    inner: Arc<Mutex<Inner>>,
}

/// Freeze the allocator so endpoint reads/writes reach the bus, exactly
/// as building a real `UsbDevice` does. The endpoint→bus pointer is only
/// wired up by `UsbBusAllocator::freeze`, which `UsbDeviceBuilder::build`
/// triggers. Call this once after every class has allocated its endpoints.
pub fn enable_bus(allocator: &UsbBusAllocator<TestBus>) {
    use usb_device::device::{UsbDeviceBuilder, UsbVidPid};
    let _dev = UsbDeviceBuilder::new(allocator, UsbVidPid(0x1209, 0x0001)).build();
}

impl TestBus {
    pub fn allocator() -> (UsbBusAllocator<TestBus>, BusHandle) {
        let inner = Arc::new(Mutex::new(Inner {
            next_in: 1,
            next_out: 1,
            ..Inner::default()
        }));
        let handle = BusHandle {
            inner: inner.clone(),
        };
        (UsbBusAllocator::new(TestBus { inner }), handle)
    }
}

impl BusHandle {
    /// Take the packet pending on an IN endpoint, freeing it for the
    /// next write.
    pub fn drain_in(&self, addr: EndpointAddress) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        inner.in_pending.get_mut(&(addr.index() as u8))?.take()
    }

    /// Queue a packet for an OUT endpoint.
    pub fn push_out(&self, addr: EndpointAddress, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .out_queues
            .get_mut(&(addr.index() as u8))
            .expect("OUT endpoint not allocated")
            .push_back(data.to_vec());
    }

    /// Every packet ever written, in write order.
    pub fn written(&self) -> Vec<(u8, Vec<u8>)> {
        self.inner.lock().unwrap().written.clone()
    }
}

impl UsbBus for TestBus {
    fn alloc_ep(
        &mut self,
        ep_dir: UsbDirection,
        ep_addr: Option<EndpointAddress>,
        _ep_type: EndpointType,
        _max_packet_size: u16,
        _interval: u8,
    ) -> usb_device::Result<EndpointAddress> {
        let mut inner = self.inner.lock().unwrap();
        let index = match ep_addr {
            Some(addr) => addr.index() as u8,
            None => match ep_dir {
                UsbDirection::In => {
                    let index = inner.next_in;
                    inner.next_in += 1;
                    index
                }
                UsbDirection::Out => {
                    let index = inner.next_out;
                    inner.next_out += 1;
                    index
                }
            },
        };
        match ep_dir {
            UsbDirection::In => {
                inner.in_pending.insert(index, None);
            }
            UsbDirection::Out => {
                inner.out_queues.insert(index, VecDeque::new());
            }
        }
        Ok(EndpointAddress::from_parts(index as usize, ep_dir))
    }

    fn enable(&mut self) {}

    fn reset(&self) {}

    fn set_device_address(&self, _addr: u8) {}

    fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> usb_device::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let index = ep_addr.index() as u8;
        let pending = inner
            .in_pending
            .get_mut(&index)
            .ok_or(UsbError::InvalidEndpoint)?;
        if pending.is_some() {
            return Err(UsbError::WouldBlock);
        }
        *pending = Some(buf.to_vec());
        inner.written.push((index, buf.to_vec()));
        Ok(buf.len())
    }

    fn read(&self, ep_addr: EndpointAddress, buf: &mut [u8]) -> usb_device::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let queue = inner
            .out_queues
            .get_mut(&(ep_addr.index() as u8))
            .ok_or(UsbError::InvalidEndpoint)?;
        let packet = queue.pop_front().ok_or(UsbError::WouldBlock)?;
        if packet.len() > buf.len() {
            return Err(UsbError::BufferOverflow);
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    fn set_stalled(&self, _ep_addr: EndpointAddress, _stalled: bool) {}

    fn is_stalled(&self, _ep_addr: EndpointAddress) -> bool {
        false
    }

    fn suspend(&self) {}

    fn resume(&self) {}

    fn poll(&self) -> PollResult {
        PollResult::None
    }
}
