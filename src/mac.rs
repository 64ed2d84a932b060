//! MAC addresses for the two ends of the link.

use heapless::String;

/// A six-byte Ethernet MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        MacAddress(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// The address for the other end of the link.
    ///
    /// The device-side interface must not share the address the host's
    /// virtual NIC enumerates with. Inverting the last byte keeps the
    /// pair distinct without any further coordination.
    pub const fn flipped_last(&self) -> MacAddress {
        let mut octets = self.0;
        octets[5] = !octets[5];
        MacAddress(octets)
    }

    /// The twelve hex digits carried by the Ethernet Networking
    /// functional descriptor's MAC string.
    pub fn descriptor_string(&self) -> String<12> {
        const HEX: &[u8; 16] = b"0123456789ABCDEF";
        let mut s = String::new();
        for byte in self.0 {
            for nibble in [byte >> 4, byte & 0xf] {
                // Capacity is exactly two digits per byte.
                s.push(HEX[nibble as usize] as char).unwrap();
            }
        }
        s
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(octets: [u8; 6]) -> Self {
        MacAddress(octets)
    }
}

impl From<MacAddress> for smoltcp::wire::EthernetAddress {
    fn from(mac: MacAddress) -> Self {
        smoltcp::wire::EthernetAddress(mac.0)
    }
}
