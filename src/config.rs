//! Static network configuration handed to the stack and its servers.
//!
//! A gadget-style network is a two-node link with fixed addressing:
//! the device owns one address and leases the handful of others to the
//! host. The lease pool and the name rule here are *configuration* for
//! external DHCP/DNS servers; assignment and wire protocol are their
//! business.

use core::num::NonZeroU32;

use smoltcp::wire::{Ipv4Address, Ipv4Cidr};

/// Addressing for the device side of the link.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NetConfig {
    /// Interface address and prefix length.
    pub addr: Ipv4Cidr,
    /// Default route, if any. A point-to-point gadget link routes
    /// nothing, hence `None`.
    pub gateway: Option<Ipv4Address>,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            addr: Ipv4Cidr::new(Ipv4Address::new(192, 168, 7, 1), 24),
            gateway: None,
        }
    }
}

/// One assignable address and its lease duration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DhcpLease {
    pub addr: Ipv4Address,
    pub lease_secs: u32,
}

/// The fixed set of addresses an external DHCP server may hand out,
/// plus the server's own identity.
///
/// A host beyond the pool size is the server's problem: it rejects or
/// queues per its own contract, and nothing here grows.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DhcpPool<const N: usize> {
    pub server: Ipv4Address,
    pub port: u16,
    pub dns: Ipv4Address,
    pub domain: &'static str,
    pub leases: [DhcpLease; N],
}

impl<const N: usize> DhcpPool<N> {
    pub fn entries(&self) -> &[DhcpLease] {
        &self.leases
    }
}

impl Default for DhcpPool<3> {
    /// Three day-long leases right above the server address.
    fn default() -> Self {
        const DAY_SECS: u32 = 24 * 60 * 60;
        DhcpPool {
            server: Ipv4Address::new(192, 168, 7, 1),
            port: 67,
            dns: Ipv4Address::new(192, 168, 7, 1),
            domain: "usb",
            leases: [
                DhcpLease {
                    addr: Ipv4Address::new(192, 168, 7, 2),
                    lease_secs: DAY_SECS,
                },
                DhcpLease {
                    addr: Ipv4Address::new(192, 168, 7, 3),
                    lease_secs: DAY_SECS,
                },
                DhcpLease {
                    addr: Ipv4Address::new(192, 168, 7, 4),
                    lease_secs: DAY_SECS,
                },
            ],
        }
    }
}

/// Maps a fixed set of hostnames to the device's own address.
///
/// Everything else falls through to whatever resolver the host
/// otherwise uses.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DnsRule {
    pub names: &'static [&'static str],
    pub addr: Ipv4Address,
}

impl DnsRule {
    /// The device address for an exact hostname match.
    pub fn resolve(&self, name: &str) -> Option<Ipv4Address> {
        self.names.iter().any(|n| *n == name).then_some(self.addr)
    }
}

/// Attempts allowed for one bring-up step.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RetryBudget(NonZeroU32);

impl RetryBudget {
    pub const fn new(attempts: NonZeroU32) -> Self {
        RetryBudget(attempts)
    }

    pub const fn attempts(&self) -> u32 {
        self.0.get()
    }
}

/// A bring-up step ran out of attempts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BringUpError<E> {
    /// How many attempts were made.
    pub attempts: u32,
    /// The error from the final attempt.
    pub last: E,
}

/// Run a fallible bring-up step until it succeeds or the budget is
/// spent.
///
/// Address-server and name-server starts want a few tries while the
/// link settles, but an unbounded retry turns a configuration mistake
/// into a silent hang; after `budget` attempts the last error comes
/// back to the caller.
pub fn bring_up<E>(
    budget: RetryBudget,
    mut attempt: impl FnMut() -> Result<(), E>,
) -> Result<(), BringUpError<E>> {
    let mut last = None;
    for _ in 0..budget.attempts() {
        match attempt() {
            Ok(()) => return Ok(()),
            Err(error) => last = Some(error),
        }
    }
    Err(BringUpError {
        attempts: budget.attempts(),
        // The budget is non-zero, so at least one attempt ran.
        last: last.expect("no attempt was made"),
    })
}
