//! Identity and address allocation
//!
//! IDs are `id<N>` with `N` taken from a monotonic counter kept in the
//! cursor store. Addresses are handed out by bumping the last octet of the
//! last issued address. Nothing is ever reclaimed: the address of an
//! archived or purged peer stays burned until an operator resets the cursor.

use crate::types::PeerId;
use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Prefix of every generated peer ID
pub const ID_PREFIX: &str = "id";

/// Highest host octet that may be issued
pub const MAX_HOST_OCTET: u8 = 254;

/// Render the ID for counter value `n`
pub fn format_id(n: u64) -> PeerId {
    format!("{}{}", ID_PREFIX, n)
}

/// Numeric suffix of an ID matching the prefix pattern
pub fn id_suffix(id: &str) -> Option<u64> {
    let digits = id.strip_prefix(ID_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Largest suffix among `ids`, or 0 when none match
pub fn max_id_suffix<'a>(ids: impl IntoIterator<Item = &'a str>) -> u64 {
    ids.into_iter().filter_map(id_suffix).max().unwrap_or(0)
}

/// Address rules for one allocation subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocator {
    subnet: Ipv4Network,
    first_cursor: Ipv4Addr,
}

impl Allocator {
    /// `first_cursor` is the value the cursor starts from on a fresh store;
    /// the first peer receives `first_cursor + 1`.
    pub fn new(subnet: Ipv4Network, first_cursor: Ipv4Addr) -> Result<Self> {
        if !subnet.contains(first_cursor) {
            return Err(Error::InvalidConfig(format!(
                "initial cursor {} is outside subnet {}",
                first_cursor, subnet
            )));
        }
        Ok(Self {
            subnet,
            first_cursor,
        })
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    pub fn first_cursor(&self) -> Ipv4Addr {
        self.first_cursor
    }

    /// Address following `cursor`
    pub fn next_address(&self, cursor: Ipv4Addr) -> Result<Ipv4Addr> {
        let [a, b, c, d] = cursor.octets();
        let exhausted = Error::AddressSpaceExhausted {
            op: "allocate_address",
            last: cursor,
        };

        if d >= MAX_HOST_OCTET {
            return Err(exhausted);
        }
        let next = Ipv4Addr::new(a, b, c, d + 1);
        if !self.subnet.contains(next) || next == self.subnet.broadcast() {
            return Err(exhausted);
        }
        Ok(next)
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self {
            subnet: Ipv4Network::new(Ipv4Addr::new(10, 8, 0, 0), 24)
                .expect("static /24 prefix is valid"),
            first_cursor: Ipv4Addr::new(10, 8, 0, 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_suffix() {
        assert_eq!(id_suffix("id1"), Some(1));
        assert_eq!(id_suffix("id042"), Some(42));
        assert_eq!(id_suffix("id"), None);
        assert_eq!(id_suffix("idx3"), None);
        assert_eq!(id_suffix("peer7"), None);
        assert_eq!(id_suffix("id-3"), None);
    }

    #[test]
    fn test_max_id_suffix() {
        assert_eq!(max_id_suffix(["id2", "id10", "custom", "id9"]), 10);
        assert_eq!(max_id_suffix(std::iter::empty()), 0);
        assert_eq!(format_id(11), "id11");
    }

    #[test]
    fn test_next_address() {
        let alloc = Allocator::default();
        assert_eq!(
            alloc.next_address(Ipv4Addr::new(10, 8, 0, 1)).unwrap(),
            Ipv4Addr::new(10, 8, 0, 2)
        );
        assert_eq!(
            alloc.next_address(Ipv4Addr::new(10, 8, 0, 253)).unwrap(),
            Ipv4Addr::new(10, 8, 0, 254)
        );
    }

    #[test]
    fn test_next_address_never_wraps() {
        let alloc = Allocator::default();
        let err = alloc.next_address(Ipv4Addr::new(10, 8, 0, 254)).unwrap_err();
        assert!(matches!(err, Error::AddressSpaceExhausted { last, .. } if last == Ipv4Addr::new(10, 8, 0, 254)));
    }

    #[test]
    fn test_small_subnet_bounds() {
        let subnet: Ipv4Network = "10.9.0.0/29".parse().unwrap();
        let alloc = Allocator::new(subnet, Ipv4Addr::new(10, 9, 0, 1)).unwrap();

        assert_eq!(
            alloc.next_address(Ipv4Addr::new(10, 9, 0, 5)).unwrap(),
            Ipv4Addr::new(10, 9, 0, 6)
        );
        // .7 is the broadcast address of the /29
        assert!(alloc.next_address(Ipv4Addr::new(10, 9, 0, 6)).is_err());
        assert!(Allocator::new(subnet, Ipv4Addr::new(10, 8, 0, 1)).is_err());
    }
}
