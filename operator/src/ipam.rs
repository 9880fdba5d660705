//! Stateless client address assignment.
//!
//! There is no allocation table: an address is a hash of (time, randomness)
//! truncated to the pool's host bits. Collisions are unlikely and are caught
//! downstream, where the reconciler compares against assigned addresses and
//! fails the pass so the retry draws a fresh index.

use ipnet::IpNet;
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::{SystemTime, UNIX_EPOCH},
};

/// Number of host bits in a network.
pub fn host_bits(net: &IpNet) -> u32 {
    u32::from(net.max_prefix_len() - net.prefix_len())
}

/// Draw a host index below `2^mask_bits`.
///
/// Panics when `mask_bits >= 128`.
pub fn generate_index(t: SystemTime, mask_bits: u32) -> u128 {
    let nanos = t
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    index_from(nanos, rand::random(), mask_bits)
}

/// Fill the top bits with time and the bottom with at least 16 random bits;
/// very wide pools get enough extra randomness that collisions stay
/// implausible.
fn index_from(nanos: u64, random: u64, mask_bits: u32) -> u128 {
    assert!(mask_bits < 128, "mask too large");

    let rand_bits = mask_bits.saturating_sub(64).max(16);
    let r = u128::from(random & ((1u64 << rand_bits) - 1));

    let mut z = u128::from(nanos) << rand_bits;
    z |= r;
    z = z.wrapping_add(r);

    if mask_bits == 0 {
        0
    } else {
        z & ((1u128 << mask_bits) - 1)
    }
}

/// The host at `index` inside `cidr`, counting up from the network address.
pub fn host_from_index(cidr: &IpNet, index: u128) -> IpAddr {
    match cidr {
        IpNet::V4(net) => {
            let base = u32::from(net.network());
            IpAddr::V4(Ipv4Addr::from(base.wrapping_add(index as u32)))
        },
        IpNet::V6(net) => {
            let base = u128::from(net.network());
            IpAddr::V6(Ipv6Addr::from(base.wrapping_add(index)))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_zero_mask_yields_zero() {
        assert_eq!(generate_index(SystemTime::now(), 0), 0);
    }

    #[test]
    #[should_panic(expected = "mask too large")]
    fn test_full_mask_panics() {
        generate_index(SystemTime::now(), 128);
    }

    #[test]
    fn test_small_mask_in_range() {
        for mask in [1, 8, 16, 31, 64, 120, 127] {
            let index = generate_index(SystemTime::now(), mask);
            assert!(index < 1u128 << mask, "index {index} out of range for mask {mask}");
        }
    }

    #[test]
    fn test_distant_future_in_range() {
        let t = UNIX_EPOCH + Duration::from_secs(1 << 40);
        for mask in [1, 16, 127] {
            assert!(generate_index(t, mask) < 1u128 << mask);
        }
    }

    #[test]
    fn test_host_bits() {
        assert_eq!(host_bits(&"fd00::/64".parse().unwrap()), 64);
        assert_eq!(host_bits(&"10.0.0.0/24".parse().unwrap()), 8);
        assert_eq!(host_bits(&"10.0.0.1/32".parse().unwrap()), 0);
    }

    #[test]
    fn test_host_from_index() {
        let v6: IpNet = "fd00::/64".parse().unwrap();
        assert_eq!(host_from_index(&v6, 5).to_string(), "fd00::5");
        let v4: IpNet = "10.0.0.0/24".parse().unwrap();
        assert_eq!(host_from_index(&v4, 7).to_string(), "10.0.0.7");
    }

    proptest! {
        #[test]
        fn prop_index_below_mask(nanos: u64, random: u64, mask in 0u32..128) {
            let index = index_from(nanos, random, mask);
            if mask == 0 {
                prop_assert_eq!(index, 0);
            } else {
                prop_assert!(index < 1u128 << mask);
            }
        }
    }
}
