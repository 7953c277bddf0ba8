use crate::error::{Error, Result};

/// Ports handed out per address: the service port plus one reserved
/// neighbour for a paired channel.
const STRIDE: u32 = 2;

/// Hands out `host:port` strings from `[low, high)`.
///
/// The counter only moves forward: a port is never handed out twice during
/// the allocator's lifetime, even after its holder is gone. There is no
/// free-list, so a long-lived node with a lot of churn will eventually
/// exhaust its range.
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    host: String,
    low: u16,
    high: u16,
    // u32 so advancing past u16::MAX cannot wrap
    next: u32,
}

impl AddressAllocator {
    pub fn new(host: impl Into<String>, low: u16, high: u16) -> Self {
        Self {
            host: host.into(),
            low,
            high,
            next: low as u32,
        }
    }

    /// Next unused address. Both the port and its paired neighbour fit below `high`.
    pub fn next_address(&mut self) -> Result<String> {
        let port = self.next;
        if port + (STRIDE - 1) >= self.high as u32 {
            return Err(Error::AddressExhausted {
                low: self.low,
                high: self.high,
            });
        }
        self.next += STRIDE;
        Ok(format!("{}:{}", self.host, port))
    }

    /// Number of addresses still available.
    pub fn remaining(&self) -> usize {
        let high = self.high as u32;
        if self.next + (STRIDE - 1) >= high {
            return 0;
        }
        ((high - self.next - (STRIDE - 1)).div_ceil(STRIDE)) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn hands_out_even_stride_until_exhausted() {
        let mut alloc = AddressAllocator::new("127.0.0.1", 9000, 9005);
        assert_eq!(alloc.remaining(), 2);
        assert_eq!(alloc.next_address().unwrap(), "127.0.0.1:9000");
        assert_eq!(alloc.next_address().unwrap(), "127.0.0.1:9002");
        assert_eq!(alloc.remaining(), 0);
        assert!(matches!(
            alloc.next_address(),
            Err(Error::AddressExhausted {
                low: 9000,
                high: 9005
            })
        ));
        // stays exhausted
        assert!(alloc.next_address().is_err());
    }

    #[test]
    fn pair_must_fit_below_high() {
        let mut alloc = AddressAllocator::new("10.0.0.1", 9000, 9003);
        assert_eq!(alloc.next_address().unwrap(), "10.0.0.1:9000");
        // 9002 would need 9003 for its pair, which is outside the range
        assert!(alloc.next_address().is_err());
    }

    #[test]
    fn top_of_port_space_does_not_wrap() {
        let mut alloc = AddressAllocator::new("h", u16::MAX - 3, u16::MAX);
        assert_eq!(alloc.next_address().unwrap(), format!("h:{}", u16::MAX - 3));
        assert!(alloc.next_address().is_err());
    }

    #[test]
    fn never_repeats() {
        let mut alloc = AddressAllocator::new("127.0.0.1", 30000, 30400);
        let mut seen = HashSet::new();
        while let Ok(addr) = alloc.next_address() {
            assert!(seen.insert(addr), "address handed out twice");
        }
        assert_eq!(seen.len(), 200);
    }
}
