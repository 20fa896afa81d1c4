//! Pool layout arithmetic.
//!
//! An AddressPool's subnet is split into `2^(host_bits - block_size_bits)`
//! blocks of `2^block_size_bits` addresses each. Block `i` starts at
//! `subnet.network() + i * 2^block_size_bits`.

use crate::error::IpamError;
use crds::AddressPool;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Largest supported block: 2^16 addresses, which bounds the per-block bitmap
pub const MAX_BLOCK_SIZE_BITS: u8 = 16;

/// Geometry of one AddressPool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    subnet: IpNet,
    block_size_bits: u8,
}

impl PoolLayout {
    /// Parses `subnet` and validates `block_size_bits` against it.
    ///
    /// Host bits in `subnet` are ignored (`10.1.0.7/24` lays out as `10.1.0.0/24`).
    pub fn new(subnet: &str, block_size_bits: u8) -> Result<Self, IpamError> {
        let net: IpNet = subnet
            .parse()
            .map_err(|e| IpamError::InvalidPool(format!("invalid subnet {subnet}: {e}")))?;
        let net = net.trunc();
        let host_bits = net.max_prefix_len() - net.prefix_len();
        
        if block_size_bits > host_bits {
            return Err(IpamError::InvalidPool(format!(
                "blockSizeBits {block_size_bits} exceeds the {host_bits} host bits of {net}"
            )));
        }
        if block_size_bits > MAX_BLOCK_SIZE_BITS {
            return Err(IpamError::InvalidPool(format!(
                "blockSizeBits {block_size_bits} exceeds the supported maximum of {MAX_BLOCK_SIZE_BITS}"
            )));
        }
        
        Ok(Self {
            subnet: net,
            block_size_bits,
        })
    }
    
    /// Layout of an AddressPool resource.
    pub fn from_pool(pool: &AddressPool) -> Result<Self, IpamError> {
        Self::new(&pool.spec.subnet, pool.spec.block_size_bits)
    }
    
    /// The (truncated) pool subnet.
    pub fn subnet(&self) -> IpNet {
        self.subnet
    }
    
    /// Host bits of every block.
    pub fn block_size_bits(&self) -> u8 {
        self.block_size_bits
    }
    
    /// Number of addresses in one block.
    pub fn block_size(&self) -> u32 {
        1u32 << self.block_size_bits
    }
    
    /// Number of blocks in the pool, saturating at `u64::MAX` for huge IPv6 pools.
    pub fn block_count(&self) -> u64 {
        let host_bits = self.subnet.max_prefix_len() - self.subnet.prefix_len();
        let index_bits = u32::from(host_bits - self.block_size_bits);
        1u64.checked_shl(index_bits).unwrap_or(u64::MAX)
    }
    
    /// CIDR of the block at `index`.
    pub fn block_cidr(&self, index: u64) -> Result<IpNet, IpamError> {
        if index >= self.block_count() {
            return Err(IpamError::Internal(format!(
                "block index {index} is outside {} ({} blocks)",
                self.subnet,
                self.block_count()
            )));
        }
        let prefix_len = self.subnet.max_prefix_len() - self.block_size_bits;
        let offset = u128::from(index) << self.block_size_bits;
        let start = add_offset(self.subnet.network(), offset)?;
        
        let net = match start {
            IpAddr::V4(addr) => Ipv4Net::new(addr, prefix_len).map(IpNet::V4),
            IpAddr::V6(addr) => Ipv6Net::new(addr, prefix_len).map(IpNet::V6),
        };
        net.map_err(|e| IpamError::Internal(format!("block {index} of {}: {e}", self.subnet)))
    }
}

/// Address at `offset` inside `block`.
pub fn address_at(block: &IpNet, offset: u32) -> Result<IpAddr, IpamError> {
    let size = 1u128 << (block.max_prefix_len() - block.prefix_len());
    if u128::from(offset) >= size {
        return Err(IpamError::Internal(format!("offset {offset} is outside {block}")));
    }
    add_offset(block.network(), u128::from(offset))
}

/// Offset of `addr` inside `block`, or None when the address is not in it.
pub fn offset_of(block: &IpNet, addr: IpAddr) -> Option<u32> {
    if !block.contains(&addr) {
        return None;
    }
    let diff = to_u128(addr) - to_u128(block.network());
    u32::try_from(diff).ok()
}

fn to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u128::from(u32::from(a)),
        IpAddr::V6(a) => u128::from(a),
    }
}

fn add_offset(base: IpAddr, offset: u128) -> Result<IpAddr, IpamError> {
    match base {
        IpAddr::V4(a) => u32::try_from(u128::from(u32::from(a)) + offset)
            .map(|v| IpAddr::V4(Ipv4Addr::from(v)))
            .map_err(|_| IpamError::Internal(format!("{a} + {offset} overflows IPv4"))),
        IpAddr::V6(a) => u128::from(a)
            .checked_add(offset)
            .map(|v| IpAddr::V6(Ipv6Addr::from(v)))
            .ok_or_else(|| IpamError::Internal(format!("{a} + {offset} overflows IPv6"))),
    }
}
