//! Address canonicalization
//!
//! iptables-save prints addresses as `network/prefix`, but declarations may
//! carry a host address with a prefix, a dotted netmask, or an IPv6 netmask.
//! [`IpCidr`] folds all of those into one value so declared and live rules
//! render the same text.
//!
//! ```
//! use iptsync::core::address::IpCidr;
//!
//! let ip: IpCidr = "10.2.4.0/255.255.128.0".parse().unwrap();
//! assert_eq!(ip.to_cidr(), "10.2.0.0/17");
//! assert_eq!(ip.netmask(), "255.255.128.0");
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::core::error::{Error, Result};

/// How addresses appear in rendered rule text.
///
/// `Cidr` matches modern iptables-save output. `Legacy` is the
/// `network/netmask` form older iptables builds print, with the mask left
/// off for single hosts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AddressFormat {
    #[default]
    Cidr,
    Legacy,
}

/// A canonical network: the masked network address plus its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpCidr {
    network: IpNetwork,
}

impl IpCidr {
    /// Parses a bare address, `addr/prefix`, or `addr/netmask`.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let (addr_part, mask_part) = match trimmed.split_once('/') {
            Some((a, m)) => (a, Some(m)),
            None => (trimmed, None),
        };

        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| Error::InvalidAddress(input.to_string()))?;

        let prefix = match mask_part {
            None => max_prefix(addr),
            Some(mask) => parse_mask(addr, mask).ok_or_else(|| Error::InvalidAddress(input.to_string()))?,
        };

        let host = IpNetwork::new(addr, prefix).map_err(|_| Error::InvalidAddress(input.to_string()))?;
        let network = IpNetwork::new(host.network(), prefix)
            .map_err(|_| Error::InvalidAddress(input.to_string()))?;
        Ok(Self { network })
    }

    pub fn network_address(&self) -> IpAddr {
        self.network.network()
    }

    pub fn prefixlen(&self) -> u8 {
        self.network.prefix()
    }

    pub fn is_ipv6(&self) -> bool {
        self.network.is_ipv6()
    }

    /// True for a single host (/32 or /128).
    pub fn is_host(&self) -> bool {
        self.prefixlen() == max_prefix(self.network_address())
    }

    /// True for `0.0.0.0/0` and `::/0`, which iptables-save never prints.
    pub fn is_any(&self) -> bool {
        self.prefixlen() == 0
    }

    /// `network/prefixlen`
    pub fn to_cidr(&self) -> String {
        format!("{}/{}", self.network_address(), self.prefixlen())
    }

    /// Expanded netmask: dotted quad for IPv4, eight zero-padded hex groups for IPv6.
    pub fn netmask(&self) -> String {
        match self.network.mask() {
            IpAddr::V4(mask) => mask.to_string(),
            IpAddr::V6(mask) => mask
                .segments()
                .iter()
                .map(|seg| format!("{seg:04x}"))
                .collect::<Vec<_>>()
                .join(":"),
        }
    }

    /// `network/netmask`, always with the mask.
    pub fn to_netmask_form(&self) -> String {
        format!("{}/{}", self.network_address(), self.netmask())
    }

    /// `network/netmask`, with the mask dropped for single hosts.
    pub fn to_legacy(&self) -> String {
        if self.is_host() {
            self.network_address().to_string()
        } else {
            self.to_netmask_form()
        }
    }

    pub fn render(&self, format: AddressFormat) -> String {
        match format {
            AddressFormat::Cidr => self.to_cidr(),
            AddressFormat::Legacy => self.to_legacy(),
        }
    }
}

impl FromStr for IpCidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cidr())
    }
}

/// Canonical CIDR of an address string.
pub fn to_cidr(input: &str) -> Result<String> {
    IpCidr::parse(input).map(|ip| ip.to_cidr())
}

/// Expanded netmask of an address string.
pub fn netmask(input: &str) -> Result<String> {
    IpCidr::parse(input).map(|ip| ip.netmask())
}

/// Prefix length of an address string.
pub fn prefixlen(input: &str) -> Result<u8> {
    IpCidr::parse(input).map(|ip| ip.prefixlen())
}

/// `network/netmask` form of an address string.
pub fn to_netmask_form(input: &str) -> Result<String> {
    IpCidr::parse(input).map(|ip| ip.to_netmask_form())
}

/// Canonicalizes to the configured format, mapping the all-zero network to `None`.
pub fn canonicalize(input: &str, format: AddressFormat) -> Result<Option<String>> {
    let ip = IpCidr::parse(input)?;
    if ip.is_any() {
        Ok(None)
    } else {
        Ok(Some(ip.render(format)))
    }
}

fn max_prefix(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// A mask is either a prefix length or a netmask of the same family.
fn parse_mask(addr: IpAddr, mask: &str) -> Option<u8> {
    if !mask.is_empty() && mask.bytes().all(|b| b.is_ascii_digit()) {
        let prefix: u8 = mask.parse().ok()?;
        return (prefix <= max_prefix(addr)).then_some(prefix);
    }

    match addr {
        IpAddr::V4(_) => {
            let bits = u32::from(mask.parse::<Ipv4Addr>().ok()?);
            contiguous(bits.leading_ones(), bits.trailing_zeros(), 32)
        }
        IpAddr::V6(_) => {
            let bits = u128::from(mask.parse::<Ipv6Addr>().ok()?);
            contiguous(bits.leading_ones(), bits.trailing_zeros(), 128)
        }
    }
}

// Netmasks with holes (255.0.255.0) have no prefix length.
fn contiguous(ones: u32, zeros: u32, width: u32) -> Option<u8> {
    if ones + zeros == width {
        u8::try_from(ones).ok()
    } else {
        None
    }
}
