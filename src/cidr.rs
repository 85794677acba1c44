use std::{
    net::IpAddr,
    str::FromStr,
    sync::LazyLock,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A CIDR block: a base address plus an optional prefix length.
///
/// A block without a prefix (`"10.0.0.1"`) matches by exact byte equality.
/// A block with a prefix (`"10.0.0.0/8"`) matches every same-family address
/// whose leading `prefix` bits equal the base address.
///
/// # Test
///
/// ```
/// use firewall::cidr::Cidr;
///
/// let block: Cidr = "10.0.0.0/8".parse().unwrap();
///
/// assert!(block.contains("10.20.206.46".parse().unwrap()));
/// assert!(!block.contains("192.1.1.1".parse().unwrap()));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    addr: IpAddr,
    prefix: Option<u8>,
}

impl Cidr {
    /// The block that matches exactly one address.
    pub fn host(addr: IpAddr) -> Self {
        Self { addr, prefix: None }
    }

    pub fn new(addr: IpAddr, prefix: u8) -> Self {
        assert!(prefix <= Self::family_bits(&addr));

        Self {
            addr,
            prefix: Some(prefix),
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> Option<u8> {
        self.prefix
    }

    fn family_bits(addr: &IpAddr) -> u8 {
        if addr.is_ipv4() { 32 } else { 128 }
    }

    /// Whether the address falls inside this block.
    ///
    /// Addresses of the other family never match. A `/0` prefix matches every
    /// same-family address.
    ///
    /// # Test
    ///
    /// ```
    /// use firewall::cidr::Cidr;
    ///
    /// let any: Cidr = "0.0.0.0/0".parse().unwrap();
    /// let host: Cidr = "192.168.0.1".parse().unwrap();
    ///
    /// assert!(any.contains("223.255.255.255".parse().unwrap()));
    /// assert!(!any.contains("::1".parse().unwrap()));
    ///
    /// assert!(host.contains("192.168.0.1".parse().unwrap()));
    /// assert!(!host.contains("192.168.0.2".parse().unwrap()));
    /// ```
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(base), IpAddr::V4(addr)) => {
                Self::matches(&base.octets(), &addr.octets(), self.prefix)
            }
            (IpAddr::V6(base), IpAddr::V6(addr)) => {
                Self::matches(&base.octets(), &addr.octets(), self.prefix)
            }
            _ => false,
        }
    }

    fn matches(base: &[u8], addr: &[u8], prefix: Option<u8>) -> bool {
        let Some(prefix) = prefix else {
            return base == addr;
        };

        let whole = (prefix / 8) as usize;
        let partial = prefix % 8;
        if base[..whole] != addr[..whole] {
            return false;
        }

        if partial == 0 {
            return true;
        }

        // Compare only the top `partial` bits of the next byte.
        let mask = (0xFF00_u16 >> partial) as u8;
        base[whole] & mask == addr[whole] & mask
    }
}

/// `true` when any block in `ranges` contains the address.
///
/// Stops at the first match.
pub fn any_contains(ranges: &[Cidr], addr: IpAddr) -> bool {
    ranges.iter().any(|range| range.contains(addr))
}

/// `true` when every address in the chain is covered by `ranges`.
///
/// A request must have passed through only permitted hops, so one uncovered
/// hop fails the whole chain. Chain elements that do not parse as addresses
/// are never covered, and an empty chain is not allowed.
///
/// # Test
///
/// ```
/// use firewall::cidr::{allowed, Cidr};
///
/// let ranges = vec!["10.0.0.0/8".parse::<Cidr>().unwrap()];
///
/// assert!(allowed(["10.20.206.46"], &ranges));
/// assert!(!allowed(["10.20.205.24", "192.10.1.1"], &ranges));
/// ```
pub fn allowed<'a>(chain: impl IntoIterator<Item = &'a str>, ranges: &[Cidr]) -> bool {
    let mut seen = false;

    for element in chain {
        seen = true;

        match element.trim().parse::<IpAddr>() {
            Ok(addr) if any_contains(ranges, addr) => continue,
            _ => return false,
        }
    }

    seen
}

/// `true` when any address in the chain is covered by `ranges`.
///
/// One bad hop poisons the chain. Chain elements that do not parse as
/// addresses are never covered.
///
/// # Test
///
/// ```
/// use firewall::cidr::{denied, Cidr};
///
/// let ranges = vec!["192.0.0.0/8".parse::<Cidr>().unwrap()];
///
/// assert!(denied(["10.20.205.24", "192.10.1.1"], &ranges));
/// assert!(!denied(["10.20.205.24"], &ranges));
/// ```
pub fn denied<'a>(chain: impl IntoIterator<Item = &'a str>, ranges: &[Cidr]) -> bool {
    chain.into_iter().any(|element| {
        element
            .trim()
            .parse::<IpAddr>()
            .map(|addr| any_contains(ranges, addr))
            .unwrap_or(false)
    })
}

/// Parse a list of textual blocks, dropping the ones that do not parse.
///
/// An unparseable block can never match a request, so it contributes nothing
/// to a range set; it is reported through the log facade instead of failing
/// the caller.
pub fn compile<'a>(blocks: impl IntoIterator<Item = &'a str>) -> Vec<Cidr> {
    blocks
        .into_iter()
        .filter_map(|block| match block.parse::<Cidr>() {
            Ok(cidr) => Some(cidr),
            Err(error) => {
                log::warn!("ignoring unparseable cidr block: {}", error);
                None
            }
        })
        .collect()
}

/// RFC 1918 IPv4 ranges and the RFC 4193 IPv6 range.
pub fn private_ranges() -> &'static [Cidr] {
    static RANGES: LazyLock<Vec<Cidr>> = LazyLock::new(|| {
        ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "fc00::/7"]
            .iter()
            .map(|block| block.parse().unwrap())
            .collect()
    });

    &RANGES
}

/// The non-private address space, partitioned into CIDR blocks.
///
/// Thirty IPv4 blocks covering `0.0.0.0`-`223.255.255.255` minus the
/// RFC 1918 holes, plus the IPv6 space below `fe00::`.
pub fn public_ranges() -> &'static [Cidr] {
    static RANGES: LazyLock<Vec<Cidr>> = LazyLock::new(|| {
        [
            "0.0.0.0/5",
            "8.0.0.0/7",
            "11.0.0.0/8",
            "12.0.0.0/6",
            "16.0.0.0/4",
            "32.0.0.0/3",
            "64.0.0.0/2",
            "128.0.0.0/3",
            "160.0.0.0/5",
            "168.0.0.0/6",
            "172.0.0.0/12",
            "172.32.0.0/11",
            "172.64.0.0/10",
            "172.128.0.0/9",
            "173.0.0.0/8",
            "174.0.0.0/7",
            "176.0.0.0/4",
            "192.0.0.0/9",
            "192.128.0.0/11",
            "192.160.0.0/13",
            "192.169.0.0/16",
            "192.170.0.0/15",
            "192.172.0.0/14",
            "192.176.0.0/12",
            "192.192.0.0/10",
            "193.0.0.0/8",
            "194.0.0.0/7",
            "196.0.0.0/6",
            "200.0.0.0/5",
            "208.0.0.0/4",
            "::/1",
            "8000::/2",
            "c000::/3",
            "e000::/4",
            "f000::/5",
            "f800::/6",
            "fe00::/7",
        ]
        .iter()
        .map(|block| block.parse().unwrap())
        .collect()
    });

    &RANGES
}

#[derive(Debug)]
pub struct CidrParseError(String);

impl std::error::Error for CidrParseError {}

impl std::fmt::Display for CidrParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<std::net::AddrParseError> for CidrParseError {
    fn from(error: std::net::AddrParseError) -> Self {
        CidrParseError(error.to_string())
    }
}

impl From<std::num::ParseIntError> for CidrParseError {
    fn from(error: std::num::ParseIntError) -> Self {
        CidrParseError(error.to_string())
    }
}

impl FromStr for Cidr {
    type Err = CidrParseError;

    /// # Test
    ///
    /// ```
    /// use firewall::cidr::Cidr;
    ///
    /// assert!("10.0.0.0/8".parse::<Cidr>().is_ok());
    /// assert!("fc00::/7".parse::<Cidr>().is_ok());
    /// assert!("10.0.0.1".parse::<Cidr>().is_ok());
    ///
    /// assert!("10.0.0.0/33".parse::<Cidr>().is_err());
    /// assert!("not-an-address".parse::<Cidr>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let Some((addr, prefix)) = s.split_once('/') else {
            return Ok(Self {
                addr: s.parse()?,
                prefix: None,
            });
        };

        let addr: IpAddr = addr.parse()?;
        let prefix: u8 = prefix.parse()?;
        if prefix > Self::family_bits(&addr) {
            return Err(CidrParseError(format!(
                "prefix /{} out of range for {}",
                prefix, addr
            )));
        }

        Ok(Self {
            addr,
            prefix: Some(prefix),
        })
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.prefix {
            Some(prefix) => write!(f, "{}/{}", self.addr, prefix),
            None => write!(f, "{}", self.addr),
        }
    }
}

#[cfg(feature = "serde")]
impl Serialize for Cidr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}
