//! NVMe transport identifier.
//!
//! Identifies how to reach a controller (PCIe function, RDMA or TCP
//! endpoint) and parses the `key:value` text form used by configuration
//! and discovery tooling:
//!
//! ```text
//! trtype:PCIe traddr:0000:04:00.0
//! trtype:RDMA adrfam:IPv4 traddr:192.168.100.8 trsvcid:4420 subnqn:nqn.2014-08.org.nvmexpress.discovery
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Maximum length of a transport address.
pub const TRADDR_MAX_LEN: usize = 256;
/// Maximum length of a transport service id.
pub const TRSVCID_MAX_LEN: usize = 32;
/// Maximum length of an NVMe qualified name.
pub const NQN_MAX_LEN: usize = 223;

const KEY_MAX_LEN: usize = 31;

/// Transport a controller is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u32)]
pub enum TransportType {
    /// Local PCIe function
    #[default]
    Pcie = 256,
    /// RDMA fabric
    Rdma = 1,
    /// TCP fabric
    Tcp = 3,
}

impl TransportType {
    /// Local-bus transports carry no address family.
    pub fn is_fabric(&self) -> bool {
        !matches!(self, TransportType::Pcie)
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            256 => Some(TransportType::Pcie),
            1 => Some(TransportType::Rdma),
            3 => Some(TransportType::Tcp),
            _ => None,
        }
    }
}

impl FromStr for TransportType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("PCIe") {
            Ok(TransportType::Pcie)
        } else if s.eq_ignore_ascii_case("RDMA") {
            Ok(TransportType::Rdma)
        } else if s.eq_ignore_ascii_case("TCP") {
            Ok(TransportType::Tcp)
        } else {
            Err(Error::NotFound(format!("unknown transport type '{}'", s)))
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Pcie => write!(f, "PCIe"),
            TransportType::Rdma => write!(f, "RDMA"),
            TransportType::Tcp => write!(f, "TCP"),
        }
    }
}

/// Fabric address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum AddressFamily {
    Ipv4 = 1,
    Ipv6 = 2,
    /// InfiniBand
    Ib = 3,
    /// Fibre Channel
    Fc = 4,
}

impl AddressFamily {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(AddressFamily::Ipv4),
            2 => Some(AddressFamily::Ipv6),
            3 => Some(AddressFamily::Ib),
            4 => Some(AddressFamily::Fc),
            _ => None,
        }
    }
}

impl FromStr for AddressFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("IPv4") {
            Ok(AddressFamily::Ipv4)
        } else if s.eq_ignore_ascii_case("IPv6") {
            Ok(AddressFamily::Ipv6)
        } else if s.eq_ignore_ascii_case("IB") {
            Ok(AddressFamily::Ib)
        } else if s.eq_ignore_ascii_case("FC") {
            Ok(AddressFamily::Fc)
        } else {
            Err(Error::NotFound(format!("unknown address family '{}'", s)))
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "IPv4"),
            AddressFamily::Ipv6 => write!(f, "IPv6"),
            AddressFamily::Ib => write!(f, "IB"),
            AddressFamily::Fc => write!(f, "FC"),
        }
    }
}

/// Parse a transport type into `trtype`.
///
/// An absent output or absent string is an invalid argument; a string that
/// names no known transport is not found.
pub fn parse_trtype(trtype: Option<&mut TransportType>, s: Option<&str>) -> Result<()> {
    match (trtype, s) {
        (Some(out), Some(s)) => {
            *out = s.parse()?;
            Ok(())
        }
        _ => Err(Error::InvalidArgument("trtype and string are required".into())),
    }
}

/// Parse an address family into `adrfam`.
///
/// Same argument rules as [`parse_trtype`].
pub fn parse_adrfam(adrfam: Option<&mut AddressFamily>, s: Option<&str>) -> Result<()> {
    match (adrfam, s) {
        (Some(out), Some(s)) => {
            *out = s.parse()?;
            Ok(())
        }
        _ => Err(Error::InvalidArgument("adrfam and string are required".into())),
    }
}

/// NVMe transport identifier.
///
/// Immutable once built; construct with [`TransportId::parse`] or one of
/// the per-transport constructors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TransportId {
    trtype: TransportType,
    adrfam: Option<AddressFamily>,
    traddr: String,
    trsvcid: String,
    subnqn: String,
}

impl TransportId {
    /// PCIe transport id from a BDF address such as `0000:04:00.0`.
    pub fn pcie(addr: &str) -> Result<Self> {
        let mut trid = TransportId::default();
        trid.traddr = check_len("traddr", addr, TRADDR_MAX_LEN)?;
        Ok(trid)
    }

    /// RDMA transport id over IPv4.
    pub fn rdma(addr: &str, svcid: &str, subnqn: &str) -> Result<Self> {
        Self::fabric(TransportType::Rdma, addr, svcid, subnqn)
    }

    /// TCP transport id over IPv4.
    pub fn tcp(addr: &str, svcid: &str, subnqn: &str) -> Result<Self> {
        Self::fabric(TransportType::Tcp, addr, svcid, subnqn)
    }

    fn fabric(trtype: TransportType, addr: &str, svcid: &str, subnqn: &str) -> Result<Self> {
        Ok(TransportId {
            trtype,
            adrfam: Some(AddressFamily::Ipv4),
            traddr: check_len("traddr", addr, TRADDR_MAX_LEN)?,
            trsvcid: check_len("trsvcid", svcid, TRSVCID_MAX_LEN)?,
            subnqn: check_len("subnqn", subnqn, NQN_MAX_LEN)?,
        })
    }

    /// Parse the whitespace separated `key:value` form.
    ///
    /// Keys are `trtype`, `adrfam`, `traddr`, `trsvcid` and `subnqn`, matched
    /// without regard to case. Any other key fails the whole parse.
    pub fn parse(s: &str) -> Result<Self> {
        let mut trid = TransportId::default();

        for token in s.split_whitespace() {
            let (key, val) = token.split_once(':').ok_or_else(|| {
                Error::InvalidArgument(format!("key without ':' separator in '{}'", token))
            })?;

            if key.is_empty() {
                return Err(Error::InvalidArgument("empty key".into()));
            }
            if key.len() > KEY_MAX_LEN {
                return Err(Error::InvalidArgument(format!(
                    "key length {} greater than maximum allowed {}",
                    key.len(),
                    KEY_MAX_LEN
                )));
            }
            if val.is_empty() {
                return Err(Error::InvalidArgument(format!("key '{}' without value", key)));
            }

            if key.eq_ignore_ascii_case("trtype") {
                trid.trtype = val.parse()?;
            } else if key.eq_ignore_ascii_case("adrfam") {
                trid.adrfam = Some(val.parse()?);
            } else if key.eq_ignore_ascii_case("traddr") {
                trid.traddr = check_len("traddr", val, TRADDR_MAX_LEN)?;
            } else if key.eq_ignore_ascii_case("trsvcid") {
                trid.trsvcid = check_len("trsvcid", val, TRSVCID_MAX_LEN)?;
            } else if key.eq_ignore_ascii_case("subnqn") {
                trid.subnqn = check_len("subnqn", val, NQN_MAX_LEN)?;
            } else {
                return Err(Error::InvalidArgument(format!("unknown key '{}'", key)));
            }
        }

        if !trid.trtype.is_fabric() && trid.adrfam.is_some() {
            return Err(Error::InvalidArgument(
                "adrfam does not apply to a PCIe transport".into(),
            ));
        }

        Ok(trid)
    }

    /// Total order over transport ids; `Equal` only when every field
    /// matches byte for byte.
    pub fn compare(&self, other: &TransportId) -> Ordering {
        (self.trtype as u32)
            .cmp(&(other.trtype as u32))
            .then_with(|| self.adrfam.map(|a| a as u32).cmp(&other.adrfam.map(|a| a as u32)))
            .then_with(|| self.traddr.as_bytes().cmp(other.traddr.as_bytes()))
            .then_with(|| self.trsvcid.as_bytes().cmp(other.trsvcid.as_bytes()))
            .then_with(|| self.subnqn.as_bytes().cmp(other.subnqn.as_bytes()))
    }

    pub fn trtype(&self) -> TransportType {
        self.trtype
    }

    pub fn adrfam(&self) -> Option<AddressFamily> {
        self.adrfam
    }

    pub fn traddr(&self) -> &str {
        &self.traddr
    }

    pub fn trsvcid(&self) -> &str {
        &self.trsvcid
    }

    pub fn subnqn(&self) -> &str {
        &self.subnqn
    }

    /// Rebuild from fields already validated elsewhere, such as the shared
    /// controller table.
    pub(crate) fn from_parts(
        trtype: TransportType,
        adrfam: Option<AddressFamily>,
        traddr: String,
        trsvcid: String,
        subnqn: String,
    ) -> Self {
        TransportId {
            trtype,
            adrfam,
            traddr,
            trsvcid,
            subnqn,
        }
    }
}

impl FromStr for TransportId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TransportId::parse(s)
    }
}

impl PartialOrd for TransportId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransportId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trtype:{}", self.trtype)?;
        if let Some(adrfam) = self.adrfam {
            write!(f, " adrfam:{}", adrfam)?;
        }
        if !self.traddr.is_empty() {
            write!(f, " traddr:{}", self.traddr)?;
        }
        if !self.trsvcid.is_empty() {
            write!(f, " trsvcid:{}", self.trsvcid)?;
        }
        if !self.subnqn.is_empty() {
            write!(f, " subnqn:{}", self.subnqn)?;
        }
        Ok(())
    }
}

fn check_len(name: &str, value: &str, max: usize) -> Result<String> {
    if value.len() > max {
        return Err(Error::InvalidArgument(format!(
            "{} length {} greater than maximum allowed {}",
            name,
            value.len(),
            max
        )));
    }
    Ok(value.to_string())
}
