//! Device identity and id-table matching

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Vendor/product pair reported by the bus for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

impl FromStr for DeviceIdentity {
    type Err = crate::Error;

    /// Parse `0xVID:0xPID`; wildcards are not identities
    fn from_str(s: &str) -> crate::Result<Self> {
        let filter: IdFilter = s.parse()?;
        match (filter.vendor_id, filter.product_id) {
            (Some(vendor_id), Some(product_id)) => Ok(Self::new(vendor_id, product_id)),
            _ => Err(crate::Error::Config(format!(
                "Invalid device identity '{}', wildcards are not allowed",
                s
            ))),
        }
    }
}

/// Bus-assigned session (interface) identifier
///
/// Valid from attach until detach of the device bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// One id-table entry: `0xVID:0xPID`, either side may be `*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdFilter {
    vendor_id: Option<u16>,
    product_id: Option<u16>,
}

impl IdFilter {
    /// Filter matching exactly one vendor/product pair
    pub fn exact(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
        }
    }

    /// Filter matching every device
    pub fn any() -> Self {
        Self {
            vendor_id: None,
            product_id: None,
        }
    }

    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        self.vendor_id.is_none_or(|vid| vid == identity.vendor_id)
            && self.product_id.is_none_or(|pid| pid == identity.product_id)
    }

    fn parse_part(part: &str, name: &str) -> crate::Result<Option<u16>> {
        if part == "*" {
            return Ok(None);
        }

        let hex = part
            .strip_prefix("0x")
            .or_else(|| part.strip_prefix("0X"))
            .ok_or_else(|| {
                crate::Error::Config(format!(
                    "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                    name, part
                ))
            })?;

        if hex.is_empty() || hex.len() > 4 {
            return Err(crate::Error::Config(format!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name, part
            )));
        }

        u16::from_str_radix(hex, 16).map(Some).map_err(|_| {
            crate::Error::Config(format!("Invalid {} '{}', not a hex number", name, part))
        })
    }
}

impl FromStr for IdFilter {
    type Err = crate::Error;

    fn from_str(filter: &str) -> crate::Result<Self> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(crate::Error::Config(format!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            )));
        }

        Ok(Self {
            vendor_id: Self::parse_part(parts[0], "vendor ID")?,
            product_id: Self::parse_part(parts[1], "product ID")?,
        })
    }
}

impl fmt::Display for IdFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor_id {
            Some(vid) => write!(f, "{:#06x}", vid)?,
            None => write!(f, "*")?,
        }
        write!(f, ":")?;
        match self.product_id {
            Some(pid) => write!(f, "{:#06x}", pid),
            None => write!(f, "*"),
        }
    }
}

/// Set of identities a driver is willing to bind to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceIdTable {
    filters: Vec<IdFilter>,
}

impl DeviceIdTable {
    pub fn new(filters: Vec<IdFilter>) -> Self {
        Self { filters }
    }

    /// Parse a table from `VID:PID` strings
    pub fn parse<S: AsRef<str>>(filters: &[S]) -> crate::Result<Self> {
        filters
            .iter()
            .map(|f| f.as_ref().parse())
            .collect::<crate::Result<Vec<_>>>()
            .map(Self::new)
    }

    /// Whether `identity` is served by this table; an empty table matches nothing
    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        self.filters.iter().any(|f| f.matches(identity))
    }

    pub fn filters(&self) -> &[IdFilter] {
        &self.filters
    }
}
