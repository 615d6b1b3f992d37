//! TDS protocol version.

use core::fmt;

/// TDS protocol version as carried in LOGIN7 and LOGINACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 7.2 (SQL Server 2005), the first version with MARS.
    pub const V7_2: Self = Self(0x72090002);

    /// TDS 7.3B (SQL Server 2008 R2).
    pub const V7_3B: Self = Self(0x730B0003);

    /// TDS 7.4 (SQL Server 2012+).
    pub const V7_4: Self = Self(0x74000004);

    /// Create a version from its raw wire value.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// Raw wire value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether the server can multiplex sessions on one connection.
    #[must_use]
    pub const fn supports_mars(self) -> bool {
        self.0 >= Self::V7_2.0
    }
}

impl Default for TdsVersion {
    fn default() -> Self {
        Self::V7_4
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let major = (self.0 >> 28) & 0xF;
        let minor = (self.0 >> 24) & 0xF;
        write!(f, "TDS {major}.{minor}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(TdsVersion::V7_4.to_string(), "TDS 7.4");
        assert_eq!(TdsVersion::V7_2.to_string(), "TDS 7.2");
    }

    #[test]
    fn test_mars_support() {
        assert!(TdsVersion::V7_4.supports_mars());
        assert!(!TdsVersion::new(0x71000001).supports_mars());
    }
}
