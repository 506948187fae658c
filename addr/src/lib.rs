//! Addresses of IPC processes within a DIF.
#![deny(missing_docs)]
use failure::Fail;
use std::str::FromStr;

/// Address of an IPC process.
///
/// Addresses are flat 64 bit identifiers assigned by the DIF management
/// plane. Address `0` is reserved and means "not assigned yet"; an IPCP
/// keeps it until a `config("address", ...)` request arrives.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Addr(u64);

impl Addr {
    /// The reserved "not assigned" address.
    pub const UNSET: Addr = Addr(0);

    /// Returns the raw 64 bit value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Address parse error.
#[derive(Debug, Fail)]
pub enum AddrParseError {
    /// The string is not a decimal 64 bit number.
    #[fail(display = "{}", _0)]
    Num(std::num::ParseIntError),
}

impl From<std::num::ParseIntError> for AddrParseError {
    fn from(err: std::num::ParseIntError) -> Self {
        Self::Num(err)
    }
}

impl FromStr for Addr {
    type Err = AddrParseError;

    fn from_str(addr: &str) -> Result<Self, Self::Err> {
        Ok(Addr(u64::from_str(addr)?))
    }
}

impl From<u64> for Addr {
    fn from(addr: u64) -> Self {
        Addr(addr)
    }
}

impl From<Addr> for u64 {
    fn from(addr: Addr) -> Self {
        addr.0
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Trait to abstract over types that can be turned into an `Addr`.
pub trait ToAddr {
    /// Returns the addr.
    fn to_addr(self) -> Result<Addr, AddrParseError>;
}

impl ToAddr for Addr {
    fn to_addr(self) -> Result<Addr, AddrParseError> {
        Ok(self)
    }
}

impl ToAddr for u64 {
    fn to_addr(self) -> Result<Addr, AddrParseError> {
        Ok(Addr(self))
    }
}

impl ToAddr for &str {
    fn to_addr(self) -> Result<Addr, AddrParseError> {
        Addr::from_str(self)?.to_addr()
    }
}
