//! This module defines range-checked types for bus addresses, command codes
//! and UID lengths, meant to simplify correct usage of the API.

use snafu::{ensure, OptionExt, Snafu};

use core::ops::Deref;

/// Error type for this module
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// The value isn't a valid bus address.
    #[snafu(display("Invalid address"))]
    InvalidAddress,
    /// The byte isn't one of the known command codes.
    #[snafu(display("Unknown command code {:#04x}", code))]
    UnknownCommand { code: u8 },
    /// UIDs are between 1 and [`MAX_UID_LEN`] bytes long.
    #[snafu(display("Invalid UID length {}", length))]
    InvalidUidLength { length: usize },
    /// The payload doesn't fit in a single frame.
    #[snafu(display("Payload of {} bytes exceeds the limit of {} bytes", length, max))]
    PayloadTooLarge { length: usize, max: usize },
}

const fn invalid_address() -> InvalidAddressSnafu {
    InvalidAddressSnafu
}

/// Highest address a node may be assigned.
pub const MAX_NODE_ADDRESS: u8 = 0xF7;

/// Longest UID the discovery commands can carry.
pub const MAX_UID_LEN: usize = 12;

/// Address is a range-checked [0x00, 0xF7] integer, representing a node address.
/// Address 0x00 is the broadcast address.
///
/// ## Example
/// ```
/// use sensor_bus_proto::Address;
/// let addr = Address::new(0x11).unwrap();
/// let addr: Address = 0x11usize.try_into().unwrap();
/// assert!(!addr.is_broadcast());
/// assert!(Address::new(0xF8).is_err());
/// ```
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct Address(u8);

/// Create a new [`Address`], panics if it is out of range.
pub const fn addr(a: u8) -> Address {
    if a <= MAX_NODE_ADDRESS {
        return Address(a);
    }
    panic!("Invalid address.")
}

impl Address {
    /// The reserved "all nodes" address.
    pub const BROADCAST: Address = Address(0x00);

    /// Create a new address, checking that the address is in \[0x00, 0xF7\].
    /// # Errors
    /// Returns [`Error::InvalidAddress`] if `address` is out of range.
    pub fn new(address: impl TryInto<u8>) -> Result<Self, Error> {
        let address = address.try_into().ok().with_context(invalid_address)?;
        ensure!(address <= MAX_NODE_ADDRESS, invalid_address());
        Ok(Self(address))
    }

    /// True for the broadcast address.
    pub const fn is_broadcast(self) -> bool {
        self.0 == Self::BROADCAST.0
    }

    /// The next higher node address, or None at the top of the range.
    pub fn next(self) -> Option<Self> {
        if self.0 < MAX_NODE_ADDRESS {
            Some(Self(self.0 + 1))
        } else {
            None
        }
    }
}

impl Deref for Address {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq<u8> for Address {
    fn eq(&self, other: &u8) -> bool {
        self.0 == *other
    }
}

/// Trait to convert `T: TryInto<u8>` into an [`Address`].
pub trait IntoAddress {
    /// Convert self to an Address.
    /// # Errors
    /// Returns `Error:InvalidAddress` if self isn't a valid address.
    fn into_address(self) -> Result<Address, Error>;
}

impl IntoAddress for Address {
    fn into_address(self) -> Result<Address, Error> {
        Ok(self)
    }
}

impl<T> IntoAddress for T
where
    T: TryInto<u8>,
{
    fn into_address(self) -> Result<Address, Error> {
        Address::new(self)
    }
}

impl TryFrom<usize> for Address {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}


/// The command codes understood by the sensor nodes.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[repr(u8)]
pub enum Command {
    /// Read a run of registers.
    ReadBytes = 0x50,
    /// Write a run of registers, the node echoes the request.
    WriteBytes = 0x51,
    /// Start a measurement cycle. Echoed, except on broadcast.
    TriggerMeasurement = 0x60,
    /// Broadcast discovery probe, answered by self-selected nodes with their UID.
    ReportUid = 0x61,
    /// Broadcast address assignment to the node with a given UID.
    SetSlaveAddress = 0x62,
}

impl Command {
    /// The on-wire command byte.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Commands whose successful response is a byte-exact copy of the request.
    pub const fn is_echo(self) -> bool {
        matches!(
            self,
            Self::WriteBytes | Self::TriggerMeasurement | Self::SetSlaveAddress
        )
    }
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x50 => Self::ReadBytes,
            0x51 => Self::WriteBytes,
            0x60 => Self::TriggerMeasurement,
            0x61 => Self::ReportUid,
            0x62 => Self::SetSlaveAddress,
            code => return UnknownCommandSnafu { code }.fail(),
        })
    }
}

/// `UidLength` is a range-checked \[1, 12\] byte count, the length of the UID
/// a node is asked to report. Nodes typically use 1, 2, 4 or 12 bytes.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct UidLength(u8);

impl UidLength {
    /// # Errors
    /// Returns [`Error::InvalidUidLength`] for zero or anything above [`MAX_UID_LEN`].
    pub fn new(length: usize) -> Result<Self, Error> {
        ensure!(
            (1..=MAX_UID_LEN).contains(&length),
            InvalidUidLengthSnafu { length }
        );
        Ok(Self(length as u8))
    }
}

impl Deref for UidLength {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
