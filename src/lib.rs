//! Master-side engine for a Modbus-inspired sensor bus.
//!
//! A single bus master talks to environmental sensor nodes over a half-duplex
//! serial line. Every frame is `[address] [command] [payload] [crc16 LE]`,
//! using CRC-16/MODBUS. The crate contains:
//!
//! * [`frame`]: frame encoding and checksum verification.
//! * [`transport`]: the [`Transport`] trait a serial driver implements, and the
//!   [`RxLink`] its receive interrupt uses to hand frames to the master.
//! * [`master`]: the blocking request/response [`Master`] and its
//!   per-command wrappers.
//! * [`discovery`]: ReportUID based enumeration and address assignment.
//!
//! The crate logs through the `log` facade and installs no logger itself.

pub mod discovery;
pub mod frame;
pub mod master;
mod nom_parser;
pub mod transport;
pub mod types;

pub use discovery::{Discovery, UidProbe};
pub use master::{Master, Timing};
pub use transport::{Reception, RxLink, Transport};
pub use types::{addr, Address, Command, IntoAddress, UidLength};
