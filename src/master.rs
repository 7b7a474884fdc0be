//! Bus master (controller) part of the protocol.
//!
//! [`Master`] drives one request/response exchange at a time over a
//! [`Transport`]: it transmits the request, blocks until the receive path
//! hands over a frame or the deadline passes, and validates the response.
//!
//! # Example
//!
//! ```no_run
//! use sensor_bus_proto::{addr, Master, Transport};
//! # fn open_port() -> Box<dyn Transport> { unimplemented!() }
//! # fn main() -> Result<(), sensor_bus_proto::master::Error> {
//! let mut master = Master::new(open_port());
//! master.trigger_measurement(addr(0x11))?;
//! let temperature = master.read_bytes(addr(0x11), 0x00, 4)?;
//! master.write_bytes(addr(0x11), 0x20, &[0x01, 0x02])?;
//! # Ok(()) }
//! ```

use std::io;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use snafu::{ensure, ResultExt, Snafu};

use crate::discovery::{Uid, UidProbe};
use crate::frame::{
    encode, expected_checksum, matches_echo, received_checksum, Frame, FRAME_CAPACITY,
    FRAME_OVERHEAD, MIN_FRAME_LEN,
};
use crate::nom_parser::{parse_read_response, parse_uid_response, ResponseToken};
use crate::transport::{rx_link, Reception, RxLink, RxSlot, Transport};
use crate::types::{self, Address, Command, IntoAddress, UidLength};

/// Longest register run a single ReadBytes can return.
pub const MAX_READ_LEN: usize = FRAME_CAPACITY - FRAME_OVERHEAD - 1;

/// Longest register run a single WriteBytes can carry.
pub const MAX_WRITE_LEN: usize = FRAME_CAPACITY - FRAME_OVERHEAD - 2;

/// Register data returned by [`Master::read_bytes`].
pub type ReadData = ArrayVec<u8, MAX_READ_LEN>;

/// Error type for bus exchanges.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// The driver rejected or didn't finish the transmission.
    #[snafu(display("Failed to transmit {:?} request", command))]
    Transmit { command: Command, source: io::Error },
    /// No frame arrived before the deadline.
    #[snafu(display("No {:?} response within {:?}", command, timeout))]
    Timeout { command: Command, timeout: Duration },
    /// A frame arrived, but its checksum is wrong.
    #[snafu(display(
        "{:?} response checksum mismatch, expected {:#06x}, received {:#06x}",
        command,
        expected,
        received
    ))]
    ChecksumMismatch {
        command: Command,
        expected: u16,
        received: u16,
    },
    /// A frame arrived, but it doesn't answer the request.
    #[snafu(display("{:?} response doesn't match the request: {}", command, reason))]
    ShapeMismatch {
        command: Command,
        reason: &'static str,
    },
    /// The command can't be addressed to all nodes.
    #[snafu(display("{:?} can't be sent to the broadcast address", command))]
    BroadcastNotAllowed { command: Command },
    /// An argument was out of range, nothing was sent.
    #[snafu(context(false), display("Invalid argument: {}", source))]
    InvalidArgument { source: types::Error },
}

impl Error {
    /// True for the outcome where nothing answered. Discovery treats this
    /// as "no unaddressed nodes left".
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// A frame arrived but failed validation.
    pub const fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::ShapeMismatch { .. }
        )
    }
}

/// Timeouts used by the master.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timing {
    /// Upper bound for handing a request to the driver.
    pub transmit: Duration,
    /// How long to wait for the response to an ordinary command.
    pub response: Duration,
    /// Discovery waits this long per unit of the delay window's high byte.
    pub discovery_delay_factor: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            transmit: Duration::from_millis(100),
            response: Duration::from_millis(100),
            discovery_delay_factor: Duration::from_millis(100),
        }
    }
}

impl Timing {
    /// Set the transmit timeout.
    pub fn transmit(mut self, timeout: Duration) -> Self {
        self.transmit = timeout;
        self
    }

    /// Set the response timeout for ordinary commands.
    pub fn response(mut self, timeout: Duration) -> Self {
        self.response = timeout;
        self
    }

    /// Set the discovery wait per step of the delay window high byte.
    pub fn discovery_delay_factor(mut self, factor: Duration) -> Self {
        self.discovery_delay_factor = factor;
        self
    }
}

/// How a response is checked against its request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Expected {
    /// The response must be a byte-exact copy of the request.
    Echo,
    /// `[address] [0x50] [length] [data; length]` from the addressed node.
    ReadBytes { length: u8 },
    /// `[any] [0x61] [uid; uid_length]`
    Uid { length: UidLength },
}

struct RxEndpoint {
    link: RxLink,
    slot: RxSlot,
}

/// Blocking bus master over a [`Transport`].
///
/// Only one exchange is ever outstanding, every method takes `&mut self`.
pub struct Master<T: Transport> {
    transport: T,
    timing: Timing,
    rx: Option<RxEndpoint>,
}

impl<T: Transport> Master<T> {
    /// Create a master with the default [`Timing`].
    pub fn new(transport: T) -> Self {
        Self::with_timing(transport, Timing::default())
    }

    /// Create a master with custom timeouts. No receive is armed until the
    /// first exchange.
    pub fn with_timing(transport: T, timing: Timing) -> Self {
        Self {
            transport,
            timing,
            rx: None,
        }
    }

    /// The timeouts in use.
    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Borrow the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the transport, e.g. to change port settings.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Return the transport, consuming the master.
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Read `length` register bytes starting at `start_reg`.
    /// # Errors
    /// See [`Error`]. The broadcast address is rejected before anything is sent.
    pub fn read_bytes(
        &mut self,
        address: impl IntoAddress,
        start_reg: u8,
        length: u8,
    ) -> Result<ReadData, Error> {
        let command = Command::ReadBytes;
        let address = address.into_address()?;
        ensure!(!address.is_broadcast(), BroadcastNotAllowedSnafu { command });
        check_payload(length as usize, MAX_READ_LEN)?;

        let request = encode(address, command, &[start_reg, length]);
        let response = self.exchange(
            &request,
            Expected::ReadBytes { length },
            self.timing.response,
        )?;
        match parse_read_response(&response, address, length) {
            ResponseToken::Data(data) => Ok(data.iter().copied().collect()),
            // exchange() has validated the shape already
            ResponseToken::Mismatch(reason) => ShapeMismatchSnafu { command, reason }.fail(),
        }
    }

    /// Write `data` to the registers starting at `start_reg`.
    /// # Errors
    /// See [`Error`]. The broadcast address is rejected before anything is sent.
    pub fn write_bytes(
        &mut self,
        address: impl IntoAddress,
        start_reg: u8,
        data: &[u8],
    ) -> Result<(), Error> {
        let command = Command::WriteBytes;
        let address = address.into_address()?;
        ensure!(!address.is_broadcast(), BroadcastNotAllowedSnafu { command });
        check_payload(data.len(), MAX_WRITE_LEN)?;

        let mut payload = ArrayVec::<u8, { FRAME_CAPACITY - FRAME_OVERHEAD }>::new();
        payload.push(start_reg);
        payload.push(data.len() as u8);
        payload
            .try_extend_from_slice(data)
            .expect("BUG: Payload buffer too small.");

        let request = encode(address, command, &payload);
        self.exchange(&request, Expected::Echo, self.timing.response)?;
        Ok(())
    }

    /// Start a measurement on `address`. On the broadcast address the frame
    /// is sent and the call returns at once, since no node answers.
    /// # Errors
    /// See [`Error`].
    pub fn trigger_measurement(&mut self, address: impl IntoAddress) -> Result<(), Error> {
        let command = Command::TriggerMeasurement;
        let address = address.into_address()?;
        let request = encode(address, command, &[]);

        if address.is_broadcast() {
            log::trace!("Broadcast trigger, no reply expected");
            return self.transmit(command, &request);
        }
        self.exchange(&request, Expected::Echo, self.timing.response)?;
        Ok(())
    }

    /// Tell the node carrying `uid` to use `new_address` from now on.
    /// The node echoes the request.
    /// # Errors
    /// See [`Error`]. `new_address` must not be the broadcast address.
    pub fn set_address_by_uid(
        &mut self,
        uid: &[u8],
        new_address: impl IntoAddress,
    ) -> Result<(), Error> {
        let command = Command::SetSlaveAddress;
        let uid_length = UidLength::new(uid.len())?;
        let new_address = new_address.into_address()?;
        if new_address.is_broadcast() {
            return Err(types::Error::InvalidAddress.into());
        }

        let mut payload = ArrayVec::<u8, { types::MAX_UID_LEN + 2 }>::new();
        payload.push(*uid_length);
        payload
            .try_extend_from_slice(uid)
            .expect("BUG: Payload buffer too small.");
        payload.push(*new_address);

        let request = encode(Address::BROADCAST, command, &payload);
        self.exchange(&request, Expected::Echo, self.timing.response)?;
        Ok(())
    }

    /// Broadcast a ReportUID probe and harvest the first answer within the
    /// probe's delay window.
    ///
    /// Only the first frame in the window is taken. Two nodes answering at
    /// overlapping times usually garble each other, which shows up as a
    /// checksum or shape mismatch.
    /// # Errors
    /// [`Error::Timeout`] when no node answered.
    pub fn report_uid(&mut self, probe: &UidProbe) -> Result<Uid, Error> {
        let command = Command::ReportUid;
        let request = encode(Address::BROADCAST, command, &probe.to_payload());
        let timeout = probe.response_timeout(self.timing.discovery_delay_factor);
        let response = self.exchange(
            &request,
            Expected::Uid {
                length: probe.uid_length,
            },
            timeout,
        )?;
        match parse_uid_response(&response, *probe.uid_length) {
            ResponseToken::Data(uid) => Ok(uid.iter().copied().collect()),
            ResponseToken::Mismatch(reason) => ShapeMismatchSnafu { command, reason }.fail(),
        }
    }

    /// Send `request` and wait up to `timeout` for a response satisfying `expected`.
    ///
    /// Stale receptions from an earlier exchange are discarded first. A
    /// transport fault doesn't end the wait, only the deadline does.
    /// # Errors
    /// See [`Error`].
    pub fn exchange(
        &mut self,
        request: &[u8],
        expected: Expected,
        timeout: Duration,
    ) -> Result<Frame, Error> {
        let command = request_command(request)?;
        self.discard_stale();
        self.transmit(command, request)?;

        let response = match self.wait_for_frame(timeout) {
            Some(frame) => frame,
            None => {
                log::debug!("<= timeout after {:?}", timeout);
                self.rearm();
                return TimeoutSnafu { command, timeout }.fail();
            }
        };
        log::debug!("<= {:02X?}", response.as_slice());

        validate(command, request, &response, expected)?;
        Ok(response)
    }

    fn transmit(&mut self, command: Command, request: &[u8]) -> Result<(), Error> {
        self.endpoint();
        log::debug!("=> {:02X?}", request);
        self.transport
            .transmit(request, self.timing.transmit)
            .context(TransmitSnafu { command })
    }

    /// Lazily create the receive slot and arm the transport on first use.
    fn endpoint(&mut self) -> &RxEndpoint {
        let transport = &mut self.transport;
        self.rx.get_or_insert_with(|| {
            let (link, slot) = rx_link();
            log::trace!("Arming continuous receive");
            transport.arm_continuous_receive(link.clone());
            RxEndpoint { link, slot }
        })
    }

    fn rearm(&mut self) {
        let link = self.endpoint().link.clone();
        log::trace!("Re-arming continuous receive");
        self.transport.arm_continuous_receive(link);
    }

    fn discard_stale(&mut self) {
        while let Some(stale) = self.endpoint().slot.try_recv() {
            log::warn!("Discarding stale reception {:02X?}", stale);
        }
    }

    fn wait_for_frame(&mut self, timeout: Duration) -> Option<Frame> {
        // no deadline if it can't be represented, recv_timeout then blocks
        let deadline = Instant::now().checked_add(timeout);
        let slot = &self.endpoint().slot;
        loop {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            match slot.recv_timeout(remaining) {
                Ok(Reception::Frame(frame)) => return Some(frame),
                Ok(Reception::Fault) => log::debug!("<= transport fault"),
                // we own a sender, so Disconnected can't happen
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }
}

fn check_payload(length: usize, max: usize) -> Result<(), Error> {
    if length > max {
        return Err(types::Error::PayloadTooLarge { length, max }.into());
    }
    Ok(())
}

/// Command of an outgoing request, after checking its address byte.
fn request_command(request: &[u8]) -> Result<Command, Error> {
    let code = request.get(1).copied().unwrap_or_default();
    let command = Command::try_from(code)?;
    Address::new(request.first().copied().unwrap_or_default())?;
    Ok(command)
}

fn validate(
    command: Command,
    request: &[u8],
    response: &[u8],
    expected: Expected,
) -> Result<(), Error> {
    if let Expected::Echo = expected {
        // an identical copy of a valid request carries a valid checksum
        ensure!(
            matches_echo(request, response),
            ShapeMismatchSnafu {
                command,
                reason: "echo differs from request",
            }
        );
        return Ok(());
    }

    ensure!(
        response.len() >= MIN_FRAME_LEN,
        ShapeMismatchSnafu {
            command,
            reason: "frame too short",
        }
    );
    let expected_crc = expected_checksum(response).unwrap_or_default();
    let received_crc = received_checksum(response).unwrap_or_default();
    ensure!(
        expected_crc == received_crc,
        ChecksumMismatchSnafu {
            command,
            expected: expected_crc,
            received: received_crc,
        }
    );

    let token = match expected {
        Expected::Echo => return Ok(()),
        Expected::ReadBytes { length } => {
            let address = Address::new(request[0])?;
            parse_read_response(response, address, length)
        }
        Expected::Uid { length } => parse_uid_response(response, *length),
    };
    match token {
        ResponseToken::Data(_) => Ok(()),
        ResponseToken::Mismatch(reason) => ShapeMismatchSnafu { command, reason }.fail(),
    }
}
