//! Bus enumeration: find nodes without an address and give them one.
//!
//! A discovery round broadcasts a ReportUID probe. Every unaddressed node
//! whose UID checksum matches the probe waits a pseudo-random time inside
//! the probe's delay window and then answers with its UID. The master takes
//! the first frame that arrives in the window and nothing else, so two nodes
//! picking overlapping delays garble each other and the round fails
//! validation. Collisions are not detected beyond that.
//!
//! After a round succeeds the caller assigns the reported UID an address
//! with SetSlaveAddress, which takes that node out of later rounds. A round
//! that times out means no unaddressed node is left:
//!
//! ```text
//! Idle -> Discover -> Ok(uid)  -> Assign(address) -> Idle
//!                  -> Timeout  -> AllAssigned
//! ```
//!
//! [`Discovery::enumerate`] runs this loop.

use std::time::Duration;

use arrayvec::ArrayVec;

use crate::frame::crc16;
use crate::master::{Error, Master};
use crate::transport::Transport;
use crate::types::{addr, Address, IntoAddress, UidLength, MAX_UID_LEN};

/// A node's unique identifier as reported on the bus.
pub type Uid = ArrayVec<u8, MAX_UID_LEN>;

/// The checksum a node compares against the probe's `uid_checksum`.
pub fn uid_checksum(uid: &[u8]) -> u16 {
    crc16(uid)
}

/// Parameters of a ReportUID broadcast.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UidProbe {
    /// Only nodes whose UID checksum matches answer.
    pub uid_checksum: u16,
    /// Upper bound of the random delay a node waits before answering.
    pub delay_window: u16,
    /// Number of UID bytes each node reports.
    pub uid_length: UidLength,
}

impl UidProbe {
    pub fn new(uid_checksum: u16, delay_window: u16, uid_length: UidLength) -> Self {
        Self {
            uid_checksum,
            delay_window,
            uid_length,
        }
    }

    /// `[uid_crc_lo] [uid_crc_hi] [delay_lo] [delay_hi] [uid_length]`
    pub(crate) fn to_payload(self) -> [u8; 5] {
        let [crc_lo, crc_hi] = self.uid_checksum.to_le_bytes();
        let [delay_lo, delay_hi] = self.delay_window.to_le_bytes();
        [crc_lo, crc_hi, delay_lo, delay_hi, *self.uid_length]
    }

    /// How long the master listens for an answer: `factor` for every step
    /// of the delay window's high byte.
    pub fn response_timeout(&self, factor: Duration) -> Duration {
        let [_, delay_hi] = self.delay_window.to_le_bytes();
        factor.saturating_mul(u32::from(delay_hi))
    }
}

/// A node found by [`Discovery::enumerate`] and the address it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub uid: Uid,
    pub address: Address,
}

/// Settings for [`Discovery::enumerate`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EnumerationOptions {
    /// Address given to the first node found, later nodes count up from here.
    pub first_address: Address,
    /// How many garbled rounds in a row are repeated before giving up.
    pub collision_retries: u8,
}

impl Default for EnumerationOptions {
    fn default() -> Self {
        Self {
            first_address: addr(0x01),
            collision_retries: 3,
        }
    }
}

/// Discovery sequencer, keeps count of the nodes it has found.
///
/// The count only grows. Create a new `Discovery` to start over.
#[derive(Debug, Default)]
pub struct Discovery {
    discovered: usize,
}

impl Discovery {
    pub const fn new() -> Self {
        Self { discovered: 0 }
    }

    /// Number of nodes that answered a discovery round so far.
    pub const fn discovered(&self) -> usize {
        self.discovered
    }

    /// Run one discovery round and count the node that answered.
    /// # Errors
    /// [`Error::Timeout`] if no node answered, a validation error if the
    /// answer was garbled. The count is unchanged in both cases.
    pub fn report_and_count_one<T: Transport>(
        &mut self,
        master: &mut Master<T>,
        probe: &UidProbe,
    ) -> Result<Uid, Error> {
        let uid = master.report_uid(probe)?;
        self.discovered += 1;
        log::info!("Discovered node #{} with UID {:02X?}", self.discovered, uid.as_slice());
        Ok(uid)
    }

    /// Give the node carrying `uid` the address `new_address`.
    /// # Errors
    /// See [`Master::set_address_by_uid`].
    pub fn set_address_by_uid<T: Transport>(
        &self,
        master: &mut Master<T>,
        uid: &[u8],
        new_address: impl IntoAddress,
    ) -> Result<(), Error> {
        let new_address = new_address.into_address()?;
        master.set_address_by_uid(uid, new_address)?;
        log::info!("Assigned address {:#04x} to UID {:02X?}", *new_address, uid);
        Ok(())
    }

    /// Discover and address nodes until a round times out or the address
    /// range runs out. Returns the assignments made, in order.
    ///
    /// A round that fails validation is treated as a collision and run again,
    /// at most `collision_retries` times in a row.
    /// # Errors
    /// The first error that isn't a timeout or a retried collision.
    pub fn enumerate<T: Transport>(
        &mut self,
        master: &mut Master<T>,
        probe: &UidProbe,
        options: &EnumerationOptions,
    ) -> Result<Vec<Assignment>, Error> {
        let mut assignments = Vec::new();
        let mut next_address = Some(options.first_address);
        let mut collisions = 0;

        while let Some(address) = next_address {
            let uid = match self.report_and_count_one(master, probe) {
                Ok(uid) => uid,
                Err(err) if err.is_timeout() => {
                    log::info!("Enumeration complete, {} nodes addressed", assignments.len());
                    return Ok(assignments);
                }
                Err(err) if err.is_validation_failure() && collisions < options.collision_retries => {
                    collisions += 1;
                    log::warn!("Discovery round garbled ({}), retrying", err);
                    continue;
                }
                Err(err) => return Err(err),
            };
            collisions = 0;

            self.set_address_by_uid(master, &uid, address)?;
            assignments.push(Assignment { uid, address });
            next_address = address.next();
        }

        log::warn!("Address range exhausted after {} nodes", assignments.len());
        Ok(assignments)
    }
}
