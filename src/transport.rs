//! The boundary between the protocol engine and a half-duplex serial driver.
//!
//! A driver implements [`Transport`]. Once armed with an [`RxLink`] it captures
//! incoming bytes until the line goes idle and hands the capture to
//! [`RxLink::on_frame_received`], or reports a line error through
//! [`RxLink::on_transport_fault`]. Both upcalls are meant to be called from
//! the driver's interrupt or reader context: they copy into a fixed-size
//! frame, never touch the heap and never block.
//!
//! The link holds at most one pending frame and one pending fault. A fault
//! never takes the place of a frame, so a reply following a line error is
//! still delivered. The waiting [`Master`](crate::Master) takes receptions
//! out of the slot, which frees it for the next one.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use crate::frame::{Frame, FRAME_CAPACITY};

/// What the receive path observed on the line.
#[derive(Debug, Clone, PartialEq)]
pub enum Reception {
    /// Bytes captured up to an idle line.
    Frame(Frame),
    /// Framing, overrun or noise error. No usable data.
    Fault,
}

/// Which kinds of reception are waiting in the slot.
#[derive(Debug, Default)]
struct Pending {
    frame: AtomicBool,
    fault: AtomicBool,
}

impl Pending {
    fn flag(&self, reception: &Reception) -> &AtomicBool {
        match reception {
            Reception::Frame(_) => &self.frame,
            Reception::Fault => &self.fault,
        }
    }
}

/// Handle given to a [`Transport`] for publishing receive events.
#[derive(Debug, Clone)]
pub struct RxLink {
    slot: SyncSender<Reception>,
    pending: Arc<Pending>,
}

impl RxLink {
    /// Reception completed with `captured.len()` bytes. Bytes beyond
    /// [`FRAME_CAPACITY`] are dropped, the frame will then fail validation.
    pub fn on_frame_received(&self, captured: &[u8]) {
        let mut frame = Frame::new();
        frame.extend(captured.iter().copied().take(FRAME_CAPACITY));
        self.publish(Reception::Frame(frame));
    }

    /// The line reported an error. The waiter is woken and keeps waiting
    /// for a valid frame until its deadline.
    pub fn on_transport_fault(&self) {
        self.publish(Reception::Fault);
    }

    fn publish(&self, reception: Reception) {
        if self.pending.flag(&reception).swap(true, Ordering::AcqRel) {
            match reception {
                Reception::Frame(dropped) => {
                    log::warn!("Receive slot occupied, dropping {:02X?}", dropped.as_slice())
                }
                Reception::Fault => log::trace!("Fault already pending"),
            }
            return;
        }
        // one frame and one fault always fit
        match self.slot.try_send(reception) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                self.pending.flag(&dropped).store(false, Ordering::Release);
                log::warn!("Receive slot overrun, dropping {:02X?}", dropped)
            }
            Err(TrySendError::Disconnected(_)) => log::trace!("Receiver gone, dropping reception"),
        }
    }
}

/// The master's end of the link.
#[derive(Debug)]
pub(crate) struct RxSlot {
    rx: Receiver<Reception>,
    pending: Arc<Pending>,
}

impl RxSlot {
    pub(crate) fn try_recv(&self) -> Option<Reception> {
        let reception = self.rx.try_recv().ok()?;
        Some(self.taken(reception))
    }

    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Result<Reception, RecvTimeoutError> {
        let reception = self.rx.recv_timeout(timeout)?;
        Ok(self.taken(reception))
    }

    fn taken(&self, reception: Reception) -> Reception {
        self.pending.flag(&reception).store(false, Ordering::Release);
        reception
    }
}

/// Create the link and the receiving end the master waits on.
pub(crate) fn rx_link() -> (RxLink, RxSlot) {
    let (slot, rx) = mpsc::sync_channel(2);
    let pending = Arc::new(Pending::default());
    (
        RxLink {
            slot,
            pending: pending.clone(),
        },
        RxSlot { rx, pending },
    )
}

/// Abstraction of a half-duplex serial link.
pub trait Transport {
    /// Send `frame`, blocking until the driver reports completion.
    /// # Errors
    /// Any error from the driver, including a send that didn't finish within `timeout`.
    fn transmit(&mut self, frame: &[u8], timeout: Duration) -> io::Result<()>;

    /// Start capturing into `link`. The driver must keep itself armed after
    /// every reception or fault. The master also calls this after a timed out
    /// exchange, so arming an already armed transport must be harmless.
    fn arm_continuous_receive(&mut self, link: RxLink);
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn transmit(&mut self, frame: &[u8], timeout: Duration) -> io::Result<()> {
        (**self).transmit(frame, timeout)
    }

    fn arm_continuous_receive(&mut self, link: RxLink) {
        (**self).arm_continuous_receive(link)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transmit(&mut self, frame: &[u8], timeout: Duration) -> io::Result<()> {
        (**self).transmit(frame, timeout)
    }

    fn arm_continuous_receive(&mut self, link: RxLink) {
        (**self).arm_continuous_receive(link)
    }
}
