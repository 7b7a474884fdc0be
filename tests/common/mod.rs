#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{Error, ErrorKind};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sensor_bus_proto::discovery::uid_checksum;
use sensor_bus_proto::frame::{crc16, verify_checksum};
use sensor_bus_proto::{RxLink, Timing, Transport};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Timeouts the tests' reply delays are written against, pinned so they
/// don't follow changes to `Timing::default()`.
pub fn test_timing() -> Timing {
    Timing::default()
        .response(Duration::from_millis(100))
        .discovery_delay_factor(Duration::from_millis(100))
}

/// Append the CRC-16 to a hand written frame body.
pub fn with_crc(body: &[u8]) -> Vec<u8> {
    let mut frame = body.to_vec();
    frame.extend_from_slice(&crc16(body).to_le_bytes());
    frame
}

/// Fire receive events from a separate thread, like a UART interrupt would.
fn deliver(link: &RxLink, events: Vec<(Duration, Event)>) {
    let link = link.clone();
    thread::spawn(move || {
        for (delay, event) in events {
            thread::sleep(delay);
            match event {
                Event::Frame(data) => link.on_frame_received(&data),
                Event::Fault => link.on_transport_fault(),
            }
        }
    });
}

#[derive(Debug, Clone)]
pub enum Event {
    Frame(Vec<u8>),
    Fault,
}

#[derive(Debug, Clone)]
enum Step {
    Reply(Vec<(Duration, Event)>),
    Echo(Duration),
    Silence,
}

/// Transport answering each transmitted frame with the next scripted step.
pub struct ScriptedTransport {
    link: Option<RxLink>,
    steps: VecDeque<Step>,
    pub sent: Vec<Vec<u8>>,
    pub arm_count: usize,
    pub do_write_error: bool,
}

const PROMPT: Duration = Duration::from_millis(5);

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            link: None,
            steps: VecDeque::new(),
            sent: Vec::new(),
            arm_count: 0,
            do_write_error: false,
        }
    }

    pub fn reply(mut self, frame: &[u8]) -> Self {
        self.steps
            .push_back(Step::Reply(vec![(PROMPT, Event::Frame(frame.to_vec()))]));
        self
    }

    pub fn reply_after(mut self, delay: Duration, frame: &[u8]) -> Self {
        self.steps
            .push_back(Step::Reply(vec![(delay, Event::Frame(frame.to_vec()))]));
        self
    }

    pub fn events(mut self, events: Vec<(Duration, Event)>) -> Self {
        self.steps.push_back(Step::Reply(events));
        self
    }

    pub fn echo(mut self) -> Self {
        self.steps.push_back(Step::Echo(PROMPT));
        self
    }

    pub fn silence(mut self) -> Self {
        self.steps.push_back(Step::Silence);
        self
    }

    /// Simulated interrupt firing with no data behind it.
    pub fn spurious(mut self) -> Self {
        self.steps
            .push_back(Step::Reply(vec![(PROMPT, Event::Frame(Vec::new()))]));
        self
    }
}

impl Transport for ScriptedTransport {
    fn transmit(&mut self, frame: &[u8], _timeout: Duration) -> std::io::Result<()> {
        if self.do_write_error {
            self.do_write_error = false;
            return Err(Error::new(ErrorKind::TimedOut, "IO write error"));
        }
        self.sent.push(frame.to_vec());

        let link = self.link.as_ref().expect("Transmit before receive was armed");
        match self.steps.pop_front().unwrap_or(Step::Silence) {
            Step::Reply(events) => deliver(link, events),
            Step::Echo(delay) => deliver(link, vec![(delay, Event::Frame(frame.to_vec()))]),
            Step::Silence => {}
        }
        Ok(())
    }

    fn arm_continuous_receive(&mut self, link: RxLink) {
        self.arm_count += 1;
        self.link = Some(link);
    }
}

/// Probe checksum the simulated nodes accept from every node.
pub const ANY_UID: u16 = 0xFFFF;

/// Nodes answering within this gap of each other collide on the line.
const COLLISION_GAP: Duration = Duration::from_millis(5);

pub struct SimNode {
    pub uid: Vec<u8>,
    pub address: u8,
    pub registers: [u8; 256],
    pub measurements: usize,
    /// Discovery answer delays in ms, the last one is reused.
    delays: VecDeque<u64>,
}

impl SimNode {
    pub fn new(uid: &[u8], delays: &[u64]) -> Self {
        let mut registers = [0; 256];
        for (n, reg) in registers.iter_mut().enumerate() {
            *reg = n as u8;
        }
        Self {
            uid: uid.to_vec(),
            address: 0,
            registers,
            measurements: 0,
            delays: delays.iter().copied().collect(),
        }
    }

    pub fn with_address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    fn next_delay(&mut self) -> Duration {
        let ms = if self.delays.len() > 1 {
            self.delays.pop_front()
        } else {
            self.delays.front().copied()
        };
        Duration::from_millis(ms.unwrap_or(10))
    }

    fn selected_by(&self, uid_crc: u16, uid_len: usize) -> bool {
        self.address == 0
            && uid_len <= self.uid.len()
            && (uid_crc == ANY_UID || uid_crc == uid_checksum(&self.uid))
    }
}

/// A bus of simulated sensor nodes, answering according to the protocol.
#[derive(Clone)]
pub struct SensorBus {
    pub nodes: Arc<Mutex<Vec<SimNode>>>,
    link: Arc<Mutex<Option<RxLink>>>,
}

impl SensorBus {
    pub fn new(nodes: Vec<SimNode>) -> Self {
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
            link: Default::default(),
        }
    }

    pub fn node_address(&self, uid: &[u8]) -> Option<u8> {
        let nodes = self.nodes.lock().unwrap();
        nodes.iter().find(|n| n.uid == uid).map(|n| n.address)
    }

    pub fn measurements(&self) -> Vec<usize> {
        let nodes = self.nodes.lock().unwrap();
        nodes.iter().map(|n| n.measurements).collect()
    }

    fn respond(&self, frame: &[u8]) -> Option<(Duration, Vec<u8>)> {
        if frame.len() < 4 || !verify_checksum(frame) {
            return None;
        }
        let body = &frame[..frame.len() - 2];
        let (address, command, payload) = (body[0], body[1], &body[2..]);
        let mut nodes = self.nodes.lock().unwrap();

        match command {
            0x50 => {
                let node = nodes.iter().find(|n| n.address == address && address != 0)?;
                let (start, len) = (payload[0] as usize, payload[1] as usize);
                let mut reply = vec![address, command, len as u8];
                reply.extend((start..start + len).map(|r| node.registers[r % 256]));
                Some((PROMPT, with_crc(&reply)))
            }
            0x51 => {
                let node = nodes
                    .iter_mut()
                    .find(|n| n.address == address && address != 0)?;
                let (start, len) = (payload[0] as usize, payload[1] as usize);
                for (n, byte) in payload[2..2 + len].iter().enumerate() {
                    node.registers[(start + n) % 256] = *byte;
                }
                Some((PROMPT, frame.to_vec()))
            }
            0x60 if address == 0 => {
                nodes.iter_mut().for_each(|n| n.measurements += 1);
                None
            }
            0x60 => {
                let node = nodes.iter_mut().find(|n| n.address == address)?;
                node.measurements += 1;
                Some((PROMPT, frame.to_vec()))
            }
            0x61 => {
                let uid_crc = u16::from_le_bytes([payload[0], payload[1]]);
                let uid_len = payload[4] as usize;
                let mut answers: Vec<(Duration, Vec<u8>)> = nodes
                    .iter_mut()
                    .filter(|n| n.selected_by(uid_crc, uid_len))
                    .map(|n| {
                        let mut reply = vec![n.address, command];
                        reply.extend_from_slice(&n.uid[..uid_len]);
                        (n.next_delay(), with_crc(&reply))
                    })
                    .collect();
                answers.sort_by_key(|(delay, _)| *delay);

                // Later nodes hear the first answer and stay quiet, unless
                // they started talking at about the same time.
                let mut answers = answers.into_iter();
                let (delay, mut first) = answers.next()?;
                let mut collided = false;
                for (other_delay, other) in answers {
                    if other_delay - delay < COLLISION_GAP {
                        collided = true;
                        for (a, b) in first.iter_mut().zip(other.iter()) {
                            *a &= *b;
                        }
                    }
                }
                // the merged frame could pass the checksum by accident
                if collided && verify_checksum(&first) {
                    let last = first.len() - 1;
                    first[last] ^= 0xFF;
                }
                Some((delay, first))
            }
            0x62 => {
                let uid_len = payload[0] as usize;
                let uid = &payload[1..1 + uid_len];
                let new_address = payload[1 + uid_len];
                let node = nodes.iter_mut().find(|n| n.uid == uid)?;
                node.address = new_address;
                Some((PROMPT, frame.to_vec()))
            }
            _ => None,
        }
    }
}

impl Transport for SensorBus {
    fn transmit(&mut self, frame: &[u8], _timeout: Duration) -> std::io::Result<()> {
        if let Some((delay, reply)) = self.respond(frame) {
            let link = self.link.lock().unwrap();
            let link = link.as_ref().expect("Transmit before receive was armed");
            deliver(link, vec![(delay, Event::Frame(reply))]);
        }
        Ok(())
    }

    fn arm_continuous_receive(&mut self, link: RxLink) {
        *self.link.lock().unwrap() = Some(link);
    }
}
