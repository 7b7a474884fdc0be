use anyhow::{Context, Result};
use arrayvec::ArrayVec;
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::iter::Peekable;
use std::str::{FromStr, SplitWhitespace};
use std::time::Duration;

use sensor_bus_proto::discovery::{uid_checksum, EnumerationOptions};
use sensor_bus_proto::frame::FRAME_CAPACITY;
use sensor_bus_proto::{Discovery, Master, RxLink, Transport, UidLength, UidProbe};

/// A gap this long on the line ends a frame.
const IDLE_GAP: Duration = Duration::from_millis(5);

/// Serial port transport. A reader thread plays the part of the UART
/// receive interrupt, cutting frames at idle gaps.
struct SerialTransport {
    port: Box<dyn SerialPort>,
    reader_running: bool,
}

impl SerialTransport {
    fn open(path: &str, baud_rate: u32) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", path, baud_rate);
        let port = serialport::new(path, baud_rate)
            .timeout(IDLE_GAP)
            .open()
            .with_context(|| format!("Failed to open serial port {}", path))?;
        Ok(Self {
            port,
            reader_running: false,
        })
    }
}

fn receive_loop(mut port: Box<dyn SerialPort>, link: RxLink) {
    let mut frame = ArrayVec::<u8, FRAME_CAPACITY>::new();
    let mut buf = [0; 64];
    loop {
        match port.read(&mut buf) {
            Ok(len) => {
                // overlong captures are cut, the frame then fails validation
                let room = frame.remaining_capacity().min(len);
                frame.extend(buf[..room].iter().copied());
            }
            Err(err) if err.kind() == ErrorKind::TimedOut => {
                if !frame.is_empty() {
                    link.on_frame_received(&frame);
                    frame.clear();
                }
            }
            Err(err) => {
                log::warn!("Serial receive error: {}", err);
                frame.clear();
                link.on_transport_fault();
                std::thread::sleep(IDLE_GAP);
            }
        }
    }
}

impl Transport for SerialTransport {
    fn transmit(&mut self, frame: &[u8], timeout: Duration) -> std::io::Result<()> {
        self.port.set_timeout(timeout)?;
        let result = self.port.write_all(frame).and_then(|_| self.port.flush());
        self.port.set_timeout(IDLE_GAP)?;
        result
    }

    fn arm_continuous_receive(&mut self, link: RxLink) {
        // the reader thread re-arms itself after every frame
        if self.reader_running {
            return;
        }
        match self.port.try_clone() {
            Ok(port) => {
                std::thread::spawn(move || receive_loop(port, link));
                self.reader_running = true;
            }
            Err(err) => log::error!("Can't start serial reader: {}", err),
        }
    }
}

fn cmd_scan(args: &mut CmdScanner<'_>, bus: &mut Master<SerialTransport>) -> Result<()> {
    let uid_crc: u16 = args.parse_next()?;
    let uid_length = UidLength::new(args.parse_or(4)?)?;
    let delay_window: u16 = args.parse_or(0x0500)?;
    let probe = UidProbe::new(uid_crc, delay_window, uid_length);

    let mut discovery = Discovery::new();
    let assignments = discovery.enumerate(bus, &probe, &EnumerationOptions::default())?;
    for assignment in assignments {
        println!(
            "{:#04x}: UID {:02X?} (checksum {:#06x})",
            *assignment.address,
            assignment.uid.as_slice(),
            uid_checksum(&assignment.uid)
        );
    }
    Ok(())
}

fn cmd_read(args: &mut CmdScanner<'_>, bus: &mut Master<SerialTransport>) -> Result<()> {
    let data = bus.read_bytes(
        args.parse_next::<u8>()?,
        args.parse_next::<u8>()?,
        args.parse_next::<u8>()?,
    )?;
    println!("{:02X?}", data.as_slice());
    Ok(())
}

fn cmd_write(args: &mut CmdScanner<'_>, bus: &mut Master<SerialTransport>) -> Result<()> {
    let address: u8 = args.parse_next()?;
    let start_reg: u8 = args.parse_next()?;
    let mut data = Vec::new();
    while args.has_next() {
        data.push(args.parse_next::<u8>()?);
    }
    bus.write_bytes(address, start_reg, &data)?;
    Ok(())
}

fn cmd_trigger(args: &mut CmdScanner<'_>, bus: &mut Master<SerialTransport>) -> Result<()> {
    bus.trigger_measurement(args.parse_or(0u8)?)?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args();
    args.next(); // Skip program name
    let port = args.next().unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let baud_rate = match args.next() {
        Some(baud) => baud.parse().context("Invalid baud rate")?,
        None => 115_200,
    };

    let mut bus = Master::new(SerialTransport::open(&port, baud_rate)?);
    let mut stdout = std::io::stdout();
    loop {
        print!(">> ");
        stdout.flush()?;
        let mut cmd = String::new();
        if std::io::stdin().read_line(&mut cmd)? == 0 {
            return Ok(());
        }
        let mut scan = CmdScanner::new(&cmd);
        if let Err(err) = match scan.next() {
            Err(_) => continue,
            Ok("scan") | Ok("s") => cmd_scan(&mut scan, &mut bus),
            Ok("read") | Ok("r") => cmd_read(&mut scan, &mut bus),
            Ok("write") | Ok("w") => cmd_write(&mut scan, &mut bus),
            Ok("trigger") | Ok("t") => cmd_trigger(&mut scan, &mut bus),
            Ok("quit") | Ok("q") => return Ok(()),
            Ok(cmd) => {
                println!("Unknown command {}", cmd);
                continue;
            }
        } {
            println!("{:#}", err)
        }
    }
}

/// Splits a command line into numbers, accepting a `0x` prefix for hex.
struct CmdScanner<'a> {
    splt: Peekable<SplitWhitespace<'a>>,
}

impl<'a> CmdScanner<'a> {
    fn new(line: &'a str) -> Self {
        let splt = line.split_whitespace().peekable();
        Self { splt }
    }
    fn next(&mut self) -> Result<&'a str> {
        self.splt.next().context("End of stream")
    }
    fn has_next(&mut self) -> bool {
        self.splt.peek().is_some()
    }
    fn parse_next<T: FromStr + FromHex>(&mut self) -> Result<T> {
        let token = self.next()?;
        match token.strip_prefix("0x") {
            Some(hex) => T::from_hex(hex),
            None => token.parse::<T>().ok(),
        }
        .with_context(|| format!("Parse error: {}", token))
    }
    fn parse_or<T: FromStr + FromHex>(&mut self, default: T) -> Result<T> {
        if self.has_next() {
            self.parse_next()
        } else {
            Ok(default)
        }
    }
}

trait FromHex: Sized {
    fn from_hex(s: &str) -> Option<Self>;
}

impl FromHex for u8 {
    fn from_hex(s: &str) -> Option<Self> {
        u8::from_str_radix(s, 16).ok()
    }
}

impl FromHex for u16 {
    fn from_hex(s: &str) -> Option<Self> {
        u16::from_str_radix(s, 16).ok()
    }
}

impl FromHex for usize {
    fn from_hex(s: &str) -> Option<Self> {
        usize::from_str_radix(s, 16).ok()
    }
}
