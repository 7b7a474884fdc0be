use nom::combinator::all_consuming;
use nom::multi::length_data;
use nom::number::complete::u8;
use nom::sequence::tuple;
use nom::IResult;

use crate::types::{Address, Command};

type Buf = [u8];

/// Outcome of matching a checksum-verified response against what the request asked for.
#[derive(PartialEq, Copy, Clone, Debug)]
pub(crate) enum ResponseToken<'a> {
    /// Payload of a well formed response.
    Data(&'a Buf),
    /// Response is well formed but doesn't answer our request.
    Mismatch(&'static str),
}

/// `frame` without its trailing checksum. Callers verify the checksum first.
fn body(frame: &Buf) -> &Buf {
    &frame[..frame.len().saturating_sub(2)]
}

fn header(buf: &Buf) -> IResult<&Buf, (u8, u8)> {
    tuple((u8, u8))(buf)
}

fn count_prefixed_data(buf: &Buf) -> IResult<&Buf, &Buf> {
    all_consuming(length_data(u8))(buf)
}

/// `[address] [0x50] [length] [data; length]`
pub(crate) fn parse_read_response(frame: &Buf, address: Address, length: u8) -> ResponseToken<'_> {
    let (buf, (received_address, command)) = match header(body(frame)) {
        Ok(x) => x,
        Err(_) => return ResponseToken::Mismatch("truncated header"),
    };
    if received_address != *address {
        return ResponseToken::Mismatch("address");
    }
    if command != Command::ReadBytes.code() {
        return ResponseToken::Mismatch("command");
    }
    match buf.first() {
        Some(count) if *count == length => {}
        _ => return ResponseToken::Mismatch("length"),
    }
    match count_prefixed_data(buf) {
        Ok((_, data)) => ResponseToken::Data(data),
        Err(_) => ResponseToken::Mismatch("frame length"),
    }
}

/// `[address] [0x61] [uid; uid_length]`. Any responder address is accepted,
/// unassigned nodes don't have one of their own.
pub(crate) fn parse_uid_response(frame: &Buf, uid_length: u8) -> ResponseToken<'_> {
    if frame.len() != 2 + uid_length as usize + 2 {
        return ResponseToken::Mismatch("frame length");
    }
    match header(body(frame)) {
        Ok((uid, (_, command))) if command == Command::ReportUid.code() => ResponseToken::Data(uid),
        Ok(_) => ResponseToken::Mismatch("command"),
        Err(_) => ResponseToken::Mismatch("truncated header"),
    }
}
