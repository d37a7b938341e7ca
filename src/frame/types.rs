//! CQL binary protocol in-wire types.

use super::frame_errors::ParseError;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::net::{IpAddr, SocketAddr};
use std::str;
use uuid::Uuid;

/// A consistency level requested for a statement.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    #[default]
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    Serial = 0x0008,
    LocalSerial = 0x0009,
    LocalOne = 0x000A,
}

impl Consistency {
    pub fn is_serial(&self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }
}

impl TryFrom<u16> for Consistency {
    type Error = ParseError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Consistency::Any),
            0x0001 => Ok(Consistency::One),
            0x0002 => Ok(Consistency::Two),
            0x0003 => Ok(Consistency::Three),
            0x0004 => Ok(Consistency::Quorum),
            0x0005 => Ok(Consistency::All),
            0x0006 => Ok(Consistency::LocalQuorum),
            0x0007 => Ok(Consistency::EachQuorum),
            0x0008 => Ok(Consistency::Serial),
            0x0009 => Ok(Consistency::LocalSerial),
            0x000A => Ok(Consistency::LocalOne),
            _ => Err(ParseError::BadIncomingData(format!(
                "unknown consistency: {:#06x}",
                value
            ))),
        }
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Consistency of the serial phase of a lightweight transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i16)]
pub enum SerialConsistency {
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

impl TryFrom<i16> for SerialConsistency {
    type Error = ParseError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0x0008 => Ok(SerialConsistency::Serial),
            0x0009 => Ok(SerialConsistency::LocalSerial),
            _ => Err(ParseError::BadIncomingData(format!(
                "unknown serial consistency: {:#06x}",
                value
            ))),
        }
    }
}

impl std::fmt::Display for SerialConsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub fn read_raw_bytes<'a>(count: usize, buf: &mut &'a [u8]) -> Result<&'a [u8], ParseError> {
    if buf.len() < count {
        return Err(ParseError::BadIncomingData(format!(
            "not enough bytes! expected: {}, received: {}",
            count,
            buf.len(),
        )));
    }
    let (ret, rest) = buf.split_at(count);
    *buf = rest;
    Ok(ret)
}

pub fn read_u8(buf: &mut &[u8]) -> Result<u8, ParseError> {
    Ok(buf.read_u8()?)
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, ParseError> {
    Ok(buf.read_i32::<BigEndian>()?)
}

pub fn read_int_length(buf: &mut &[u8]) -> Result<usize, ParseError> {
    let len = read_int(buf)?;
    usize::try_from(len).map_err(|_| {
        ParseError::BadIncomingData(format!("invalid negative length: {}", len))
    })
}

pub fn read_long(buf: &mut &[u8]) -> Result<i64, ParseError> {
    Ok(buf.read_i64::<BigEndian>()?)
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, ParseError> {
    Ok(buf.read_u16::<BigEndian>()?)
}

pub fn read_short_length(buf: &mut &[u8]) -> Result<usize, ParseError> {
    Ok(read_short(buf)?.into())
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, ParseError> {
    let len = read_short_length(buf)?;
    let raw = read_raw_bytes(len, buf)?;
    str::from_utf8(raw)
        .map_err(|err| ParseError::BadIncomingData(format!("invalid utf8 string: {}", err)))
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, ParseError> {
    let len = read_int_length(buf)?;
    let raw = read_raw_bytes(len, buf)?;
    str::from_utf8(raw)
        .map_err(|err| ParseError::BadIncomingData(format!("invalid utf8 string: {}", err)))
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, ParseError> {
    let len = read_short_length(buf)?;
    let mut result = Vec::with_capacity(len);
    for _ in 0..len {
        result.push(read_string(buf)?.to_owned());
    }
    Ok(result)
}

pub fn read_string_map(buf: &mut &[u8]) -> Result<HashMap<String, String>, ParseError> {
    let len = read_short_length(buf)?;
    let mut result = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string(buf)?.to_owned();
        result.insert(key, val);
    }
    Ok(result)
}

pub fn read_string_multimap(buf: &mut &[u8]) -> Result<HashMap<String, Vec<String>>, ParseError> {
    let len = read_short_length(buf)?;
    let mut result = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string_list(buf)?;
        result.insert(key, val);
    }
    Ok(result)
}

pub fn read_bytes_opt<'a>(buf: &mut &'a [u8]) -> Result<Option<&'a [u8]>, ParseError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let raw = read_raw_bytes(len as usize, buf)?;
    Ok(Some(raw))
}

pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], ParseError> {
    let len = read_int_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], ParseError> {
    let len = read_short_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, ParseError> {
    let raw = read_raw_bytes(16, buf)?;
    Uuid::from_slice(raw)
        .map_err(|err| ParseError::BadIncomingData(format!("invalid uuid: {}", err)))
}

pub fn read_inet(buf: &mut &[u8]) -> Result<SocketAddr, ParseError> {
    let len = read_u8(buf)?;
    let ip: IpAddr = match len {
        4 => {
            let raw: [u8; 4] = read_raw_bytes(4, buf)?.try_into().unwrap();
            IpAddr::from(raw)
        }
        16 => {
            let raw: [u8; 16] = read_raw_bytes(16, buf)?.try_into().unwrap();
            IpAddr::from(raw)
        }
        v => {
            return Err(ParseError::BadIncomingData(format!(
                "invalid inet length: {}",
                v
            )))
        }
    };
    let port = read_int(buf)?;

    Ok(SocketAddr::new(ip, port as u16))
}

pub fn read_consistency(buf: &mut &[u8]) -> Result<Consistency, ParseError> {
    Consistency::try_from(read_short(buf)?)
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub fn write_long(v: i64, buf: &mut impl BufMut) {
    buf.put_i64(v);
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

fn checked_short(len: usize) -> Result<u16, ParseError> {
    u16::try_from(len)
        .map_err(|_| ParseError::BadDataToSerialize(format!("length too big for short: {}", len)))
}

fn checked_int(len: usize) -> Result<i32, ParseError> {
    i32::try_from(len)
        .map_err(|_| ParseError::BadDataToSerialize(format!("length too big for int: {}", len)))
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_short(checked_short(v.len())?, buf);
    buf.put_slice(v.as_bytes());
    Ok(())
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_int(checked_int(v.len())?, buf);
    buf.put_slice(v.as_bytes());
    Ok(())
}

pub fn write_string_list(v: &[String], buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_short(checked_short(v.len())?, buf);
    for s in v {
        write_string(s, buf)?;
    }
    Ok(())
}

pub fn write_string_map(v: &HashMap<String, String>, buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_short(checked_short(v.len())?, buf);
    for (key, val) in v {
        write_string(key, buf)?;
        write_string(val, buf)?;
    }
    Ok(())
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_int(checked_int(v.len())?, buf);
    buf.put_slice(v);
    Ok(())
}

pub fn write_bytes_opt(v: Option<&[u8]>, buf: &mut impl BufMut) -> Result<(), ParseError> {
    match v {
        Some(bytes) => write_bytes(bytes, buf),
        None => {
            write_int(-1, buf);
            Ok(())
        }
    }
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_short(checked_short(v.len())?, buf);
    buf.put_slice(v);
    Ok(())
}

pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn write_serial_consistency(c: SerialConsistency, buf: &mut impl BufMut) {
    write_short(c as i16 as u16, buf);
}
