use crate::model::data::{Message, Trame, U16, U32};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use std::io::{Read, Write};

/// PER length prefix
///
/// Lengths beyond 0x7F are encoded on two bytes
/// with the high bit of the first byte set
pub fn write_length(length: u16, s: &mut dyn Write) -> RdpResult<()> {
    if length > 0x7f {
        U16::BE(length | 0x8000).write(s)?;
    } else {
        (length as u8).write(s)?;
    }
    Ok(())
}

/// Read a PER length prefix in its one or two byte form
pub fn read_length(s: &mut dyn Read) -> RdpResult<u16> {
    let mut byte: u8 = 0;
    byte.read(s)?;
    if byte & 0x80 != 0 {
        let mut least: u8 = 0;
        least.read(s)?;
        Ok(((byte as u16 & !0x80) << 8) + least as u16)
    } else {
        Ok(byte as u16)
    }
}

/// PER choice is a raw byte
pub fn write_choice(choice: u8, s: &mut dyn Write) -> RdpResult<()> {
    choice.write(s)?;
    Ok(())
}

pub fn read_choice(s: &mut dyn Read) -> RdpResult<u8> {
    let mut choice: u8 = 0;
    choice.read(s)?;
    Ok(choice)
}

/// Constrained integer with explicit minimum, two bytes wide
pub fn write_integer16(integer: u16, minimum: u16, s: &mut dyn Write) -> RdpResult<()> {
    U16::BE(integer - minimum).write(s)?;
    Ok(())
}

pub fn read_integer16(minimum: u16, s: &mut dyn Read) -> RdpResult<u16> {
    let mut result = U16::BE(0);
    result.read(s)?;
    Ok(result.inner() + minimum)
}

/// Unconstrained integer announced by a length prefix
pub fn write_integer(integer: u32, s: &mut dyn Write) -> RdpResult<()> {
    if integer <= 0xFF {
        write_length(1, s)?;
        (integer as u8).write(s)?;
    } else if integer <= 0xFFFF {
        write_length(2, s)?;
        U16::BE(integer as u16).write(s)?;
    } else {
        write_length(4, s)?;
        U32::BE(integer).write(s)?;
    }
    Ok(())
}

pub fn read_integer(s: &mut dyn Read) -> RdpResult<u32> {
    let size = read_length(s)?;
    match size {
        1 => {
            let mut result: u8 = 0;
            result.read(s)?;
            Ok(result as u32)
        }
        2 => {
            let mut result = U16::BE(0);
            result.read(s)?;
            Ok(result.inner() as u32)
        }
        4 => {
            let mut result = U32::BE(0);
            result.read(s)?;
            Ok(result.inner())
        }
        _ => Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidSize,
            "PER integer with an invalid size",
        ))),
    }
}

/// PER selection bitmask, a raw byte
pub fn write_selection(selection: u8, s: &mut dyn Write) -> RdpResult<()> {
    selection.write(s)?;
    Ok(())
}

pub fn read_selection(s: &mut dyn Read) -> RdpResult<u8> {
    let mut selection: u8 = 0;
    selection.read(s)?;
    Ok(selection)
}

/// PER number of set, a raw byte
pub fn write_number_of_set(number: u8, s: &mut dyn Write) -> RdpResult<()> {
    number.write(s)?;
    Ok(())
}

pub fn read_number_of_set(s: &mut dyn Read) -> RdpResult<u8> {
    let mut number: u8 = 0;
    number.read(s)?;
    Ok(number)
}

pub fn write_enumerates(enumerate: u8, s: &mut dyn Write) -> RdpResult<()> {
    enumerate.write(s)?;
    Ok(())
}

pub fn read_enumerates(s: &mut dyn Read) -> RdpResult<u8> {
    let mut enumerate: u8 = 0;
    enumerate.read(s)?;
    Ok(enumerate)
}

/// Object identifier in the packed form used by T.124
pub fn write_object_identifier(oid: &[u8], s: &mut dyn Write) -> RdpResult<()> {
    if oid.len() != 6 {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidSize,
            "PER object identifier of unexpected length",
        )));
    }
    let mut raw: Trame = trame![5_u8, (oid[0] << 4) | (oid[1] & 0xF)];
    for i in &oid[2..] {
        raw.push(Box::new(*i));
    }
    raw.write(s)?;
    Ok(())
}

/// Check that the object identifier read from the stream
/// matches the expected one
pub fn read_object_identifier(oid: &[u8], s: &mut dyn Read) -> RdpResult<bool> {
    if oid.len() != 6 {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidSize,
            "PER object identifier of unexpected length",
        )));
    }
    let length = read_length(s)?;
    if length != 5 {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidSize,
            "PER object identifier of unexpected length",
        )));
    }

    let mut raw = [0_u8; 5];
    s.read_exact(&mut raw)?;

    let mut checked = [0_u8; 6];
    checked[0] = raw[0] >> 4;
    checked[1] = raw[0] & 0xF;
    checked[2..].copy_from_slice(&raw[1..]);

    Ok(checked == oid)
}

pub fn write_numeric_string(string: &[u8], minimum: usize, s: &mut dyn Write) -> RdpResult<()> {
    let mut length = string.len();
    if length >= minimum {
        length -= minimum;
    }
    write_length(length as u16, s)?;
    for i in 0..string.len() {
        let c1 = string[i];
        let c2 = if i + 1 < string.len() {
            string[i + 1]
        } else {
            0x30
        };
        if i % 2 == 0 {
            (((c1 - 0x30) << 4) | (c2 - 0x30)).write(s)?;
        }
    }
    Ok(())
}

pub fn read_numeric_string(minimum: usize, s: &mut dyn Read) -> RdpResult<()> {
    let length = read_length(s)?;
    let mut buffer = vec![0; (length as usize + minimum + 1) / 2];
    s.read_exact(&mut buffer)?;
    Ok(())
}

pub fn write_padding(length: usize, s: &mut dyn Write) -> RdpResult<()> {
    vec![0_u8; length].write(s)?;
    Ok(())
}

pub fn read_padding(length: usize, s: &mut dyn Read) -> RdpResult<()> {
    let mut buffer = vec![0; length];
    s.read_exact(&mut buffer)?;
    Ok(())
}

pub fn write_octet_stream(octet_string: &[u8], minimum: usize, s: &mut dyn Write) -> RdpResult<()> {
    let mut length = 0;
    if octet_string.len() >= minimum {
        length = octet_string.len() - minimum;
    }
    write_length(length as u16, s)?;
    octet_string.to_vec().write(s)?;
    Ok(())
}

/// Check that the octet stream read from the stream matches
/// the expected one
pub fn read_octet_stream(
    octet_stream: &[u8],
    minimum: usize,
    s: &mut dyn Read,
) -> RdpResult<()> {
    let length = read_length(s)? as usize + minimum;
    if length != octet_stream.len() {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidSize,
            "PER octet stream of unexpected length",
        )));
    }
    let mut buffer = vec![0; length];
    s.read_exact(&mut buffer)?;
    if buffer != octet_stream {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidConst,
            "PER octet stream of unexpected content",
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_length_one_byte() {
        let mut buffer = Cursor::new(Vec::new());
        write_length(0x10, &mut buffer).unwrap();
        assert_eq!(buffer.get_ref().as_slice(), [0x10]);
        buffer.set_position(0);
        assert_eq!(read_length(&mut buffer).unwrap(), 0x10);
    }

    #[test]
    fn test_length_two_bytes() {
        let mut buffer = Cursor::new(Vec::new());
        write_length(0x110, &mut buffer).unwrap();
        assert_eq!(buffer.get_ref().as_slice(), [0x81, 0x10]);
        buffer.set_position(0);
        assert_eq!(read_length(&mut buffer).unwrap(), 0x110);
    }

    #[test]
    fn test_integer16_minimum() {
        let mut buffer = Cursor::new(Vec::new());
        write_integer16(1005, 1001, &mut buffer).unwrap();
        assert_eq!(buffer.get_ref().as_slice(), [0, 4]);
        buffer.set_position(0);
        assert_eq!(read_integer16(1001, &mut buffer).unwrap(), 1005);
    }

    #[test]
    fn test_object_identifier_round_trip() {
        let t124 = [0, 0, 20, 124, 0, 1];
        let mut buffer = Cursor::new(Vec::new());
        write_object_identifier(&t124, &mut buffer).unwrap();
        buffer.set_position(0);
        assert!(read_object_identifier(&t124, &mut buffer).unwrap());
    }

    #[test]
    fn test_integer_sizes() {
        for value in [0x7f_u32, 0x1234, 0x12345678] {
            let mut buffer = Cursor::new(Vec::new());
            write_integer(value, &mut buffer).unwrap();
            buffer.set_position(0);
            assert_eq!(read_integer(&mut buffer).unwrap(), value);
        }
    }
}
