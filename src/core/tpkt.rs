use crate::model::data::{Message, Trame, U16};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use crate::model::link::{Link, ReadStatus};
use std::io::{Cursor, Read, Write};

/// TPKT action header
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum Action {
    FastPathActionFastPath = 0x0,
    FastPathActionX224 = 0x3,
}

/// Minimum valid total length of a TPKT unit
/// version + reserved + length + the smallest X224 payload
pub const TPKT_MIN_LENGTH: usize = 7;
/// TPKT header size on the wire
pub const TPKT_HEADER_LENGTH: usize = 4;
/// Minimum valid total length of a fast-path unit
pub const FASTPATH_MIN_LENGTH: usize = 3;
/// Fragmentation safe ceiling for outgoing fast-path units
pub const FASTPATH_MAX_SAFE_LENGTH: u16 = 0x3F80;

/// A logically complete unit delivered by the transport
///
/// Raw payloads are slow path (X224 framed) or, in NLA mode,
/// a whole DER encoded TSRequest. FastPath carries the
/// security flags from the header byte
pub enum Payload {
    Raw(Cursor<Vec<u8>>),
    FastPath(u8, Cursor<Vec<u8>>),
}

impl Payload {
    /// Reset the read cursor to the start of the unit
    ///
    /// Used by the state machine when a handler asks for the
    /// same input to be parsed again from its start position
    pub fn rewind(&mut self) {
        match self {
            Payload::Raw(cursor) => cursor.set_position(0),
            Payload::FastPath(_, cursor) => cursor.set_position(0),
        }
    }
}

/// Encode a fast-path length using the one or two byte form
///
/// Lengths above 0x7F need the two byte form with the high
/// bit of the first byte set
pub fn write_fastpath_length(length: u16, s: &mut dyn Write) -> RdpResult<()> {
    if length > 0x7F {
        if length > 0x7FFF {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                "fast-path length overflow",
            )));
        }
        U16::BE(length | 0x8000).write(s)?;
    } else {
        (length as u8).write(s)?;
    }
    Ok(())
}

/// Decode a fast-path length prefix, returning the length and
/// the number of bytes the prefix occupied
pub fn read_fastpath_length(s: &mut dyn Read) -> RdpResult<(u16, usize)> {
    let mut length1: u8 = 0;
    length1.read(s)?;
    if length1 & 0x80 != 0 {
        let mut length2: u8 = 0;
        length2.read(s)?;
        Ok((((length1 as u16 & !0x80) << 8) + length2 as u16, 2))
    } else {
        Ok((length1 as u16, 1))
    }
}

/// Reusable byte buffers for inbound units
///
/// Buffers are checked out by the active read operation and
/// given back once the unit has been sealed and copied out
struct BufferPool {
    free: Vec<Vec<u8>>,
}

impl BufferPool {
    fn new() -> Self {
        BufferPool { free: Vec::new() }
    }

    fn check_out(&mut self) -> Vec<u8> {
        self.free.pop().unwrap_or_default()
    }

    fn release(&mut self, mut buffer: Vec<u8>) {
        buffer.clear();
        if self.free.len() < 4 {
            self.free.push(buffer);
        }
    }
}

/// Wire format of the unit currently being read
#[derive(Copy, Clone, Eq, PartialEq)]
enum FrameKind {
    Tpkt,
    FastPath { sec_flags: u8 },
    Nla,
}

/// In flight accumulation state of one unit
///
/// A unit survives across read_pdu calls when the layer
/// reports no data yet, so a fragmented delivery never
/// loses partial progress
struct PendingPdu {
    data: Vec<u8>,
    filled: usize,
    target: usize,
    kind: Option<FrameKind>,
    header_length: usize,
}

/// The PDU layer over a link
///
/// It delivers logically complete units to callers whatever
/// the number of underlying stream reads, and classifies each
/// unit as TPKT, fast-path or, when NLA mode is active, a DER
/// encoded message
pub struct Client<S> {
    transport: Link<S>,
    pool: BufferPool,
    pending: Option<PendingPdu>,
    nla_mode: bool,
}

impl<S: Read + Write> Client<S> {
    pub fn new(transport: Link<S>) -> Self {
        Client {
            transport,
            pool: BufferPool::new(),
            pending: None,
            nla_mode: false,
        }
    }

    /// While NLA mode is active inbound units are classified
    /// as DER messages instead of TPKT or fast-path
    pub fn set_nla_mode(&mut self, enabled: bool) {
        self.nla_mode = enabled;
    }

    /// Access to the underlying link, used during protocol
    /// upgrades (TLS start and NLA)
    pub fn get_link(&mut self) -> &mut Link<S> {
        &mut self.transport
    }

    pub fn into_link(self) -> Link<S> {
        self.transport
    }

    /// Send a message wrapped into a TPKT header
    ///
    /// # Example
    /// ```
    /// # #[macro_use]
    /// # extern crate rdp;
    /// # use rdp::core::tpkt;
    /// # use rdp::model::link::{Link, Stream};
    /// # use rdp::model::data::{U16, Trame};
    /// # use std::io::Cursor;
    /// # fn main() {
    ///     let mut tpkt = tpkt::Client::new(Link::new(Stream::Raw(Cursor::new(vec![]))));
    ///     tpkt.write(trame![U16::BE(4)]).unwrap();
    /// # }
    /// ```
    pub fn write<T: 'static + Message>(&mut self, message: T) -> RdpResult<()> {
        self.transport.write_msg(&trame![
            Action::FastPathActionX224 as u8,
            0_u8,
            U16::BE(message.length() as u16 + 4),
            message
        ])
    }

    /// Send a fast-path unit with the given security flags
    pub fn write_fast_path(&mut self, sec_flags: u8, payload: Vec<u8>) -> RdpResult<()> {
        let header_length = if payload.len() + 2 > 0x7F { 3 } else { 2 };
        let total = (payload.len() + header_length) as u16;
        let mut buffer = Cursor::new(Vec::with_capacity(total as usize));
        ((Action::FastPathActionFastPath as u8) | (sec_flags << 6)).write(&mut buffer)?;
        write_fastpath_length(total, &mut buffer)?;
        payload.write(&mut buffer)?;
        self.transport.write(buffer.into_inner().as_slice())
    }

    /// Read one logically complete unit
    ///
    /// Returns None when the layer has no complete unit yet in
    /// non blocking mode. On success the unit is sealed and the
    /// read position is at its start.
    pub fn read_pdu(&mut self) -> RdpResult<Option<Payload>> {
        loop {
            let mut pending = match self.pending.take() {
                Some(p) => p,
                None => PendingPdu {
                    data: self.pool.check_out(),
                    filled: 0,
                    target: 1,
                    kind: None,
                    header_length: 0,
                },
            };

            if pending.data.len() < pending.target {
                pending.data.resize(pending.target, 0);
            }

            let status = self
                .transport
                .fill(&mut pending.data[..pending.target], &mut pending.filled);
            match status {
                Ok(ReadStatus::Pending) => {
                    self.pending = Some(pending);
                    return Ok(None);
                }
                Ok(ReadStatus::Complete) => (),
                Err(e) => {
                    self.pool.release(pending.data);
                    return Err(e);
                }
            }

            if pending.kind.is_none() {
                if let Err(e) = self.classify(&mut pending) {
                    self.pool.release(pending.data);
                    return Err(e);
                }
                if pending.kind.is_some() && pending.filled == pending.target {
                    // a unit made only of its header, seal it now
                    return Ok(Some(self.seal(pending)));
                }
                self.pending = Some(pending);
                continue;
            }

            return Ok(Some(self.seal(pending)));
        }
    }

    /// Blocking counterpart of read_pdu
    pub fn read(&mut self) -> RdpResult<Payload> {
        loop {
            if let Some(payload) = self.read_pdu()? {
                return Ok(payload);
            }
        }
    }

    /// Inspect the buffered prefix and compute how many bytes
    /// the whole unit occupies
    fn classify(&mut self, pending: &mut PendingPdu) -> RdpResult<()> {
        let first = pending.data[0];

        if self.nla_mode {
            if first != 0x30 {
                return Err(Error::RdpError(RdpError::new(
                    RdpErrorKind::InvalidData,
                    "NLA unit without a DER sequence header",
                )));
            }
            // DER definite length: short form or long form on
            // one or two extra bytes
            if pending.filled < 2 {
                pending.target = 2;
                return Ok(());
            }
            let length_octet = pending.data[1];
            let (header, length) = match length_octet {
                0x81 => {
                    if pending.filled < 3 {
                        pending.target = 3;
                        return Ok(());
                    }
                    (3, pending.data[2] as usize)
                }
                0x82 => {
                    if pending.filled < 4 {
                        pending.target = 4;
                        return Ok(());
                    }
                    (4, ((pending.data[2] as usize) << 8) + pending.data[3] as usize)
                }
                x if x < 0x80 => (2, x as usize),
                _ => {
                    return Err(Error::RdpError(RdpError::new(
                        RdpErrorKind::InvalidSize,
                        "unhandled DER length form",
                    )))
                }
            };
            pending.kind = Some(FrameKind::Nla);
            pending.header_length = 0;
            pending.target = header + length;
            return Ok(());
        }

        if first & 0x3 == Action::FastPathActionX224 as u8 {
            if pending.filled < TPKT_HEADER_LENGTH {
                pending.target = TPKT_HEADER_LENGTH;
                return Ok(());
            }
            let total =
                (((pending.data[2] as usize) << 8) + pending.data[3] as usize) as usize;
            if total < TPKT_MIN_LENGTH {
                return Err(Error::RdpError(RdpError::new(
                    RdpErrorKind::InvalidSize,
                    "TPKT length below the minimal unit size",
                )));
            }
            pending.kind = Some(FrameKind::Tpkt);
            pending.header_length = TPKT_HEADER_LENGTH;
            pending.target = total;
            return Ok(());
        }

        // fast-path unit
        let sec_flags = (first >> 6) & 0x3;
        if pending.filled < 2 {
            pending.target = 2;
            return Ok(());
        }
        let length1 = pending.data[1];
        let (header, total) = if length1 & 0x80 != 0 {
            if pending.filled < 3 {
                pending.target = 3;
                return Ok(());
            }
            (
                3,
                (((length1 as usize) & !0x80) << 8) + pending.data[2] as usize,
            )
        } else {
            (2, length1 as usize)
        };
        if total < FASTPATH_MIN_LENGTH || total < header {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                "fast-path length below the minimal unit size",
            )));
        }
        pending.kind = Some(FrameKind::FastPath { sec_flags });
        pending.header_length = header;
        pending.target = total;
        Ok(())
    }

    /// Freeze a fully buffered unit and hand it to the caller
    /// with its position reset to zero
    fn seal(&mut self, pending: PendingPdu) -> Payload {
        let body = pending.data[pending.header_length..pending.target].to_vec();
        let kind = pending.kind;
        self.pool.release(pending.data);
        match kind {
            Some(FrameKind::FastPath { sec_flags }) => {
                Payload::FastPath(sec_flags, Cursor::new(body))
            }
            // NLA units keep their DER header, the TSRequest
            // decoder consumes the whole message
            _ => Payload::Raw(Cursor::new(body)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::link::Stream;

    fn client_from(data: Vec<u8>) -> Client<Cursor<Vec<u8>>> {
        Client::new(Link::new(Stream::Raw(Cursor::new(data))))
    }

    #[test]
    fn test_read_tpkt_exact_length() {
        // total length 7: header plus three payload bytes
        let mut tpkt = client_from(vec![3, 0, 0, 7, 4, 5, 6]);
        match tpkt.read().unwrap() {
            Payload::Raw(cursor) => assert_eq!(cursor.into_inner(), [4, 5, 6]),
            _ => panic!("expected slow path unit"),
        }
    }

    #[test]
    fn test_read_tpkt_truncated_is_incomplete() {
        let mut tpkt = client_from(vec![3, 0, 0, 8, 4, 5, 6]);
        // one missing byte means end of stream before the unit completes
        assert!(tpkt.read().is_err());
    }

    #[test]
    fn test_read_tpkt_invalid_length() {
        let mut tpkt = client_from(vec![3, 0, 0, 6, 4, 5]);
        assert!(tpkt.read().is_err());
    }

    #[test]
    fn test_read_fastpath_short_form() {
        let mut tpkt = client_from(vec![0x00, 0x05, 1, 2, 3]);
        match tpkt.read().unwrap() {
            Payload::FastPath(flags, cursor) => {
                assert_eq!(flags, 0);
                assert_eq!(cursor.into_inner(), [1, 2, 3]);
            }
            _ => panic!("expected fast path unit"),
        }
    }

    #[test]
    fn test_read_fastpath_long_form() {
        let mut payload = vec![0x80, 0x81, 0x84];
        payload.extend_from_slice(&vec![0_u8; 0x181]);
        let mut tpkt = client_from(payload);
        match tpkt.read().unwrap() {
            Payload::FastPath(flags, cursor) => {
                assert_eq!(flags, 2);
                assert_eq!(cursor.into_inner().len(), 0x181);
            }
            _ => panic!("expected fast path unit"),
        }
    }

    #[test]
    fn test_read_fastpath_below_minimum_is_rejected() {
        // header claims a total length of 2 with no payload byte
        let mut tpkt = client_from(vec![0x00, 0x02]);
        assert!(tpkt.read().is_err());
    }

    #[test]
    fn test_fastpath_length_round_trip() {
        for length in [3_u16, 0x7F, 0x80, 0x1234, 0x3FFF, 0x7FFF] {
            let mut buffer = Cursor::new(Vec::new());
            write_fastpath_length(length, &mut buffer).unwrap();
            buffer.set_position(0);
            let (decoded, _) = read_fastpath_length(&mut buffer).unwrap();
            assert_eq!(decoded, length);
        }
    }

    #[test]
    fn test_read_nla_der_message() {
        let mut tpkt = client_from(vec![0x30, 0x03, 1, 2, 3, 0xFF]);
        tpkt.set_nla_mode(true);
        match tpkt.read().unwrap() {
            Payload::Raw(cursor) => assert_eq!(cursor.into_inner(), [0x30, 0x03, 1, 2, 3]),
            _ => panic!("expected raw unit"),
        }
    }

    #[test]
    fn test_write_tpkt_header() {
        let mut tpkt = client_from(vec![]);
        tpkt.write(trame![U16::BE(4)]).unwrap();
        if let Stream::Raw(cursor) = tpkt.into_link().get_stream() {
            assert_eq!(cursor.into_inner(), [3, 0, 0, 6, 0, 4]);
        } else {
            panic!("expected raw stream")
        }
    }
}
