use crate::core::tpkt;
use crate::model::data::{Check, Component, DataType, Message, Trame, U16, U32};
use crate::model::error::{
    Error, ProtocolNegFailureCode, RdpError, RdpErrorKind, RdpResult,
};
use std::io::{Cursor, Read, Write};

/// TPDU message code
#[derive(Copy, Clone)]
pub enum MessageType {
    X224TPDUConnectionRequest = 0xE0,
    X224TPDUConnectionConfirm = 0xD0,
    X224TPDUDisconnectRequest = 0x80,
    X224TPDUData = 0xF0,
    X224TPDUError = 0x70,
}

/// Negotiation header of the RDP negotiation sub protocol
#[derive(Copy, Clone)]
pub enum NegotiationType {
    /// Negotiation Request
    /// Send from client to server
    TypeRDPNegReq = 0x01,
    /// Negotiation Response
    /// Send from server to client
    TypeRDPNegRsp = 0x02,
    /// Negotiation failure
    /// Send when security level are not expected
    /// Server ask for NLA and client doesn't support it
    TypeRDPNegFailure = 0x03,
}

/// Security protocols negotiated during the X224 phase
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/902b090b-9cb3-4efc-92bf-ee13373371e3
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Protocols {
    ProtocolRDP = 0x00,
    ProtocolSSL = 0x01,
    ProtocolHybrid = 0x02,
    ProtocolHybridEx = 0x08,
}

impl Protocols {
    pub fn from_bits(bits: u32) -> RdpResult<Protocols> {
        match bits {
            0x00 => Ok(Protocols::ProtocolRDP),
            0x01 => Ok(Protocols::ProtocolSSL),
            0x02 => Ok(Protocols::ProtocolHybrid),
            0x08 => Ok(Protocols::ProtocolHybridEx),
            _ => Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidProtocol,
                "unknown security protocol selected by the server",
            ))),
        }
    }
}

/// RDP negotiation structure
/// shared by the request, response and failure forms
fn rdp_neg_req(neg_type: NegotiationType, result: u32, flag: u8) -> Component {
    component![
        "type" => neg_type as u8,
        "flag" => flag,
        "length" => Check::new(U16::LE(0x0008)),
        "result" => U32::LE(result)
    ]
}

/// X224 request header for the connection phase
fn x224_crq(len: u8, code: MessageType) -> Component {
    component![
        "len" => (len + 6) as u8,
        "code" => code as u8,
        "padding" => trame![U16::LE(0), U16::LE(0), 0_u8]
    ]
}

/// Header of an X224 data TPDU
fn x224_header() -> Component {
    component![
        "header" => 2_u8,
        "messageType" => Check::new(MessageType::X224TPDUData as u8),
        "separator" => Check::new(0x80_u8)
    ]
}

/// Send the client connection request with the routing cookie
/// and the list of security protocols the client supports
pub fn send_connection_request<S: Read + Write>(
    tpkt: &mut tpkt::Client<S>,
    protocols: u32,
    cookie: Option<&str>,
) -> RdpResult<()> {
    let cookie_trame = match cookie {
        Some(username) => format!("Cookie: mstshash={}\r\n", username).into_bytes(),
        None => Vec::new(),
    };
    let negotiation = rdp_neg_req(NegotiationType::TypeRDPNegReq, protocols, 0);
    tpkt.write(trame![
        x224_crq(
            (cookie_trame.len() + negotiation.length() as usize) as u8,
            MessageType::X224TPDUConnectionRequest
        ),
        cookie_trame,
        negotiation
    ])
}

/// Parse a connection confirm and return the protocol
/// selected by the server
///
/// A negotiation failure payload is mapped to a
/// ProtocolNegFailure error carrying the server failure code
pub fn parse_connection_confirm(stream: &mut dyn Read) -> RdpResult<Protocols> {
    let mut confirm = component![
        "len" => 0_u8,
        "code" => Check::new(MessageType::X224TPDUConnectionConfirm as u8),
        "padding" => trame![U16::LE(0), U16::LE(0), 0_u8],
        "negotiation" => rdp_neg_req(NegotiationType::TypeRDPNegRsp, 0, 0)
    ];
    confirm.read(stream)?;

    let negotiation = cast!(DataType::Component, confirm["negotiation"])?;
    let response_type = cast!(DataType::U8, negotiation["type"])?;
    let result = cast!(DataType::U32, negotiation["result"])?;

    if response_type == NegotiationType::TypeRDPNegFailure as u8 {
        let code = ProtocolNegFailureCode::from_code(result);
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::ProtocolNegFailure,
            &format!("negotiation failure: {}", code),
        )));
    }
    if response_type != NegotiationType::TypeRDPNegRsp as u8 {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidRespond,
            "unexpected negotiation response type",
        )));
    }
    Protocols::from_bits(result)
}

/// Connection request as seen by the accepting role
pub struct ConnectionRequest {
    pub requested_protocols: u32,
    pub cookie: Option<String>,
}

/// Parse the client connection request, server side
///
/// The optional routing cookie terminated by CR LF is carried
/// between the fixed header and the negotiation structure
pub fn parse_connection_request(stream: &mut Cursor<Vec<u8>>) -> RdpResult<ConnectionRequest> {
    let mut header = component![
        "len" => 0_u8,
        "code" => Check::new(MessageType::X224TPDUConnectionRequest as u8),
        "padding" => trame![U16::LE(0), U16::LE(0), 0_u8]
    ];
    header.read(stream)?;

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest)?;

    let mut cookie = None;
    let mut negotiation_start = 0;
    if rest.starts_with(b"Cookie:") {
        if let Some(end) = rest.windows(2).position(|w| w == b"\r\n") {
            cookie = Some(String::from_utf8_lossy(&rest[..end]).to_string());
            negotiation_start = end + 2;
        }
    }

    let mut requested_protocols = 0;
    if rest.len() > negotiation_start {
        let mut negotiation = rdp_neg_req(NegotiationType::TypeRDPNegReq, 0, 0);
        negotiation.read(&mut Cursor::new(rest[negotiation_start..].to_vec()))?;
        if cast!(DataType::U8, negotiation["type"])? != NegotiationType::TypeRDPNegReq as u8 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidRespond,
                "unexpected negotiation request type",
            )));
        }
        requested_protocols = cast!(DataType::U32, negotiation["result"])?;
    }

    Ok(ConnectionRequest {
        requested_protocols,
        cookie,
    })
}

/// Send a connection confirm carrying the selected protocol,
/// server side
pub fn send_connection_confirm<S: Read + Write>(
    tpkt: &mut tpkt::Client<S>,
    selected: Protocols,
) -> RdpResult<()> {
    let negotiation = rdp_neg_req(NegotiationType::TypeRDPNegRsp, selected as u32, 0);
    tpkt.write(trame![
        x224_crq(
            negotiation.length() as u8,
            MessageType::X224TPDUConnectionConfirm
        ),
        negotiation
    ])
}

/// Send a negotiation failure, server side
pub fn send_connection_failure<S: Read + Write>(
    tpkt: &mut tpkt::Client<S>,
    code: u32,
) -> RdpResult<()> {
    let negotiation = rdp_neg_req(NegotiationType::TypeRDPNegFailure, code, 0);
    tpkt.write(trame![
        x224_crq(
            negotiation.length() as u8,
            MessageType::X224TPDUConnectionConfirm
        ),
        negotiation
    ])
}

/// X224 data layer over the PDU transport
///
/// All slow path messages of the established connection are
/// wrapped into a three byte data TPDU header
pub struct Client<S> {
    transport: tpkt::Client<S>,
    pub selected_protocol: Protocols,
}

impl<S: Read + Write> Client<S> {
    pub fn new(transport: tpkt::Client<S>, selected_protocol: Protocols) -> Self {
        Client {
            transport,
            selected_protocol,
        }
    }

    /// Wrap a message into a data TPDU and send it
    pub fn write<T: 'static + Message>(&mut self, message: T) -> RdpResult<()> {
        self.transport.write(trame![x224_header(), message])
    }

    pub fn write_fast_path(&mut self, sec_flags: u8, payload: Vec<u8>) -> RdpResult<()> {
        self.transport.write_fast_path(sec_flags, payload)
    }

    /// Read one unit from the transport
    ///
    /// For slow path units the data TPDU header is consumed
    /// before the payload is handed back
    pub fn read_pdu(&mut self) -> RdpResult<Option<tpkt::Payload>> {
        match self.transport.read_pdu()? {
            None => Ok(None),
            Some(payload) => Ok(Some(self.strip_header(payload)?)),
        }
    }

    pub fn read(&mut self) -> RdpResult<tpkt::Payload> {
        let payload = self.transport.read()?;
        self.strip_header(payload)
    }

    /// Consume the data TPDU header of a slow path unit
    ///
    /// The header bytes are dropped from the unit so a later
    /// rewind lands on the start of the payload, not on the
    /// header again
    pub fn strip_header(&mut self, payload: tpkt::Payload) -> RdpResult<tpkt::Payload> {
        match payload {
            tpkt::Payload::Raw(mut cursor) => {
                let mut header = x224_header();
                header.read(&mut cursor)?;
                let position = cursor.position() as usize;
                let rest = cursor.into_inner().split_off(position);
                Ok(tpkt::Payload::Raw(Cursor::new(rest)))
            }
            fast_path => Ok(fast_path),
        }
    }

    pub fn get_transport(&mut self) -> &mut tpkt::Client<S> {
        &mut self.transport
    }

    pub fn into_transport(self) -> tpkt::Client<S> {
        self.transport
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::link::{Link, Stream};

    #[test]
    fn test_connection_request_format() {
        let mut tpkt = tpkt::Client::new(Link::new(Stream::Raw(Cursor::new(vec![]))));
        send_connection_request(&mut tpkt, Protocols::ProtocolSSL as u32, None).unwrap();
        if let Stream::Raw(cursor) = tpkt.into_link().get_stream() {
            assert_eq!(
                cursor.into_inner(),
                [3, 0, 0, 19, 14, 224, 0, 0, 0, 0, 0, 1, 0, 8, 0, 1, 0, 0, 0]
            );
        } else {
            panic!("expected raw stream")
        }
    }

    #[test]
    fn test_parse_connection_confirm_selects_ssl() {
        let raw = vec![14, 0xD0, 0, 0, 0, 0, 0, 2, 0, 8, 0, 1, 0, 0, 0];
        let selected = parse_connection_confirm(&mut Cursor::new(raw)).unwrap();
        assert_eq!(selected, Protocols::ProtocolSSL);
    }

    #[test]
    fn test_parse_connection_confirm_failure() {
        // negotiation failure with SSL_REQUIRED_BY_SERVER
        let raw = vec![14, 0xD0, 0, 0, 0, 0, 0, 3, 0, 8, 0, 1, 0, 0, 0];
        match parse_connection_confirm(&mut Cursor::new(raw)) {
            Err(Error::RdpError(e)) => assert_eq!(e.kind(), RdpErrorKind::ProtocolNegFailure),
            _ => panic!("expected negotiation failure"),
        }
    }

    #[test]
    fn test_parse_connection_request_with_cookie() {
        let mut raw = vec![0_u8, 0xE0, 0, 0, 0, 0, 0];
        raw.extend_from_slice(b"Cookie: mstshash=user\r\n");
        raw.extend_from_slice(&[1, 0, 8, 0, 3, 0, 0, 0]);
        raw[0] = (raw.len() - 1) as u8;
        let request = parse_connection_request(&mut Cursor::new(raw)).unwrap();
        assert_eq!(request.requested_protocols, 3);
        assert_eq!(request.cookie.unwrap(), "Cookie: mstshash=user");
    }
}
