use crate::core::sec::SecurityFlag;
use crate::model::data::{to_vec, Component, DataType, Message, Trame, U16, U32};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use log::debug;
use std::io::Read;

/// Requested side channel protocols
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/35b56fbf-a72c-4b4c-85e9-86d85dcdd167
pub const INITIATE_REQUEST_PROTOCOL_UDPFECR: u16 = 0x0001;
pub const INITIATE_REQUEST_PROTOCOL_UDPFECL: u16 = 0x0002;

/// hrResponse of the initiate multitransport response
const HR_E_ABORT: u32 = 0x80004004;
const HR_S_OK: u32 = 0x00000000;

const SECURITY_COOKIE_SIZE: usize = 16;

/// State of the multitransport bootstrap
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MultitransportState {
    /// Waiting for the server initiate request
    Request,
    /// The response left for the server
    Response,
}

/// Server initiate multitransport request once parsed
pub struct InitiateRequest {
    pub request_id: u32,
    pub requested_protocol: u16,
    pub security_cookie: Vec<u8>,
}

/// Side channel bootstrap
///
/// The server offers a UDP side transport over the message
/// channel. This engine only acknowledges the offer; without a
/// UDP stack the answer is an abort so the session continues
/// on the main transport.
pub struct Multitransport {
    state: MultitransportState,
    /// set when a side transport implementation is plugged in
    supports_side_channel: bool,
}

impl Default for Multitransport {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Multitransport {
    pub fn new(supports_side_channel: bool) -> Self {
        Multitransport {
            state: MultitransportState::Request,
            supports_side_channel,
        }
    }

    pub fn state(&self) -> MultitransportState {
        self.state
    }

    /// Feed the server initiate request, returns the channel
    /// payload to answer with
    pub fn process_request(
        &mut self,
        stream: &mut dyn Read,
    ) -> RdpResult<(MultitransportState, Vec<u8>)> {
        let request = read_initiate_request(stream)?;
        debug!(
            "multitransport request {} for protocol {:#06x}",
            request.request_id, request.requested_protocol
        );
        let hr_response = if self.supports_side_channel {
            HR_S_OK
        } else {
            HR_E_ABORT
        };
        self.state = MultitransportState::Response;
        Ok((
            self.state,
            initiate_response(request.request_id, hr_response),
        ))
    }
}

/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/35b56fbf-a72c-4b4c-85e9-86d85dcdd167
pub fn read_initiate_request(stream: &mut dyn Read) -> RdpResult<InitiateRequest> {
    let mut message = component![
        "requestId" => U32::LE(0),
        "requestedProtocol" => U16::LE(0),
        "reserved" => U16::LE(0),
        "securityCookie" => vec![0_u8; SECURITY_COOKIE_SIZE]
    ];
    message.read(stream)?;

    let requested_protocol = cast!(DataType::U16, message["requestedProtocol"])?;
    if requested_protocol != INITIATE_REQUEST_PROTOCOL_UDPFECR
        && requested_protocol != INITIATE_REQUEST_PROTOCOL_UDPFECL
    {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidData,
            "multitransport request with an unknown protocol",
        )));
    }

    Ok(InitiateRequest {
        request_id: cast!(DataType::U32, message["requestId"])?,
        requested_protocol,
        security_cookie: cast!(DataType::Slice, message["securityCookie"])?.to_vec(),
    })
}

/// Initiate multitransport response wrapped for the message
/// channel
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/5df7bd22-657d-4729-9d61-1b14b2a7f230
fn initiate_response(request_id: u32, hr_response: u32) -> Vec<u8> {
    to_vec(&trame![
        U16::LE(SecurityFlag::RdpSecTransportRsp as u16),
        U16::LE(0),
        U32::LE(request_id),
        U32::LE(hr_response)
    ])
}

/// Build a server initiate request, accepting role
pub fn initiate_request(
    request_id: u32,
    requested_protocol: u16,
    security_cookie: &[u8; SECURITY_COOKIE_SIZE],
) -> Vec<u8> {
    to_vec(&trame![
        U16::LE(SecurityFlag::SecTransportReq as u16),
        U16::LE(0),
        U32::LE(request_id),
        U16::LE(requested_protocol),
        U16::LE(0),
        security_cookie.to_vec()
    ])
}

/// Parse a client response, accepting role
pub fn read_initiate_response(stream: &mut dyn Read) -> RdpResult<(u32, bool)> {
    let mut message = component![
        "requestId" => U32::LE(0),
        "hrResponse" => U32::LE(0)
    ];
    message.read(stream)?;
    Ok((
        cast!(DataType::U32, message["requestId"])?,
        cast!(DataType::U32, message["hrResponse"])? == HR_S_OK,
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_request_is_aborted_without_udp_stack() {
        let mut multitransport = Multitransport::default();
        let request = initiate_request(7, INITIATE_REQUEST_PROTOCOL_UDPFECR, &[0xAA; 16]);
        // strip the security header
        let (state, response) = multitransport
            .process_request(&mut Cursor::new(request[4..].to_vec()))
            .unwrap();
        assert_eq!(state, MultitransportState::Response);

        let (request_id, accepted) =
            read_initiate_response(&mut Cursor::new(response[4..].to_vec())).unwrap();
        assert_eq!(request_id, 7);
        assert!(!accepted);
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let mut multitransport = Multitransport::default();
        let mut raw = vec![1, 0, 0, 0, 0xEE, 0xEE, 0, 0];
        raw.extend_from_slice(&[0_u8; 16]);
        assert!(multitransport
            .process_request(&mut Cursor::new(raw))
            .is_err());
    }
}
