use crate::core::sec::SecurityFlag;
use crate::model::data::{to_vec, Component, DataType, Message, Trame, U16, U32};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use log::debug;
use std::io::Read;
use std::time::Instant;

/// Header type ids
const TYPE_ID_AUTODETECT_REQUEST: u8 = 0x00;
const TYPE_ID_AUTODETECT_RESPONSE: u8 = 0x01;

/// Request types sent by the server
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/2e425a9c-bd6a-43d5-9d37-eadbbea25d29
const RTT_MEASURE_REQUEST_CONNECTTIME: u16 = 0x0001;
const RTT_MEASURE_REQUEST_CONTINUOUS: u16 = 0x1001;
const BW_MEASURE_START_CONNECTTIME: u16 = 0x0014;
const BW_MEASURE_START_CONTINUOUS: u16 = 0x0114;
const BW_MEASURE_PAYLOAD: u16 = 0x0002;
const BW_MEASURE_STOP_CONNECTTIME: u16 = 0x002B;
const BW_MEASURE_STOP_CONTINUOUS: u16 = 0x0429;
const NETCHAR_RESULT_BASE_RTT_AVG_RTT: u16 = 0x0840;
const NETCHAR_RESULT_BW_AVG_RTT: u16 = 0x0880;
const NETCHAR_RESULT_BASE_RTT_BW_AVG_RTT: u16 = 0x08C0;

/// Response types sent by the client
const RTT_MEASURE_RESPONSE: u16 = 0x0000;
const BW_MEASURE_RESULTS_CONNECTTIME: u16 = 0x0003;
const BW_MEASURE_RESULTS_CONTINUOUS: u16 = 0x000B;
const NETCHAR_SYNC: u16 = 0x0018;

/// Fixed header: length, type id, sequence, request type
const HEADER_FIXED_LENGTH: u8 = 0x06;
/// Header plus an eight byte payload
const HEADER_WITH_8_BYTE_PAYLOAD: u8 = 0x0E;
/// Header plus a twelve byte payload
const HEADER_WITH_12_BYTE_PAYLOAD: u8 = 0x12;
/// Header plus the two byte payload length field
const HEADER_WITH_PAYLOAD_LENGTH: u8 = 0x08;

/// State of the connect time network characterization
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AutoDetectState {
    /// A request from the server is expected
    Request,
    /// At least one response was produced
    Response,
    /// The server published its results
    Complete,
    /// A malformed PDU was received
    Fail,
}

/// Network figures published by the server at the end of the
/// exchange
#[derive(Copy, Clone, Default, Debug)]
pub struct NetworkCharacteristics {
    pub base_rtt_ms: u32,
    pub average_rtt_ms: u32,
    pub bandwidth_kbps: u32,
}

/// Client side of the auto-detect sub protocol
///
/// Requests arrive on the message channel tagged with the
/// auto-detect security flag, each one is answered
/// synchronously
pub struct AutoDetector {
    state: AutoDetectState,
    bandwidth_start: Option<Instant>,
    bandwidth_byte_count: u32,
    results: NetworkCharacteristics,
}

impl Default for AutoDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoDetector {
    pub fn new() -> Self {
        AutoDetector {
            state: AutoDetectState::Request,
            bandwidth_start: None,
            bandwidth_byte_count: 0,
            results: NetworkCharacteristics::default(),
        }
    }

    pub fn state(&self) -> AutoDetectState {
        self.state
    }

    pub fn results(&self) -> NetworkCharacteristics {
        self.results
    }

    /// Feed one auto-detect request
    ///
    /// The stream must be positioned at the request header.
    /// Returns the new state and, when the request demands
    /// one, a complete channel payload to send back.
    pub fn process_request(
        &mut self,
        stream: &mut dyn Read,
    ) -> RdpResult<(AutoDetectState, Option<Vec<u8>>)> {
        let mut header = component![
            "headerLength" => 0_u8,
            "headerTypeId" => 0_u8,
            "sequenceNumber" => U16::LE(0),
            "requestType" => U16::LE(0)
        ];
        if let Err(e) = header.read(stream) {
            self.state = AutoDetectState::Fail;
            return Err(e);
        }

        let header_length = cast!(DataType::U8, header["headerLength"])?;
        let type_id = cast!(DataType::U8, header["headerTypeId"])?;
        let sequence = cast!(DataType::U16, header["sequenceNumber"])?;
        let request_type = cast!(DataType::U16, header["requestType"])?;

        if type_id != TYPE_ID_AUTODETECT_REQUEST {
            self.state = AutoDetectState::Fail;
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidData,
                "auto-detect PDU with an unexpected type id",
            )));
        }

        match request_type {
            RTT_MEASURE_REQUEST_CONNECTTIME | RTT_MEASURE_REQUEST_CONTINUOUS => {
                self.expect_length(header_length, HEADER_FIXED_LENGTH)?;
                debug!("answering RTT measure request {}", sequence);
                self.state = AutoDetectState::Response;
                Ok((self.state, Some(rtt_measure_response(sequence))))
            }
            BW_MEASURE_START_CONNECTTIME | BW_MEASURE_START_CONTINUOUS => {
                self.expect_length(header_length, HEADER_FIXED_LENGTH)?;
                self.bandwidth_start = Some(Instant::now());
                self.bandwidth_byte_count = 0;
                self.state = AutoDetectState::Response;
                Ok((self.state, None))
            }
            BW_MEASURE_PAYLOAD => {
                self.expect_length(header_length, HEADER_WITH_PAYLOAD_LENGTH)?;
                let mut payload_length = U16::LE(0);
                payload_length.read(stream)?;
                let mut payload = vec![0_u8; payload_length.inner() as usize];
                stream.read_exact(&mut payload)?;
                self.bandwidth_byte_count += payload_length.inner() as u32 + 8;
                Ok((self.state, None))
            }
            BW_MEASURE_STOP_CONNECTTIME => {
                self.expect_length(header_length, HEADER_WITH_PAYLOAD_LENGTH)?;
                let mut payload_length = U16::LE(0);
                payload_length.read(stream)?;
                self.finish_bandwidth_measure(sequence, payload_length.inner() as u32)
            }
            BW_MEASURE_STOP_CONTINUOUS => {
                self.expect_length(header_length, HEADER_FIXED_LENGTH)?;
                self.finish_bandwidth_measure(sequence, 0)
            }
            NETCHAR_RESULT_BASE_RTT_AVG_RTT => {
                self.expect_length(header_length, HEADER_WITH_8_BYTE_PAYLOAD)?;
                let (first, second) = read_two_u32(stream)?;
                self.results.base_rtt_ms = first;
                self.results.average_rtt_ms = second;
                self.state = AutoDetectState::Complete;
                Ok((self.state, None))
            }
            NETCHAR_RESULT_BW_AVG_RTT => {
                self.expect_length(header_length, HEADER_WITH_8_BYTE_PAYLOAD)?;
                let (first, second) = read_two_u32(stream)?;
                self.results.bandwidth_kbps = first;
                self.results.average_rtt_ms = second;
                self.state = AutoDetectState::Complete;
                Ok((self.state, None))
            }
            NETCHAR_RESULT_BASE_RTT_BW_AVG_RTT => {
                self.expect_length(header_length, HEADER_WITH_12_BYTE_PAYLOAD)?;
                let mut payload = component![
                    "baseRTT" => U32::LE(0),
                    "bandwidth" => U32::LE(0),
                    "averageRTT" => U32::LE(0)
                ];
                payload.read(stream)?;
                self.results.base_rtt_ms = cast!(DataType::U32, payload["baseRTT"])?;
                self.results.bandwidth_kbps = cast!(DataType::U32, payload["bandwidth"])?;
                self.results.average_rtt_ms = cast!(DataType::U32, payload["averageRTT"])?;
                self.state = AutoDetectState::Complete;
                Ok((self.state, None))
            }
            _ => {
                self.state = AutoDetectState::Fail;
                Err(Error::RdpError(RdpError::new(
                    RdpErrorKind::InvalidData,
                    "unknown auto-detect request type",
                )))
            }
        }
    }

    fn finish_bandwidth_measure(
        &mut self,
        sequence: u16,
        trailing_bytes: u32,
    ) -> RdpResult<(AutoDetectState, Option<Vec<u8>>)> {
        let elapsed = match self.bandwidth_start.take() {
            Some(start) => start.elapsed().as_millis() as u32,
            None => {
                self.state = AutoDetectState::Fail;
                return Err(Error::RdpError(RdpError::new(
                    RdpErrorKind::InvalidAutomata,
                    "bandwidth measure stop without a start",
                )));
            }
        };
        let byte_count = self.bandwidth_byte_count + trailing_bytes;
        debug!(
            "bandwidth measure finished, {} bytes in {} ms",
            byte_count, elapsed
        );
        self.state = AutoDetectState::Response;
        Ok((
            self.state,
            Some(bw_measure_results(sequence, elapsed, byte_count)),
        ))
    }

    fn expect_length(&mut self, actual: u8, expected: u8) -> RdpResult<()> {
        if actual != expected {
            self.state = AutoDetectState::Fail;
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                "auto-detect PDU header length does not match its type",
            )));
        }
        Ok(())
    }
}

fn read_two_u32(stream: &mut dyn Read) -> RdpResult<(u32, u32)> {
    let mut payload = component![
        "first" => U32::LE(0),
        "second" => U32::LE(0)
    ];
    payload.read(stream)?;
    Ok((
        cast!(DataType::U32, payload["first"])?,
        cast!(DataType::U32, payload["second"])?,
    ))
}

/// Wrap an auto-detect response into its security header
fn autodetect_response_payload(message: Vec<u8>) -> Vec<u8> {
    to_vec(&trame![
        U16::LE(SecurityFlag::SecAutodetectRsp as u16),
        U16::LE(0),
        message
    ])
}

/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/d57c62cd-f8b9-4c69-bdd6-9c877a4424ab
fn rtt_measure_response(sequence: u16) -> Vec<u8> {
    autodetect_response_payload(to_vec(&trame![
        HEADER_FIXED_LENGTH,
        TYPE_ID_AUTODETECT_RESPONSE,
        U16::LE(sequence),
        U16::LE(RTT_MEASURE_RESPONSE)
    ]))
}

/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/4b41dd63-fcf5-4bd8-a21f-0b3c0f38f618
fn bw_measure_results(sequence: u16, time_delta_ms: u32, byte_count: u32) -> Vec<u8> {
    autodetect_response_payload(to_vec(&trame![
        HEADER_WITH_8_BYTE_PAYLOAD,
        TYPE_ID_AUTODETECT_RESPONSE,
        U16::LE(sequence),
        U16::LE(BW_MEASURE_RESULTS_CONNECTTIME),
        U32::LE(time_delta_ms),
        U32::LE(byte_count)
    ]))
}

/// Network characteristics sync sent on reconnect
pub fn netchar_sync(sequence: u16, bandwidth_kbps: u32, rtt_ms: u32) -> Vec<u8> {
    autodetect_response_payload(to_vec(&trame![
        HEADER_WITH_8_BYTE_PAYLOAD,
        TYPE_ID_AUTODETECT_RESPONSE,
        U16::LE(sequence),
        U16::LE(NETCHAR_SYNC),
        U32::LE(bandwidth_kbps),
        U32::LE(rtt_ms)
    ]))
}

/// Server side builders used to drive connect time detection,
/// accepting role
pub mod server {
    use super::*;

    pub fn rtt_measure_request(sequence: u16) -> Vec<u8> {
        to_vec(&trame![
            U16::LE(SecurityFlag::SecAutodetectReq as u16),
            U16::LE(0),
            HEADER_FIXED_LENGTH,
            TYPE_ID_AUTODETECT_REQUEST,
            U16::LE(sequence),
            U16::LE(RTT_MEASURE_REQUEST_CONNECTTIME)
        ])
    }

    pub fn netchar_result(sequence: u16, results: NetworkCharacteristics) -> Vec<u8> {
        to_vec(&trame![
            U16::LE(SecurityFlag::SecAutodetectReq as u16),
            U16::LE(0),
            HEADER_WITH_12_BYTE_PAYLOAD,
            TYPE_ID_AUTODETECT_REQUEST,
            U16::LE(sequence),
            U16::LE(NETCHAR_RESULT_BASE_RTT_BW_AVG_RTT),
            U32::LE(results.base_rtt_ms),
            U32::LE(results.bandwidth_kbps),
            U32::LE(results.average_rtt_ms)
        ])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn strip_security_header(payload: Vec<u8>) -> Vec<u8> {
        payload[4..].to_vec()
    }

    #[test]
    fn test_rtt_request_gets_response() {
        let mut detector = AutoDetector::new();
        let request = strip_security_header(server::rtt_measure_request(5));
        let (state, response) = detector
            .process_request(&mut Cursor::new(request))
            .unwrap();
        assert_eq!(state, AutoDetectState::Response);
        let response = response.unwrap();
        // response carries the auto-detect response security flag
        assert_eq!(
            u16::from_le_bytes([response[0], response[1]]),
            SecurityFlag::SecAutodetectRsp as u16
        );
        // echoed sequence number
        assert_eq!(u16::from_le_bytes([response[6], response[7]]), 5);
    }

    #[test]
    fn test_netchar_result_completes() {
        let mut detector = AutoDetector::new();
        let results = NetworkCharacteristics {
            base_rtt_ms: 10,
            average_rtt_ms: 20,
            bandwidth_kbps: 10_000,
        };
        let request = strip_security_header(server::netchar_result(1, results));
        let (state, response) = detector
            .process_request(&mut Cursor::new(request))
            .unwrap();
        assert_eq!(state, AutoDetectState::Complete);
        assert!(response.is_none());
        assert_eq!(detector.results().bandwidth_kbps, 10_000);
        assert_eq!(detector.results().average_rtt_ms, 20);
    }

    #[test]
    fn test_header_length_mismatch_fails() {
        let mut detector = AutoDetector::new();
        // RTT request claiming a twelve byte payload
        let raw = vec![0x12, 0x00, 0x01, 0x00, 0x01, 0x00];
        assert!(detector.process_request(&mut Cursor::new(raw)).is_err());
        assert_eq!(detector.state(), AutoDetectState::Fail);
    }

    #[test]
    fn test_unknown_request_type_fails() {
        let mut detector = AutoDetector::new();
        let raw = vec![0x06, 0x00, 0x01, 0x00, 0xEE, 0xEE];
        assert!(detector.process_request(&mut Cursor::new(raw)).is_err());
        assert_eq!(detector.state(), AutoDetectState::Fail);
    }

    #[test]
    fn test_bandwidth_stop_without_start_fails() {
        let mut detector = AutoDetector::new();
        let raw = vec![0x08, 0x00, 0x01, 0x00, 0x2B, 0x00, 0x00, 0x00];
        assert!(detector.process_request(&mut Cursor::new(raw)).is_err());
    }
}
