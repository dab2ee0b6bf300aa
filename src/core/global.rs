use crate::core::capability::{self, Capability, CapabilitySets};
use crate::model::data::{to_vec, Component, DataType, Message, Trame, U16, U32};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use log::debug;
use std::io::{Cursor, Read};

/// Marker of the legacy five byte flow PDU form
const FLOW_PDU_MARKER: u16 = 0x8000;
/// Originator id the client puts into its confirm active
const CLIENT_ORIGINATOR_ID: u16 = 0x03EA;

/// Share control PDU types
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/73d01865-2eae-407f-9b2c-87e31daac471
#[repr(u16)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PDUType {
    PdutypeDemandactivepdu = 0x11,
    PdutypeConfirmactivepdu = 0x13,
    PdutypeDeactivateallpdu = 0x16,
    PdutypeDatapdu = 0x17,
    PdutypeServerRedirPkt = 0x1A,
}

impl PDUType {
    pub fn from_bits(bits: u16) -> RdpResult<Self> {
        match bits & 0xF {
            0x1 => Ok(PDUType::PdutypeDemandactivepdu),
            0x3 => Ok(PDUType::PdutypeConfirmactivepdu),
            0x6 => Ok(PDUType::PdutypeDeactivateallpdu),
            0x7 => Ok(PDUType::PdutypeDatapdu),
            0xA => Ok(PDUType::PdutypeServerRedirPkt),
            _ => Err(Error::RdpError(RdpError::new(
                RdpErrorKind::UnexpectedType,
                "unknown share control PDU type",
            ))),
        }
    }

    /// Name used in protocol traces
    pub fn name(&self) -> &'static str {
        match self {
            PDUType::PdutypeDemandactivepdu => "DEMAND_ACTIVE",
            PDUType::PdutypeConfirmactivepdu => "CONFIRM_ACTIVE",
            PDUType::PdutypeDeactivateallpdu => "DEACTIVATE_ALL",
            PDUType::PdutypeDatapdu => "DATA",
            PDUType::PdutypeServerRedirPkt => "SERVER_REDIRECT",
        }
    }
}

/// Share data PDU types
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[allow(dead_code)]
pub enum PDUType2 {
    Pdutype2Update = 0x02,
    Pdutype2Control = 0x14,
    Pdutype2Pointer = 0x1B,
    Pdutype2Input = 0x1C,
    Pdutype2Synchronize = 0x1F,
    Pdutype2RefreshRect = 0x21,
    Pdutype2PlaySound = 0x22,
    Pdutype2SuppressOutput = 0x23,
    Pdutype2ShutdownRequest = 0x24,
    Pdutype2ShutdownDenied = 0x25,
    Pdutype2SaveSessionInfo = 0x26,
    Pdutype2Fontlist = 0x27,
    Pdutype2Fontmap = 0x28,
    Pdutype2SetKeyboardIndicators = 0x29,
    Pdutype2BitmapcachePersistentList = 0x2B,
    Pdutype2BitmapcacheErrorPdu = 0x2C,
    Pdutype2SetKeyboardImeStatus = 0x2D,
    Pdutype2OffscrcacheErrorPdu = 0x2E,
    Pdutype2SetErrorInfoPdu = 0x2F,
    Pdutype2DrawninegridErrorPdu = 0x30,
    Pdutype2DrawgdiplusErrorPdu = 0x31,
    Pdutype2ArcStatusPdu = 0x32,
    Pdutype2StatusInfoPdu = 0x36,
    Pdutype2MonitorLayoutPdu = 0x37,
}

impl PDUType2 {
    pub fn name(bits: u8) -> &'static str {
        match bits {
            0x02 => "UPDATE",
            0x14 => "CONTROL",
            0x1B => "POINTER",
            0x1C => "INPUT",
            0x1F => "SYNCHRONIZE",
            0x27 => "FONTLIST",
            0x28 => "FONTMAP",
            0x2B => "PERSISTENT_LIST",
            0x2F => "SET_ERROR_INFO",
            0x37 => "MONITOR_LAYOUT",
            _ => "UNKNOWN",
        }
    }
}

/// Compression flags of the share data header
#[allow(dead_code)]
pub enum CompressionFlag {
    PacketCompressed = 0x20,
    PacketAtFront = 0x40,
    PacketFlushed = 0x80,
    CompressionTypeMask = 0x0F,
}

/// Control actions of the finalization phase
#[repr(u16)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ControlAction {
    RequestControl = 0x0001,
    GrantedControl = 0x0002,
    Detach = 0x0003,
    Cooperate = 0x0004,
}

/// Server set error info codes surfaced to the caller
///
/// The list only names the common ones, everything else is
/// reported with its numeric value
pub fn error_info_description(code: u32) -> String {
    match code {
        0x00000000 => "no error".to_string(),
        0x00000001 => "disconnected by an administrative tool".to_string(),
        0x00000002 => "disconnected by another connection to the session".to_string(),
        0x00000003 => "logged off from the session".to_string(),
        0x00000004 => "idle timeout reached".to_string(),
        0x00000005 => "logon time limit reached".to_string(),
        0x00000006 => "disconnected by another user on the console".to_string(),
        0x00000007 => "server is shutting down".to_string(),
        0x00000009 => "connection denied by the server".to_string(),
        0x0000000A => "connection denied, insufficient privileges".to_string(),
        0x0000000B => "server has expired credentials".to_string(),
        0x0000010C => "disconnection initiated by the user".to_string(),
        0x00000C06 => "the decryption or the signature of a PDU failed".to_string(),
        code => format!("server error info {:#010x}", code),
    }
}

/// Share control header wrapping a payload
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/73d01865-2eae-407f-9b2c-87e31daac471
pub fn share_control(pdu_type: PDUType, pdu_source: u16, payload: Vec<u8>) -> Trame {
    trame![
        U16::LE(payload.len() as u16 + 6),
        U16::LE(pdu_type as u16 | 0x10),
        U16::LE(pdu_source),
        payload
    ]
}

pub struct ShareControlHeader {
    pub total_length: u16,
    pub pdu_type: PDUType,
    pub pdu_source: u16,
}

/// Read a share control header
///
/// Returns None for the legacy five byte flow PDU form, which
/// carries no useful payload and is skipped whole
pub fn read_share_control_header(
    stream: &mut Cursor<Vec<u8>>,
) -> RdpResult<Option<ShareControlHeader>> {
    let mut total_length = U16::LE(0);
    total_length.read(stream)?;
    if total_length.inner() == FLOW_PDU_MARKER {
        debug!("skipping a legacy flow PDU");
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest)?;
        return Ok(None);
    }
    let mut fixed = component![
        "pduType" => U16::LE(0),
        "PDUSource" => U16::LE(0)
    ];
    fixed.read(stream)?;
    Ok(Some(ShareControlHeader {
        total_length: total_length.inner(),
        pdu_type: PDUType::from_bits(cast!(DataType::U16, fixed["pduType"])?)?,
        pdu_source: cast!(DataType::U16, fixed["PDUSource"])?,
    }))
}

/// Share data header wrapping a data payload
pub fn share_data(share_id: u32, pdu_type2: PDUType2, payload: Vec<u8>) -> Vec<u8> {
    to_vec(&trame![
        U32::LE(share_id),
        0_u8, // padding
        1_u8, // streamId low
        U16::LE(payload.len() as u16 + 18),
        pdu_type2 as u8,
        0_u8, // compressedType
        U16::LE(0), // compressedLength
        payload
    ])
}

pub struct ShareDataHeader {
    pub share_id: u32,
    pub stream_id: u8,
    pub uncompressed_length: u16,
    pub pdu_type2: u8,
    pub compressed_type: u8,
    pub compressed_length: u16,
}

pub fn read_share_data_header(stream: &mut dyn Read) -> RdpResult<ShareDataHeader> {
    let mut header = component![
        "shareId" => U32::LE(0),
        "pad1" => 0_u8,
        "streamId" => 0_u8,
        "uncompressedLength" => U16::LE(0),
        "pduType2" => 0_u8,
        "compressedType" => 0_u8,
        "compressedLength" => U16::LE(0)
    ];
    header.read(stream)?;
    Ok(ShareDataHeader {
        share_id: cast!(DataType::U32, header["shareId"])?,
        stream_id: cast!(DataType::U8, header["streamId"])?,
        uncompressed_length: cast!(DataType::U16, header["uncompressedLength"])?,
        pdu_type2: cast!(DataType::U8, header["pduType2"])?,
        compressed_type: cast!(DataType::U8, header["compressedType"])?,
        compressed_length: cast!(DataType::U16, header["compressedLength"])?,
    })
}

/// Demand active PDU as parsed from the server
pub struct DemandActive {
    pub share_id: u32,
    pub capabilities: CapabilitySets,
}

/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/a07abad1-38bb-4a1a-96c9-253e3d5440df
pub fn read_demand_active(stream: &mut Cursor<Vec<u8>>) -> RdpResult<DemandActive> {
    let mut fixed = component![
        "shareId" => U32::LE(0),
        "lengthSourceDescriptor" => crate::model::data::DynOption::new(U16::LE(0), |length| crate::model::data::MessageOption::Size("sourceDescriptor".to_string(), length.inner() as usize)),
        "lengthCombinedCapabilities" => U16::LE(0),
        "sourceDescriptor" => Vec::<u8>::new(),
        "numberCapabilities" => U16::LE(0),
        "pad2Octets" => U16::LE(0)
    ];
    fixed.read(stream)?;
    let share_id = cast!(DataType::U32, fixed["shareId"])?;
    let count = cast!(DataType::U16, fixed["numberCapabilities"])?;
    let capabilities = capability::parse_capability_sets(count, stream)?;
    // trailing sessionId is optional, consume it when present
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest)?;
    Ok(DemandActive {
        share_id,
        capabilities,
    })
}

/// Build a demand active payload, accepting role
pub fn write_demand_active(share_id: u32, capabilities: &[Capability]) -> Vec<u8> {
    let caps = capability::write_capability_sets(capabilities);
    let source = b"RDP".to_vec();
    to_vec(&trame![
        U32::LE(share_id),
        U16::LE(source.len() as u16),
        U16::LE(caps.len() as u16 + 4),
        source,
        U16::LE(capabilities.len() as u16),
        U16::LE(0), // pad2Octets
        caps,
        U32::LE(0)  // sessionId
    ])
}

/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/4e9722c3-ad83-43f5-af5a-529f73d88b48
pub fn write_confirm_active(share_id: u32, capabilities: &[Capability]) -> Vec<u8> {
    let caps = capability::write_capability_sets(capabilities);
    let source = b"MSTSC".to_vec();
    to_vec(&trame![
        U32::LE(share_id),
        U16::LE(CLIENT_ORIGINATOR_ID),
        U16::LE(source.len() as u16),
        U16::LE(caps.len() as u16 + 4),
        source,
        U16::LE(capabilities.len() as u16),
        U16::LE(0), // pad2Octets
        caps
    ])
}

/// Parse a confirm active payload, accepting role
pub fn read_confirm_active(stream: &mut Cursor<Vec<u8>>) -> RdpResult<DemandActive> {
    let mut fixed = component![
        "shareId" => U32::LE(0),
        "originatorId" => U16::LE(0),
        "lengthSourceDescriptor" => crate::model::data::DynOption::new(U16::LE(0), |length| crate::model::data::MessageOption::Size("sourceDescriptor".to_string(), length.inner() as usize)),
        "lengthCombinedCapabilities" => U16::LE(0),
        "sourceDescriptor" => Vec::<u8>::new(),
        "numberCapabilities" => U16::LE(0),
        "pad2Octets" => U16::LE(0)
    ];
    fixed.read(stream)?;
    let share_id = cast!(DataType::U32, fixed["shareId"])?;
    let count = cast!(DataType::U16, fixed["numberCapabilities"])?;
    let capabilities = capability::parse_capability_sets(count, stream)?;
    Ok(DemandActive {
        share_id,
        capabilities,
    })
}

/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/3fb4c95c-e9d1-4b3b-a80d-a82f3d8a19d1
pub fn synchronize_payload(target_user: u16) -> Vec<u8> {
    to_vec(&trame![
        U16::LE(1), // SYNCMSGTYPE_SYNC
        U16::LE(target_user)
    ])
}

pub fn control_payload(action: ControlAction) -> Vec<u8> {
    to_vec(&trame![
        U16::LE(action as u16),
        U16::LE(0),  // grantId
        U32::LE(0)   // controlId
    ])
}

/// Control granted as sent by the server during finalization
pub fn control_granted_payload(grant_id: u16, control_id: u32) -> Vec<u8> {
    to_vec(&trame![
        U16::LE(ControlAction::GrantedControl as u16),
        U16::LE(grant_id),
        U32::LE(control_id)
    ])
}

pub struct ControlPdu {
    pub action: ControlAction,
}

pub fn read_control_payload(stream: &mut dyn Read) -> RdpResult<ControlPdu> {
    let mut message = component![
        "action" => U16::LE(0),
        "grantId" => U16::LE(0),
        "controlId" => U32::LE(0)
    ];
    message.read(stream)?;
    let action = match cast!(DataType::U16, message["action"])? {
        0x0001 => ControlAction::RequestControl,
        0x0002 => ControlAction::GrantedControl,
        0x0003 => ControlAction::Detach,
        0x0004 => ControlAction::Cooperate,
        _ => {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::UnexpectedType,
                "unknown control action",
            )))
        }
    };
    Ok(ControlPdu { action })
}

/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/e373575a-01e2-43a7-a6d8-e1952b83e787
pub fn font_list_payload() -> Vec<u8> {
    to_vec(&trame![
        U16::LE(0), // numberFonts
        U16::LE(0), // totalNumFonts
        U16::LE(3), // listFlags FONTLIST_FIRST | FONTLIST_LAST
        U16::LE(50) // entrySize
    ])
}

/// Font map sent back by the server to close finalization
pub fn font_map_payload() -> Vec<u8> {
    to_vec(&trame![
        U16::LE(0), // numberEntries
        U16::LE(0), // totalNumEntries
        U16::LE(3), // mapFlags FONTMAP_FIRST | FONTMAP_LAST
        U16::LE(4)  // entrySize
    ])
}

/// Monitor layout PDU exchanged during the capability phase,
/// the monitor definitions themselves belong to the caller
pub fn read_monitor_layout(stream: &mut dyn Read) -> RdpResult<u32> {
    let mut count = U32::LE(0);
    count.read(stream)?;
    let mut definitions = Vec::new();
    stream.read_to_end(&mut definitions)?;
    Ok(count.inner())
}

pub fn monitor_layout_payload(monitor_count: u32, definitions: &[u8]) -> Vec<u8> {
    to_vec(&trame![U32::LE(monitor_count), definitions.to_vec()])
}

/// Read the error code of a set error info data PDU
pub fn read_error_info(stream: &mut dyn Read) -> RdpResult<u32> {
    let mut code = U32::LE(0);
    code.read(stream)?;
    Ok(code.inner())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_share_control_round_trip() {
        let message = share_control(PDUType::PdutypeDatapdu, 1002, vec![1, 2, 3]);
        let raw = to_vec(&message);
        let mut stream = Cursor::new(raw);
        let header = read_share_control_header(&mut stream).unwrap().unwrap();
        assert_eq!(header.pdu_type, PDUType::PdutypeDatapdu);
        assert_eq!(header.pdu_source, 1002);
        assert_eq!(header.total_length, 9);
    }

    #[test]
    fn test_flow_pdu_is_skipped() {
        let raw = vec![0x00, 0x80, 1, 2, 3];
        let mut stream = Cursor::new(raw);
        assert!(read_share_control_header(&mut stream).unwrap().is_none());
    }

    #[test]
    fn test_demand_confirm_active_round_trip() {
        let capabilities = capability::client_capabilities(800, 600, 0x409);
        let demand = write_demand_active(0x1000, &capabilities);
        let parsed = read_demand_active(&mut Cursor::new(demand)).unwrap();
        assert_eq!(parsed.share_id, 0x1000);
        assert_eq!(parsed.capabilities.len(), capabilities.len());

        let confirm = write_confirm_active(parsed.share_id, &capabilities);
        let parsed = read_confirm_active(&mut Cursor::new(confirm)).unwrap();
        assert_eq!(parsed.share_id, 0x1000);
    }

    #[test]
    fn test_share_data_round_trip() {
        let raw = share_data(7, PDUType2::Pdutype2Synchronize, synchronize_payload(1002));
        let mut stream = Cursor::new(raw);
        let header = read_share_data_header(&mut stream).unwrap();
        assert_eq!(header.share_id, 7);
        assert_eq!(header.pdu_type2, PDUType2::Pdutype2Synchronize as u8);
        assert_eq!(header.compressed_type, 0);
    }

    #[test]
    fn test_error_info_description_known_and_unknown() {
        assert_eq!(
            error_info_description(0x00000003),
            "logged off from the session"
        );
        assert!(error_info_description(0xDEAD).starts_with("server error info"));
    }
}
