use crate::core::per;
use crate::model::data::{to_vec, Component, DataType, Message, Trame, U16, U32};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use crate::model::unicode::Unicode;
use std::io::{Cursor, Read, Write};

/// T.124 object identifier
const T124_02_98_OID: [u8; 6] = [0, 0, 20, 124, 0, 1];
const H221_CS_KEY: &[u8; 4] = b"Duca";
const H221_SC_KEY: &[u8; 4] = b"McDn";

/// User data block types exchanged inside the
/// conference create request and response
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/db605fd9-7cf2-4c8e-ac57-c8e8e32cc0bb
#[repr(u16)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BlockType {
    CsCore = 0xC001,
    CsSecurity = 0xC002,
    CsNet = 0xC003,
    CsCluster = 0xC004,
    CsMcsMsgChannel = 0xC006,
    CsMultitransport = 0xC00A,
    ScCore = 0x0C01,
    ScSecurity = 0x0C02,
    ScNet = 0x0C03,
    ScMcsMsgChannel = 0x0C04,
    ScMultitransport = 0x0C08,
}

/// RDP protocol version announced in the core block
#[repr(u32)]
#[allow(dead_code)]
#[derive(Copy, Clone)]
pub enum Version {
    RdpVersion4 = 0x00080001,
    RdpVersion5Plus = 0x00080004,
    RdpVersion10 = 0x00080005,
}

pub enum KeyboardLayout {
    French = 0x0000040C,
    UnitedStates = 0x00000409,
}

/// Early capability flags of the client core data
#[allow(dead_code)]
pub enum EarlyCapabilityFlag {
    SupportErrInfoPdu = 0x0001,
    Want32BppSession = 0x0002,
    SupportStatusInfoPdu = 0x0004,
    StrongAsymmetricKeys = 0x0008,
    SupportNetcharAutodetect = 0x0080,
    SupportDynvcGfxProtocol = 0x0100,
    SupportDynamicTimeZone = 0x0200,
    SupportHeartbeatPdu = 0x0400,
}

/// Encryption methods the client offers in its security block
#[allow(dead_code)]
pub enum EncryptionMethod {
    Bit40 = 0x00000001,
    Bit128 = 0x00000002,
    Bit56 = 0x00000008,
    Fips = 0x00000010,
}

/// Encryption level chosen by the server
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EncryptionLevel {
    None = 0x00000000,
    Low = 0x00000001,
    ClientCompatible = 0x00000002,
    High = 0x00000003,
    Fips = 0x00000004,
}

impl EncryptionLevel {
    pub fn from_bits(bits: u32) -> RdpResult<Self> {
        match bits {
            0 => Ok(EncryptionLevel::None),
            1 => Ok(EncryptionLevel::Low),
            2 => Ok(EncryptionLevel::ClientCompatible),
            3 => Ok(EncryptionLevel::High),
            4 => Ok(EncryptionLevel::Fips),
            _ => Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidData,
                "unknown encryption level",
            ))),
        }
    }
}

fn block_header(block_type: BlockType, data_length: u16) -> Component {
    component![
        "type" => U16::LE(block_type as u16),
        "length" => U16::LE(data_length + 4)
    ]
}

/// Client core data block
///
/// The client name is truncated to 15 unicode characters and
/// zero padded, as the wire format requires
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/00f1da4a-ee9c-421a-852f-c19f92343d73
pub fn client_core_data(
    width: u16,
    height: u16,
    layout: u32,
    client_name: &str,
    selected_protocol: u32,
) -> Component {
    let mut name = client_name.chars().take(15).collect::<String>().to_unicode();
    name.resize(32, 0);

    component![
        "version" => U32::LE(Version::RdpVersion5Plus as u32),
        "desktopWidth" => U16::LE(width),
        "desktopHeight" => U16::LE(height),
        "colorDepth" => U16::LE(0xCA01),
        "sasSequence" => U16::LE(0xAA03),
        "kbdLayout" => U32::LE(layout),
        "clientBuild" => U32::LE(3790),
        "clientName" => name,
        "keyboardType" => U32::LE(4),
        "keyboardSubType" => U32::LE(0),
        "keyboardFnKeys" => U32::LE(12),
        "imeFileName" => vec![0_u8; 64],
        "postBeta2ColorDepth" => U16::LE(0xCA01),
        "clientProductId" => U16::LE(1),
        "serialNumber" => U32::LE(0),
        "highColorDepth" => U16::LE(24),
        "supportedColorDepths" => U16::LE(0x0007),
        "earlyCapabilityFlags" => U16::LE(
            EarlyCapabilityFlag::SupportErrInfoPdu as u16
            | EarlyCapabilityFlag::SupportNetcharAutodetect as u16
            | EarlyCapabilityFlag::SupportHeartbeatPdu as u16
        ),
        "clientDigProductId" => vec![0_u8; 64],
        "connectionType" => 0_u8,
        "pad1octet" => 0_u8,
        "serverSelectedProtocol" => U32::LE(selected_protocol)
    ]
}

/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/6b58e11e-a32b-4903-b736-339f3cfe46ec
pub fn client_security_data(encryption_methods: u32) -> Component {
    component![
        "encryptionMethods" => U32::LE(encryption_methods),
        "extEncryptionMethods" => U32::LE(0)
    ]
}

/// Static virtual channel request entry
pub fn channel_def(name: &str, options: u32) -> Component {
    let mut raw_name = name.as_bytes().to_vec();
    raw_name.resize(8, 0);
    component![
        "name" => raw_name,
        "options" => U32::LE(options)
    ]
}

/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/49f99e00-caf1-4786-bcab-4abebd067024
pub fn client_network_data(channels: Trame) -> Component {
    component![
        "channelCount" => U32::LE(channels.len() as u32),
        "channelDefArray" => to_vec(&channels)
    ]
}

/// Assemble all client blocks of the conference create request
pub fn client_gcc_blocks(
    width: u16,
    height: u16,
    layout: u32,
    client_name: &str,
    selected_protocol: u32,
    encryption_methods: u32,
    channel_names: &[String],
) -> RdpResult<Vec<u8>> {
    let core = to_vec(&client_core_data(
        width,
        height,
        layout,
        client_name,
        selected_protocol,
    ));
    let security = to_vec(&client_security_data(encryption_methods));
    let mut channels = Trame::new();
    for name in channel_names {
        channels.push(Box::new(channel_def(name, 0)));
    }
    let network = to_vec(&client_network_data(channels));
    // ask for a dedicated MCS message channel, used by the
    // auto-detect and multitransport sub protocols
    let message_channel = to_vec(&U32::LE(0));
    let multitransport = to_vec(&U32::LE(0));

    Ok(to_vec(&trame![
        block_header(BlockType::CsCore, core.len() as u16),
        core,
        block_header(BlockType::CsSecurity, security.len() as u16),
        security,
        block_header(BlockType::CsNet, network.len() as u16),
        network,
        block_header(BlockType::CsMcsMsgChannel, message_channel.len() as u16),
        message_channel,
        block_header(BlockType::CsMultitransport, multitransport.len() as u16),
        multitransport
    ]))
}

/// Client blocks once parsed, accepting role
pub struct ClientData {
    pub version: u32,
    pub width: u16,
    pub height: u16,
    pub encryption_methods: u32,
    pub channel_names: Vec<String>,
    pub wants_message_channel: bool,
}

/// Walk the client user data blocks, accepting role
pub fn parse_client_data(user_data: Vec<u8>) -> RdpResult<ClientData> {
    let total = user_data.len() as u64;
    let mut stream = Cursor::new(user_data);
    let mut result = ClientData {
        version: 0,
        width: 0,
        height: 0,
        encryption_methods: 0,
        channel_names: Vec::new(),
        wants_message_channel: false,
    };

    while stream.position() < total {
        let mut header = component![
            "type" => U16::LE(0),
            "length" => U16::LE(0)
        ];
        header.read(&mut stream)?;
        let block_type = cast!(DataType::U16, header["type"])?;
        let length = cast!(DataType::U16, header["length"])? as usize;
        if length < 4 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                "client data block with an invalid length",
            )));
        }
        let mut body = vec![0_u8; length - 4];
        stream.read_exact(&mut body)?;
        let mut body = Cursor::new(body);

        match block_type {
            x if x == BlockType::CsCore as u16 => {
                let mut fixed = component![
                    "version" => U32::LE(0),
                    "desktopWidth" => U16::LE(0),
                    "desktopHeight" => U16::LE(0)
                ];
                fixed.read(&mut body)?;
                result.version = cast!(DataType::U32, fixed["version"])?;
                result.width = cast!(DataType::U16, fixed["desktopWidth"])?;
                result.height = cast!(DataType::U16, fixed["desktopHeight"])?;
            }
            x if x == BlockType::CsSecurity as u16 => {
                let mut methods = U32::LE(0);
                methods.read(&mut body)?;
                result.encryption_methods = methods.inner();
            }
            x if x == BlockType::CsNet as u16 => {
                let mut count = U32::LE(0);
                count.read(&mut body)?;
                for _ in 0..count.inner() {
                    let mut name = vec![0_u8; 8];
                    body.read_exact(&mut name)?;
                    let mut options = U32::LE(0);
                    options.read(&mut body)?;
                    let name = String::from_utf8_lossy(&name)
                        .trim_end_matches('\0')
                        .to_string();
                    result.channel_names.push(name);
                }
            }
            x if x == BlockType::CsMcsMsgChannel as u16 => {
                result.wants_message_channel = true;
            }
            _ => (),
        }
    }

    Ok(result)
}

/// Server security block once parsed
///
/// The certificate blob stays opaque at this layer, the
/// security commencement phase extracts the RSA key from it
pub struct ServerSecurityData {
    pub encryption_method: u32,
    pub encryption_level: EncryptionLevel,
    pub server_random: Vec<u8>,
    pub server_certificate: Vec<u8>,
}

/// Server network block once parsed
pub struct ServerNetworkData {
    pub mcs_channel_id: u16,
    pub channel_ids: Vec<u16>,
}

/// All server blocks of the conference create response
pub struct ServerData {
    pub version: u32,
    pub security: ServerSecurityData,
    pub network: ServerNetworkData,
    pub message_channel_id: Option<u16>,
}

/// Walk the server user data blocks
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/9bb96a29-d535-4514-b2b6-a0a8f6096e0e
pub fn parse_server_data(user_data: Vec<u8>) -> RdpResult<ServerData> {
    let total = user_data.len() as u64;
    let mut stream = Cursor::new(user_data);
    let mut version = 0;
    let mut security = None;
    let mut network = None;
    let mut message_channel_id = None;

    while stream.position() < total {
        let mut header = component![
            "type" => U16::LE(0),
            "length" => U16::LE(0)
        ];
        header.read(&mut stream)?;
        let block_type = cast!(DataType::U16, header["type"])?;
        let length = cast!(DataType::U16, header["length"])? as usize;
        if length < 4 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                "server data block with an invalid length",
            )));
        }
        let mut body = vec![0_u8; length - 4];
        stream.read_exact(&mut body)?;
        let mut body = Cursor::new(body);

        match block_type {
            x if x == BlockType::ScCore as u16 => {
                let mut core = U32::LE(0);
                core.read(&mut body)?;
                version = core.inner();
            }
            x if x == BlockType::ScSecurity as u16 => {
                security = Some(parse_server_security_data(&mut body)?);
            }
            x if x == BlockType::ScNet as u16 => {
                network = Some(parse_server_network_data(&mut body)?);
            }
            x if x == BlockType::ScMcsMsgChannel as u16 => {
                let mut id = U16::LE(0);
                id.read(&mut body)?;
                message_channel_id = Some(id.inner());
            }
            // other optional blocks, e.g. multitransport, are
            // tolerated and skipped
            _ => (),
        }
    }

    Ok(ServerData {
        version,
        security: try_option!(security, "missing server security data")?,
        network: try_option!(network, "missing server network data")?,
        message_channel_id,
    })
}

/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/3e86b68d-3e2e-4433-b486-878875778f4b
fn parse_server_security_data(stream: &mut Cursor<Vec<u8>>) -> RdpResult<ServerSecurityData> {
    let mut fixed = component![
        "encryptionMethod" => U32::LE(0),
        "encryptionLevel" => U32::LE(0)
    ];
    fixed.read(stream)?;
    let encryption_method = cast!(DataType::U32, fixed["encryptionMethod"])?;
    let encryption_level =
        EncryptionLevel::from_bits(cast!(DataType::U32, fixed["encryptionLevel"])?)?;

    if encryption_method == 0 && encryption_level == EncryptionLevel::None {
        return Ok(ServerSecurityData {
            encryption_method,
            encryption_level,
            server_random: Vec::new(),
            server_certificate: Vec::new(),
        });
    }

    let mut sizes = component![
        "serverRandomLen" => U32::LE(0),
        "serverCertLen" => U32::LE(0)
    ];
    sizes.read(stream)?;
    let random_length = cast!(DataType::U32, sizes["serverRandomLen"])? as usize;
    let cert_length = cast!(DataType::U32, sizes["serverCertLen"])? as usize;

    let mut server_random = vec![0_u8; random_length];
    stream.read_exact(&mut server_random)?;
    let mut server_certificate = vec![0_u8; cert_length];
    stream.read_exact(&mut server_certificate)?;

    Ok(ServerSecurityData {
        encryption_method,
        encryption_level,
        server_random,
        server_certificate,
    })
}

/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/89fa11de-5275-4106-9cf1-e5aa7709436c
fn parse_server_network_data(stream: &mut Cursor<Vec<u8>>) -> RdpResult<ServerNetworkData> {
    let mut fixed = component![
        "MCSChannelId" => U16::LE(0),
        "channelCount" => U16::LE(0)
    ];
    fixed.read(stream)?;
    let mcs_channel_id = cast!(DataType::U16, fixed["MCSChannelId"])?;
    let channel_count = cast!(DataType::U16, fixed["channelCount"])?;

    let mut channel_ids = Vec::with_capacity(channel_count as usize);
    for _ in 0..channel_count {
        let mut id = U16::LE(0);
        id.read(stream)?;
        channel_ids.push(id.inner());
    }

    Ok(ServerNetworkData {
        mcs_channel_id,
        channel_ids,
    })
}

/// Build the server user data blocks, accepting role
pub fn server_gcc_blocks(
    encryption_method: u32,
    encryption_level: EncryptionLevel,
    server_random: &[u8],
    server_certificate: &[u8],
    mcs_channel_id: u16,
    channel_ids: &[u16],
    message_channel_id: Option<u16>,
) -> RdpResult<Vec<u8>> {
    let core = to_vec(&U32::LE(Version::RdpVersion5Plus as u32));

    let mut security = component![
        "encryptionMethod" => U32::LE(encryption_method),
        "encryptionLevel" => U32::LE(encryption_level as u32)
    ];
    if encryption_method != 0 || encryption_level != EncryptionLevel::None {
        security.insert(
            "serverRandomLen".to_string(),
            Box::new(U32::LE(server_random.len() as u32)),
        );
        security.insert(
            "serverCertLen".to_string(),
            Box::new(U32::LE(server_certificate.len() as u32)),
        );
        security.insert("serverRandom".to_string(), Box::new(server_random.to_vec()));
        security.insert(
            "serverCertificate".to_string(),
            Box::new(server_certificate.to_vec()),
        );
    }
    let security = to_vec(&security);

    let mut network = component![
        "MCSChannelId" => U16::LE(mcs_channel_id),
        "channelCount" => U16::LE(channel_ids.len() as u16)
    ];
    let mut ids = Trame::new();
    for id in channel_ids {
        ids.push(Box::new(U16::LE(*id)));
    }
    if channel_ids.len() % 2 == 1 {
        // keep the block length even
        ids.push(Box::new(U16::LE(0)));
    }
    network.insert("channelIdArray".to_string(), Box::new(to_vec(&ids)));
    let network = to_vec(&network);

    let mut blocks = trame![
        block_header(BlockType::ScCore, core.len() as u16),
        core,
        block_header(BlockType::ScSecurity, security.len() as u16),
        security,
        block_header(BlockType::ScNet, network.len() as u16),
        network
    ];
    if let Some(id) = message_channel_id {
        let body = to_vec(&U16::LE(id));
        blocks.push(Box::new(block_header(
            BlockType::ScMcsMsgChannel,
            body.len() as u16,
        )));
        blocks.push(Box::new(body));
    }
    Ok(to_vec(&blocks))
}

/// Wrap client user data into a T.124 conference create request
pub fn write_conference_create_request(user_data: &[u8]) -> RdpResult<Vec<u8>> {
    let mut result = Cursor::new(Vec::new());
    per::write_choice(0, &mut result)?;
    per::write_object_identifier(&T124_02_98_OID, &mut result)?;
    per::write_length(user_data.len() as u16 + 14, &mut result)?;
    per::write_choice(0, &mut result)?;
    per::write_selection(0x08, &mut result)?;
    per::write_numeric_string(b"1", 1, &mut result)?;
    per::write_padding(1, &mut result)?;
    per::write_number_of_set(1, &mut result)?;
    per::write_choice(0xC0, &mut result)?;
    per::write_octet_stream(H221_CS_KEY, 4, &mut result)?;
    per::write_length(user_data.len() as u16, &mut result)?;
    result.write_all(user_data)?;
    Ok(result.into_inner())
}

/// Unwrap the user data of a T.124 conference create response
pub fn read_conference_create_response(cursor: &mut dyn Read) -> RdpResult<Vec<u8>> {
    per::read_choice(cursor)?;
    if !per::read_object_identifier(&T124_02_98_OID, cursor)? {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidData,
            "invalid T.124 object identifier",
        )));
    }
    per::read_length(cursor)?;
    per::read_choice(cursor)?;
    per::read_integer16(1001, cursor)?;
    per::read_integer(cursor)?;
    per::read_enumerates(cursor)?;
    per::read_number_of_set(cursor)?;
    per::read_choice(cursor)?;
    per::read_octet_stream(H221_SC_KEY, 4, cursor)?;
    per::read_length(cursor)?;
    let mut result = Vec::new();
    cursor.read_to_end(&mut result)?;
    Ok(result)
}

/// Unwrap the user data of a T.124 conference create request,
/// accepting role
pub fn read_conference_create_request(cursor: &mut dyn Read) -> RdpResult<Vec<u8>> {
    per::read_choice(cursor)?;
    if !per::read_object_identifier(&T124_02_98_OID, cursor)? {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidData,
            "invalid T.124 object identifier",
        )));
    }
    per::read_length(cursor)?;
    per::read_choice(cursor)?;
    per::read_selection(cursor)?;
    per::read_numeric_string(1, cursor)?;
    per::read_padding(1, cursor)?;
    per::read_number_of_set(cursor)?;
    per::read_choice(cursor)?;
    per::read_octet_stream(H221_CS_KEY, 4, cursor)?;
    per::read_length(cursor)?;
    let mut result = Vec::new();
    cursor.read_to_end(&mut result)?;
    Ok(result)
}

/// Wrap server user data into a T.124 conference create
/// response, accepting role
pub fn write_conference_create_response(user_data: &[u8]) -> RdpResult<Vec<u8>> {
    let mut result = Cursor::new(Vec::new());
    per::write_choice(0, &mut result)?;
    per::write_object_identifier(&T124_02_98_OID, &mut result)?;
    per::write_length(user_data.len() as u16 + 14, &mut result)?;
    per::write_choice(0, &mut result)?;
    per::write_integer16(0x79F3, 1001, &mut result)?;
    per::write_integer(1, &mut result)?;
    per::write_enumerates(0, &mut result)?;
    per::write_number_of_set(1, &mut result)?;
    per::write_choice(0xC0, &mut result)?;
    per::write_octet_stream(H221_SC_KEY, 4, &mut result)?;
    per::write_length(user_data.len() as u16, &mut result)?;
    result.write_all(user_data)?;
    Ok(result.into_inner())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_client_core_data_length() {
        let core = client_core_data(1024, 768, KeyboardLayout::UnitedStates as u32, "demo", 1);
        assert_eq!(core.length(), 212);
    }

    #[test]
    fn test_client_blocks_round_trip_header() {
        let blocks = client_gcc_blocks(
            800,
            600,
            KeyboardLayout::UnitedStates as u32,
            "demo",
            1,
            0,
            &[],
        )
        .unwrap();
        // first block announced as client core data
        assert_eq!(blocks[0], 0x01);
        assert_eq!(blocks[1], 0xC0);
    }

    #[test]
    fn test_server_data_parse() {
        let blocks = server_gcc_blocks(
            0,
            EncryptionLevel::None,
            &[],
            &[],
            1003,
            &[1004, 1005],
            Some(1006),
        )
        .unwrap();
        let parsed = parse_server_data(blocks).unwrap();
        assert_eq!(parsed.network.mcs_channel_id, 1003);
        assert_eq!(parsed.network.channel_ids, [1004, 1005]);
        assert_eq!(parsed.security.encryption_level, EncryptionLevel::None);
        assert_eq!(parsed.message_channel_id, Some(1006));
    }

    #[test]
    fn test_conference_wrapping_round_trip() {
        let wrapped = write_conference_create_request(&[1, 2, 3, 4]).unwrap();
        let unwrapped = read_conference_create_request(&mut Cursor::new(wrapped)).unwrap();
        assert_eq!(unwrapped, [1, 2, 3, 4]);
    }
}
