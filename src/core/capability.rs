use crate::model::data::{to_vec, Component, DataType, Message, Trame, U16, U32};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use indexmap::IndexMap;
use std::io::{Cursor, Read};

/// All capability set identifiers of the exchange phase
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/d8ca3fdb-3644-4dcc-b0ab-51af0b21b0e8
#[repr(u16)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
#[allow(dead_code)]
pub enum CapabilitySetType {
    CapstypeGeneral = 0x0001,
    CapstypeBitmap = 0x0002,
    CapstypeOrder = 0x0003,
    CapstypeBitmapcache = 0x0004,
    CapstypeControl = 0x0005,
    CapstypeActivation = 0x0007,
    CapstypePointer = 0x0008,
    CapstypeShare = 0x0009,
    CapstypeColorcache = 0x000A,
    CapstypeSound = 0x000C,
    CapstypeInput = 0x000D,
    CapstypeFont = 0x000E,
    CapstypeBrush = 0x000F,
    CapstypeGlyphcache = 0x0010,
    CapstypeOffscreencache = 0x0011,
    CapstypeBitmapcacheHostsupport = 0x0012,
    CapstypeBitmapcacheRev2 = 0x0013,
    CapstypeVirtualchannel = 0x0014,
    CapstypeDrawninegridcache = 0x0015,
    CapstypeDrawgdiplus = 0x0016,
    CapstypeRail = 0x0017,
    CapstypeWindow = 0x0018,
    CapsettypeCompdesk = 0x0019,
    CapsettypeMultifragmentupdate = 0x001A,
    CapsettypeLargePointer = 0x001B,
    CapsettypeSurfaceCommands = 0x001C,
    CapsettypeBitmapCodecs = 0x001D,
    CapssettypeFrameAcknowledge = 0x001E,
}

/// General capability extra flags
#[allow(dead_code)]
pub enum GeneralExtraFlag {
    FastpathOutputSupported = 0x0001,
    NoBitmapCompressionHdr = 0x0400,
    LongCredentialsSupported = 0x0004,
    AutoreconnectSupported = 0x0008,
    EncSaltedChecksum = 0x0010,
}

/// Input support flags
#[allow(dead_code)]
pub enum InputFlags {
    InputFlagScancodes = 0x0001,
    InputFlagMousex = 0x0004,
    InputFlagFastpathInput = 0x0008,
    InputFlagUnicode = 0x0010,
    InputFlagFastpathInput2 = 0x0020,
}

/// One capability set with its header
pub struct Capability {
    pub cap_type: CapabilitySetType,
    pub message: Component,
}

impl Capability {
    /// Wire form: type, length, payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = to_vec(&self.message);
        to_vec(&trame![
            U16::LE(self.cap_type as u16),
            U16::LE(payload.len() as u16 + 4),
            payload
        ])
    }
}

/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/41dc6845-07dc-4af6-bc14-d8281acd4877
pub fn general_capability(extra_flags: u16) -> Capability {
    Capability {
        cap_type: CapabilitySetType::CapstypeGeneral,
        message: component![
            "osMajorType" => U16::LE(4),
            "osMinorType" => U16::LE(7),
            "protocolVersion" => U16::LE(0x0200),
            "pad2octetsA" => U16::LE(0),
            "generalCompressionTypes" => U16::LE(0),
            "extraFlags" => U16::LE(extra_flags),
            "updateCapabilityFlag" => U16::LE(0),
            "remoteUnshareFlag" => U16::LE(0),
            "generalCompressionLevel" => U16::LE(0),
            "refreshRectSupport" => 0_u8,
            "suppressOutputSupport" => 0_u8
        ],
    }
}

/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/76670547-e35c-4b95-a242-5729a21b83f6
pub fn bitmap_capability(preferred_bits_per_pixel: u16, width: u16, height: u16) -> Capability {
    Capability {
        cap_type: CapabilitySetType::CapstypeBitmap,
        message: component![
            "preferredBitsPerPixel" => U16::LE(preferred_bits_per_pixel),
            "receive1BitPerPixel" => U16::LE(1),
            "receive4BitsPerPixel" => U16::LE(1),
            "receive8BitsPerPixel" => U16::LE(1),
            "desktopWidth" => U16::LE(width),
            "desktopHeight" => U16::LE(height),
            "pad2octets" => U16::LE(0),
            "desktopResizeFlag" => U16::LE(1),
            "bitmapCompressionFlag" => U16::LE(1),
            "highColorFlags" => 0_u8,
            "drawingFlags" => 0_u8,
            "multipleRectangleSupport" => U16::LE(1),
            "pad2octetsB" => U16::LE(0)
        ],
    }
}

pub fn order_capability() -> Capability {
    Capability {
        cap_type: CapabilitySetType::CapstypeOrder,
        message: component![
            "terminalDescriptor" => vec![0_u8; 16],
            "pad4octetsA" => U32::LE(0),
            "desktopSaveXGranularity" => U16::LE(1),
            "desktopSaveYGranularity" => U16::LE(20),
            "pad2octetsA" => U16::LE(0),
            "maximumOrderLevel" => U16::LE(1),
            "numberFonts" => U16::LE(0),
            "orderFlags" => U16::LE(0x0022),
            "orderSupport" => vec![0_u8; 32],
            "textFlags" => U16::LE(0),
            "orderSupportExFlags" => U16::LE(0),
            "pad4octetsB" => U32::LE(0),
            "desktopSaveSize" => U32::LE(480 * 480),
            "pad2octetsC" => U16::LE(0),
            "pad2octetsD" => U16::LE(0),
            "textANSICodePage" => U16::LE(0),
            "pad2octetsE" => U16::LE(0)
        ],
    }
}

pub fn bitmap_cache_capability() -> Capability {
    Capability {
        cap_type: CapabilitySetType::CapstypeBitmapcache,
        message: component![
            "pad1" => U32::LE(0),
            "pad2" => U32::LE(0),
            "pad3" => U32::LE(0),
            "pad4" => U32::LE(0),
            "pad5" => U32::LE(0),
            "pad6" => U32::LE(0),
            "cache0Entries" => U16::LE(200),
            "cache0MaximumCellSize" => U16::LE(1024),
            "cache1Entries" => U16::LE(600),
            "cache1MaximumCellSize" => U16::LE(4096),
            "cache2Entries" => U16::LE(1000),
            "cache2MaximumCellSize" => U16::LE(16384)
        ],
    }
}

pub fn pointer_capability() -> Capability {
    Capability {
        cap_type: CapabilitySetType::CapstypePointer,
        message: component![
            "colorPointerFlag" => U16::LE(1),
            "colorPointerCacheSize" => U16::LE(20)
        ],
    }
}

pub fn input_capability(flags: u16, layout: u32) -> Capability {
    Capability {
        cap_type: CapabilitySetType::CapstypeInput,
        message: component![
            "inputFlags" => U16::LE(flags),
            "pad2octetsA" => U16::LE(0),
            "keyboardLayout" => U32::LE(layout),
            "keyboardType" => U32::LE(4),
            "keyboardSubType" => U32::LE(0),
            "keyboardFunctionKey" => U32::LE(12),
            "imeFileName" => vec![0_u8; 64]
        ],
    }
}

pub fn brush_capability() -> Capability {
    Capability {
        cap_type: CapabilitySetType::CapstypeBrush,
        message: component![
            "brushSupportLevel" => U32::LE(0)
        ],
    }
}

pub fn glyph_capability() -> Capability {
    Capability {
        cap_type: CapabilitySetType::CapstypeGlyphcache,
        message: component![
            "glyphCache" => vec![0_u8; 40],
            "fragCache" => U32::LE(0),
            "glyphSupportLevel" => U16::LE(0),
            "pad2octets" => U16::LE(0)
        ],
    }
}

pub fn offscreen_capability() -> Capability {
    Capability {
        cap_type: CapabilitySetType::CapstypeOffscreencache,
        message: component![
            "offscreenSupportLevel" => U32::LE(0),
            "offscreenCacheSize" => U16::LE(0),
            "offscreenCacheEntries" => U16::LE(0)
        ],
    }
}

pub fn virtual_channel_capability() -> Capability {
    Capability {
        cap_type: CapabilitySetType::CapstypeVirtualchannel,
        message: component![
            "flags" => U32::LE(0),
            "VCChunkSize" => U32::LE(1600)
        ],
    }
}

pub fn sound_capability() -> Capability {
    Capability {
        cap_type: CapabilitySetType::CapstypeSound,
        message: component![
            "soundFlags" => U16::LE(0),
            "pad2octetsA" => U16::LE(0)
        ],
    }
}

pub fn multifragment_update_capability(max_request_size: u32) -> Capability {
    Capability {
        cap_type: CapabilitySetType::CapsettypeMultifragmentupdate,
        message: component![
            "MaxRequestSize" => U32::LE(max_request_size)
        ],
    }
}

/// The default client capability sets announced during the
/// confirm active phase
pub fn client_capabilities(width: u16, height: u16, layout: u32) -> Vec<Capability> {
    vec![
        general_capability(
            GeneralExtraFlag::LongCredentialsSupported as u16
                | GeneralExtraFlag::NoBitmapCompressionHdr as u16
                | GeneralExtraFlag::EncSaltedChecksum as u16
                | GeneralExtraFlag::FastpathOutputSupported as u16,
        ),
        bitmap_capability(16, width, height),
        order_capability(),
        bitmap_cache_capability(),
        pointer_capability(),
        input_capability(
            InputFlags::InputFlagScancodes as u16
                | InputFlags::InputFlagMousex as u16
                | InputFlags::InputFlagUnicode as u16,
            layout,
        ),
        brush_capability(),
        glyph_capability(),
        offscreen_capability(),
        virtual_channel_capability(),
        sound_capability(),
        multifragment_update_capability(0),
    ]
}

/// Raw capability sets received from the peer, keyed by type
pub type CapabilitySets = IndexMap<u16, Vec<u8>>;

/// Parse `count` capability sets out of a demand or confirm
/// active payload
pub fn parse_capability_sets(count: u16, stream: &mut dyn Read) -> RdpResult<CapabilitySets> {
    let mut result = IndexMap::new();
    for _ in 0..count {
        let mut header = component![
            "capabilitySetType" => U16::LE(0),
            "lengthCapability" => U16::LE(0)
        ];
        header.read(stream)?;
        let cap_type = cast!(DataType::U16, header["capabilitySetType"])?;
        let length = cast!(DataType::U16, header["lengthCapability"])? as usize;
        if length < 4 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                "capability set with an invalid length",
            )));
        }
        let mut payload = vec![0_u8; length - 4];
        stream.read_exact(&mut payload)?;
        result.insert(cap_type, payload);
    }
    Ok(result)
}

/// Read the extra flags of a general capability payload
pub fn general_extra_flags(sets: &CapabilitySets) -> Option<u16> {
    let payload = sets.get(&(CapabilitySetType::CapstypeGeneral as u16))?;
    let mut parsed = general_capability(0).message;
    parsed.read(&mut Cursor::new(payload.to_vec())).ok()?;
    cast!(DataType::U16, parsed["extraFlags"]).ok()
}

/// Serialize capability sets back to back
pub fn write_capability_sets(capabilities: &[Capability]) -> Vec<u8> {
    let mut result = Vec::new();
    for capability in capabilities {
        result.extend_from_slice(&capability.to_bytes());
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_capability_round_trip() {
        let capabilities = client_capabilities(1024, 768, 0x409);
        let raw = write_capability_sets(&capabilities);
        let parsed =
            parse_capability_sets(capabilities.len() as u16, &mut Cursor::new(raw)).unwrap();
        assert_eq!(parsed.len(), capabilities.len());
        assert!(parsed.contains_key(&(CapabilitySetType::CapstypeGeneral as u16)));
    }

    #[test]
    fn test_general_extra_flags_decoded() {
        let capabilities = vec![general_capability(
            GeneralExtraFlag::FastpathOutputSupported as u16,
        )];
        let raw = write_capability_sets(&capabilities);
        let parsed = parse_capability_sets(1, &mut Cursor::new(raw)).unwrap();
        assert_eq!(
            general_extra_flags(&parsed).unwrap(),
            GeneralExtraFlag::FastpathOutputSupported as u16
        );
    }

    #[test]
    fn test_truncated_capability_rejected() {
        let raw = vec![0x01, 0x00, 0x03, 0x00];
        assert!(parse_capability_sets(1, &mut Cursor::new(raw)).is_err());
    }
}
