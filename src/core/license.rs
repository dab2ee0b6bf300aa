use crate::core::sec::{self, SecurityFlag, ServerCertificate};
use crate::model::data::{
    to_vec, Check, Component, DataType, DynOption, Message, MessageOption, Trame, U16, U32,
};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use crate::model::rnd::random;
use log::{debug, info, warn};
use md5::Digest;
use num_enum::TryFromPrimitive;
use rc4::{Key, KeyInit, Rc4, StreamCipher};
use ring::digest;
use std::convert::TryFrom;
use std::ffi::CString;
use std::fs;
use std::io::{Cursor, Read};
use std::path::PathBuf;

const KEY_EXCHANGE_ALG_RSA: u32 = 0x00000001;
const PLATFORM_CHALLENGE_VERSION: u16 = 0x0100;
const CLIENT_RANDOM_SIZE: usize = 32;
const PREMASTER_RANDOM_SIZE: usize = 48;
const MAC_SIZE: usize = 16;

#[repr(u8)]
#[allow(dead_code)]
enum Preambule {
    PreambleVersion20 = 0x2,
    PreambleVersion30 = 0x3,
    ExtendedErrorMsgSupported = 0x80,
}

#[repr(u16)]
#[allow(dead_code)]
enum PlatformChallengeType {
    Win32 = 0x0100,
    Win16 = 0x0200,
    WinCE = 0x0300,
    Other = 0xFF00,
}

#[repr(u16)]
#[allow(dead_code)]
enum LicenseDetailLevel {
    Simple = 0x0001,
    Moderate = 0x0002,
    Detail = 0x0003,
}

/// All type of message
/// which can follow a license preamble
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/73170ca2-5f82-4a2d-9d1b-b439f3d8dadc
#[repr(u8)]
#[derive(TryFromPrimitive, Copy, Clone, Debug)]
pub enum MessageType {
    LicenseRequest = 0x01,
    PlatformChallenge = 0x02,
    NewLicense = 0x03,
    UpgradeLicense = 0x04,
    LicenseInfo = 0x12,
    NewLicenseRequest = 0x13,
    PlatformChallengeResponse = 0x15,
    ErrorAlert = 0xFF,
}

/// Error code of the license automata
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/f18b6c9f-f3d8-4a0e-8398-f9b153233dca
#[repr(u32)]
#[derive(PartialEq, Eq, TryFromPrimitive, Copy, Clone, Debug)]
pub enum ErrorCode {
    ErrInvalidServerCertificate = 0x00000001,
    ErrNoLicense = 0x00000002,
    ErrInvalidMac = 0x00000003,
    ErrInvalidScope = 0x00000004,
    ErrNoLicenseServer = 0x00000006,
    StatusValidClient = 0x00000007,
    ErrInvalidClient = 0x00000008,
    ErrInvalidProductid = 0x0000000B,
    ErrInvalidMessageLen = 0x0000000C,
}

/// All valid state transition available
/// for license automata
#[repr(u32)]
#[derive(PartialEq, Eq, TryFromPrimitive, Copy, Clone, Debug)]
pub enum StateTransition {
    StTotalAbort = 0x00000001,
    StNoTransition = 0x00000002,
    StResetPhaseToStart = 0x00000003,
    StResendLastMessage = 0x00000004,
}

/// Semantic type of a binary blob inside license messages
#[repr(u16)]
#[derive(TryFromPrimitive, Copy, Clone)]
pub enum BlobType {
    Any = 0x0000,
    Data = 0x0001,
    Random = 0x0002,
    Certificate = 0x0003,
    Error = 0x0004,
    EncryptedData = 0x0009,
    KeyExchgAlg = 0x000D,
    Scope = 0x000E,
    ClientUserName = 0x000F,
    ClientMachineName = 0x0010,
}

#[repr(u32)]
#[derive(TryFromPrimitive)]
pub enum ClientImageId {
    Microsoft = 0x00010000,
    Citrix = 0x00020000,
}

#[repr(u32)]
#[derive(TryFromPrimitive)]
pub enum ClientOsId {
    WinNt351 = 0x01000000,
    WinNt40 = 0x02000000,
    WinNt50 = 0x03000000,
    WinNtPost52 = 0x04000000,
}

/// State of the licensing exchange
///
/// The exchange either completes, with or without a fresh
/// license, or aborts on a server error alert
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LicenseState {
    Initial,
    Await,
    Completed,
    Aborted,
}

/// Licenses are persisted under a name derived from the
/// server hostname so the client can answer the next license
/// request with the cached blob
pub trait LicenseStore {
    fn save_license(&mut self, hostname: &str, license: &[u8]) -> RdpResult<()>;
    fn load_license(&self, hostname: &str) -> Option<Vec<u8>>;
}

impl<T: LicenseStore + ?Sized> LicenseStore for Box<T> {
    fn save_license(&mut self, hostname: &str, license: &[u8]) -> RdpResult<()> {
        (**self).save_license(hostname, license)
    }
    fn load_license(&self, hostname: &str) -> Option<Vec<u8>> {
        (**self).load_license(hostname)
    }
}

/// A store which never remembers anything
pub struct NoopLicenseStore;

impl LicenseStore for NoopLicenseStore {
    fn save_license(&mut self, _hostname: &str, _license: &[u8]) -> RdpResult<()> {
        Ok(())
    }
    fn load_license(&self, _hostname: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Hex encoded SHA1 of the hostname, the content address of
/// a cached license
fn license_file_name(hostname: &str) -> String {
    let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, hostname.as_bytes());
    let mut name = String::with_capacity(40);
    for byte in hash.as_ref() {
        name.push_str(&format!("{:02x}", byte));
    }
    name
}

/// File backed license store
///
/// Writes go to a temporary file first and are committed with
/// an atomic rename so a crash never corrupts a previously
/// stored license
pub struct FileLicenseStore {
    directory: PathBuf,
}

impl FileLicenseStore {
    pub fn new<P: Into<PathBuf>>(directory: P) -> Self {
        FileLicenseStore {
            directory: directory.into(),
        }
    }
}

impl LicenseStore for FileLicenseStore {
    fn save_license(&mut self, hostname: &str, license: &[u8]) -> RdpResult<()> {
        fs::create_dir_all(&self.directory)?;
        let name = license_file_name(hostname);
        let path = self.directory.join(format!("{}.cal", name));
        let temp_path = self.directory.join(format!("{}.cal.new", name));
        fs::write(&temp_path, license)?;
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(Error::Io(e));
        }
        Ok(())
    }

    fn load_license(&self, hostname: &str) -> Option<Vec<u8>> {
        let path = self
            .directory
            .join(format!("{}.cal", license_file_name(hostname)));
        fs::read(path).ok()
    }
}

pub enum LicenseMessage {
    NewLicense(NewLicense),
    LicenseRequest(ServerLicenseRequest),
    PlatformChallenge(PlatformChallenge),
    UpgradeLicense(UpgradeLicense),
    ErrorAlert(ErrorAlert),
}

impl LicenseMessage {
    /// Decode a license message out of a channel payload whose
    /// security header was already consumed
    fn new(stream: &mut dyn Read) -> RdpResult<Self> {
        let mut license_message = component![
            "bMsgtype" => 0_u8,
            "flag" => Check::new(Preambule::PreambleVersion30 as u8),
            "wMsgSize" => DynOption::new(U16::LE(0), |size| MessageOption::Size("message".to_string(), size.inner() as usize - 4)),
            "message" => Vec::<u8>::new()
        ];

        license_message.read(stream)?;
        let msg_type = cast!(DataType::U8, license_message["bMsgtype"])?;
        let mut msg_data = Cursor::new(cast!(DataType::Slice, license_message["message"])?);

        match MessageType::try_from(msg_type)? {
            MessageType::NewLicense => Ok(Self::NewLicense(NewLicense::from_bytes(&mut msg_data)?)),
            MessageType::LicenseRequest => Ok(Self::LicenseRequest(
                ServerLicenseRequest::from_bytes(&mut msg_data)?,
            )),
            MessageType::PlatformChallenge => Ok(Self::PlatformChallenge(
                PlatformChallenge::from_bytes(&mut msg_data)?,
            )),
            MessageType::UpgradeLicense => Ok(Self::UpgradeLicense(UpgradeLicense::from_bytes(
                &mut msg_data,
            )?)),
            MessageType::ErrorAlert => Ok(Self::ErrorAlert(ErrorAlert::from_bytes(&mut msg_data)?)),
            _ => Err(Error::RdpError(RdpError::new(
                RdpErrorKind::NotImplemented,
                &format!("unhandled license message type {:?}", msg_type),
            ))),
        }
    }
}

pub struct NewLicense {
    mac_data: Vec<u8>,
    encrypted_license_data: Vec<u8>,
}

impl NewLicense {
    fn from_bytes(raw: &mut dyn Read) -> RdpResult<Self> {
        let mut message = component![
            "EncryptedLicenseInfo" => component![
                "wBlobType" => U16::LE(0),
                "wBlobLen" => DynOption::new(U16::LE(0), |size| MessageOption::Size("blobData".to_string(), size.inner() as usize)),
                "blobData" => Vec::<u8>::new()
            ],
            "MACData" => vec![0_u8; MAC_SIZE]
        ];

        message.read(raw)?;
        let encrypted_license_info = cast!(DataType::Component, message["EncryptedLicenseInfo"])?;
        Ok(Self {
            encrypted_license_data: cast!(DataType::Slice, encrypted_license_info["blobData"])?
                .to_vec(),
            mac_data: cast!(DataType::Slice, message["MACData"])?.to_vec(),
        })
    }
}

#[allow(dead_code)]
pub struct UpgradeLicense {
    mac_data: Vec<u8>,
    encrypted_license_data: Vec<u8>,
}

impl UpgradeLicense {
    fn from_bytes(raw: &mut dyn Read) -> RdpResult<Self> {
        let inner = NewLicense::from_bytes(raw)?;
        Ok(Self {
            mac_data: inner.mac_data,
            encrypted_license_data: inner.encrypted_license_data,
        })
    }
}

pub struct ErrorAlert {
    code: ErrorCode,
    state_transition: StateTransition,
}

impl ErrorAlert {
    fn from_bytes(raw: &mut dyn Read) -> RdpResult<Self> {
        let mut message = component![
            "dwErrorCode" => U32::LE(0),
            "dwStateTransition" => U32::LE(0),
            "blob" => component![
                "wBlobType" => U16::LE(0),
                "wBlobLen" => DynOption::new(U16::LE(0), |size| MessageOption::Size("blobData".to_string(), size.inner() as usize)),
                "blobData" => Vec::<u8>::new()
            ]
        ];
        message.read(raw)?;

        let code = ErrorCode::try_from(cast!(DataType::U32, message["dwErrorCode"])?)?;
        let state_transition =
            StateTransition::try_from(cast!(DataType::U32, message["dwStateTransition"])?)?;
        Ok(Self {
            code,
            state_transition,
        })
    }

    /// The server uses a valid client status alert as the
    /// licensing not required marker
    fn is_valid(&self) -> RdpResult<()> {
        if self.code == ErrorCode::StatusValidClient
            && self.state_transition == StateTransition::StNoTransition
        {
            Ok(())
        } else {
            Err(Error::RdpError(RdpError::new(
                RdpErrorKind::RejectedByServer,
                &format!("server rejected the license exchange: {:?}", self.code),
            )))
        }
    }
}

struct BinaryBlob {
    blob_type: BlobType,
    data: Vec<u8>,
}

impl BinaryBlob {
    fn new(blob_type: BlobType, data: Vec<u8>) -> Self {
        Self { blob_type, data }
    }

    fn component(self) -> Component {
        component![
            "wBlobType" => U16::LE(self.blob_type as u16),
            "wBlobLen" => U16::LE(self.data.len() as u16),
            "blobData" => self.data
        ]
    }
}

pub struct PlatformChallenge {
    mac_data: Vec<u8>,
    encrypted_platform_challenge: Vec<u8>,
}

impl PlatformChallenge {
    fn from_bytes(raw: &mut dyn Read) -> RdpResult<Self> {
        let mut message = component![
            "ConnectFlags" => U32::LE(0),
            "EncryptedPlatformChallenge" => component![
                "wBlobType" => U16::LE(0),
                "wBlobLen" => DynOption::new(U16::LE(0), |size| MessageOption::Size("blobData".to_string(), size.inner() as usize)),
                "blobData" => Vec::<u8>::new()
            ],
            "MACData" => vec![0_u8; MAC_SIZE]
        ];
        message.read(raw)?;
        Ok(Self {
            mac_data: cast!(DataType::Slice, message["MACData"])?.to_vec(),
            encrypted_platform_challenge: cast!(
                DataType::Slice,
                cast!(DataType::Component, message["EncryptedPlatformChallenge"])?["blobData"]
            )?
            .to_vec(),
        })
    }
}

pub struct ServerLicenseRequest {
    server_random: Vec<u8>,
    certificate: ServerCertificate,
}

impl ServerLicenseRequest {
    fn from_bytes(raw: &mut dyn Read) -> RdpResult<Self> {
        let mut message = component![
            "ServerRandom" => vec![0u8; 32],
            "dwVersion" => U32::LE(0),
            "cbCompanyName" => DynOption::new(U32::LE(0), |size| MessageOption::Size("pbCompanyName".to_string(), size.inner() as usize)),
            "pbCompanyName" => Vec::<u8>::new(),
            "cbProductId" => DynOption::new(U32::LE(0), |size| MessageOption::Size("pbProductId".to_string(), size.inner() as usize)),
            "pbProductId" => Vec::<u8>::new(),
            "KeyExchangeList" => component![
                "wBlobType" => U16::LE(0),
                "wBlobLen" => DynOption::new(U16::LE(0), |size| MessageOption::Size("blobData".to_string(), size.inner() as usize)),
                "blobData" => Vec::<u8>::new()
            ],
            "ServerCertificate" => component![
                "wBlobType" => U16::LE(0),
                "wBlobLen" => DynOption::new(U16::LE(0), |size| MessageOption::Size("blobData".to_string(), size.inner() as usize)),
                "blobData" => Vec::<u8>::new()
            ],
            "ScopeCount" => DynOption::new(U32::LE(0), |size| MessageOption::Size("ScopeArray".to_string(), size.inner() as usize)),
            "ScopeArray" => Vec::<u8>::new()
        ];

        message.read(raw)?;
        let server_random = cast!(DataType::Slice, message["ServerRandom"])?;
        let server_certificate = cast!(DataType::Component, message["ServerCertificate"])?;
        let mut blob_data = cast!(DataType::Slice, server_certificate["blobData"])?;

        Ok(Self {
            server_random: Vec::from(server_random),
            certificate: ServerCertificate::from_bytes(&mut blob_data)?,
        })
    }
}

/// Licensing key material derived from the randoms
///
/// The derivation chain is the same SaltedHash construction as
/// the session security keys, with the licensing premaster
/// secret as input
struct SessionEncryptionData {
    client_random: Vec<u8>,
    premaster_secret: Vec<u8>,
    mac_salt_key: Vec<u8>,
    license_encryption_key: Vec<u8>,
    certificate: ServerCertificate,
}

impl SessionEncryptionData {
    fn new(
        client_random: Vec<u8>,
        server_random: Vec<u8>,
        premaster_secret: Vec<u8>,
        certificate: ServerCertificate,
    ) -> Self {
        let master = sec::master_secret(&premaster_secret, &client_random, &server_random);
        let session_key_blob = sec::session_key_blob(&master, &client_random, &server_random);
        let mac_salt_key = session_key_blob[..16].to_vec();
        let license_encryption_key =
            sec::md5_16_32_32(&session_key_blob[16..32], &client_random, &server_random);

        Self {
            client_random,
            premaster_secret,
            mac_salt_key,
            license_encryption_key,
            certificate,
        }
    }

    fn rc4(&self) -> Rc4<rc4::consts::U16> {
        Rc4::new(Key::<rc4::consts::U16>::from_slice(
            &self.license_encryption_key,
        ))
    }

    fn decrypt_message(&self, message: &[u8]) -> Vec<u8> {
        let mut buf: Vec<u8> = message.to_vec();
        self.rc4().apply_keystream(&mut buf);
        buf
    }

    fn encrypt_message(&self, message: &[u8]) -> Vec<u8> {
        // RC4 is symmetric
        self.decrypt_message(message)
    }

    fn generate_mac_data(&self, data: &[u8]) -> Vec<u8> {
        sec::mac_data(&self.mac_salt_key, data)
    }
}

/// Wraps license message with security and preamble headers
fn license_response(message_type: MessageType, data: Vec<u8>) -> Vec<u8> {
    to_vec(&trame![
        U16::LE(SecurityFlag::SecLicensePkt as u16),
        U16::LE(0),
        component![
            "bMsgtype" => message_type as u8,
            "flag" => Check::new(Preambule::PreambleVersion30 as u8),
            "wMsgSize" => U16::LE(data.len() as u16 + 4),
            "message" => data
        ]
    ])
}

/// Client side of the licensing exchange
///
/// Driven one message at a time by the connection state
/// machine. Responses come back as complete channel payloads
/// the caller sends on the global channel.
pub struct LicenseClient {
    state: LicenseState,
    username: String,
    hostname: String,
    store: Box<dyn LicenseStore>,
    session: Option<SessionEncryptionData>,
}

impl LicenseClient {
    pub fn new(username: &str, hostname: &str, store: Box<dyn LicenseStore>) -> Self {
        LicenseClient {
            state: LicenseState::Initial,
            username: username.to_string(),
            hostname: hostname.to_string(),
            store,
            session: None,
        }
    }

    pub fn state(&self) -> LicenseState {
        self.state
    }

    /// Feed one inbound license message
    ///
    /// The stream must be positioned at the license preamble.
    /// Returns the new state and an optional response payload.
    pub fn process(&mut self, stream: &mut dyn Read) -> RdpResult<(LicenseState, Option<Vec<u8>>)> {
        match LicenseMessage::new(stream)? {
            LicenseMessage::LicenseRequest(request) => self.on_license_request(request),
            LicenseMessage::PlatformChallenge(challenge) => self.on_platform_challenge(challenge),
            LicenseMessage::NewLicense(new_license) => {
                self.on_new_license(new_license.encrypted_license_data, new_license.mac_data)
            }
            LicenseMessage::UpgradeLicense(upgrade) => {
                self.on_new_license(upgrade.encrypted_license_data, upgrade.mac_data)
            }
            LicenseMessage::ErrorAlert(alert) => match alert.is_valid() {
                Ok(()) => {
                    self.state = LicenseState::Completed;
                    Ok((self.state, None))
                }
                Err(e) => {
                    self.state = LicenseState::Aborted;
                    Err(e)
                }
            },
        }
    }

    fn on_license_request(
        &mut self,
        request: ServerLicenseRequest,
    ) -> RdpResult<(LicenseState, Option<Vec<u8>>)> {
        let session = SessionEncryptionData::new(
            random(CLIENT_RANDOM_SIZE),
            request.server_random,
            random(PREMASTER_RANDOM_SIZE),
            request.certificate,
        );

        let response = match self.store.load_license(&self.hostname) {
            Some(license) => {
                debug!("answering the license request with a cached license");
                license_response(
                    MessageType::LicenseInfo,
                    self.license_info(&session, &license),
                )
            }
            None => {
                debug!("no cached license, requesting a new one");
                license_response(
                    MessageType::NewLicenseRequest,
                    self.new_license_request(&session)?,
                )
            }
        };

        self.session = Some(session);
        self.state = LicenseState::Await;
        Ok((self.state, Some(response)))
    }

    /// CLIENT_NEW_LICENSE_REQUEST
    /// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpele/c57e4890-51a0-4e2a-b2b6-2d2f85449e86
    fn new_license_request(&self, session: &SessionEncryptionData) -> RdpResult<Vec<u8>> {
        let username = CString::new(self.username.as_str())
            .unwrap_or_else(|_| CString::new("default").unwrap());
        let hostname = CString::new(self.hostname.as_str())
            .unwrap_or_else(|_| CString::new("default").unwrap());

        Ok(to_vec(&component![
            "PreferredKeyExchangeAlg" => U32::LE(KEY_EXCHANGE_ALG_RSA),
            "PlatformId" => U32::LE(ClientOsId::WinNtPost52 as u32 | ClientImageId::Microsoft as u32),
            "ClientRandom" => session.client_random.clone(),
            "EncryptedPreMasterSecret" => BinaryBlob::new(
                BlobType::Random,
                session.certificate.encrypt_message(&session.premaster_secret)
            ).component(),
            "ClientUserName" => BinaryBlob::new(
                BlobType::ClientUserName,
                username.to_bytes_with_nul().to_owned()
            ).component(),
            "ClientMachineName" => BinaryBlob::new(
                BlobType::ClientMachineName,
                hostname.to_bytes_with_nul().to_owned()
            ).component()
        ]))
    }

    /// CLIENT_LICENSE_INFO, the answer when a cached license
    /// exists for this server
    /// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpele/1d258f4a-fae2-4831-ae91-223d26f8c2a4
    fn license_info(&self, session: &SessionEncryptionData, license: &[u8]) -> Vec<u8> {
        let hwid = self.hardware_id();
        let encrypted_hwid = session.encrypt_message(&hwid);
        let mac_data = session.generate_mac_data(&hwid);

        to_vec(&component![
            "PreferredKeyExchangeAlg" => U32::LE(KEY_EXCHANGE_ALG_RSA),
            "PlatformId" => U32::LE(ClientOsId::WinNtPost52 as u32 | ClientImageId::Microsoft as u32),
            "ClientRandom" => session.client_random.clone(),
            "EncryptedPreMasterSecret" => BinaryBlob::new(
                BlobType::Random,
                session.certificate.encrypt_message(&session.premaster_secret)
            ).component(),
            "LicenseInfo" => BinaryBlob::new(BlobType::Data, license.to_vec()).component(),
            "EncryptedHWID" => BinaryBlob::new(BlobType::EncryptedData, encrypted_hwid).component(),
            "MACData" => mac_data
        ])
    }

    /// Hardware identifier: the platform id followed by an
    /// MD5 digest of the client hostname
    fn hardware_id(&self) -> Vec<u8> {
        let mut md5 = md5::Md5::new();
        md5.input(
            gethostname::gethostname()
                .to_str()
                .unwrap_or("default"),
        );
        let digest: Vec<u8> = md5.result().to_vec();

        to_vec(&component![
            "PlatformId" => U32::LE(ClientOsId::WinNtPost52 as u32 | ClientImageId::Microsoft as u32),
            "client_hardware_id" => digest
        ])
    }

    fn on_platform_challenge(
        &mut self,
        challenge: PlatformChallenge,
    ) -> RdpResult<(LicenseState, Option<Vec<u8>>)> {
        let session = try_option!(
            self.session.as_ref(),
            "platform challenge received before the license request"
        )?;

        let challenge_data = session.decrypt_message(&challenge.encrypted_platform_challenge);
        if session.generate_mac_data(&challenge_data) != challenge.mac_data {
            self.state = LicenseState::Aborted;
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidChecksum,
                "platform challenge MAC is different than MAC from encrypted message",
            )));
        }

        let challenge_response = to_vec(&component![
            "wVersion" => U16::LE(PLATFORM_CHALLENGE_VERSION),
            "wClientType" => U16::LE(PlatformChallengeType::Other as u16),
            "wLicenseDetailLevel" => U16::LE(LicenseDetailLevel::Detail as u16),
            "cbChallenge" => U16::LE(challenge_data.len() as u16),
            "pbChallenge" => challenge_data
        ]);
        let hwid = self.hardware_id();

        let encrypted_challenge_response = session.encrypt_message(&challenge_response);
        let encrypted_hwid = session.encrypt_message(&hwid);

        // MAC generated over the plaintext response followed by
        // the plaintext hardware identifier
        let mac_data =
            session.generate_mac_data(&[challenge_response.as_slice(), hwid.as_slice()].concat());

        let response = license_response(
            MessageType::PlatformChallengeResponse,
            to_vec(&component![
                "EncryptedPlatformChallengeResponse" => BinaryBlob::new(BlobType::EncryptedData, encrypted_challenge_response).component(),
                "EncryptedHWID" => BinaryBlob::new(BlobType::EncryptedData, encrypted_hwid).component(),
                "MACData" => mac_data
            ]),
        );

        self.state = LicenseState::Await;
        Ok((self.state, Some(response)))
    }

    fn on_new_license(
        &mut self,
        encrypted: Vec<u8>,
        mac: Vec<u8>,
    ) -> RdpResult<(LicenseState, Option<Vec<u8>>)> {
        // a new license at the start of the exchange means the
        // server does not require any licensing round
        let session = match self.session.as_ref() {
            Some(session) => session,
            None => {
                self.state = LicenseState::Completed;
                return Ok((self.state, None));
            }
        };

        let license_data = session.decrypt_message(&encrypted);
        if session.generate_mac_data(&license_data) != mac {
            self.state = LicenseState::Aborted;
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidChecksum,
                "license MAC is different than MAC from encrypted message",
            )));
        }

        match parse_new_license_payload(&license_data) {
            Ok(license) => {
                if let Err(e) = self.store.save_license(&self.hostname, &license) {
                    warn!("could not persist the license: {:?}", e);
                } else {
                    info!("license stored for {}", self.hostname);
                }
            }
            Err(e) => warn!("could not parse the new license payload: {:?}", e),
        }

        self.state = LicenseState::Completed;
        Ok((self.state, None))
    }
}

/// Extract the license certificate out of a decrypted new or
/// upgrade license payload
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpele/c82bcfa3-0741-4c25-8c45-58c4bbda3c3b
fn parse_new_license_payload(payload: &[u8]) -> RdpResult<Vec<u8>> {
    let mut message = component![
        "dwVersion" => U32::LE(0),
        "cbScope" => DynOption::new(U32::LE(0), |size| MessageOption::Size("pbScope".to_string(), size.inner() as usize)),
        "pbScope" => Vec::<u8>::new(),
        "cbCompanyName" => DynOption::new(U32::LE(0), |size| MessageOption::Size("pbCompanyName".to_string(), size.inner() as usize)),
        "pbCompanyName" => Vec::<u8>::new(),
        "cbProductId" => DynOption::new(U32::LE(0), |size| MessageOption::Size("pbProductId".to_string(), size.inner() as usize)),
        "pbProductId" => Vec::<u8>::new(),
        "cbLicenseInfo" => DynOption::new(U32::LE(0), |size| MessageOption::Size("pbLicenseInfo".to_string(), size.inner() as usize)),
        "pbLicenseInfo" => Vec::<u8>::new()
    ];
    message.read(&mut Cursor::new(payload.to_vec()))?;
    Ok(cast!(DataType::Slice, message["pbLicenseInfo"])?.to_vec())
}

/// Build the licensing not required marker, accepting role
///
/// STATUS_VALID_CLIENT error alert with no transition
pub fn valid_client_payload() -> Vec<u8> {
    license_response(
        MessageType::ErrorAlert,
        to_vec(&component![
            "dwErrorCode" => U32::LE(ErrorCode::StatusValidClient as u32),
            "dwStateTransition" => U32::LE(StateTransition::StNoTransition as u32),
            "blob" => component![
                "wBlobType" => U16::LE(BlobType::Error as u16),
                "wBlobLen" => U16::LE(0)
            ]
        ]),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use rsa::RsaPublicKey;

    const CLIENT_RANDOM_BUFFER: [u8; 32] = [
        29, 91, 101, 210, 58, 6, 253, 117, 36, 209, 128, 84, 229, 91, 28, 208, 0, 65, 109, 164,
        235, 10, 22, 69, 183, 184, 158, 209, 128, 157, 122, 187,
    ];
    const SERVER_RANDOM_BUFFER: [u8; 32] = [
        135, 43, 167, 218, 195, 159, 70, 134, 193, 59, 40, 249, 168, 129, 51, 230, 69, 18, 45, 19,
        183, 23, 238, 173, 95, 50, 156, 45, 254, 174, 194, 255,
    ];
    const PREMASTER_SECRET_BUFFER: [u8; 48] = [
        10, 63, 107, 103, 158, 17, 153, 19, 221, 157, 28, 215, 121, 50, 89, 79, 194, 171, 104, 34,
        180, 124, 248, 187, 66, 180, 163, 60, 208, 90, 236, 216, 4, 98, 137, 236, 151, 108, 126,
        215, 164, 2, 191, 110, 236, 93, 51, 40,
    ];
    const SESSION_KEY_BLOB: [u8; 48] = [
        116, 192, 213, 13, 126, 75, 71, 132, 142, 4, 227, 137, 9, 236, 124, 46, 180, 3, 198, 101,
        137, 71, 69, 8, 249, 165, 203, 120, 82, 245, 219, 102, 102, 5, 158, 87, 22, 221, 137, 195,
        241, 120, 125, 127, 224, 14, 174, 47,
    ];
    const LICENSE_KEY_BUFFER: [u8; 16] = [
        44, 229, 51, 182, 241, 98, 94, 249, 201, 240, 209, 190, 72, 113, 246, 41,
    ];

    fn dummy_certificate() -> ServerCertificate {
        // any RSA key will do for derivation tests
        let n = rsa::BigUint::from_bytes_be(&[
            0xAB, 0xAC, 0x87, 0x11, 0x83, 0xBF, 0xE9, 0x48, 0x25, 0x00, 0x2C, 0x33, 0x31, 0x5E,
            0x3D, 0x78, 0xC8, 0x5F, 0x82, 0xCB, 0x36, 0x41, 0xF5, 0xB4, 0x65, 0x15, 0xEE, 0x04,
            0x31, 0xAE, 0xE2, 0x48, 0x58, 0x99, 0x7F, 0x4F, 0x90, 0x1D, 0xF7, 0x7C, 0xD7, 0xF8,
            0x47, 0x93, 0xA0, 0xCA, 0x9C, 0xDF, 0x91, 0xB0, 0x41, 0xE8, 0x05, 0x4B, 0xDC, 0x24,
            0x5B, 0x72, 0xF7, 0x68, 0x91, 0x84, 0xFB, 0x19,
        ]);
        let e = rsa::BigUint::from_slice(&[0x10001]);
        ServerCertificate::Proprietary(RsaPublicKey::new(n, e).unwrap())
    }

    #[test]
    fn test_session_key_blob_derivation() {
        let master = sec::master_secret(
            &PREMASTER_SECRET_BUFFER,
            &CLIENT_RANDOM_BUFFER,
            &SERVER_RANDOM_BUFFER,
        );
        let blob = sec::session_key_blob(&master, &CLIENT_RANDOM_BUFFER, &SERVER_RANDOM_BUFFER);
        assert_eq!(blob, SESSION_KEY_BLOB.as_ref());
    }

    #[test]
    fn test_license_encryption_key_derivation() {
        let session = SessionEncryptionData::new(
            CLIENT_RANDOM_BUFFER.to_vec(),
            SERVER_RANDOM_BUFFER.to_vec(),
            PREMASTER_SECRET_BUFFER.to_vec(),
            dummy_certificate(),
        );
        assert_eq!(
            session.license_encryption_key,
            LICENSE_KEY_BUFFER.as_ref()
        );
    }

    #[test]
    fn test_license_mac_round_trip() {
        let session = SessionEncryptionData::new(
            CLIENT_RANDOM_BUFFER.to_vec(),
            SERVER_RANDOM_BUFFER.to_vec(),
            PREMASTER_SECRET_BUFFER.to_vec(),
            dummy_certificate(),
        );
        let encrypted = session.encrypt_message(b"challenge");
        assert_eq!(session.decrypt_message(&encrypted), b"challenge");
        let mac = session.generate_mac_data(b"challenge");
        assert_eq!(mac.len(), MAC_SIZE);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileLicenseStore::new(dir.path());
        store.save_license("test-host", &[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(store.load_license("test-host").unwrap(), [0x01, 0x02, 0x03]);
        assert!(store.load_license("other-host").is_none());
    }

    #[test]
    fn test_file_store_interrupted_write_keeps_committed_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileLicenseStore::new(dir.path());
        store.save_license("test-host", &[1, 2, 3]).unwrap();

        // simulate a crash between the temporary write and the
        // rename: the temporary file exists but was never moved
        let temp_path = dir
            .path()
            .join(format!("{}.cal.new", license_file_name("test-host")));
        fs::write(&temp_path, [9, 9, 9]).unwrap();

        assert_eq!(store.load_license("test-host").unwrap(), [1, 2, 3]);
    }

    #[test]
    fn test_valid_client_marker_completes_the_exchange() {
        let payload = valid_client_payload();
        // skip the security header
        let mut stream = Cursor::new(payload[4..].to_vec());
        let mut client = LicenseClient::new("user", "host", Box::new(NoopLicenseStore));
        let (state, response) = client.process(&mut stream).unwrap();
        assert_eq!(state, LicenseState::Completed);
        assert!(response.is_none());
    }

    #[test]
    fn test_license_file_name_is_stable() {
        // hex encoded SHA1 of the hostname
        assert_eq!(
            license_file_name("test-host"),
            "75a445037a58661b99a1062a2183d641b13a0b0a"
        );
        assert_ne!(license_file_name("host"), license_file_name("other"));
    }
}
