use crate::model::data::{to_vec, Component, DataType, Message, Trame, U16, U32};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use crate::model::rnd::random;
use crate::model::unicode::Unicode;
use crate::nla::sspi::{AuthenticationProtocol, Credentials, GenericSecurityService};
use hmac::{Hmac, Mac};
use md4::{Digest as Md4Digest, Md4};
use md5::Md5;
use rc4::{Key, KeyInit, Rc4, StreamCipher};
use std::io::{Cursor, Read};

type HmacMd5 = Hmac<Md5>;

/// Negotiation flags of the NTLM handshake
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-nlmp/99d90ff4-957f-4c8a-80e4-5bfe5a9a9832
#[repr(u32)]
#[allow(dead_code)]
enum Negotiate {
    NtlmsspNegociate56 = 0x80000000,
    NtlmsspNegociateKeyExch = 0x40000000,
    NtlmsspNegociate128 = 0x20000000,
    NtlmsspNegociateVersion = 0x02000000,
    NtlmsspNegociateTargetInfo = 0x00800000,
    NtlmsspRequestNonNTSessionKey = 0x00400000,
    NtlmsspNegociateIdentify = 0x00100000,
    NtlmsspNegociateExtendedSessionSecurity = 0x00080000,
    NtlmsspTargetTypeServer = 0x00020000,
    NtlmsspTargetTypeDomain = 0x00010000,
    NtlmsspNegociateAlwaysSign = 0x00008000,
    NtlmsspNegociateOEMWorkstationSupplied = 0x00002000,
    NtlmsspNegociateOEMDomainSupplied = 0x00001000,
    NtlmsspNegociateNTLM = 0x00000200,
    NtlmsspNegociateLMKey = 0x00000080,
    NtlmsspNegociateDatagram = 0x00000040,
    NtlmsspNegociateSeal = 0x00000020,
    NtlmsspNegociateSign = 0x00000010,
    NtlmsspRequestTarget = 0x00000004,
    NtlmNegotiateOEM = 0x00000002,
    NtlmsspNegociateUnicode = 0x00000001,
}

const NTLM_SIGNATURE: &[u8; 8] = b"NTLMSSP\x00";
const MESSAGE_TYPE_NEGOTIATE: u32 = 0x00000001;
const MESSAGE_TYPE_CHALLENGE: u32 = 0x00000002;
const MESSAGE_TYPE_AUTHENTICATE: u32 = 0x00000003;

/// AvId of the timestamp pair inside the target info
const MSV_AV_TIMESTAMP: u16 = 0x0007;

const CLIENT_SIGNING_MAGIC: &[u8] =
    b"session key to client-to-server signing key magic constant\x00";
const SERVER_SIGNING_MAGIC: &[u8] =
    b"session key to server-to-client signing key magic constant\x00";
const CLIENT_SEALING_MAGIC: &[u8] =
    b"session key to client-to-server sealing key magic constant\x00";
const SERVER_SEALING_MAGIC: &[u8] =
    b"session key to server-to-client sealing key magic constant\x00";

fn hmac_md5(key: &[u8], data: &[u8]) -> RdpResult<Vec<u8>> {
    let mut hmac = HmacMd5::new_varkey(key).map_err(|_| {
        Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidData,
            "invalid HMAC-MD5 key",
        ))
    })?;
    hmac.input(data);
    Ok(hmac.result().code().to_vec())
}

fn md4(data: &[u8]) -> Vec<u8> {
    let mut hasher = Md4::new();
    hasher.input(data);
    hasher.result().to_vec()
}

fn md5(data: &[u8]) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.input(data);
    hasher.result().to_vec()
}

/// NTOWFv2(Passwd, User, UserDom)
/// = HMAC_MD5(MD4(UNICODE(Passwd)), UNICODE(Uppercase(User) + UserDom))
fn ntowf_v2(password: &str, user: &str, domain: &str) -> RdpResult<Vec<u8>> {
    let key = md4(&password.to_string().to_unicode());
    let identity = [
        user.to_uppercase().to_unicode(),
        domain.to_string().to_unicode(),
    ]
    .concat();
    hmac_md5(&key, &identity)
}

/// One field descriptor of an NTLM message header
fn message_field(length: u16, offset: u32) -> Component {
    component![
        "Len" => U16::LE(length),
        "MaxLen" => U16::LE(length),
        "BufferOffset" => U32::LE(offset)
    ]
}

/// Challenge message as parsed from the server token
struct ChallengeMessage {
    server_challenge: Vec<u8>,
    target_info: Vec<u8>,
    timestamp: Option<Vec<u8>>,
    flags: u32,
}

fn parse_challenge_message(data: &[u8]) -> RdpResult<ChallengeMessage> {
    let mut stream = Cursor::new(data.to_vec());
    let mut message = component![
        "Signature" => vec![0_u8; 8],
        "MessageType" => U32::LE(0),
        "TargetNameLen" => U16::LE(0),
        "TargetNameMaxLen" => U16::LE(0),
        "TargetNameBufferOffset" => U32::LE(0),
        "NegotiateFlags" => U32::LE(0),
        "ServerChallenge" => vec![0_u8; 8],
        "Reserved" => vec![0_u8; 8],
        "TargetInfoLen" => U16::LE(0),
        "TargetInfoMaxLen" => U16::LE(0),
        "TargetInfoBufferOffset" => U32::LE(0)
    ];
    message.read(&mut stream)?;

    if cast!(DataType::Slice, message["Signature"])? != NTLM_SIGNATURE {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidData,
            "token without the NTLMSSP signature",
        )));
    }
    if cast!(DataType::U32, message["MessageType"])? != MESSAGE_TYPE_CHALLENGE {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidData,
            "expected an NTLM challenge message",
        )));
    }

    let info_length = cast!(DataType::U16, message["TargetInfoLen"])? as usize;
    let info_offset = cast!(DataType::U32, message["TargetInfoBufferOffset"])? as usize;
    if info_offset + info_length > data.len() {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidSize,
            "NTLM target info exceeds the token",
        )));
    }
    let target_info = data[info_offset..info_offset + info_length].to_vec();

    Ok(ChallengeMessage {
        server_challenge: cast!(DataType::Slice, message["ServerChallenge"])?.to_vec(),
        timestamp: find_av_pair(&target_info, MSV_AV_TIMESTAMP)?,
        target_info,
        flags: cast!(DataType::U32, message["NegotiateFlags"])?,
    })
}

/// Walk the AV pair list looking for one id
fn find_av_pair(target_info: &[u8], wanted: u16) -> RdpResult<Option<Vec<u8>>> {
    let mut stream = Cursor::new(target_info.to_vec());
    loop {
        let mut header = component![
            "AvId" => U16::LE(0),
            "AvLen" => U16::LE(0)
        ];
        if header.read(&mut stream).is_err() {
            // truncated list, nothing else to find
            return Ok(None);
        }
        let av_id = cast!(DataType::U16, header["AvId"])?;
        let av_length = cast!(DataType::U16, header["AvLen"])? as usize;
        if av_id == 0 {
            return Ok(None);
        }
        let mut value = vec![0_u8; av_length];
        stream.read_exact(&mut value)?;
        if av_id == wanted {
            return Ok(Some(value));
        }
    }
}

/// NTLMv2 client side security package
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-nlmp/
pub struct Ntlm {
    credentials: Credentials,
    negotiate_message: Option<Vec<u8>>,
    challenge_message: Option<Vec<u8>>,
    exported_session_key: Option<Vec<u8>>,
    complete: bool,
}

impl Ntlm {
    pub fn new(domain: String, username: String, password: String) -> Self {
        Ntlm {
            credentials: Credentials::Password {
                domain,
                username,
                password,
            },
            negotiate_message: None,
            challenge_message: None,
            exported_session_key: None,
            complete: false,
        }
    }

    /// Smartcard logon still authenticates the NTLM exchange
    /// with the pin acquired outside this crate
    pub fn new_with_credentials(credentials: Credentials) -> Self {
        Ntlm {
            credentials,
            negotiate_message: None,
            challenge_message: None,
            exported_session_key: None,
            complete: false,
        }
    }

    fn flags() -> u32 {
        Negotiate::NtlmsspNegociateKeyExch as u32
            | Negotiate::NtlmsspNegociate128 as u32
            | Negotiate::NtlmsspNegociateExtendedSessionSecurity as u32
            | Negotiate::NtlmsspNegociateTargetInfo as u32
            | Negotiate::NtlmsspNegociateAlwaysSign as u32
            | Negotiate::NtlmsspNegociateNTLM as u32
            | Negotiate::NtlmsspNegociateSeal as u32
            | Negotiate::NtlmsspNegociateSign as u32
            | Negotiate::NtlmsspRequestTarget as u32
            | Negotiate::NtlmsspNegociateUnicode as u32
    }

    fn password(&self) -> RdpResult<(String, String, String)> {
        match &self.credentials {
            Credentials::Password {
                domain,
                username,
                password,
            } => Ok((domain.clone(), username.clone(), password.clone())),
            Credentials::SmartCard { pin, user_hint, domain_hint, .. } => {
                Ok((domain_hint.clone(), user_hint.clone(), pin.clone()))
            }
            Credentials::RemoteGuard { .. } => Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidData,
                "remote guard credentials carry no NTLM secret",
            ))),
        }
    }

    /// Build the authenticate message and derive the session
    /// key out of the server challenge
    fn authenticate_message(&mut self, challenge: &ChallengeMessage) -> RdpResult<Vec<u8>> {
        let (domain, username, password) = self.password()?;
        let ntowf = ntowf_v2(&password, &username, &domain)?;

        let client_challenge = random(8);
        // when the server provides a timestamp, use it,
        // otherwise the response carries zeros
        let timestamp = challenge
            .timestamp
            .clone()
            .unwrap_or_else(|| vec![0_u8; 8]);

        let temp = [
            &[0x01, 0x01, 0, 0, 0, 0, 0, 0][..],
            &timestamp,
            &client_challenge,
            &[0, 0, 0, 0][..],
            &challenge.target_info,
            &[0, 0, 0, 0][..],
        ]
        .concat();

        let nt_proof =
            hmac_md5(&ntowf, &[&challenge.server_challenge[..], &temp[..]].concat())?;
        let nt_challenge_response = [&nt_proof[..], &temp[..]].concat();

        let lm_proof = hmac_md5(
            &ntowf,
            &[&challenge.server_challenge[..], &client_challenge[..]].concat(),
        )?;
        let lm_challenge_response = [&lm_proof[..], &client_challenge[..]].concat();

        let session_base_key = hmac_md5(&ntowf, &nt_proof)?;
        let exported_session_key = random(16);
        let mut encrypted_session_key = exported_session_key.clone();
        let mut rc4 = Rc4::new(Key::<rc4::consts::U16>::from_slice(&session_base_key));
        rc4.apply_keystream(&mut encrypted_session_key);

        let domain_bytes = domain.to_unicode();
        let username_bytes = username.to_unicode();
        let workstation_bytes: Vec<u8> = Vec::new();

        // payload layout: domain, user, workstation, lm, nt, session key
        // fixed part: signature, type, six field descriptors, flags, MIC
        let header_length = 80_u32;
        let domain_offset = header_length;
        let username_offset = domain_offset + domain_bytes.len() as u32;
        let workstation_offset = username_offset + username_bytes.len() as u32;
        let lm_offset = workstation_offset + workstation_bytes.len() as u32;
        let nt_offset = lm_offset + lm_challenge_response.len() as u32;
        let key_offset = nt_offset + nt_challenge_response.len() as u32;

        let build = |mic: &[u8]| -> Vec<u8> {
            to_vec(&trame![
                NTLM_SIGNATURE.to_vec(),
                U32::LE(MESSAGE_TYPE_AUTHENTICATE),
                message_field(lm_challenge_response.len() as u16, lm_offset),
                message_field(nt_challenge_response.len() as u16, nt_offset),
                message_field(domain_bytes.len() as u16, domain_offset),
                message_field(username_bytes.len() as u16, username_offset),
                message_field(workstation_bytes.len() as u16, workstation_offset),
                message_field(encrypted_session_key.len() as u16, key_offset),
                U32::LE(Self::flags()),
                mic.to_vec(),
                domain_bytes.clone(),
                username_bytes.clone(),
                workstation_bytes.clone(),
                lm_challenge_response.clone(),
                nt_challenge_response.clone(),
                encrypted_session_key.clone()
            ])
        };

        // MIC over the three tokens with a zeroed MIC field
        let with_zero_mic = build(&[0_u8; 16]);
        let negotiate = try_option!(self.negotiate_message.as_ref(), "missing negotiate token")?;
        let challenge_raw =
            try_option!(self.challenge_message.as_ref(), "missing challenge token")?;
        let mic = hmac_md5(
            &exported_session_key,
            &[&negotiate[..], &challenge_raw[..], &with_zero_mic[..]].concat(),
        )?;

        self.exported_session_key = Some(exported_session_key);
        self.complete = true;
        Ok(build(&mic))
    }
}

impl AuthenticationProtocol for Ntlm {
    fn package_name(&self) -> &'static str {
        "NTLM"
    }

    fn create_negotiate_message(&mut self) -> RdpResult<Vec<u8>> {
        let message = to_vec(&trame![
            NTLM_SIGNATURE.to_vec(),
            U32::LE(MESSAGE_TYPE_NEGOTIATE),
            U32::LE(Self::flags()),
            message_field(0, 32), // DomainNameFields
            message_field(0, 32)  // WorkstationFields
        ]);
        self.negotiate_message = Some(message.clone());
        Ok(message)
    }

    fn read_challenge_message(&mut self, request: &[u8]) -> RdpResult<Vec<u8>> {
        self.challenge_message = Some(request.to_vec());
        let challenge = parse_challenge_message(request)?;
        self.authenticate_message(&challenge)
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn build_security_interface(&self) -> RdpResult<Box<dyn GenericSecurityService>> {
        let exported_session_key = try_option!(
            self.exported_session_key.as_ref(),
            "security interface requested before the handshake completed"
        )?;
        Ok(Box::new(NtlmSecurityInterface::new(exported_session_key)))
    }

    fn credentials(&self) -> Credentials {
        self.credentials.clone()
    }
}

/// Signing and sealing of the CredSSP payloads once NTLM
/// completed
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-nlmp/524cdccb-563e-4793-92b0-7bc321fce096
pub struct NtlmSecurityInterface {
    encrypt_cipher: Rc4<rc4::consts::U16>,
    decrypt_cipher: Rc4<rc4::consts::U16>,
    signing_key: Vec<u8>,
    verify_key: Vec<u8>,
    send_seq_num: u32,
    recv_seq_num: u32,
}

impl NtlmSecurityInterface {
    pub fn new(exported_session_key: &[u8]) -> Self {
        let client_sealing_key =
            md5(&[exported_session_key, CLIENT_SEALING_MAGIC].concat());
        let server_sealing_key =
            md5(&[exported_session_key, SERVER_SEALING_MAGIC].concat());
        NtlmSecurityInterface {
            encrypt_cipher: Rc4::new(Key::<rc4::consts::U16>::from_slice(&client_sealing_key)),
            decrypt_cipher: Rc4::new(Key::<rc4::consts::U16>::from_slice(&server_sealing_key)),
            signing_key: md5(&[exported_session_key, CLIENT_SIGNING_MAGIC].concat()),
            verify_key: md5(&[exported_session_key, SERVER_SIGNING_MAGIC].concat()),
            send_seq_num: 0,
            recv_seq_num: 0,
        }
    }
}

impl GenericSecurityService for NtlmSecurityInterface {
    fn gss_wrapex(&mut self, data: &[u8]) -> RdpResult<Vec<u8>> {
        let mut sealed = data.to_vec();
        self.encrypt_cipher.apply_keystream(&mut sealed);

        let digest = hmac_md5(
            &self.signing_key,
            &[&self.send_seq_num.to_le_bytes()[..], data].concat(),
        )?;
        // the checksum travels sealed as well
        let mut checksum = digest[..8].to_vec();
        self.encrypt_cipher.apply_keystream(&mut checksum);

        let signature = to_vec(&trame![
            U32::LE(1), // version
            checksum,
            U32::LE(self.send_seq_num)
        ]);
        self.send_seq_num += 1;
        Ok([signature, sealed].concat())
    }

    fn gss_unwrapex(&mut self, data: &[u8]) -> RdpResult<Vec<u8>> {
        if data.len() < 16 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                "sealed payload shorter than its signature",
            )));
        }
        let (signature, payload) = data.split_at(16);

        let mut plaintext = payload.to_vec();
        self.decrypt_cipher.apply_keystream(&mut plaintext);

        let mut checksum = signature[4..12].to_vec();
        self.decrypt_cipher.apply_keystream(&mut checksum);

        let digest = hmac_md5(
            &self.verify_key,
            &[&self.recv_seq_num.to_le_bytes()[..], &plaintext[..]].concat(),
        )?;
        self.recv_seq_num += 1;
        if digest[..8] != checksum[..] {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidChecksum,
                "NTLM payload signature mismatch",
            )));
        }
        Ok(plaintext)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// MS-NLMP 4.2.4.1.1 reference value
    #[test]
    fn test_ntowf_v2_reference_vector() {
        let result = ntowf_v2("Password", "User", "Domain").unwrap();
        assert_eq!(
            result,
            hex::decode("0c868a403bfd7a93a3001ef22ef02e3f").unwrap()
        );
    }

    #[test]
    fn test_negotiate_message_signature() {
        let mut ntlm = Ntlm::new("dom".to_string(), "user".to_string(), "pass".to_string());
        let message = ntlm.create_negotiate_message().unwrap();
        assert_eq!(&message[..8], NTLM_SIGNATURE);
        assert_eq!(
            u32::from_le_bytes([message[8], message[9], message[10], message[11]]),
            MESSAGE_TYPE_NEGOTIATE
        );
    }

    #[test]
    fn test_challenge_with_bad_signature_rejected() {
        let mut ntlm = Ntlm::new("dom".to_string(), "user".to_string(), "pass".to_string());
        ntlm.create_negotiate_message().unwrap();
        let bogus = vec![0_u8; 64];
        assert!(ntlm.read_challenge_message(&bogus).is_err());
    }

    /// wrap on one side must unwrap on a mirrored peer
    #[test]
    fn test_gss_wrap_round_trip() {
        let session_key = vec![0x55_u8; 16];
        let mut client = NtlmSecurityInterface::new(&session_key);
        // a peer interface with client and server keys swapped
        let mut server = NtlmSecurityInterface {
            encrypt_cipher: Rc4::new(Key::<rc4::consts::U16>::from_slice(&md5(
                &[&session_key[..], SERVER_SEALING_MAGIC].concat(),
            ))),
            decrypt_cipher: Rc4::new(Key::<rc4::consts::U16>::from_slice(&md5(
                &[&session_key[..], CLIENT_SEALING_MAGIC].concat(),
            ))),
            signing_key: md5(&[&session_key[..], SERVER_SIGNING_MAGIC].concat()),
            verify_key: md5(&[&session_key[..], CLIENT_SIGNING_MAGIC].concat()),
            send_seq_num: 0,
            recv_seq_num: 0,
        };

        let sealed = client.gss_wrapex(b"ts credentials").unwrap();
        assert_ne!(&sealed[16..], b"ts credentials");
        let opened = server.gss_unwrapex(&sealed).unwrap();
        assert_eq!(opened, b"ts credentials");
    }

    #[test]
    fn test_gss_unwrap_detects_corruption() {
        let session_key = vec![0x55_u8; 16];
        let mut client = NtlmSecurityInterface::new(&session_key);
        let mut server = NtlmSecurityInterface {
            encrypt_cipher: Rc4::new(Key::<rc4::consts::U16>::from_slice(&md5(
                &[&session_key[..], SERVER_SEALING_MAGIC].concat(),
            ))),
            decrypt_cipher: Rc4::new(Key::<rc4::consts::U16>::from_slice(&md5(
                &[&session_key[..], CLIENT_SEALING_MAGIC].concat(),
            ))),
            signing_key: md5(&[&session_key[..], SERVER_SIGNING_MAGIC].concat()),
            verify_key: md5(&[&session_key[..], CLIENT_SIGNING_MAGIC].concat()),
            send_seq_num: 0,
            recv_seq_num: 0,
        };

        let mut sealed = client.gss_wrapex(b"ts credentials").unwrap();
        sealed[20] ^= 0xFF;
        assert!(server.gss_unwrapex(&sealed).is_err());
    }
}
