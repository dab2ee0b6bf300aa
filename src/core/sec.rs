use crate::core::gcc;
use crate::core::mcs;
use crate::model::data::{Component, DataType, Message, Trame, U16, U32};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use crate::model::unicode::Unicode;
use log::{debug, warn};
use md5::Digest;
use num_bigint::BigUint;
use rc4::{Key, KeyInit, Rc4, StreamCipher};
use ring::digest;
use rsa::{PublicKeyParts, RsaPublicKey};
use std::io::{Read, Write};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// Security flags carried by the per PDU security header
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/e13405c5-668b-4716-94b2-1c2654ca1ad4
#[repr(u16)]
#[allow(dead_code)]
#[derive(Copy, Clone)]
pub enum SecurityFlag {
    SecExchangePkt = 0x0001,
    SecTransportReq = 0x0002,
    RdpSecTransportRsp = 0x0004,
    SecEncrypt = 0x0008,
    SecResetSeqno = 0x0010,
    SecIgnoreSeqno = 0x0020,
    SecInfoPkt = 0x0040,
    SecLicensePkt = 0x0080,
    SecLicenseEncryptCs = 0x0200,
    SecRedirectionPkt = 0x0400,
    SecSecureChecksum = 0x0800,
    SecAutodetectReq = 0x1000,
    SecAutodetectRsp = 0x2000,
    SecHeartbeat = 0x4000,
    SecFlagshiValid = 0x8000,
}

/// RDP option someone links to capabilities
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/732394f5-e2b5-4ac5-8a0a-35345386b0d1
pub enum InfoFlag {
    InfoMouse = 0x00000001,
    InfoDisablectrlaltdel = 0x00000002,
    InfoAutologon = 0x00000008,
    InfoUnicode = 0x00000010,
    InfoMaximizeshell = 0x00000020,
    InfoLogonnotify = 0x00000040,
    InfoCompression = 0x00000080,
    InfoEnablewindowskey = 0x00000100,
    InfoRemoteconsoleaudio = 0x00002000,
    InfoForceEncryptedCsPdu = 0x00004000,
    InfoRail = 0x00008000,
    InfoLogonerrors = 0x00010000,
    InfoMouseHasWheel = 0x00020000,
    InfoPasswordIsScPin = 0x00040000,
    InfoNoaudioplayback = 0x00080000,
    InfoUsingSavedCreds = 0x00100000,
    InfoAudiocapture = 0x00200000,
    InfoVideoDisable = 0x00400000,
    InfoCompressionTypeMask = 0x00001E00,
}

/// Optional performance flags as specified in
/// 2.2.1.11.1.1.1 (TS_EXTENDED_INFO_PACKET)
pub enum ExtendedInfoFlag {
    PerfDisableWallpaper = 0x00000001,
    PerfDisableFullWindowDrag = 0x00000002,
    PerfDisableMenuAnimations = 0x00000004,
    PerfDisableTheming = 0x00000008,
    PerfDisableCursorShadow = 0x00000020,
    PerfDisableCursorBlink = 0x00000040,
    PerfEnableFontSmoothing = 0x00000080,
    PerfEnableDesktopComposition = 0x00000100,
}

#[allow(dead_code)]
enum AfInet {
    AfInet = 0x00002,
    AfInet6 = 0x0017,
}

const SIGNATURE_ALG_RSA: u32 = 0x00000001;
const KEY_EXCHANGE_ALG_RSA: u32 = 0x00000001;
const CERT_CHAIN_VERSION_1: u32 = 0x00000001;
const CERT_CHAIN_VERSION_2: u32 = 0x00000002;
const CERT_CHAIN_VERSION_MASK: u32 = 0x7FFFFFFF;

/// Number of cipher uses after which a key is re-derived
const KEY_UPDATE_INTERVAL: u32 = 4096;

/// TS_FIPS_INFO constants
#[cfg(feature = "fips")]
const FIPS_HEADER_LENGTH: u16 = 0x10;
#[cfg(feature = "fips")]
const TSFIPS_VERSION1: u8 = 1;

/// pad1 of the MAC computations, 40 bytes of 0x36
const PAD1: [u8; 40] = [0x36; 40];
/// pad2 of the MAC computations, 48 bytes of 0x5C
const PAD2: [u8; 48] = [0x5C; 48];

/// 40 and 56 bit key reductions overwrite the head of the key
/// with this salt
const KEY_SALT: [u8; 3] = [0xD1, 0x26, 0x9E];

/// SaltedHash(Salt, Input, Salt1, Salt2)
/// = MD5(Salt + SHA1(Input + Salt + Salt1 + Salt2))
pub fn salted_hash(salt: &[u8], input: &[u8], salt1: &[u8], salt2: &[u8]) -> Vec<u8> {
    let mut md5 = md5::Md5::new();
    md5.input(
        &[
            salt,
            digest::digest(
                &digest::SHA1_FOR_LEGACY_USE_ONLY,
                &[input, salt, salt1, salt2].concat(),
            )
            .as_ref(),
        ]
        .concat(),
    );
    md5.result().to_vec()
}

/// MasterSecret = PremasterHash('A') + PremasterHash('BB') + PremasterHash('CCC')
pub fn master_secret(premaster_secret: &[u8], client_random: &[u8], server_random: &[u8]) -> Vec<u8> {
    [
        salted_hash(premaster_secret, b"A", client_random, server_random),
        salted_hash(premaster_secret, b"BB", client_random, server_random),
        salted_hash(premaster_secret, b"CCC", client_random, server_random),
    ]
    .concat()
}

/// SessionKeyBlob = MasterHash('A') + MasterHash('BB') + MasterHash('CCC')
///
/// The salts swap sides compared to the master secret
pub fn session_key_blob(master: &[u8], client_random: &[u8], server_random: &[u8]) -> Vec<u8> {
    [
        salted_hash(master, b"A", server_random, client_random),
        salted_hash(master, b"BB", server_random, client_random),
        salted_hash(master, b"CCC", server_random, client_random),
    ]
    .concat()
}

/// MD5(in0 + in1 + in2) over a 16 byte and two 32 byte inputs
pub fn md5_16_32_32(in0: &[u8], in1: &[u8], in2: &[u8]) -> Vec<u8> {
    let mut md5 = md5::Md5::new();
    md5.input([in0, in1, in2].concat());
    md5.result().to_vec()
}

/// MacData = MD5(MacSaltKey + pad2 + SHA1(MacSaltKey + pad1 + length + data))
///
/// Used by the licensing sub protocol
pub fn mac_data(mac_salt_key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut md5 = md5::Md5::new();
    md5.input(
        &[
            mac_salt_key,
            &PAD2[..],
            digest::digest(
                &digest::SHA1_FOR_LEGACY_USE_ONLY,
                &[
                    mac_salt_key,
                    &PAD1[..],
                    &(data.len() as u32).to_le_bytes(),
                    data,
                ]
                .concat(),
            )
            .as_ref(),
        ]
        .concat(),
    );
    md5.result().to_vec()
}

/// Server certificate as carried by the server security block
/// or the licensing certificate chain
pub enum ServerCertificate {
    Proprietary(RsaPublicKey),
    X509(RsaPublicKey),
}

impl ServerCertificate {
    /// Parse either certificate chain version out of a
    /// certData blob
    pub fn from_bytes(raw: &mut dyn Read) -> RdpResult<Self> {
        let mut binary_blob_server_certificate = component![
            "dwVersion" => U32::LE(0),
            "certData" => Vec::<u8>::new()
        ];
        binary_blob_server_certificate.read(raw)?;
        let cert_version = cast!(DataType::U32, binary_blob_server_certificate["dwVersion"])?;
        let mut cert_data = cast!(DataType::Slice, binary_blob_server_certificate["certData"])?;

        match cert_version & CERT_CHAIN_VERSION_MASK {
            CERT_CHAIN_VERSION_1 => {
                let mut message = component![
                    "dwSigAlgId" => U32::LE(0),
                    "dwKeyAlgId" => U32::LE(0),
                    "wPublicKeyBlobType" => U16::LE(0),
                    "wPublicKeyBlobLen" => crate::model::data::DynOption::new(U16::LE(0), |size| crate::model::data::MessageOption::Size("PublicKeyBlob".to_string(), size.inner() as usize)),
                    "PublicKeyBlob" => component![
                        "magic" => U32::LE(0),
                        "keylen" => crate::model::data::DynOption::new(U32::LE(0), |size| crate::model::data::MessageOption::Size("modulus".to_string(), size.inner() as usize - 8)),
                        "bitlen" => U32::LE(0),
                        "datalen" => U32::LE(0),
                        "pubExp" => U32::LE(0),
                        "modulus" => Vec::<u8>::new(),
                        "padding" => vec![0_u8; 8]
                    ],
                    "wSignatureBlobType" => U16::LE(0),
                    "wSignatureBlobLen" => crate::model::data::DynOption::new(U16::LE(0), |size| crate::model::data::MessageOption::Size("SignatureBlob".to_string(), size.inner() as usize)),
                    "SignatureBlob" => Vec::<u8>::new()
                ];

                message.read(&mut cert_data)?;

                let sig_alg_id = cast!(DataType::U32, message["dwSigAlgId"])?;
                let key_alg_id = cast!(DataType::U32, message["dwKeyAlgId"])?;
                if sig_alg_id != SIGNATURE_ALG_RSA && key_alg_id != KEY_EXCHANGE_ALG_RSA {
                    return Err(Error::RdpError(RdpError::new(
                        RdpErrorKind::NotImplemented,
                        &format!(
                            "unsupported signature or key algorithm, dwSigAlgId={} dwKeyAlgId={}",
                            sig_alg_id, key_alg_id
                        ),
                    )));
                }
                let public_key_blob = cast!(DataType::Component, message["PublicKeyBlob"])?;
                let pubexp = cast!(DataType::U32, public_key_blob["pubExp"])?;
                let modulus = cast!(DataType::Slice, public_key_blob["modulus"])?;
                let n = rsa::BigUint::from_bytes_le(modulus);
                let e = rsa::BigUint::from_slice(&[pubexp]);
                let key = RsaPublicKey::new(n, e).map_err(|_| {
                    Error::RdpError(RdpError::new(
                        RdpErrorKind::InvalidData,
                        "invalid RSA public key in the proprietary certificate",
                    ))
                })?;
                Ok(Self::Proprietary(key))
            }
            CERT_CHAIN_VERSION_2 => {
                let mut num_cert_blobs = U32::LE(0);
                num_cert_blobs.read(&mut cert_data)?;
                let num_cert_blobs = cast!(DataType::U32, num_cert_blobs)?;

                if num_cert_blobs < 2 {
                    return Err(Error::RdpError(RdpError::new(
                        RdpErrorKind::InvalidData,
                        &format!("invalid number of certificates in the chain. expected minimum 2, found: {}", num_cert_blobs),
                    )));
                }
                let mut certificates: Vec<Vec<u8>> = Vec::with_capacity(num_cert_blobs as usize);
                for _ in 0..num_cert_blobs {
                    let mut cert_blob = component![
                        "cbCert" => crate::model::data::DynOption::new(U32::LE(0), |size| crate::model::data::MessageOption::Size("abCert".to_string(), size.inner() as usize)),
                        "abCert" => Vec::<u8>::new()
                    ];
                    cert_blob.read(&mut cert_data)?;
                    certificates.push(cast!(DataType::Slice, cert_blob["abCert"])?.to_vec());
                }

                Self::from_der(&certificates[certificates.len() - 1])
            }
            _ => Err(Error::RdpError(RdpError::new(
                RdpErrorKind::NotImplemented,
                "Invalid certificate version",
            ))),
        }
    }

    pub fn from_der(data: &[u8]) -> RdpResult<Self> {
        let (_, mut x509) = X509Certificate::from_der(data).map_err(|_| {
            Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidData,
                "invalid X509 certificate",
            ))
        })?;

        // Some Windows servers uses certificates with old and invalid OIDs, e.g. Oid(1.3.14.3.2.15)
        // and we can't parse it so we have to fix it
        x509.tbs_certificate.subject_pki.algorithm.algorithm =
            oid_registry::OID_PKCS1_RSAENCRYPTION;
        let public_key = x509.tbs_certificate.subject_pki.parsed().map_err(|_| {
            Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidData,
                "can't parse X509 certificate",
            ))
        })?;

        let rsa_public_key = match public_key {
            x509_parser::public_key::PublicKey::RSA(key) => RsaPublicKey::new(
                rsa::BigUint::from_bytes_be(key.modulus),
                rsa::BigUint::from_bytes_be(key.exponent),
            )
            .map_err(|_| {
                Error::RdpError(RdpError::new(
                    RdpErrorKind::InvalidData,
                    "can't get RSA certificate from the X509 certificate",
                ))
            })?,
            _ => {
                return Err(Error::RdpError(RdpError::new(
                    RdpErrorKind::InvalidData,
                    "invalid type of certificate",
                )))
            }
        };

        Ok(Self::X509(rsa_public_key))
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        match self {
            ServerCertificate::Proprietary(rsa) => rsa,
            ServerCertificate::X509(rsa) => rsa,
        }
    }

    /// Raw RSA operation under the server public key
    ///
    /// The client random and the licensing premaster secret
    /// travel encrypted this way, little endian with an eight
    /// byte zero tail
    pub fn encrypt_message(&self, message: &[u8]) -> Vec<u8> {
        let key = self.public_key();
        let n = BigUint::from_bytes_be(&key.n().to_bytes_be());
        let e = BigUint::from_bytes_be(&key.e().to_bytes_be());
        let m = BigUint::from_bytes_le(message);
        let c = m.modpow(&e, &n);

        let mut encrypted = c.to_bytes_le();
        encrypted.resize(key.size(), 0);
        encrypted.extend_from_slice(&[0_u8; 8]);
        encrypted
    }
}

/// RSA key material of the accepting role, raw big endian
/// components as found in the server certificate store
pub struct RsaKeyPair {
    pub modulus: Vec<u8>,
    pub public_exponent: u32,
    pub private_exponent: Vec<u8>,
}

/// Raw RSA operation under the server private key,
/// accepting role counterpart of encrypt_message
pub fn decrypt_client_message(key: &RsaKeyPair, message: &[u8]) -> Vec<u8> {
    let n = BigUint::from_bytes_be(&key.modulus);
    let d = BigUint::from_bytes_be(&key.private_exponent);
    let c = BigUint::from_bytes_le(message);
    let m = c.modpow(&d, &n);
    let mut decrypted = m.to_bytes_le();
    decrypted.resize(32, 0);
    decrypted
}

/// RC4 state for the two key lengths in use
enum Rc4Cipher {
    Key8(Rc4<rc4::consts::U8>),
    Key16(Rc4<rc4::consts::U16>),
}

impl Rc4Cipher {
    fn new(key: &[u8]) -> Self {
        if key.len() == 8 {
            Rc4Cipher::Key8(Rc4::new(Key::<rc4::consts::U8>::from_slice(key)))
        } else {
            Rc4Cipher::Key16(Rc4::new(Key::<rc4::consts::U16>::from_slice(key)))
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Rc4Cipher::Key8(rc4) => rc4.apply_keystream(data),
            Rc4Cipher::Key16(rc4) => rc4.apply_keystream(data),
        }
    }
}

#[cfg(feature = "fips")]
mod fips {
    use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
    use boring::symm::{Cipher, Crypter, Mode};

    const FIPS_IVEC: [u8; 8] = [0x12, 0x34, 0x56, 0x78, 0x90, 0xAB, 0xCD, 0xEF];

    /// Table to reverse the bit order of a byte
    fn reverse(byte: u8) -> u8 {
        byte.reverse_bits()
    }

    fn odd_parity(byte: u8) -> u8 {
        let masked = byte & 0xFE;
        if masked.count_ones() % 2 == 0 {
            masked | 1
        } else {
            masked
        }
    }

    /// Expand a 21 byte key into a 24 byte 3DES key with odd
    /// parity, inserting a zero bit after every seventh bit
    pub fn expand_key_bits(input: &[u8; 21]) -> [u8; 24] {
        let mut reversed = [0_u8; 21];
        for (i, byte) in input.iter().enumerate() {
            reversed[i] = reverse(*byte);
        }

        let mut out = [0_u8; 24];
        for i in 0..24 {
            let b = i * 7;
            let p = b / 8;
            let r = b % 8;
            out[i] = if r == 0 {
                reversed[p] & 0xFE
            } else {
                let mut c = reversed[p] << r;
                c |= reversed[p + 1] >> (8 - r);
                c & 0xFE
            };
        }

        for byte in out.iter_mut() {
            *byte = odd_parity(reverse(*byte));
        }
        out
    }

    /// A 3DES CBC cipher whose chaining state persists across
    /// the whole connection
    pub struct FipsCipher {
        crypter: Crypter,
    }

    impl FipsCipher {
        pub fn new(key: &[u8; 24], encrypt: bool) -> RdpResult<Self> {
            let mode = if encrypt { Mode::Encrypt } else { Mode::Decrypt };
            let mut crypter = Crypter::new(Cipher::des_ede3_cbc(), mode, key, Some(&FIPS_IVEC))
                .map_err(|_| {
                    Error::RdpError(RdpError::new(
                        RdpErrorKind::InvalidData,
                        "can't initialize the FIPS cipher",
                    ))
                })?;
            crypter.pad(false);
            Ok(Self { crypter })
        }

        pub fn process(&mut self, data: &[u8]) -> RdpResult<Vec<u8>> {
            let mut output = vec![0_u8; data.len() + 8];
            let count = self.crypter.update(data, &mut output).map_err(|_| {
                Error::RdpError(RdpError::new(
                    RdpErrorKind::InvalidData,
                    "FIPS cipher step failed",
                ))
            })?;
            output.truncate(count);
            Ok(output)
        }
    }
}

/// Session key material of one connection
///
/// Established once during the security commencement phase,
/// re-derived every 4096 cipher uses and zeroed on drop
pub struct SessionSecurity {
    sign_key: Vec<u8>,
    encrypt_key: Vec<u8>,
    decrypt_key: Vec<u8>,
    encrypt_update_key: Vec<u8>,
    decrypt_update_key: Vec<u8>,
    rc4_key_len: usize,
    encrypt_cipher: Option<Rc4Cipher>,
    decrypt_cipher: Option<Rc4Cipher>,
    encrypt_use_count: u32,
    decrypt_use_count: u32,
    encrypt_checksum_use_count: u32,
    decrypt_checksum_use_count: u32,
    /// When set a standard RC4 MAC mismatch aborts the
    /// connection instead of being logged
    strict_checksum: bool,
    #[cfg(feature = "fips")]
    fips_sign_key: Vec<u8>,
    #[cfg(feature = "fips")]
    fips_encrypt: Option<fips::FipsCipher>,
    #[cfg(feature = "fips")]
    fips_decrypt: Option<fips::FipsCipher>,
}

impl SessionSecurity {
    /// Derive all key material from the two randoms
    ///
    /// The premaster secret is the concatenation of the first
    /// 24 bytes of each random. Key assignment swaps between
    /// the two roles.
    pub fn establish(
        client_random: &[u8],
        server_random: &[u8],
        encryption_method: u32,
        server_mode: bool,
        strict_checksum: bool,
    ) -> RdpResult<Self> {
        if client_random.len() < 32 || server_random.len() < 32 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                "random of an unexpected size during key establishment",
            )));
        }

        let pre_master_secret = [&client_random[..24], &server_random[..24]].concat();
        let master = master_secret(&pre_master_secret, client_random, server_random);
        let blob = session_key_blob(&master, client_random, server_random);

        let mut sign_key = blob[..16].to_vec();
        let client_decrypt = md5_16_32_32(&blob[16..32], client_random, server_random);
        let client_encrypt = md5_16_32_32(&blob[32..48], client_random, server_random);

        let (mut encrypt_key, mut decrypt_key) = if server_mode {
            (client_decrypt, client_encrypt)
        } else {
            (client_encrypt, client_decrypt)
        };

        let rc4_key_len = match encryption_method {
            x if x == gcc::EncryptionMethod::Bit40 as u32 => {
                sign_key[..3].copy_from_slice(&KEY_SALT);
                encrypt_key[..3].copy_from_slice(&KEY_SALT);
                decrypt_key[..3].copy_from_slice(&KEY_SALT);
                8
            }
            x if x == gcc::EncryptionMethod::Bit56 as u32 => {
                sign_key[..1].copy_from_slice(&KEY_SALT[..1]);
                encrypt_key[..1].copy_from_slice(&KEY_SALT[..1]);
                decrypt_key[..1].copy_from_slice(&KEY_SALT[..1]);
                8
            }
            _ => 16,
        };

        let mut security = SessionSecurity {
            encrypt_update_key: encrypt_key.clone(),
            decrypt_update_key: decrypt_key.clone(),
            encrypt_cipher: Some(Rc4Cipher::new(&encrypt_key[..rc4_key_len])),
            decrypt_cipher: Some(Rc4Cipher::new(&decrypt_key[..rc4_key_len])),
            sign_key,
            encrypt_key,
            decrypt_key,
            rc4_key_len,
            encrypt_use_count: 0,
            decrypt_use_count: 0,
            encrypt_checksum_use_count: 0,
            decrypt_checksum_use_count: 0,
            strict_checksum,
            #[cfg(feature = "fips")]
            fips_sign_key: Vec::new(),
            #[cfg(feature = "fips")]
            fips_encrypt: None,
            #[cfg(feature = "fips")]
            fips_decrypt: None,
        };

        #[cfg(feature = "fips")]
        if encryption_method == gcc::EncryptionMethod::Fips as u32 {
            security.establish_fips(client_random, server_random, server_mode)?;
        }

        Ok(security)
    }

    #[cfg(feature = "fips")]
    fn establish_fips(
        &mut self,
        client_random: &[u8],
        server_random: &[u8],
        server_mode: bool,
    ) -> RdpResult<()> {
        let mut client_encrypt_key_t = [0_u8; 21];
        client_encrypt_key_t[..20].copy_from_slice(
            digest::digest(
                &digest::SHA1_FOR_LEGACY_USE_ONLY,
                &[&client_random[16..32], &server_random[16..32]].concat(),
            )
            .as_ref(),
        );
        client_encrypt_key_t[20] = client_encrypt_key_t[0];

        let mut client_decrypt_key_t = [0_u8; 21];
        client_decrypt_key_t[..20].copy_from_slice(
            digest::digest(
                &digest::SHA1_FOR_LEGACY_USE_ONLY,
                &[&client_random[..16], &server_random[..16]].concat(),
            )
            .as_ref(),
        );
        client_decrypt_key_t[20] = client_decrypt_key_t[0];

        self.fips_sign_key = digest::digest(
            &digest::SHA1_FOR_LEGACY_USE_ONLY,
            &[&client_decrypt_key_t[..20], &client_encrypt_key_t[..20]].concat(),
        )
        .as_ref()
        .to_vec();

        let encrypt_source = if server_mode {
            &client_decrypt_key_t
        } else {
            &client_encrypt_key_t
        };
        let decrypt_source = if server_mode {
            &client_encrypt_key_t
        } else {
            &client_decrypt_key_t
        };

        self.fips_encrypt = Some(fips::FipsCipher::new(
            &fips::expand_key_bits(encrypt_source),
            true,
        )?);
        self.fips_decrypt = Some(fips::FipsCipher::new(
            &fips::expand_key_bits(decrypt_source),
            false,
        )?);
        Ok(())
    }

    /// MACSignature = First64Bits(MD5(SignKey + pad2 + SHA1(SignKey + pad1 + length + data)))
    fn mac_signature(&self, data: &[u8]) -> Vec<u8> {
        let sign_key = &self.sign_key[..self.rc4_key_len];
        let sha1 = digest::digest(
            &digest::SHA1_FOR_LEGACY_USE_ONLY,
            &[
                sign_key,
                &PAD1[..],
                &(data.len() as u32).to_le_bytes(),
                data,
            ]
            .concat(),
        );
        let mut md5 = md5::Md5::new();
        md5.input([sign_key, &PAD2[..], sha1.as_ref()].concat());
        md5.result()[..8].to_vec()
    }

    /// Salted variant folding the cipher use count into the
    /// digest so replayed ciphertext can be detected
    fn salted_mac_signature(&self, data: &[u8], encryption: bool) -> Vec<u8> {
        let use_count = if encryption {
            self.encrypt_checksum_use_count
        } else {
            // checksum is computed over the plaintext after
            // decryption, the counter is already one ahead
            self.decrypt_checksum_use_count.wrapping_sub(1)
        };
        let sign_key = &self.sign_key[..self.rc4_key_len];
        let sha1 = digest::digest(
            &digest::SHA1_FOR_LEGACY_USE_ONLY,
            &[
                sign_key,
                &PAD1[..],
                &(data.len() as u32).to_le_bytes(),
                data,
                &use_count.to_le_bytes(),
            ]
            .concat(),
        );
        let mut md5 = md5::Md5::new();
        md5.input([sign_key, &PAD2[..], sha1.as_ref()].concat());
        md5.result()[..8].to_vec()
    }

    /// Re-derive a key from its update key
    ///
    /// NewKey = RC4(MD5(UpdateKey + pad2 + SHA1(UpdateKey + pad1 + CurrentKey)))
    /// with the 40/56 bit salt re-applied afterwards
    fn key_update(key: &mut Vec<u8>, update_key: &[u8], key_len: usize) {
        debug!("updating RDP session key");
        let sha1 = digest::digest(
            &digest::SHA1_FOR_LEGACY_USE_ONLY,
            &[&update_key[..key_len], &PAD1[..], &key[..key_len]].concat(),
        );
        let mut md5 = md5::Md5::new();
        md5.input([&update_key[..key_len], &PAD2[..], sha1.as_ref()].concat());
        let mut new_key = md5.result().to_vec();

        let mut rc4 = Rc4Cipher::new(&new_key[..key_len]);
        rc4.apply(&mut new_key[..key_len]);

        if key_len == 8 {
            new_key[..3].copy_from_slice(&KEY_SALT);
        }
        *key = new_key;
    }

    /// Sign and encrypt one payload in place
    ///
    /// Returns the signature and the ciphertext. The cipher
    /// key rotates after 4096 uses.
    pub fn encrypt(&mut self, data: &[u8], salted: bool) -> RdpResult<(Vec<u8>, Vec<u8>)> {
        if self.encrypt_use_count >= KEY_UPDATE_INTERVAL {
            Self::key_update(
                &mut self.encrypt_key,
                &self.encrypt_update_key,
                self.rc4_key_len,
            );
            self.encrypt_cipher = Some(Rc4Cipher::new(&self.encrypt_key[..self.rc4_key_len]));
            self.encrypt_use_count = 0;
        }

        let signature = if salted {
            self.salted_mac_signature(data, true)
        } else {
            self.mac_signature(data)
        };

        let mut ciphertext = data.to_vec();
        if let Some(cipher) = self.encrypt_cipher.as_mut() {
            cipher.apply(&mut ciphertext);
        }
        self.encrypt_use_count += 1;
        self.encrypt_checksum_use_count += 1;
        Ok((signature, ciphertext))
    }

    /// Decrypt one payload and verify its signature
    ///
    /// A mismatching MAC on the standard RC4 path is logged
    /// and tolerated unless strict checksum mode is on. The
    /// protocol is insecure against active tampering by
    /// design, so interoperability wins by default.
    pub fn decrypt(
        &mut self,
        data: &[u8],
        signature: &[u8],
        salted: bool,
    ) -> RdpResult<Vec<u8>> {
        if self.decrypt_use_count >= KEY_UPDATE_INTERVAL {
            Self::key_update(
                &mut self.decrypt_key,
                &self.decrypt_update_key,
                self.rc4_key_len,
            );
            self.decrypt_cipher = Some(Rc4Cipher::new(&self.decrypt_key[..self.rc4_key_len]));
            self.decrypt_use_count = 0;
        }

        let mut plaintext = data.to_vec();
        if let Some(cipher) = self.decrypt_cipher.as_mut() {
            cipher.apply(&mut plaintext);
        }
        self.decrypt_use_count += 1;
        self.decrypt_checksum_use_count += 1;

        let expected = if salted {
            self.salted_mac_signature(&plaintext, false)
        } else {
            self.mac_signature(&plaintext)
        };
        if expected != signature {
            if self.strict_checksum {
                return Err(Error::RdpError(RdpError::new(
                    RdpErrorKind::InvalidChecksum,
                    "PDU signature mismatch",
                )));
            }
            warn!("PDU signature mismatch, tolerated on the standard security path");
        }
        Ok(plaintext)
    }

    /// FIPS envelope: pad to the 3DES block size, encrypt and
    /// sign with HMAC-SHA1 over the plaintext and use count
    #[cfg(feature = "fips")]
    pub fn fips_encrypt(&mut self, data: &[u8]) -> RdpResult<(u8, Vec<u8>, Vec<u8>)> {
        let pad_length = (8 - data.len() % 8) % 8;
        let mut padded = data.to_vec();
        padded.resize(data.len() + pad_length, 0);

        let signature = self.fips_signature(data, self.encrypt_use_count);
        let cipher = try_option!(self.fips_encrypt.as_mut(), "FIPS cipher not established")?;
        let ciphertext = cipher.process(&padded)?;
        self.encrypt_use_count += 1;
        Ok((pad_length as u8, signature, ciphertext))
    }

    /// FIPS decrypt path, a signature mismatch here is fatal
    #[cfg(feature = "fips")]
    pub fn fips_decrypt(
        &mut self,
        data: &[u8],
        pad_length: u8,
        signature: &[u8],
    ) -> RdpResult<Vec<u8>> {
        let cipher = try_option!(self.fips_decrypt.as_mut(), "FIPS cipher not established")?;
        let mut plaintext = cipher.process(data)?;
        plaintext.truncate(plaintext.len().saturating_sub(pad_length as usize));

        let expected = self.fips_signature(&plaintext, self.decrypt_use_count);
        self.decrypt_use_count += 1;
        if expected != signature {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidChecksum,
                "FIPS PDU signature mismatch",
            )));
        }
        Ok(plaintext)
    }

    /// True when the 3DES envelope protects this session
    #[cfg(feature = "fips")]
    pub fn is_fips(&self) -> bool {
        self.fips_encrypt.is_some()
    }

    #[cfg(not(feature = "fips"))]
    pub fn is_fips(&self) -> bool {
        false
    }

    #[cfg(feature = "fips")]
    fn fips_signature(&self, data: &[u8], use_count: u32) -> Vec<u8> {
        let key = ring::hmac::Key::new(
            ring::hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            &self.fips_sign_key,
        );
        let mut input = data.to_vec();
        input.extend_from_slice(&use_count.to_le_bytes());
        ring::hmac::sign(&key, &input).as_ref()[..8].to_vec()
    }
}

impl Drop for SessionSecurity {
    fn drop(&mut self) {
        for key in [
            &mut self.sign_key,
            &mut self.encrypt_key,
            &mut self.decrypt_key,
            &mut self.encrypt_update_key,
            &mut self.decrypt_update_key,
        ] {
            for byte in key.iter_mut() {
                *byte = 0;
            }
        }
        #[cfg(feature = "fips")]
        for byte in self.fips_sign_key.iter_mut() {
            *byte = 0;
        }
    }
}

/// The two byte flags and two byte flagsHi of every protected
/// slow path PDU
pub fn read_security_header(stream: &mut dyn Read) -> RdpResult<u16> {
    let mut header = component![
        "securityFlag" => U16::LE(0),
        "securityFlagHi" => U16::LE(0)
    ];
    header.read(stream)?;
    // the high half is reserved and ignored
    cast!(DataType::U16, header["securityFlag"])
}

/// Decrypt the rest of `stream` according to the security
/// header flags previously read
pub fn decrypt_payload(
    security: &mut SessionSecurity,
    flags: u16,
    stream: &mut dyn Read,
) -> RdpResult<Vec<u8>> {
    if flags & SecurityFlag::SecEncrypt as u16 == 0 {
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest)?;
        return Ok(rest);
    }
    #[cfg(feature = "fips")]
    if security.is_fips() {
        return decrypt_fips_payload(security, stream);
    }
    let mut signature = vec![0_u8; 8];
    stream.read_exact(&mut signature)?;
    let mut ciphertext = Vec::new();
    stream.read_to_end(&mut ciphertext)?;
    security.decrypt(
        &ciphertext,
        &signature,
        flags & SecurityFlag::SecSecureChecksum as u16 != 0,
    )
}

/// TS_FIPS_INFO envelope: length, version, pad length, then
/// the HMAC signature and the 3DES ciphertext
#[cfg(feature = "fips")]
fn decrypt_fips_payload(
    security: &mut SessionSecurity,
    stream: &mut dyn Read,
) -> RdpResult<Vec<u8>> {
    let mut header = component![
        "length" => U16::LE(0),
        "version" => 0_u8,
        "padlen" => 0_u8,
        "dataSignature" => vec![0_u8; 8]
    ];
    header.read(stream)?;
    if cast!(DataType::U16, header["length"])? != FIPS_HEADER_LENGTH
        || cast!(DataType::U8, header["version"])? != TSFIPS_VERSION1
    {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidData,
            "malformed FIPS security header",
        )));
    }
    let pad_length = cast!(DataType::U8, header["padlen"])?;
    let signature = cast!(DataType::Slice, header["dataSignature"])?.to_vec();
    let mut ciphertext = Vec::new();
    stream.read_to_end(&mut ciphertext)?;
    security.fips_decrypt(&ciphertext, pad_length, &signature)
}

/// Decrypt the body of an encrypted fast-path unit, which
/// starts directly at its signature
pub fn decrypt_fastpath(
    security: &mut SessionSecurity,
    body: &[u8],
    salted: bool,
) -> RdpResult<Vec<u8>> {
    #[cfg(feature = "fips")]
    if security.is_fips() {
        let mut stream = body;
        return decrypt_fips_payload(security, &mut stream);
    }
    if body.len() < 8 {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidSize,
            "fast-path unit shorter than its signature",
        )));
    }
    security.decrypt(&body[8..], &body[..8], salted)
}

/// Wrap `payload` into a security envelope ready to be sent on
/// a channel
pub fn seal_payload(
    security: Option<&mut SessionSecurity>,
    base_flags: u16,
    payload: Vec<u8>,
) -> RdpResult<Trame> {
    match security {
        Some(security) => {
            #[cfg(feature = "fips")]
            if security.is_fips() {
                let (pad_length, signature, ciphertext) = security.fips_encrypt(&payload)?;
                return Ok(trame![
                    U16::LE(base_flags | SecurityFlag::SecEncrypt as u16),
                    U16::LE(0),
                    U16::LE(FIPS_HEADER_LENGTH),
                    TSFIPS_VERSION1,
                    pad_length,
                    signature,
                    ciphertext
                ]);
            }
            let (signature, ciphertext) = security.encrypt(&payload, false)?;
            Ok(trame![
                U16::LE(base_flags | SecurityFlag::SecEncrypt as u16),
                U16::LE(0),
                signature,
                ciphertext
            ])
        }
        None => Ok(trame![U16::LE(base_flags), U16::LE(0), payload]),
    }
}

/// On RDP version > 5
/// Client have to send IP information
///
/// https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/05ada9e4-a468-494b-8694-eb806a0ecc89
fn rdp_extended_infos(performance_flags: u32) -> Component {
    component![
        "clientAddressFamily" => U16::LE(AfInet::AfInet as u16),
        "cbClientAddress" => U16::LE(2), // size in bytes of the hardcoded null terminator in clientAddress
        "clientAddress" => b"\x00\x00".to_vec(),
        "cbClientDir" => U16::LE(2), // size in bytes of the hardcoded null terminator in clientDir
        "clientDir" => b"\x00\x00".to_vec(),
        "clientTimeZone" => vec![0u8; 172],
        "clientSessionId" => U32::LE(0),
        "performanceFlags" => U32::LE(performance_flags)
    ]
}

/// When CSSP is not used
/// interactive logon used credentials
/// present in this payload
fn rdp_infos(
    domain: &str,
    username: &str,
    password: &str,
    auto_logon: bool,
    info_flags: Option<u32>,
    extended_info_flags: Option<u32>,
) -> Component {
    let mut domain_format = domain.to_unicode();
    domain_format.push(0);
    domain_format.push(0);

    let mut username_format = username.to_unicode();
    username_format.push(0);
    username_format.push(0);

    let mut password_format = password.to_unicode();
    password_format.push(0);
    password_format.push(0);

    component![
        "codePage" => U32::LE(0),
        "flag" => U32::LE(
            info_flags.unwrap_or(0) |
            InfoFlag::InfoMouse as u32 |
            InfoFlag::InfoMouseHasWheel as u32 |
            InfoFlag::InfoUnicode as u32 |
            InfoFlag::InfoDisablectrlaltdel as u32 |
            InfoFlag::InfoEnablewindowskey as u32 |
            if auto_logon { InfoFlag::InfoAutologon as u32 } else { 0 }
        ),
        "cbDomain" => U16::LE((domain_format.len() - 2) as u16),
        "cbUserName" => U16::LE((username_format.len() - 2) as u16),
        "cbPassword" => U16::LE((password_format.len() - 2) as u16),
        "cbAlternateShell" => U16::LE(0),
        "cbWorkingDir" => U16::LE(0),
        "domain" => domain_format,
        "userName" => username_format,
        "password" => password_format,
        "alternateShell" => b"\x00\x00".to_vec(),
        "workingDir" => b"\x00\x00".to_vec(),
        "extendedInfos" => match extended_info_flags {
            Some(f) => rdp_extended_infos(f),
            None => component![]
        }
    ]
}

/// Client credentials used by the secure settings exchange
pub struct InfoParameters {
    pub domain: String,
    pub username: String,
    pub password: String,
    pub auto_logon: bool,
    pub info_flags: Option<u32>,
    pub extended_info_flags: Option<u32>,
}

/// Send the security exchange PDU carrying the client random
/// encrypted under the server certificate
pub fn send_security_exchange<S: Read + Write>(
    mcs: &mut mcs::Client<S>,
    certificate: &ServerCertificate,
    client_random: &[u8],
) -> RdpResult<()> {
    let encrypted = certificate.encrypt_message(client_random);
    mcs.write(
        mcs::GLOBAL_CHANNEL_NAME,
        trame![
            U16::LE(SecurityFlag::SecExchangePkt as u16),
            U16::LE(0),
            U32::LE(encrypted.len() as u32),
            encrypted
        ],
    )
}

/// Receive the security exchange PDU, accepting role, and
/// recover the client random with the server private key
pub fn recv_security_exchange(
    private_key: &RsaKeyPair,
    stream: &mut dyn Read,
) -> RdpResult<Vec<u8>> {
    let flags = read_security_header(stream)?;
    if flags & SecurityFlag::SecExchangePkt as u16 == 0 {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidData,
            "expected a security exchange PDU",
        )));
    }
    let mut length = U32::LE(0);
    length.read(stream)?;
    let mut encrypted = vec![0_u8; length.inner() as usize];
    stream.read_exact(&mut encrypted)?;
    // strip the eight byte zero tail before the RSA operation
    encrypted.truncate(encrypted.len().saturating_sub(8));
    Ok(decrypt_client_message(private_key, &encrypted))
}

/// Client Info PDU of the secure settings exchange,
/// encrypted when standard RDP security is active
pub fn send_client_info<S: Read + Write>(
    mcs: &mut mcs::Client<S>,
    security: Option<&mut SessionSecurity>,
    infos: &InfoParameters,
    rdp_version_5_plus: bool,
) -> RdpResult<()> {
    let extended = if rdp_version_5_plus {
        infos.extended_info_flags
    } else {
        None
    };
    let payload = crate::model::data::to_vec(&rdp_infos(
        &infos.domain,
        &infos.username,
        &infos.password,
        infos.auto_logon,
        infos.info_flags,
        extended,
    ));
    let message = seal_payload(security, SecurityFlag::SecInfoPkt as u16, payload)?;
    mcs.write(mcs::GLOBAL_CHANNEL_NAME, message)
}

#[cfg(test)]
mod test {
    use super::*;

    const CLIENT_RANDOM: [u8; 32] = [
        29, 91, 101, 210, 58, 6, 253, 117, 36, 209, 128, 84, 229, 91, 28, 208, 0, 65, 109, 164,
        235, 10, 22, 69, 183, 184, 158, 209, 128, 157, 122, 187,
    ];
    const SERVER_RANDOM: [u8; 32] = [
        135, 43, 167, 218, 195, 159, 70, 134, 193, 59, 40, 249, 168, 129, 51, 230, 69, 18, 45, 19,
        183, 23, 238, 173, 95, 50, 156, 45, 254, 174, 194, 255,
    ];

    fn peered_sessions() -> (SessionSecurity, SessionSecurity) {
        let client = SessionSecurity::establish(
            &CLIENT_RANDOM,
            &SERVER_RANDOM,
            gcc::EncryptionMethod::Bit128 as u32,
            false,
            true,
        )
        .unwrap();
        let server = SessionSecurity::establish(
            &CLIENT_RANDOM,
            &SERVER_RANDOM,
            gcc::EncryptionMethod::Bit128 as u32,
            true,
            true,
        )
        .unwrap();
        (client, server)
    }

    #[test]
    fn test_peer_keys_are_swapped() {
        let (client, server) = peered_sessions();
        assert_eq!(client.encrypt_key, server.decrypt_key);
        assert_eq!(client.decrypt_key, server.encrypt_key);
        assert_eq!(client.sign_key, server.sign_key);
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let (mut client, mut server) = peered_sessions();
        let plaintext = b"secure settings exchange".to_vec();
        let (signature, ciphertext) = client.encrypt(&plaintext, false).unwrap();
        assert_ne!(ciphertext, plaintext);
        let decrypted = server.decrypt(&ciphertext, &signature, false).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_key_rotation_round_trip() {
        // both sides step their ciphers through a full key
        // update interval and still agree afterwards
        let (mut client, mut server) = peered_sessions();
        let block = vec![0x42_u8; 16];
        for _ in 0..=KEY_UPDATE_INTERVAL {
            let (signature, ciphertext) = client.encrypt(&block, false).unwrap();
            let decrypted = server.decrypt(&ciphertext, &signature, false).unwrap();
            assert_eq!(decrypted, block);
        }
        // the counter wrapped through a rotation
        assert!(client.encrypt_use_count <= KEY_UPDATE_INTERVAL);
    }

    #[test]
    fn test_corrupted_signature_detected_in_strict_mode() {
        let (mut client, mut server) = peered_sessions();
        let (mut signature, ciphertext) = client.encrypt(b"payload", false).unwrap();
        signature[0] ^= 0xFF;
        assert!(server.decrypt(&ciphertext, &signature, false).is_err());
    }

    #[test]
    fn test_salted_signature_round_trip() {
        let (mut client, mut server) = peered_sessions();
        let (signature, ciphertext) = client.encrypt(b"salted", true).unwrap();
        let decrypted = server.decrypt(&ciphertext, &signature, true).unwrap();
        assert_eq!(decrypted, b"salted");
    }

    #[test]
    fn test_master_secret_known_vector() {
        const PREMASTER: [u8; 48] = [
            10, 63, 107, 103, 158, 17, 153, 19, 221, 157, 28, 215, 121, 50, 89, 79, 194, 171, 104,
            34, 180, 124, 248, 187, 66, 180, 163, 60, 208, 90, 236, 216, 4, 98, 137, 236, 151, 108,
            126, 215, 164, 2, 191, 110, 236, 93, 51, 40,
        ];
        const MASTER: [u8; 48] = [
            121, 64, 28, 102, 24, 136, 13, 198, 158, 252, 57, 55, 222, 122, 4, 93, 193, 218, 164,
            59, 153, 133, 183, 145, 40, 134, 109, 239, 233, 122, 214, 75, 248, 66, 147, 166, 135,
            133, 144, 178, 145, 156, 51, 212, 87, 202, 238, 190,
        ];
        let result = master_secret(&PREMASTER, &CLIENT_RANDOM, &SERVER_RANDOM);
        assert_eq!(result, MASTER.as_ref());
    }

    #[test]
    fn test_info_pdu_contains_credentials() {
        let infos = rdp_infos("domain", "user", "pass", true, None, None);
        let buffer = crate::model::data::to_vec(&infos);
        // unicode encoded username must appear in the payload
        let needle: Vec<u8> = "user".to_string().to_unicode();
        assert!(buffer
            .windows(needle.len())
            .any(|window| window == needle.as_slice()));
    }
}
