use crate::core::tpkt;
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use crate::model::rnd::random;
use crate::model::unicode::Unicode;
use crate::nla::asn1;
use crate::nla::sspi::{AuthenticationProtocol, Credentials, GenericSecurityService};
use log::{debug, warn};
use ring::digest;
use std::io::{Read, Write};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use yasna::Tag;

/// Highest CredSSP protocol version this client speaks
pub const CREDSSP_VERSION: u32 = 6;

/// Public key binding magics of CredSSP version 5 and later
const CLIENT_SERVER_HASH_MAGIC: &[u8] = b"CredSSP Client-To-Server Binding Hash\x00";
const SERVER_CLIENT_HASH_MAGIC: &[u8] = b"CredSSP Server-To-Client Binding Hash\x00";

const NONCE_SIZE: usize = 32;

/// Credential type discriminants of TSCredentials
const CRED_TYPE_PASSWORD: u32 = 1;
const CRED_TYPE_SMARTCARD: u32 = 2;
const CRED_TYPE_REMOTE_GUARD: u32 = 6;

/// Phases of the nested CredSSP exchange
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NlaState {
    Initial,
    NegoToken,
    PubKeyAuth,
    AuthInfo,
    Final,
}

/// The CredSSP message unit
///
/// DER SEQUENCE with contextual tags, everything optional
/// except the version
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-cssp/6aac4dea-08ef-47a6-8747-22ea7f6d8685
#[derive(Default)]
pub struct TsRequest {
    pub version: u32,
    pub nego_tokens: Option<Vec<u8>>,
    pub auth_info: Option<Vec<u8>>,
    pub pub_key_auth: Option<Vec<u8>>,
    pub error_code: Option<u32>,
    pub client_nonce: Option<Vec<u8>>,
}

impl TsRequest {
    fn with_version(version: u32) -> Self {
        TsRequest {
            version,
            ..Default::default()
        }
    }

    /// Serialize to DER
    ///
    /// yasna computes every nested length before writing, so
    /// the outer SEQUENCE length is exact from the first byte
    pub fn to_der(&self) -> Vec<u8> {
        yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer
                    .next()
                    .write_tagged(Tag::context(0), |writer| writer.write_u32(self.version));
                if let Some(nego_tokens) = &self.nego_tokens {
                    writer.next().write_tagged(Tag::context(1), |writer| {
                        writer.write_sequence_of(|writer| {
                            writer.next().write_sequence(|writer| {
                                writer.next().write_tagged(Tag::context(0), |writer| {
                                    writer.write_bytes(nego_tokens)
                                });
                            });
                        })
                    });
                }
                if let Some(auth_info) = &self.auth_info {
                    writer
                        .next()
                        .write_tagged(Tag::context(2), |writer| writer.write_bytes(auth_info));
                }
                if let Some(pub_key_auth) = &self.pub_key_auth {
                    writer
                        .next()
                        .write_tagged(Tag::context(3), |writer| writer.write_bytes(pub_key_auth));
                }
                if let Some(error_code) = self.error_code {
                    writer
                        .next()
                        .write_tagged(Tag::context(4), |writer| writer.write_u32(error_code));
                }
                if let Some(client_nonce) = &self.client_nonce {
                    writer
                        .next()
                        .write_tagged(Tag::context(5), |writer| writer.write_bytes(client_nonce));
                }
            })
        })
    }

    /// Parse a TSRequest out of a whole DER message
    pub fn from_der(data: &[u8]) -> RdpResult<Self> {
        let children = asn1::read_sequence(data)?;
        let mut request = TsRequest::default();
        let mut version_seen = false;

        for child in &children {
            if child.is_context(0) {
                request.version = asn1::read_integer(&asn1::read_context_inner(child)?)?;
                version_seen = true;
            } else if child.is_context(1) {
                // negoTokens is a SEQUENCE OF NegoData, each
                // one a SEQUENCE holding one [0] OCTET STRING
                let sequence_of = asn1::read_context_inner(child)?;
                let items = asn1::read_children(sequence_of.payload)?;
                if let Some(first) = items.first() {
                    let inner = asn1::read_children(first.payload)?;
                    let token = try_option!(inner.first(), "empty negoData entry")?;
                    let octet_string = asn1::read_context_inner(token)?;
                    request.nego_tokens = Some(asn1::read_octet_string(&octet_string)?);
                }
            } else if child.is_context(2) {
                request.auth_info =
                    Some(asn1::read_octet_string(&asn1::read_context_inner(child)?)?);
            } else if child.is_context(3) {
                request.pub_key_auth =
                    Some(asn1::read_octet_string(&asn1::read_context_inner(child)?)?);
            } else if child.is_context(4) {
                request.error_code =
                    Some(asn1::read_integer(&asn1::read_context_inner(child)?)?);
            } else if child.is_context(5) {
                request.client_nonce =
                    Some(asn1::read_octet_string(&asn1::read_context_inner(child)?)?);
            }
        }

        if !version_seen {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidData,
                "TSRequest without a version",
            )));
        }
        Ok(request)
    }
}

/// Extract the subject public key info payload out of the
/// peer X509 certificate
///
/// This is the key CredSSP binds the TLS session to
pub fn public_key_from_certificate(der: &[u8]) -> RdpResult<Vec<u8>> {
    let (_, x509) = X509Certificate::from_der(der).map_err(|_| {
        Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidData,
            "invalid peer X509 certificate",
        ))
    })?;
    Ok(x509
        .tbs_certificate
        .subject_pki
        .subject_public_key
        .data
        .to_vec())
}

/// The public key proof carried inside pubKeyAuth
///
/// Version 5 and later bind a SHA-256 hash of the key and the
/// client nonce, older versions echo the key verbatim
fn public_key_proof(
    version: u32,
    magic: &[u8],
    nonce: Option<&[u8]>,
    public_key: &[u8],
    server_side: bool,
) -> Vec<u8> {
    if version >= 5 {
        let nonce = nonce.unwrap_or(&[]);
        digest::digest(
            &digest::SHA256,
            &[magic, nonce, public_key].concat(),
        )
        .as_ref()
        .to_vec()
    } else if server_side {
        // legacy servers prove possession by incrementing the
        // first byte of the echoed key
        let mut incremented = public_key.to_vec();
        if let Some(first) = incremented.first_mut() {
            *first = first.wrapping_add(1);
        }
        incremented
    } else {
        public_key.to_vec()
    }
}

/// Build TSCredentials for any credential variant
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-cssp/94a1ab00-5500-42fd-8d3d-7a84e6c2cf03
pub fn create_ts_credentials(credentials: &Credentials) -> Vec<u8> {
    let (cred_type, cred_buffer) = match credentials {
        Credentials::Password {
            domain,
            username,
            password,
        } => (
            CRED_TYPE_PASSWORD,
            yasna::construct_der(|writer| {
                writer.write_sequence(|writer| {
                    writer.next().write_tagged(Tag::context(0), |writer| {
                        writer.write_bytes(&domain.to_unicode())
                    });
                    writer.next().write_tagged(Tag::context(1), |writer| {
                        writer.write_bytes(&username.to_unicode())
                    });
                    writer.next().write_tagged(Tag::context(2), |writer| {
                        writer.write_bytes(&password.to_unicode())
                    });
                })
            }),
        ),
        Credentials::SmartCard {
            pin,
            csp_name,
            reader_name,
            card_name,
            container_name,
            user_hint,
            domain_hint,
        } => (
            CRED_TYPE_SMARTCARD,
            yasna::construct_der(|writer| {
                writer.write_sequence(|writer| {
                    writer.next().write_tagged(Tag::context(0), |writer| {
                        writer.write_bytes(&pin.to_unicode())
                    });
                    writer.next().write_tagged(Tag::context(1), |writer| {
                        writer.write_sequence(|writer| {
                            writer
                                .next()
                                .write_tagged(Tag::context(0), |writer| writer.write_u32(1));
                            writer.next().write_tagged(Tag::context(1), |writer| {
                                writer.write_bytes(&card_name.to_unicode())
                            });
                            writer.next().write_tagged(Tag::context(2), |writer| {
                                writer.write_bytes(&reader_name.to_unicode())
                            });
                            writer.next().write_tagged(Tag::context(3), |writer| {
                                writer.write_bytes(&container_name.to_unicode())
                            });
                            writer.next().write_tagged(Tag::context(4), |writer| {
                                writer.write_bytes(&csp_name.to_unicode())
                            });
                        })
                    });
                    writer.next().write_tagged(Tag::context(2), |writer| {
                        writer.write_bytes(&user_hint.to_unicode())
                    });
                    writer.next().write_tagged(Tag::context(3), |writer| {
                        writer.write_bytes(&domain_hint.to_unicode())
                    });
                })
            }),
        ),
        Credentials::RemoteGuard {
            package_name,
            logon_credentials,
            supplemental_credentials,
        } => (
            CRED_TYPE_REMOTE_GUARD,
            yasna::construct_der(|writer| {
                writer.write_sequence(|writer| {
                    writer.next().write_tagged(Tag::context(0), |writer| {
                        writer.write_sequence(|writer| {
                            writer.next().write_tagged(Tag::context(0), |writer| {
                                writer.write_bytes(&package_name.to_unicode())
                            });
                            writer.next().write_tagged(Tag::context(1), |writer| {
                                writer.write_bytes(logon_credentials)
                            });
                        })
                    });
                    if !supplemental_credentials.is_empty() {
                        writer.next().write_tagged(Tag::context(1), |writer| {
                            writer.write_sequence_of(|writer| {
                                for supplemental in supplemental_credentials {
                                    writer.next().write_sequence(|writer| {
                                        writer.next().write_tagged(
                                            Tag::context(0),
                                            |writer| {
                                                writer.write_bytes(
                                                    &"Kerberos".to_unicode(),
                                                )
                                            },
                                        );
                                        writer.next().write_tagged(
                                            Tag::context(1),
                                            |writer| writer.write_bytes(supplemental),
                                        );
                                    });
                                }
                            })
                        });
                    }
                })
            }),
        ),
    };

    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer
                .next()
                .write_tagged(Tag::context(0), |writer| writer.write_u32(cred_type));
            writer
                .next()
                .write_tagged(Tag::context(1), |writer| writer.write_bytes(&cred_buffer));
        })
    })
}

fn send_ts_request<S: Read + Write>(
    tpkt: &mut tpkt::Client<S>,
    request: &TsRequest,
) -> RdpResult<()> {
    tpkt.get_link().write(&request.to_der())
}

fn read_ts_request<S: Read + Write>(tpkt: &mut tpkt::Client<S>) -> RdpResult<TsRequest> {
    let payload = tpkt.read()?;
    let stream = try_let!(tpkt::Payload::Raw, payload)?;
    TsRequest::from_der(&stream.into_inner())
}

/// Select the first security package able to start
///
/// Kerberos comes first when available and NTLM is the
/// fallback, a package failing before any byte left the
/// machine is simply skipped
fn select_package(
    providers: Vec<Box<dyn AuthenticationProtocol>>,
) -> RdpResult<(Box<dyn AuthenticationProtocol>, Vec<u8>)> {
    for mut provider in providers {
        match provider.create_negotiate_message() {
            Ok(token) => {
                debug!("authenticating with the {} package", provider.package_name());
                return Ok((provider, token));
            }
            Err(e) => warn!(
                "security package {} unavailable, falling back: {:?}",
                provider.package_name(),
                e
            ),
        }
    }
    Err(Error::RdpError(RdpError::new(
        RdpErrorKind::ProtocolNegFailure,
        "no security package could start the NLA exchange",
    )))
}

/// Drive the whole CredSSP exchange over an established TLS
/// link
///
/// Phases: negotiate tokens until the package completes, bind
/// the TLS public key with the nonce and verify the server
/// proof, and only then transmit the credentials. A proof
/// mismatch aborts before any credential leaves the machine.
pub fn cssp_connect<S: Read + Write>(
    tpkt: &mut tpkt::Client<S>,
    providers: Vec<Box<dyn AuthenticationProtocol>>,
) -> RdpResult<()> {
    tpkt.set_nla_mode(true);
    let result = cssp_connect_inner(tpkt, providers);
    tpkt.set_nla_mode(false);
    result
}

fn cssp_connect_inner<S: Read + Write>(
    tpkt: &mut tpkt::Client<S>,
    providers: Vec<Box<dyn AuthenticationProtocol>>,
) -> RdpResult<()> {
    let mut state = NlaState::Initial;
    debug!("NLA state {:?}", state);
    let (mut auth, first_token) = select_package(providers)?;

    let certificate = try_option!(
        tpkt.get_link().get_peer_certificate()?,
        "NLA requires the peer certificate"
    )?;
    let public_key = public_key_from_certificate(&certificate.to_der()?)?;
    let client_nonce = random(NONCE_SIZE);

    let mut request = TsRequest::with_version(CREDSSP_VERSION);
    request.nego_tokens = Some(first_token);
    send_ts_request(tpkt, &request)?;
    state = NlaState::NegoToken;
    debug!("NLA state {:?}", state);

    // version negotiated on the first answer, pinned for the
    // rest of the exchange
    let mut session_version = None;

    let mut security_interface = loop {
        let response = read_ts_request(tpkt)?;
        check_error_code(&response)?;
        match session_version {
            None => {
                session_version = Some(response.version.min(CREDSSP_VERSION));
            }
            Some(version) if version != response.version.min(CREDSSP_VERSION) => {
                return Err(Error::RdpError(RdpError::new(
                    RdpErrorKind::InvalidRespond,
                    "CredSSP version changed during the exchange",
                )));
            }
            _ => (),
        }

        let token = try_option!(response.nego_tokens, "TSRequest without a negotiate token")?;
        let next_token = auth.read_challenge_message(&token)?;

        if auth.is_complete() {
            let version = session_version.unwrap_or(CREDSSP_VERSION);
            let mut gss = auth.build_security_interface()?;
            let proof = public_key_proof(
                version,
                CLIENT_SERVER_HASH_MAGIC,
                Some(&client_nonce),
                &public_key,
                false,
            );

            let mut request = TsRequest::with_version(CREDSSP_VERSION);
            request.nego_tokens = Some(next_token);
            request.pub_key_auth = Some(gss.gss_wrapex(&proof)?);
            if version >= 5 {
                request.client_nonce = Some(client_nonce.clone());
            }
            send_ts_request(tpkt, &request)?;
            state = NlaState::PubKeyAuth;
            debug!("NLA state {:?}", state);
            break gss;
        }

        let mut request = TsRequest::with_version(CREDSSP_VERSION);
        request.nego_tokens = Some(next_token);
        send_ts_request(tpkt, &request)?;
    };

    // the server now proves it saw the same TLS public key
    let response = read_ts_request(tpkt)?;
    check_error_code(&response)?;
    let version = session_version.unwrap_or(CREDSSP_VERSION);
    let server_proof = security_interface.gss_unwrapex(&try_option!(
        response.pub_key_auth,
        "server answered without a public key proof"
    )?)?;
    let expected = public_key_proof(
        version,
        SERVER_CLIENT_HASH_MAGIC,
        Some(&client_nonce),
        &public_key,
        true,
    );
    if server_proof != expected {
        // never send credentials over a relayed session
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::PossibleMITM,
            "the server public key proof does not match the TLS session",
        )));
    }

    state = NlaState::AuthInfo;
    debug!("NLA state {:?}", state);
    let credentials = create_ts_credentials(&auth.credentials());
    let mut request = TsRequest::with_version(CREDSSP_VERSION);
    request.auth_info = Some(security_interface.gss_wrapex(&credentials)?);
    send_ts_request(tpkt, &request)?;

    state = NlaState::Final;
    debug!("NLA state {:?}", state);
    Ok(())
}

fn check_error_code(request: &TsRequest) -> RdpResult<()> {
    if let Some(code) = request.error_code {
        if code != 0 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::RejectedByServer,
                &format!("CredSSP error from the peer: {:#010x}", code),
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ts_request_round_trip() {
        let mut request = TsRequest::with_version(6);
        request.nego_tokens = Some(vec![1, 2, 3]);
        request.client_nonce = Some(vec![9_u8; NONCE_SIZE]);
        let der = request.to_der();
        let parsed = TsRequest::from_der(&der).unwrap();
        assert_eq!(parsed.version, 6);
        assert_eq!(parsed.nego_tokens.unwrap(), [1, 2, 3]);
        assert_eq!(parsed.client_nonce.unwrap(), vec![9_u8; NONCE_SIZE]);
        assert!(parsed.auth_info.is_none());
        assert!(parsed.error_code.is_none());
    }

    #[test]
    fn test_ts_request_error_code() {
        let mut request = TsRequest::with_version(6);
        request.error_code = Some(0x80090302);
        let parsed = TsRequest::from_der(&request.to_der()).unwrap();
        assert_eq!(parsed.error_code, Some(0x80090302));
        assert!(check_error_code(&parsed).is_err());
    }

    #[test]
    fn test_ts_request_without_version_rejected() {
        let der = yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer
                    .next()
                    .write_tagged(Tag::context(2), |writer| writer.write_bytes(&[1]));
            })
        });
        assert!(TsRequest::from_der(&der).is_err());
    }

    #[test]
    fn test_public_key_proof_verifies_and_detects_corruption() {
        let public_key = vec![3_u8; 64];
        let nonce = vec![7_u8; NONCE_SIZE];
        let sent = public_key_proof(6, SERVER_CLIENT_HASH_MAGIC, Some(&nonce), &public_key, true);
        let expected =
            public_key_proof(6, SERVER_CLIENT_HASH_MAGIC, Some(&nonce), &public_key, true);
        assert_eq!(sent, expected);

        // any corruption of the bound key changes the digest
        let mut corrupted_key = public_key.clone();
        corrupted_key[0] ^= 0x01;
        let corrupted =
            public_key_proof(6, SERVER_CLIENT_HASH_MAGIC, Some(&nonce), &corrupted_key, true);
        assert_ne!(corrupted, expected);
    }

    #[test]
    fn test_legacy_proof_increments_first_byte() {
        let public_key = vec![3_u8; 8];
        let proof = public_key_proof(2, SERVER_CLIENT_HASH_MAGIC, None, &public_key, true);
        assert_eq!(proof[0], 4);
        assert_eq!(&proof[1..], &public_key[1..]);
    }

    #[test]
    fn test_ts_credentials_password_encoding() {
        let credentials = Credentials::Password {
            domain: "dom".to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let der = create_ts_credentials(&credentials);
        let children = asn1::read_sequence(&der).unwrap();
        assert_eq!(children.len(), 2);
        let cred_type =
            asn1::read_integer(&asn1::read_context_inner(&children[0]).unwrap()).unwrap();
        assert_eq!(cred_type, CRED_TYPE_PASSWORD);

        // the credential buffer itself holds unicode fields
        let buffer =
            asn1::read_octet_string(&asn1::read_context_inner(&children[1]).unwrap()).unwrap();
        let fields = asn1::read_sequence(&buffer).unwrap();
        assert_eq!(fields.len(), 3);
        let password =
            asn1::read_octet_string(&asn1::read_context_inner(&fields[2]).unwrap()).unwrap();
        assert_eq!(password, "pass".to_unicode());
    }

    #[test]
    fn test_ts_credentials_smartcard_discriminant() {
        let credentials = Credentials::SmartCard {
            pin: "1234".to_string(),
            csp_name: "csp".to_string(),
            reader_name: "reader".to_string(),
            card_name: "card".to_string(),
            container_name: "container".to_string(),
            user_hint: "user".to_string(),
            domain_hint: "dom".to_string(),
        };
        let der = create_ts_credentials(&credentials);
        let children = asn1::read_sequence(&der).unwrap();
        let cred_type =
            asn1::read_integer(&asn1::read_context_inner(&children[0]).unwrap()).unwrap();
        assert_eq!(cred_type, CRED_TYPE_SMARTCARD);
    }
}
