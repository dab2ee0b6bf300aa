use crate::model::error::RdpResult;

/// Credentials handed to the CredSSP exchange
///
/// The acquisition itself, password prompt, PKCS#11 pin entry
/// or Kerberos ticket retrieval, happens outside this crate.
/// Every consumption site matches exhaustively on the variant.
#[derive(Clone)]
pub enum Credentials {
    Password {
        domain: String,
        username: String,
        password: String,
    },
    SmartCard {
        pin: String,
        csp_name: String,
        reader_name: String,
        card_name: String,
        container_name: String,
        user_hint: String,
        domain_hint: String,
    },
    RemoteGuard {
        package_name: String,
        logon_credentials: Vec<u8>,
        supplemental_credentials: Vec<Vec<u8>>,
    },
}

impl Credentials {
    pub fn domain(&self) -> String {
        match self {
            Credentials::Password { domain, .. } => domain.clone(),
            Credentials::SmartCard { domain_hint, .. } => domain_hint.clone(),
            Credentials::RemoteGuard { .. } => String::new(),
        }
    }

    pub fn username(&self) -> String {
        match self {
            Credentials::Password { username, .. } => username.clone(),
            Credentials::SmartCard { user_hint, .. } => user_hint.clone(),
            Credentials::RemoteGuard { .. } => String::new(),
        }
    }
}

/// Once the security package handshake completed, this
/// interface encrypts and decrypts the CredSSP payloads
pub trait GenericSecurityService {
    /// Sign and seal a payload
    fn gss_wrapex(&mut self, data: &[u8]) -> RdpResult<Vec<u8>>;

    /// Unseal a payload and verify its signature
    fn gss_unwrapex(&mut self, data: &[u8]) -> RdpResult<Vec<u8>>;
}

/// An underlying security package usable by CredSSP
///
/// NTLM is provided by this crate. A Kerberos package can be
/// plugged in from the outside; it consumes the canonicalized
/// principal produced by the external credential machinery.
pub trait AuthenticationProtocol {
    /// Name of the package, used for tracing and the remote
    /// guard credential selection
    fn package_name(&self) -> &'static str;

    /// First token of the exchange
    fn create_negotiate_message(&mut self) -> RdpResult<Vec<u8>>;

    /// Consume the peer token and produce the next one
    fn read_challenge_message(&mut self, request: &[u8]) -> RdpResult<Vec<u8>>;

    /// True once the package needs no further token exchange
    fn is_complete(&self) -> bool;

    /// Build the encryption interface from the established
    /// session key
    fn build_security_interface(&self) -> RdpResult<Box<dyn GenericSecurityService>>;

    /// Credentials this package authenticates with
    fn credentials(&self) -> Credentials;
}
