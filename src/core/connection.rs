use crate::core::autodetect::{AutoDetectState, AutoDetector};
use crate::core::capability;
use crate::core::gcc;
use crate::core::global::{self, ControlAction, PDUType, PDUType2};
use crate::core::license::{self, LicenseClient, LicenseState, LicenseStore};
use crate::core::mcs;
use crate::core::multitransport::Multitransport;
use crate::core::sec::{self, SecurityFlag, SessionSecurity};
use crate::core::tpkt;
use crate::core::x224;
use crate::core::{BulkCompressor, NoBulkCompression};
use crate::model::data::{to_vec, Component, DataType, Message, Trame, U16, U32};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use crate::model::link::Link;
use crate::model::rnd::random;
use crate::nla::cssp;
use crate::nla::ntlm::Ntlm;
use crate::nla::sspi::{AuthenticationProtocol, Credentials};
use log::{debug, warn};
use std::collections::VecDeque;
use std::io::{Cursor, Read, Write};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Maximum size of one virtual channel chunk
pub const CHANNEL_CHUNK_LENGTH: usize = 1600;

/// Virtual channel PDU flags
#[allow(dead_code)]
pub enum ChannelFlag {
    First = 0x00000001,
    Last = 0x00000002,
    ShowProtocol = 0x00000010,
}

/// Every phase of the connection sequence
///
/// The client walks them top to bottom, the accepting role
/// mirrors the same cursor with send and receive swapped
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Initial,
    Nego,
    Nla,
    McsCreateRequest,
    McsCreateResponse,
    McsErectDomain,
    McsAttachUser,
    McsAttachUserConfirm,
    McsChannelJoinRequest,
    McsChannelJoinResponse,
    RdpSecurityCommencement,
    SecureSettingsExchange,
    ConnectTimeAutoDetectRequest,
    ConnectTimeAutoDetectResponse,
    Licensing,
    MultitransportBootstrappingRequest,
    MultitransportBootstrappingResponse,
    CapabilitiesExchangeDemandActive,
    CapabilitiesExchangeMonitorLayout,
    CapabilitiesExchangeConfirmActive,
    FinalizationClientSync,
    FinalizationClientCooperate,
    FinalizationClientGrantedControl,
    FinalizationClientFontMap,
    Active,
}

impl ConnectionState {
    /// Name used in traces
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Initial => "INITIAL",
            ConnectionState::Nego => "NEGO",
            ConnectionState::Nla => "NLA",
            ConnectionState::McsCreateRequest => "MCS_CREATE_REQUEST",
            ConnectionState::McsCreateResponse => "MCS_CREATE_RESPONSE",
            ConnectionState::McsErectDomain => "MCS_ERECT_DOMAIN",
            ConnectionState::McsAttachUser => "MCS_ATTACH_USER",
            ConnectionState::McsAttachUserConfirm => "MCS_ATTACH_USER_CONFIRM",
            ConnectionState::McsChannelJoinRequest => "MCS_CHANNEL_JOIN_REQUEST",
            ConnectionState::McsChannelJoinResponse => "MCS_CHANNEL_JOIN_RESPONSE",
            ConnectionState::RdpSecurityCommencement => "RDP_SECURITY_COMMENCEMENT",
            ConnectionState::SecureSettingsExchange => "SECURE_SETTINGS_EXCHANGE",
            ConnectionState::ConnectTimeAutoDetectRequest => "CONNECT_TIME_AUTO_DETECT_REQUEST",
            ConnectionState::ConnectTimeAutoDetectResponse => "CONNECT_TIME_AUTO_DETECT_RESPONSE",
            ConnectionState::Licensing => "LICENSING",
            ConnectionState::MultitransportBootstrappingRequest => {
                "MULTITRANSPORT_BOOTSTRAPPING_REQUEST"
            }
            ConnectionState::MultitransportBootstrappingResponse => {
                "MULTITRANSPORT_BOOTSTRAPPING_RESPONSE"
            }
            ConnectionState::CapabilitiesExchangeDemandActive => {
                "CAPABILITIES_EXCHANGE_DEMAND_ACTIVE"
            }
            ConnectionState::CapabilitiesExchangeMonitorLayout => {
                "CAPABILITIES_EXCHANGE_MONITOR_LAYOUT"
            }
            ConnectionState::CapabilitiesExchangeConfirmActive => {
                "CAPABILITIES_EXCHANGE_CONFIRM_ACTIVE"
            }
            ConnectionState::FinalizationClientSync => "FINALIZATION_CLIENT_SYNC",
            ConnectionState::FinalizationClientCooperate => "FINALIZATION_CLIENT_COOPERATE",
            ConnectionState::FinalizationClientGrantedControl => {
                "FINALIZATION_CLIENT_GRANTED_CONTROL"
            }
            ConnectionState::FinalizationClientFontMap => "FINALIZATION_CLIENT_FONT_MAP",
            ConnectionState::Active => "ACTIVE",
        }
    }
}

/// Outcome of one state dispatch
///
/// This is the control flow signal of the driving loop: it
/// repeats dispatch on Continue and TryAgain, waits for input
/// on Success and stops on the three terminal variants
pub enum StateRun {
    /// Wait for the next inbound unit
    Success,
    /// Re-dispatch in the new state without new input
    Continue,
    /// Re-parse the same input from its start position in the
    /// new state
    TryAgain,
    /// The server asked for a session redirection, the caller
    /// tears the transport down and rebuilds it
    Redirect(RedirectionTarget),
    /// Steady state reached
    ActiveReady,
    /// Abort the connection
    Failed(RdpError),
}

/// What a step of the engine produced, as seen by the
/// embedding event loop
#[derive(Debug)]
pub enum ConnectionEvent {
    /// No complete unit available yet, retry when readable
    Pending,
    /// The sequence advanced and waits for the peer
    InProgress,
    /// Steady state
    Active,
    /// Rebuild against the new target
    Redirected(RedirectionTarget),
}

/// Target of a server redirection PDU
#[derive(Debug, Clone, Default)]
pub struct RedirectionTarget {
    pub session_id: u32,
    pub target_net_address: Option<String>,
    pub load_balance_info: Option<Vec<u8>>,
    pub username: Option<String>,
    pub domain: Option<String>,
}

/// Redirection field presence flags
#[allow(dead_code)]
enum RedirectionFlag {
    TargetNetAddress = 0x00000001,
    LoadBalanceInfo = 0x00000002,
    Username = 0x00000004,
    Domain = 0x00000008,
    Password = 0x00000010,
}

/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/e2db4dc2-826d-4992-9812-04755a194a14
fn parse_redirection(stream: &mut dyn Read) -> RdpResult<RedirectionTarget> {
    let mut fixed = component![
        "flags" => U16::LE(0),
        "length" => U16::LE(0),
        "sessionId" => U32::LE(0),
        "redirFlags" => U32::LE(0)
    ];
    fixed.read(stream)?;
    let redir_flags = cast!(DataType::U32, fixed["redirFlags"])?;

    let mut target = RedirectionTarget {
        session_id: cast!(DataType::U32, fixed["sessionId"])?,
        ..Default::default()
    };

    let mut read_blob = |stream: &mut dyn Read| -> RdpResult<Vec<u8>> {
        let mut length = U32::LE(0);
        length.read(stream)?;
        let mut value = vec![0_u8; length.inner() as usize];
        stream.read_exact(&mut value)?;
        Ok(value)
    };

    if redir_flags & RedirectionFlag::TargetNetAddress as u32 != 0 {
        target.target_net_address = Some(from_unicode(&read_blob(stream)?));
    }
    if redir_flags & RedirectionFlag::LoadBalanceInfo as u32 != 0 {
        target.load_balance_info = Some(read_blob(stream)?);
    }
    if redir_flags & RedirectionFlag::Username as u32 != 0 {
        target.username = Some(from_unicode(&read_blob(stream)?));
    }
    if redir_flags & RedirectionFlag::Domain as u32 != 0 {
        target.domain = Some(from_unicode(&read_blob(stream)?));
    }
    Ok(target)
}

fn from_unicode(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|c| *c != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Callbacks the connection raises towards the embedding
/// application
///
/// Every hook has a default empty body so implementations
/// override only what they consume
pub trait ConnectionHandler {
    /// The sequence reached the steady state
    fn on_connected(&mut self) {}

    /// A fast-path update arrived, already decrypted
    fn on_update(&mut self, _payload: &[u8]) {}

    /// A slow path data PDU arrived which the engine does not
    /// consume itself
    fn on_data_pdu(&mut self, _pdu_type2: u8, _payload: &[u8]) {}

    /// A virtual channel chunk arrived, reassembly is the
    /// consumer's concern
    fn on_channel_data(&mut self, _channel: &str, _flags: u32, _payload: &[u8]) {}

    /// The server published an error info code
    fn on_error_info(&mut self, _code: u32, _description: &str) {}
}

/// Handler with every hook left at its default
pub struct NoopHandler;

impl ConnectionHandler for NoopHandler {}

/// Static settings of the initiating role
pub struct ClientConfig {
    pub width: u16,
    pub height: u16,
    pub layout: u32,
    pub client_name: String,
    pub credentials: Credentials,
    /// security protocols offered during the X224 negotiation
    pub security_protocols: u32,
    /// encryption methods offered in the GCC security block
    pub encryption_methods: u32,
    pub check_certificate: bool,
    pub auto_logon: bool,
    pub info_flags: Option<u32>,
    pub extended_info_flags: Option<u32>,
    pub channel_names: Vec<String>,
    /// connect time network characterization toggle
    pub auto_detect: bool,
    /// abort on a standard path MAC mismatch instead of
    /// logging it
    pub strict_checksum: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            width: 1024,
            height: 768,
            layout: gcc::KeyboardLayout::UnitedStates as u32,
            client_name: "rdp-core".to_string(),
            credentials: Credentials::Password {
                domain: String::new(),
                username: String::new(),
                password: String::new(),
            },
            security_protocols: x224::Protocols::ProtocolSSL as u32
                | x224::Protocols::ProtocolHybrid as u32,
            encryption_methods: gcc::EncryptionMethod::Bit128 as u32,
            check_certificate: false,
            auto_logon: true,
            info_flags: None,
            extended_info_flags: None,
            channel_names: Vec::new(),
            auto_detect: true,
            strict_checksum: false,
        }
    }
}

/// The initiating side of a connection
///
/// Owns the whole layer stack and the state cursor. One
/// inbound unit drives one state handler; the embedded
/// sub machines, licensing, auto-detect and multitransport,
/// are consumed from the states that own their phase.
pub struct Connection<S> {
    mcs: Option<mcs::Client<S>>,
    state: ConnectionState,
    config: ClientConfig,
    handler: Box<dyn ConnectionHandler>,
    security: Option<SessionSecurity>,
    license: LicenseClient,
    autodetect: AutoDetector,
    multitransport: Multitransport,
    compressor: Box<dyn BulkCompressor>,
    share_id: u32,
    join_queue: VecDeque<(String, u16)>,
    joining: Option<String>,
    font_list_sent: bool,
    pending_input: Option<tpkt::Payload>,
    last_error: Option<String>,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(
        link: Link<S>,
        config: ClientConfig,
        handler: Box<dyn ConnectionHandler>,
        license_store: Box<dyn LicenseStore>,
    ) -> Self {
        let tpkt = tpkt::Client::new(link);
        let x224 = x224::Client::new(tpkt, x224::Protocols::ProtocolRDP);
        let license = LicenseClient::new(
            &config.credentials.username(),
            &config.client_name,
            license_store,
        );
        Connection {
            mcs: Some(mcs::Client::new(x224)),
            state: ConnectionState::Initial,
            config,
            handler,
            security: None,
            license,
            autodetect: AutoDetector::new(),
            multitransport: Multitransport::default(),
            compressor: Box::new(NoBulkCompression),
            share_id: 0,
            join_queue: VecDeque::new(),
            joining: None,
            font_list_sent: false,
            pending_input: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Human readable description of the last fatal condition
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Plug a bulk compression implementation in
    pub fn set_bulk_compressor(&mut self, compressor: Box<dyn BulkCompressor>) {
        self.compressor = compressor;
    }

    /// Cancellation flag polled by every read loop
    pub fn abort_handle(&mut self) -> RdpResult<Arc<AtomicBool>> {
        Ok(self.mcs()?.x224.get_transport().get_link().abort_handle())
    }

    pub fn set_blocking(&mut self, blocking: bool) -> RdpResult<()> {
        self.mcs()?
            .x224
            .get_transport()
            .get_link()
            .set_blocking(blocking);
        Ok(())
    }

    fn mcs(&mut self) -> RdpResult<&mut mcs::Client<S>> {
        try_option!(self.mcs.as_mut(), "transport is being upgraded")
    }

    /// Run one step of the engine
    ///
    /// Dispatch repeats while handlers ask for it and stops on
    /// the first state which waits for new input
    pub fn step(&mut self) -> RdpResult<ConnectionEvent> {
        loop {
            let run = if self.waits_for_input() {
                let mut payload = match self.pending_input.take() {
                    Some(payload) => payload,
                    None => {
                        // the negotiation phase runs below the
                        // X224 data layer
                        let raw = if self.state == ConnectionState::Nego {
                            self.mcs()?.x224.get_transport().read_pdu()?
                        } else {
                            self.mcs()?.x224.read_pdu()?
                        };
                        match raw {
                            Some(payload) => payload,
                            None => return Ok(ConnectionEvent::Pending),
                        }
                    }
                };
                let run = self.dispatch(Some(&mut payload));
                if let Ok(StateRun::TryAgain) = run {
                    payload.rewind();
                    self.pending_input = Some(payload);
                }
                run?
            } else {
                self.dispatch(None)?
            };

            match run {
                StateRun::Success => {
                    return if self.state == ConnectionState::Active {
                        Ok(ConnectionEvent::Active)
                    } else {
                        Ok(ConnectionEvent::InProgress)
                    }
                }
                StateRun::Continue | StateRun::TryAgain => continue,
                StateRun::ActiveReady => {
                    self.state = ConnectionState::Active;
                    debug!("connection reached {}", self.state.name());
                    self.handler.on_connected();
                    return Ok(ConnectionEvent::Active);
                }
                StateRun::Redirect(target) => {
                    return Ok(ConnectionEvent::Redirected(target));
                }
                StateRun::Failed(e) => {
                    self.last_error = Some(format!("{}", e));
                    return Err(Error::RdpError(e));
                }
            }
        }
    }

    /// Blocking driver, returns once the steady state is
    /// reached
    pub fn run_until_active(&mut self) -> RdpResult<Option<RedirectionTarget>> {
        loop {
            match self.step()? {
                ConnectionEvent::Active => return Ok(None),
                ConnectionEvent::Redirected(target) => return Ok(Some(target)),
                _ => continue,
            }
        }
    }

    fn waits_for_input(&self) -> bool {
        match self.state {
            ConnectionState::Nego
            | ConnectionState::McsCreateResponse
            | ConnectionState::McsAttachUserConfirm
            | ConnectionState::McsChannelJoinResponse
            | ConnectionState::ConnectTimeAutoDetectRequest
            | ConnectionState::ConnectTimeAutoDetectResponse
            | ConnectionState::Licensing
            | ConnectionState::MultitransportBootstrappingRequest
            | ConnectionState::CapabilitiesExchangeDemandActive
            | ConnectionState::Active => true,
            ConnectionState::FinalizationClientFontMap => self.font_list_sent,
            _ => false,
        }
    }

    fn transition(&mut self, state: ConnectionState) {
        debug!("{} -> {}", self.state.name(), state.name());
        self.state = state;
    }

    fn dispatch(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        match self.state {
            ConnectionState::Initial => self.on_initial(),
            ConnectionState::Nego => self.on_nego(input),
            ConnectionState::Nla => self.on_nla(),
            ConnectionState::McsCreateRequest => self.on_mcs_create_request(),
            ConnectionState::McsCreateResponse => self.on_mcs_create_response(input),
            ConnectionState::McsErectDomain => self.on_mcs_erect_domain(),
            ConnectionState::McsAttachUser => self.on_mcs_attach_user(),
            ConnectionState::McsAttachUserConfirm => self.on_mcs_attach_user_confirm(input),
            ConnectionState::McsChannelJoinRequest => self.on_mcs_channel_join_request(),
            ConnectionState::McsChannelJoinResponse => self.on_mcs_channel_join_response(input),
            ConnectionState::RdpSecurityCommencement => self.on_security_commencement(),
            ConnectionState::SecureSettingsExchange => self.on_secure_settings_exchange(),
            ConnectionState::ConnectTimeAutoDetectRequest
            | ConnectionState::ConnectTimeAutoDetectResponse => self.on_auto_detect(input),
            ConnectionState::Licensing => self.on_licensing(input),
            ConnectionState::MultitransportBootstrappingRequest => {
                self.on_multitransport_request(input)
            }
            ConnectionState::MultitransportBootstrappingResponse => {
                self.transition(ConnectionState::CapabilitiesExchangeDemandActive);
                Ok(StateRun::Continue)
            }
            ConnectionState::CapabilitiesExchangeDemandActive => self.on_demand_active(input),
            ConnectionState::CapabilitiesExchangeMonitorLayout => {
                // the optional monitor layout PDU is consumed by
                // the data phase when it shows up
                self.transition(ConnectionState::CapabilitiesExchangeConfirmActive);
                Ok(StateRun::Continue)
            }
            ConnectionState::CapabilitiesExchangeConfirmActive => self.on_confirm_active(),
            ConnectionState::FinalizationClientSync => self.on_client_sync(),
            ConnectionState::FinalizationClientCooperate => self.on_client_cooperate(),
            ConnectionState::FinalizationClientGrantedControl => self.on_client_granted_control(),
            ConnectionState::FinalizationClientFontMap => self.on_client_font_map(input),
            ConnectionState::Active => self.on_active(input),
        }
    }

    // --- connection phases ----------------------------------------------

    fn on_initial(&mut self) -> RdpResult<StateRun> {
        let username = self.config.credentials.username();
        let cookie = if username.is_empty() {
            None
        } else {
            Some(username)
        };
        let protocols = self.config.security_protocols;
        x224::send_connection_request(
            self.mcs()?.x224.get_transport(),
            protocols,
            cookie.as_deref(),
        )?;
        self.transition(ConnectionState::Nego);
        Ok(StateRun::Success)
    }

    fn on_nego(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(StateRun::Success),
        };
        let selected = match x224::parse_connection_confirm(stream) {
            Ok(selected) => selected,
            Err(Error::RdpError(e)) => return Ok(StateRun::Failed(e)),
            Err(e) => return Err(e),
        };
        debug!("server selected {:?}", selected);

        // upgrade the link according to the selected protocol
        let mcs = try_option!(self.mcs.take(), "transport is being upgraded")?;
        let mut x224_client = mcs.x224;
        x224_client.selected_protocol = selected;
        match selected {
            x224::Protocols::ProtocolRDP => {
                self.mcs = Some(mcs::Client::new(x224_client));
                self.transition(ConnectionState::McsCreateRequest);
                Ok(StateRun::Continue)
            }
            x224::Protocols::ProtocolSSL => {
                let tpkt_client = x224_client.into_transport();
                let link = tpkt_client
                    .into_link()
                    .start_ssl(self.config.check_certificate)?;
                let tpkt_client = tpkt::Client::new(link);
                self.mcs = Some(mcs::Client::new(x224::Client::new(tpkt_client, selected)));
                self.transition(ConnectionState::McsCreateRequest);
                Ok(StateRun::Continue)
            }
            x224::Protocols::ProtocolHybrid | x224::Protocols::ProtocolHybridEx => {
                let tpkt_client = x224_client.into_transport();
                let link = tpkt_client
                    .into_link()
                    .start_ssl(self.config.check_certificate)?;
                let tpkt_client = tpkt::Client::new(link);
                self.mcs = Some(mcs::Client::new(x224::Client::new(tpkt_client, selected)));
                self.transition(ConnectionState::Nla);
                Ok(StateRun::Continue)
            }
        }
    }

    fn on_nla(&mut self) -> RdpResult<StateRun> {
        // the nested CredSSP machine drives its own exchange
        // over the transport's NLA framing
        let credentials = self.config.credentials.clone();
        let providers: Vec<Box<dyn AuthenticationProtocol>> =
            vec![Box::new(Ntlm::new_with_credentials(credentials))];
        let mcs = self.mcs()?;
        match cssp::cssp_connect(mcs.x224.get_transport(), providers) {
            Ok(()) => {
                self.transition(ConnectionState::McsCreateRequest);
                Ok(StateRun::Continue)
            }
            Err(Error::RdpError(e)) => Ok(StateRun::Failed(e)),
            Err(e) => Err(e),
        }
    }

    fn on_mcs_create_request(&mut self) -> RdpResult<StateRun> {
        let width = self.config.width;
        let height = self.config.height;
        let layout = self.config.layout;
        let client_name = self.config.client_name.clone();
        let encryption_methods = self.config.encryption_methods;
        let channel_names = self.config.channel_names.clone();
        self.mcs()?.send_connect_initial(
            width,
            height,
            layout,
            &client_name,
            encryption_methods,
            &channel_names,
        )?;
        self.transition(ConnectionState::McsCreateResponse);
        Ok(StateRun::Success)
    }

    fn on_mcs_create_response(
        &mut self,
        input: Option<&mut tpkt::Payload>,
    ) -> RdpResult<StateRun> {
        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(StateRun::Success),
        };
        let mut local = Cursor::new(read_rest(stream)?);
        match self.mcs()?.recv_connect_response(&mut local) {
            Ok(()) => (),
            Err(Error::RdpError(e)) => return Ok(StateRun::Failed(e)),
            Err(e) => return Err(e),
        }
        self.transition(ConnectionState::McsErectDomain);
        Ok(StateRun::Continue)
    }

    fn on_mcs_erect_domain(&mut self) -> RdpResult<StateRun> {
        self.mcs()?.send_erect_domain_request()?;
        self.transition(ConnectionState::McsAttachUser);
        Ok(StateRun::Continue)
    }

    fn on_mcs_attach_user(&mut self) -> RdpResult<StateRun> {
        self.mcs()?.send_attach_user_request()?;
        self.transition(ConnectionState::McsAttachUserConfirm);
        Ok(StateRun::Success)
    }

    fn on_mcs_attach_user_confirm(
        &mut self,
        input: Option<&mut tpkt::Payload>,
    ) -> RdpResult<StateRun> {
        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(StateRun::Success),
        };
        let mut local = Cursor::new(read_rest(stream)?);
        match self.mcs()?.recv_attach_user_confirm(&mut local) {
            Ok(user_id) => debug!("attached as user {}", user_id),
            Err(Error::RdpError(e)) => return Ok(StateRun::Failed(e)),
            Err(e) => return Err(e),
        }
        self.join_queue = self.mcs()?.channels_to_join()?.into_iter().collect();
        self.transition(ConnectionState::McsChannelJoinRequest);
        Ok(StateRun::Continue)
    }

    fn on_mcs_channel_join_request(&mut self) -> RdpResult<StateRun> {
        match self.join_queue.pop_front() {
            Some((name, channel_id)) => {
                self.mcs()?.send_channel_join_request(channel_id)?;
                self.joining = Some(name);
                self.transition(ConnectionState::McsChannelJoinResponse);
                Ok(StateRun::Success)
            }
            None => {
                self.transition(ConnectionState::RdpSecurityCommencement);
                Ok(StateRun::Continue)
            }
        }
    }

    fn on_mcs_channel_join_response(
        &mut self,
        input: Option<&mut tpkt::Payload>,
    ) -> RdpResult<StateRun> {
        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(StateRun::Success),
        };
        let mut local = Cursor::new(read_rest(stream)?);
        let name = try_option!(self.joining.take(), "no channel join in flight")?;
        match self.mcs()?.recv_channel_join_confirm(&name, &mut local) {
            Ok(channel_id) => debug!("joined channel {} as {}", name, channel_id),
            Err(Error::RdpError(e)) => return Ok(StateRun::Failed(e)),
            Err(e) => return Err(e),
        }
        self.transition(ConnectionState::McsChannelJoinRequest);
        Ok(StateRun::Continue)
    }

    /// Standard RDP security: send the encrypted client
    /// random and derive the session keys. Skipped entirely
    /// when the server negotiated no encryption.
    fn on_security_commencement(&mut self) -> RdpResult<StateRun> {
        let (encryption_method, server_random, certificate_blob) = {
            let mcs = self.mcs()?;
            let server_data = try_option!(mcs.server_data(), "server data not negotiated")?;
            (
                server_data.security.encryption_method,
                server_data.security.server_random.clone(),
                server_data.security.server_certificate.clone(),
            )
        };

        if encryption_method != 0 {
            let certificate =
                sec::ServerCertificate::from_bytes(&mut Cursor::new(certificate_blob))?;
            let client_random = random(32);
            sec::send_security_exchange(self.mcs()?, &certificate, &client_random)?;
            self.security = Some(SessionSecurity::establish(
                &client_random,
                &server_random,
                encryption_method,
                false,
                self.config.strict_checksum,
            )?);
        }

        self.transition(ConnectionState::SecureSettingsExchange);
        Ok(StateRun::Continue)
    }

    fn on_secure_settings_exchange(&mut self) -> RdpResult<StateRun> {
        let infos = sec::InfoParameters {
            domain: self.config.credentials.domain(),
            username: self.config.credentials.username(),
            password: match &self.config.credentials {
                Credentials::Password { password, .. } => password.clone(),
                _ => String::new(),
            },
            auto_logon: self.config.auto_logon,
            info_flags: self.config.info_flags,
            extended_info_flags: self.config.extended_info_flags,
        };
        let rdp_version_5_plus = {
            let mcs = self.mcs()?;
            let server_data = try_option!(mcs.server_data(), "server data not negotiated")?;
            server_data.version >= gcc::Version::RdpVersion5Plus as u32
        };
        // borrow dance: the security context and the mcs layer
        // live in the same struct
        let mut security = self.security.take();
        let result = sec::send_client_info(
            self.mcs()?,
            security.as_mut(),
            &infos,
            rdp_version_5_plus,
        );
        self.security = security;
        result?;

        if self.config.auto_detect {
            self.transition(ConnectionState::ConnectTimeAutoDetectRequest);
        } else {
            self.transition(ConnectionState::Licensing);
        }
        Ok(StateRun::Success)
    }

    fn on_auto_detect(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(StateRun::Success),
        };
        let (_channel_id, mut payload) = self.open_channel_payload(stream)?;
        let flags = sec::read_security_header(&mut payload)?;
        let mut payload = self.unseal(flags, &mut payload)?;

        if flags & SecurityFlag::SecAutodetectReq as u16 != 0 {
            let response = match self.autodetect.process_request(&mut payload) {
                Ok((_, response)) => response,
                Err(Error::RdpError(e)) => return Ok(StateRun::Failed(e)),
                Err(e) => return Err(e),
            };
            if let Some(response) = response {
                self.send_wrapped(mcs::MESSAGE_CHANNEL_NAME, response)?;
            }
            if self.autodetect.state() == AutoDetectState::Complete {
                self.transition(ConnectionState::Licensing);
            }
            return Ok(StateRun::Success);
        }

        // the server went on without auto-detect, hand the
        // same unit to the licensing phase
        self.transition(ConnectionState::Licensing);
        Ok(StateRun::TryAgain)
    }

    fn on_licensing(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(StateRun::Success),
        };
        let (_channel_id, mut payload) = self.open_channel_payload(stream)?;
        let flags = sec::read_security_header(&mut payload)?;

        if flags & SecurityFlag::SecRedirectionPkt as u16 != 0 {
            let mut payload = self.unseal(flags, &mut payload)?;
            return Ok(StateRun::Redirect(parse_redirection(&mut payload)?));
        }

        if flags & SecurityFlag::SecAutodetectReq as u16 != 0 {
            // late auto-detect request, tolerated
            let mut payload = self.unseal(flags, &mut payload)?;
            if let Ok((_, Some(response))) = self.autodetect.process_request(&mut payload) {
                self.send_wrapped(mcs::MESSAGE_CHANNEL_NAME, response)?;
            }
            return Ok(StateRun::Success);
        }

        if flags & SecurityFlag::SecLicensePkt as u16 == 0 {
            // licensing was skipped by the server, the unit
            // belongs to the capability exchange
            self.transition(ConnectionState::CapabilitiesExchangeDemandActive);
            return Ok(StateRun::TryAgain);
        }

        let mut payload = self.unseal(flags, &mut payload)?;
        let (state, response) = match self.license.process(&mut payload) {
            Ok(result) => result,
            Err(Error::RdpError(e)) => return Ok(StateRun::Failed(e)),
            Err(e) => return Err(e),
        };
        if let Some(response) = response {
            self.send_wrapped(mcs::GLOBAL_CHANNEL_NAME, response)?;
        }
        match state {
            LicenseState::Completed => {
                self.transition(ConnectionState::MultitransportBootstrappingRequest);
                Ok(StateRun::Success)
            }
            LicenseState::Aborted => Ok(StateRun::Failed(RdpError::new(
                RdpErrorKind::RejectedByServer,
                "license negotiation aborted",
            ))),
            _ => Ok(StateRun::Success),
        }
    }

    fn on_multitransport_request(
        &mut self,
        input: Option<&mut tpkt::Payload>,
    ) -> RdpResult<StateRun> {
        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(StateRun::Success),
        };
        let (channel_id, mut payload) = self.open_channel_payload(stream)?;
        let message_channel = self.mcs()?.message_channel_id();
        if Some(channel_id) != message_channel {
            // no multitransport offer, this unit opens the
            // capability exchange
            self.transition(ConnectionState::CapabilitiesExchangeDemandActive);
            return Ok(StateRun::TryAgain);
        }

        let flags = sec::read_security_header(&mut payload)?;
        let mut payload = self.unseal(flags, &mut payload)?;

        if flags & SecurityFlag::SecTransportReq as u16 != 0 {
            let (_, response) = match self.multitransport.process_request(&mut payload) {
                Ok(result) => result,
                Err(Error::RdpError(e)) => {
                    warn!("malformed multitransport request: {}", e);
                    return Ok(StateRun::Success);
                }
                Err(e) => return Err(e),
            };
            self.send_wrapped(mcs::MESSAGE_CHANNEL_NAME, response)?;
            self.transition(ConnectionState::MultitransportBootstrappingResponse);
            return Ok(StateRun::Continue);
        }

        if flags & SecurityFlag::SecAutodetectReq as u16 != 0 {
            if let Ok((_, Some(response))) = self.autodetect.process_request(&mut payload) {
                self.send_wrapped(mcs::MESSAGE_CHANNEL_NAME, response)?;
            }
            return Ok(StateRun::Success);
        }

        warn!("unexpected message channel unit while waiting for multitransport");
        Ok(StateRun::Success)
    }

    fn on_demand_active(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        let stream = match input {
            Some(tpkt::Payload::Raw(stream)) => stream,
            Some(tpkt::Payload::FastPath(_, _)) => {
                warn!("fast-path unit before the capability exchange completed");
                return Ok(StateRun::Success);
            }
            None => return Ok(StateRun::Success),
        };
        let (channel_id, mut payload) = self.open_channel_payload(stream)?;
        let message_channel = self.mcs()?.message_channel_id();
        if Some(channel_id) == message_channel {
            // late message channel traffic is tolerated here
            let flags = sec::read_security_header(&mut payload)?;
            let mut payload = self.unseal(flags, &mut payload)?;
            if flags & SecurityFlag::SecAutodetectReq as u16 != 0 {
                if let Ok((_, Some(response))) = self.autodetect.process_request(&mut payload) {
                    self.send_wrapped(mcs::MESSAGE_CHANNEL_NAME, response)?;
                }
            }
            return Ok(StateRun::Success);
        }

        let mut payload = self.unseal_global(&mut payload)?;
        let header = match global::read_share_control_header(&mut payload)? {
            Some(header) => header,
            None => return Ok(StateRun::Success),
        };
        match header.pdu_type {
            PDUType::PdutypeDemandactivepdu => {
                let demand = global::read_demand_active(&mut payload)?;
                self.share_id = demand.share_id;
                debug!(
                    "demand active for share {:#x} with {} capability sets",
                    demand.share_id,
                    demand.capabilities.len()
                );
                self.transition(ConnectionState::CapabilitiesExchangeMonitorLayout);
                Ok(StateRun::Continue)
            }
            PDUType::PdutypeServerRedirPkt => {
                Ok(StateRun::Redirect(parse_redirection(&mut payload)?))
            }
            other => {
                warn!(
                    "unexpected {} while waiting for demand active",
                    other.name()
                );
                Ok(StateRun::Success)
            }
        }
    }

    fn on_confirm_active(&mut self) -> RdpResult<StateRun> {
        let capabilities =
            capability::client_capabilities(self.config.width, self.config.height, self.config.layout);
        let payload = global::write_confirm_active(self.share_id, &capabilities);
        self.send_share_control(PDUType::PdutypeConfirmactivepdu, payload)?;
        self.transition(ConnectionState::FinalizationClientSync);
        Ok(StateRun::Continue)
    }

    fn on_client_sync(&mut self) -> RdpResult<StateRun> {
        let target_user = self.mcs()?.user_id();
        self.send_data_pdu(
            PDUType2::Pdutype2Synchronize,
            global::synchronize_payload(target_user),
        )?;
        self.transition(ConnectionState::FinalizationClientCooperate);
        Ok(StateRun::Continue)
    }

    fn on_client_cooperate(&mut self) -> RdpResult<StateRun> {
        self.send_data_pdu(
            PDUType2::Pdutype2Control,
            global::control_payload(ControlAction::Cooperate),
        )?;
        self.transition(ConnectionState::FinalizationClientGrantedControl);
        Ok(StateRun::Continue)
    }

    fn on_client_granted_control(&mut self) -> RdpResult<StateRun> {
        self.send_data_pdu(
            PDUType2::Pdutype2Control,
            global::control_payload(ControlAction::RequestControl),
        )?;
        self.font_list_sent = false;
        self.transition(ConnectionState::FinalizationClientFontMap);
        Ok(StateRun::Continue)
    }

    fn on_client_font_map(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        if !self.font_list_sent {
            self.send_data_pdu(PDUType2::Pdutype2Fontlist, global::font_list_payload())?;
            self.font_list_sent = true;
            return Ok(StateRun::Success);
        }

        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(StateRun::Success),
        };
        let (_channel_id, mut payload) = self.open_channel_payload(stream)?;
        let mut payload = self.unseal_global(&mut payload)?;
        let header = match global::read_share_control_header(&mut payload)? {
            Some(header) => header,
            None => return Ok(StateRun::Success),
        };
        if header.pdu_type != PDUType::PdutypeDatapdu {
            warn!(
                "unexpected {} during finalization",
                header.pdu_type.name()
            );
            return Ok(StateRun::Success);
        }
        let data_header = global::read_share_data_header(&mut payload)?;
        if data_header.pdu_type2 == PDUType2::Pdutype2Fontmap as u8 {
            return Ok(StateRun::ActiveReady);
        }
        // server synchronize and control PDUs pass through here
        debug!(
            "finalization consumed a {} data PDU",
            PDUType2::name(data_header.pdu_type2)
        );
        Ok(StateRun::Success)
    }

    /// Steady state dispatch
    fn on_active(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        match input {
            Some(tpkt::Payload::FastPath(sec_flags, stream)) => {
                let sec_flags = *sec_flags;
                let mut body = read_rest(stream)?;
                if sec_flags & 0x2 != 0 {
                    // FASTPATH_OUTPUT_ENCRYPTED
                    let security = try_option!(
                        self.security.as_mut(),
                        "encrypted fast-path unit without session keys"
                    )?;
                    let salted = sec_flags & 0x1 != 0;
                    body = match sec::decrypt_fastpath(security, &body, salted) {
                        Ok(body) => body,
                        Err(Error::RdpError(e)) => return Ok(StateRun::Failed(e)),
                        Err(e) => return Err(e),
                    };
                }
                self.handler.on_update(&body);
                Ok(StateRun::Success)
            }
            Some(tpkt::Payload::Raw(stream)) => self.on_active_slow_path(stream),
            None => Ok(StateRun::Success),
        }
    }

    fn on_active_slow_path(&mut self, stream: &mut Cursor<Vec<u8>>) -> RdpResult<StateRun> {
        let (channel_id, mut payload) = self.open_channel_payload(stream)?;
        let mcs_ref = self.mcs()?;
        let channel_name = mcs_ref
            .channel_name(channel_id)
            .unwrap_or("unknown")
            .to_string();
        let message_channel = mcs_ref.message_channel_id();

        if Some(channel_id) == message_channel {
            let flags = sec::read_security_header(&mut payload)?;
            let mut payload = self.unseal(flags, &mut payload)?;
            if flags & SecurityFlag::SecAutodetectReq as u16 != 0 {
                // continuous network characterization
                if let Ok((_, Some(response))) = self.autodetect.process_request(&mut payload) {
                    self.send_wrapped(mcs::MESSAGE_CHANNEL_NAME, response)?;
                }
            } else if flags & SecurityFlag::SecTransportReq as u16 != 0 {
                if let Ok((_, response)) = self.multitransport.process_request(&mut payload) {
                    self.send_wrapped(mcs::MESSAGE_CHANNEL_NAME, response)?;
                }
            } else if flags & SecurityFlag::SecHeartbeat as u16 != 0 {
                debug!("heartbeat");
            } else {
                warn!("unexpected message channel unit in active state");
            }
            return Ok(StateRun::Success);
        }

        if channel_name != mcs::GLOBAL_CHANNEL_NAME {
            // virtual channel chunk, reassembly belongs to the
            // consumer
            let mut header = component![
                "length" => U32::LE(0),
                "flags" => U32::LE(0)
            ];
            header.read(&mut payload)?;
            let flags = cast!(DataType::U32, header["flags"])?;
            let chunk = read_rest(&mut payload)?;
            self.handler.on_channel_data(&channel_name, flags, &chunk);
            return Ok(StateRun::Success);
        }

        let mut payload = self.unseal_global(&mut payload)?;
        let header = match global::read_share_control_header(&mut payload)? {
            Some(header) => header,
            None => return Ok(StateRun::Success),
        };
        match header.pdu_type {
            PDUType::PdutypeDeactivateallpdu => {
                // reactivation sequence, the transport stays up
                debug!("deactivate all, returning to the capability exchange");
                self.transition(ConnectionState::CapabilitiesExchangeDemandActive);
                Ok(StateRun::Continue)
            }
            PDUType::PdutypeServerRedirPkt => {
                Ok(StateRun::Redirect(parse_redirection(&mut payload)?))
            }
            PDUType::PdutypeDatapdu => {
                let data_header = global::read_share_data_header(&mut payload)?;
                let mut body = read_rest(&mut payload)?;
                if data_header.compressed_type & global::CompressionFlag::PacketCompressed as u8
                    != 0
                {
                    body = self.compressor.decompress(
                        &body,
                        data_header.compressed_type,
                        data_header.uncompressed_length as usize,
                    )?;
                }
                self.on_data_pdu(data_header.pdu_type2, &body)
            }
            other => {
                warn!("unexpected {} in active state", other.name());
                Ok(StateRun::Success)
            }
        }
    }

    fn on_data_pdu(&mut self, pdu_type2: u8, body: &[u8]) -> RdpResult<StateRun> {
        if pdu_type2 == PDUType2::Pdutype2SetErrorInfoPdu as u8 {
            let code = global::read_error_info(&mut Cursor::new(body.to_vec()))?;
            let description = global::error_info_description(code);
            if code != 0 {
                warn!("server error info: {}", description);
                self.last_error = Some(description.clone());
            }
            self.handler.on_error_info(code, &description);
            return Ok(StateRun::Success);
        }
        if pdu_type2 == PDUType2::Pdutype2ShutdownDenied as u8 {
            debug!("shutdown request denied by the server");
            return Ok(StateRun::Success);
        }
        self.handler.on_data_pdu(pdu_type2, body);
        Ok(StateRun::Success)
    }

    // --- senders ---------------------------------------------------------

    /// Read the domain header of a slow path unit and hand the
    /// channel payload back
    fn open_channel_payload(
        &mut self,
        stream: &mut Cursor<Vec<u8>>,
    ) -> RdpResult<(u16, Cursor<Vec<u8>>)> {
        let indication = self.mcs()?.read_indication(stream)?;
        Ok((indication.channel_id, Cursor::new(read_rest(stream)?)))
    }

    /// Decrypt the rest of a unit according to already read
    /// security flags
    fn unseal(
        &mut self,
        flags: u16,
        payload: &mut Cursor<Vec<u8>>,
    ) -> RdpResult<Cursor<Vec<u8>>> {
        if flags & SecurityFlag::SecEncrypt as u16 != 0 {
            let security = try_option!(
                self.security.as_mut(),
                "encrypted unit without session keys"
            )?;
            Ok(Cursor::new(sec::decrypt_payload(security, flags, payload)?))
        } else {
            Ok(Cursor::new(read_rest(payload)?))
        }
    }

    /// Global channel units carry a security header only when
    /// standard encryption is active
    fn unseal_global(&mut self, payload: &mut Cursor<Vec<u8>>) -> RdpResult<Cursor<Vec<u8>>> {
        if self.security.is_some() {
            let flags = sec::read_security_header(payload)?;
            self.unseal(flags, payload)
        } else {
            Ok(Cursor::new(read_rest(payload)?))
        }
    }

    /// Send a payload which already starts with its security
    /// header, re-sealing it when encryption is active
    fn send_wrapped(&mut self, channel: &str, payload: Vec<u8>) -> RdpResult<()> {
        let message = match self.security.as_mut() {
            Some(security) => {
                let flags = u16::from_le_bytes([payload[0], payload[1]]);
                sec::seal_payload(Some(security), flags, payload[4..].to_vec())?
            }
            None => trame![payload],
        };
        let channel = self.existing_channel(channel)?;
        self.mcs()?.write(&channel, message)
    }

    fn existing_channel(&mut self, wanted: &str) -> RdpResult<String> {
        let mcs = self.mcs()?;
        if mcs.channel_ids().contains_key(wanted) {
            Ok(wanted.to_string())
        } else {
            // the server granted no message channel, those
            // sub protocols then ride the global channel
            Ok(mcs::GLOBAL_CHANNEL_NAME.to_string())
        }
    }

    fn send_share_control(&mut self, pdu_type: PDUType, payload: Vec<u8>) -> RdpResult<()> {
        let pdu_source = self.mcs()?.user_id();
        let message = to_vec(&global::share_control(pdu_type, pdu_source, payload));
        let sealed = match self.security.as_mut() {
            Some(security) => sec::seal_payload(Some(security), 0, message)?,
            None => trame![message],
        };
        self.mcs()?.write(mcs::GLOBAL_CHANNEL_NAME, sealed)
    }

    fn send_data_pdu(&mut self, pdu_type2: PDUType2, payload: Vec<u8>) -> RdpResult<()> {
        let share = global::share_data(self.share_id, pdu_type2, payload);
        self.send_share_control(PDUType::PdutypeDatapdu, share)
    }

    /// Send an application payload over a joined virtual
    /// channel, fragmented at the negotiated chunk size
    pub fn send_channel_data(&mut self, channel: &str, data: &[u8]) -> RdpResult<()> {
        let total = data.len() as u32;
        let chunk_count = data.len().div_ceil(CHANNEL_CHUNK_LENGTH).max(1);
        for (index, chunk) in data
            .chunks(CHANNEL_CHUNK_LENGTH)
            .chain(std::iter::once(&[] as &[u8]).take(usize::from(data.is_empty())))
            .enumerate()
        {
            let mut flags = ChannelFlag::ShowProtocol as u32;
            if index == 0 {
                flags |= ChannelFlag::First as u32;
            }
            if index + 1 == chunk_count {
                flags |= ChannelFlag::Last as u32;
            }
            let message = to_vec(&trame![U32::LE(total), U32::LE(flags), chunk.to_vec()]);
            let sealed = match self.security.as_mut() {
                Some(security) => sec::seal_payload(Some(security), 0, message)?,
                None => trame![message],
            };
            self.mcs()?.write(channel, sealed)?;
        }
        Ok(())
    }

    /// Orderly teardown
    pub fn shutdown(&mut self) -> RdpResult<()> {
        self.mcs()?.shutdown()
    }
}

fn raw_input<'a>(
    input: Option<&'a mut tpkt::Payload>,
) -> RdpResult<Option<&'a mut Cursor<Vec<u8>>>> {
    match input {
        Some(tpkt::Payload::Raw(stream)) => Ok(Some(stream)),
        Some(tpkt::Payload::FastPath(_, _)) => {
            warn!("fast-path unit during the connection sequence");
            Ok(None)
        }
        None => Ok(None),
    }
}

fn read_rest(stream: &mut dyn Read) -> RdpResult<Vec<u8>> {
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest)?;
    Ok(rest)
}

/// Static settings of the accepting role
pub struct ServerConfig {
    /// identity presented during the TLS upgrade
    pub identity: Option<crate::model::tls::ServerIdentity>,
    /// RSA key of the proprietary certificate, standard
    /// security only
    pub key_pair: Option<sec::RsaKeyPair>,
    /// certificate blob for the GCC security block, standard
    /// security only
    pub certificate_blob: Vec<u8>,
    pub encryption_method: u32,
    pub encryption_level: gcc::EncryptionLevel,
    pub strict_checksum: bool,
    /// grant the client a message channel
    pub with_message_channel: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            identity: None,
            key_pair: None,
            certificate_blob: Vec::new(),
            encryption_method: 0,
            encryption_level: gcc::EncryptionLevel::None,
            strict_checksum: false,
            with_message_channel: true,
        }
    }
}

/// MCS channel ids granted by the acceptor
const SERVER_USER_ID: u16 = 1002;
const SERVER_GLOBAL_CHANNEL_ID: u16 = 1003;
const SERVER_MESSAGE_CHANNEL_ID: u16 = 1004;
const SERVER_STATIC_CHANNEL_BASE: u16 = 1005;
const SERVER_SHARE_ID: u32 = 0x0001_0001;

/// The accepting side of a connection
///
/// Mirrors the client sequence with the PDU roles reversed
/// and the additional demand active send step. Unexpected
/// units are fatal on this side.
pub struct Acceptor<S> {
    mcs: Option<mcs::Client<S>>,
    state: ConnectionState,
    config: ServerConfig,
    handler: Box<dyn ConnectionHandler>,
    security: Option<SessionSecurity>,
    client_data: Option<gcc::ClientData>,
    expected_joins: usize,
    pending_input: Option<tpkt::Payload>,
    last_error: Option<String>,
}

impl<S: Read + Write> Acceptor<S> {
    pub fn new(link: Link<S>, config: ServerConfig, handler: Box<dyn ConnectionHandler>) -> Self {
        let tpkt = tpkt::Client::new(link);
        let x224 = x224::Client::new(tpkt, x224::Protocols::ProtocolRDP);
        Acceptor {
            mcs: Some(mcs::Client::new(x224)),
            state: ConnectionState::Initial,
            config,
            handler,
            security: None,
            client_data: None,
            expected_joins: 0,
            pending_input: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn mcs(&mut self) -> RdpResult<&mut mcs::Client<S>> {
        try_option!(self.mcs.as_mut(), "transport is being upgraded")
    }

    pub fn step(&mut self) -> RdpResult<ConnectionEvent> {
        loop {
            let run = if self.waits_for_input() {
                let mut payload = match self.pending_input.take() {
                    Some(payload) => payload,
                    None => {
                        // the connection request arrives below
                        // the X224 data layer
                        let raw = if self.state == ConnectionState::Initial {
                            self.mcs()?.x224.get_transport().read_pdu()?
                        } else {
                            self.mcs()?.x224.read_pdu()?
                        };
                        match raw {
                            Some(payload) => payload,
                            None => return Ok(ConnectionEvent::Pending),
                        }
                    }
                };
                let run = self.dispatch(Some(&mut payload));
                if let Ok(StateRun::TryAgain) = run {
                    payload.rewind();
                    self.pending_input = Some(payload);
                }
                run?
            } else {
                self.dispatch(None)?
            };

            match run {
                StateRun::Success => {
                    return if self.state == ConnectionState::Active {
                        Ok(ConnectionEvent::Active)
                    } else {
                        Ok(ConnectionEvent::InProgress)
                    }
                }
                StateRun::Continue | StateRun::TryAgain => continue,
                StateRun::ActiveReady => {
                    self.state = ConnectionState::Active;
                    self.handler.on_connected();
                    return Ok(ConnectionEvent::Active);
                }
                StateRun::Redirect(target) => return Ok(ConnectionEvent::Redirected(target)),
                StateRun::Failed(e) => {
                    self.last_error = Some(format!("{}", e));
                    return Err(Error::RdpError(e));
                }
            }
        }
    }

    pub fn run_until_active(&mut self) -> RdpResult<()> {
        loop {
            if let ConnectionEvent::Active = self.step()? {
                return Ok(());
            }
        }
    }

    fn waits_for_input(&self) -> bool {
        !matches!(
            self.state,
            ConnectionState::Licensing
                | ConnectionState::CapabilitiesExchangeDemandActive
                | ConnectionState::ConnectTimeAutoDetectRequest
                | ConnectionState::MultitransportBootstrappingRequest
        )
    }

    fn transition(&mut self, state: ConnectionState) {
        debug!("{} -> {} (acceptor)", self.state.name(), state.name());
        self.state = state;
    }

    fn dispatch(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        match self.state {
            ConnectionState::Initial => self.on_connection_request(input),
            ConnectionState::McsCreateRequest => self.on_connect_initial(input),
            ConnectionState::McsErectDomain => self.on_erect_domain(input),
            ConnectionState::McsAttachUser => self.on_attach_user(input),
            ConnectionState::McsChannelJoinRequest | ConnectionState::McsChannelJoinResponse => {
                self.on_channel_join(input)
            }
            ConnectionState::RdpSecurityCommencement => self.on_security_exchange(input),
            ConnectionState::SecureSettingsExchange => self.on_client_info(input),
            ConnectionState::ConnectTimeAutoDetectRequest => {
                // connect time detection is not initiated by
                // this acceptor
                self.transition(ConnectionState::Licensing);
                Ok(StateRun::Continue)
            }
            ConnectionState::Licensing => self.on_send_license_marker(),
            ConnectionState::MultitransportBootstrappingRequest => {
                // no side transport offer either
                self.transition(ConnectionState::CapabilitiesExchangeDemandActive);
                Ok(StateRun::Continue)
            }
            ConnectionState::CapabilitiesExchangeDemandActive => self.on_send_demand_active(),
            ConnectionState::CapabilitiesExchangeConfirmActive => self.on_confirm_active(input),
            ConnectionState::FinalizationClientSync
            | ConnectionState::FinalizationClientCooperate
            | ConnectionState::FinalizationClientGrantedControl
            | ConnectionState::FinalizationClientFontMap => self.on_finalization(input),
            ConnectionState::Active => self.on_active(input),
            // states which only exist on the initiating side
            // are disallowed for this role
            _ => Ok(StateRun::Failed(RdpError::new(
                RdpErrorKind::InvalidAutomata,
                "state is disallowed for the accepting role",
            ))),
        }
    }

    fn on_connection_request(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(StateRun::Success),
        };
        let request = match x224::parse_connection_request(stream) {
            Ok(request) => request,
            Err(Error::RdpError(e)) => return Ok(StateRun::Failed(e)),
            Err(e) => return Err(e),
        };

        if self.config.identity.is_some() {
            if request.requested_protocols & x224::Protocols::ProtocolSSL as u32 == 0 {
                x224::send_connection_failure(self.mcs()?.x224.get_transport(), 1)?;
                return Ok(StateRun::Failed(RdpError::new(
                    RdpErrorKind::ProtocolNegFailure,
                    "client does not support TLS security",
                )));
            }
            x224::send_connection_confirm(
                self.mcs()?.x224.get_transport(),
                x224::Protocols::ProtocolSSL,
            )?;
            // upgrade to TLS with our identity
            let identity = try_option!(self.config.identity.as_ref(), "missing identity")?;
            let mcs = try_option!(self.mcs.take(), "transport is being upgraded")?;
            let link = mcs.x224.into_transport().into_link().accept_ssl(identity)?;
            let tpkt_client = tpkt::Client::new(link);
            self.mcs = Some(mcs::Client::new(x224::Client::new(
                tpkt_client,
                x224::Protocols::ProtocolSSL,
            )));
        } else {
            x224::send_connection_confirm(
                self.mcs()?.x224.get_transport(),
                x224::Protocols::ProtocolRDP,
            )?;
        }

        self.transition(ConnectionState::McsCreateRequest);
        Ok(StateRun::Success)
    }

    fn on_connect_initial(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(StateRun::Success),
        };
        let mut local = Cursor::new(read_rest(stream)?);
        let user_data = self.mcs()?.recv_connect_initial(&mut local)?;
        let client_data = gcc::parse_client_data(user_data)?;

        let static_channel_ids: Vec<u16> = (0..client_data.channel_names.len())
            .map(|i| SERVER_STATIC_CHANNEL_BASE + i as u16)
            .collect();
        let message_channel_id = if self.config.with_message_channel
            && client_data.wants_message_channel
        {
            Some(SERVER_MESSAGE_CHANNEL_ID)
        } else {
            None
        };

        let server_random = random(32);
        let blocks = gcc::server_gcc_blocks(
            self.config.encryption_method,
            self.config.encryption_level,
            &server_random,
            &self.config.certificate_blob,
            SERVER_GLOBAL_CHANNEL_ID,
            &static_channel_ids,
            message_channel_id,
        )?;
        let server_data = gcc::ServerData {
            version: gcc::Version::RdpVersion5Plus as u32,
            security: gcc::ServerSecurityData {
                encryption_method: self.config.encryption_method,
                encryption_level: self.config.encryption_level,
                server_random,
                server_certificate: self.config.certificate_blob.clone(),
            },
            network: gcc::ServerNetworkData {
                mcs_channel_id: SERVER_GLOBAL_CHANNEL_ID,
                channel_ids: static_channel_ids,
            },
            message_channel_id,
        };
        // user, global, optional message channel and statics
        self.expected_joins = 2
            + usize::from(message_channel_id.is_some())
            + client_data.channel_names.len();
        self.client_data = Some(client_data);
        self.mcs()?.send_connect_response(&blocks, server_data)?;
        self.transition(ConnectionState::McsErectDomain);
        Ok(StateRun::Success)
    }

    fn on_erect_domain(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(StateRun::Success),
        };
        let mut local = Cursor::new(read_rest(stream)?);
        self.mcs()?.recv_erect_domain_request(&mut local)?;
        self.transition(ConnectionState::McsAttachUser);
        Ok(StateRun::Success)
    }

    fn on_attach_user(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(StateRun::Success),
        };
        let mut local = Cursor::new(read_rest(stream)?);
        self.mcs()?.recv_attach_user_request(&mut local)?;
        self.mcs()?.send_attach_user_confirm(SERVER_USER_ID)?;
        self.transition(ConnectionState::McsChannelJoinRequest);
        Ok(StateRun::Success)
    }

    fn on_channel_join(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(StateRun::Success),
        };
        let mut local = Cursor::new(read_rest(stream)?);
        let channel_id = self.mcs()?.recv_channel_join_request(&mut local)?;
        let name = self.channel_name_for(channel_id);
        self.mcs()?.send_channel_join_confirm(&name, channel_id)?;
        self.expected_joins = self.expected_joins.saturating_sub(1);
        if self.expected_joins == 0 {
            if self.config.encryption_method != 0 {
                self.transition(ConnectionState::RdpSecurityCommencement);
            } else {
                self.transition(ConnectionState::SecureSettingsExchange);
            }
        }
        Ok(StateRun::Success)
    }

    fn channel_name_for(&self, channel_id: u16) -> String {
        match channel_id {
            SERVER_USER_ID => mcs::USER_CHANNEL_NAME.to_string(),
            SERVER_GLOBAL_CHANNEL_ID => mcs::GLOBAL_CHANNEL_NAME.to_string(),
            SERVER_MESSAGE_CHANNEL_ID => mcs::MESSAGE_CHANNEL_NAME.to_string(),
            id => {
                let index = (id - SERVER_STATIC_CHANNEL_BASE) as usize;
                self.client_data
                    .as_ref()
                    .and_then(|data| data.channel_names.get(index))
                    .cloned()
                    .unwrap_or_else(|| format!("channel{}", id))
            }
        }
    }

    fn on_security_exchange(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(StateRun::Success),
        };
        let mut local = Cursor::new(read_rest(stream)?);
        let indication = self.mcs()?.read_indication(&mut local)?;
        if indication.channel_id != SERVER_GLOBAL_CHANNEL_ID {
            return Ok(StateRun::Failed(RdpError::new(
                RdpErrorKind::InvalidAutomata,
                "security exchange expected on the global channel",
            )));
        }
        let key_pair = try_option!(
            self.config.key_pair.as_ref(),
            "standard security requires the server RSA key"
        )?;
        let client_random = sec::recv_security_exchange(key_pair, &mut local)?;
        let server_random = {
            let mcs = self.mcs()?;
            let server_data = try_option!(mcs.server_data(), "server data not negotiated")?;
            server_data.security.server_random.clone()
        };
        self.security = Some(SessionSecurity::establish(
            &client_random,
            &server_random,
            self.config.encryption_method,
            true,
            self.config.strict_checksum,
        )?);
        self.transition(ConnectionState::SecureSettingsExchange);
        Ok(StateRun::Success)
    }

    fn on_client_info(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(StateRun::Success),
        };
        let mut local = Cursor::new(read_rest(stream)?);
        self.mcs()?.read_indication(&mut local)?;
        let flags = sec::read_security_header(&mut local)?;
        if flags & SecurityFlag::SecInfoPkt as u16 == 0 {
            return Ok(StateRun::Failed(RdpError::new(
                RdpErrorKind::InvalidAutomata,
                "expected the client info PDU",
            )));
        }
        if flags & SecurityFlag::SecEncrypt as u16 != 0 {
            let security = try_option!(
                self.security.as_mut(),
                "encrypted unit without session keys"
            )?;
            // decrypted settings go to the embedding server
            let _infos = sec::decrypt_payload(security, flags, &mut local)?;
        }
        self.transition(ConnectionState::ConnectTimeAutoDetectRequest);
        Ok(StateRun::Continue)
    }

    fn on_send_license_marker(&mut self) -> RdpResult<StateRun> {
        // licensing not required marker
        let payload = license::valid_client_payload();
        let message = match self.security.as_mut() {
            Some(security) => {
                let flags = u16::from_le_bytes([payload[0], payload[1]]);
                sec::seal_payload(Some(security), flags, payload[4..].to_vec())?
            }
            None => trame![payload],
        };
        self.mcs()?
            .write_indication(mcs::GLOBAL_CHANNEL_NAME, message)?;
        self.transition(ConnectionState::MultitransportBootstrappingRequest);
        Ok(StateRun::Continue)
    }

    fn on_send_demand_active(&mut self) -> RdpResult<StateRun> {
        let (width, height) = self
            .client_data
            .as_ref()
            .map(|data| (data.width, data.height))
            .unwrap_or((1024, 768));
        let capabilities =
            capability::client_capabilities(width, height, gcc::KeyboardLayout::UnitedStates as u32);
        let payload = global::write_demand_active(SERVER_SHARE_ID, &capabilities);
        self.send_share_control(PDUType::PdutypeDemandactivepdu, payload)?;
        self.transition(ConnectionState::CapabilitiesExchangeConfirmActive);
        Ok(StateRun::Success)
    }

    fn on_confirm_active(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        let mut payload = match self.open_global_payload(input)? {
            Some(payload) => payload,
            None => return Ok(StateRun::Success),
        };
        let header = match global::read_share_control_header(&mut payload)? {
            Some(header) => header,
            None => return Ok(StateRun::Success),
        };
        if header.pdu_type != PDUType::PdutypeConfirmactivepdu {
            return Ok(StateRun::Failed(RdpError::new(
                RdpErrorKind::InvalidAutomata,
                "expected the confirm active PDU",
            )));
        }
        let confirm = global::read_confirm_active(&mut payload)?;
        debug!(
            "confirm active with {} capability sets",
            confirm.capabilities.len()
        );

        // the server side of finalization starts right away
        self.send_data_pdu(
            PDUType2::Pdutype2Synchronize,
            global::synchronize_payload(SERVER_USER_ID),
        )?;
        self.send_data_pdu(
            PDUType2::Pdutype2Control,
            global::control_payload(ControlAction::Cooperate),
        )?;
        self.transition(ConnectionState::FinalizationClientSync);
        Ok(StateRun::Success)
    }

    fn on_finalization(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        let mut payload = match self.open_global_payload(input)? {
            Some(payload) => payload,
            None => return Ok(StateRun::Success),
        };
        let header = match global::read_share_control_header(&mut payload)? {
            Some(header) => header,
            None => return Ok(StateRun::Success),
        };
        if header.pdu_type != PDUType::PdutypeDatapdu {
            return Ok(StateRun::Failed(RdpError::new(
                RdpErrorKind::InvalidAutomata,
                "unexpected share control PDU during finalization",
            )));
        }
        let data_header = global::read_share_data_header(&mut payload)?;

        match data_header.pdu_type2 {
            x if x == PDUType2::Pdutype2Synchronize as u8 => {
                self.transition(ConnectionState::FinalizationClientCooperate);
                Ok(StateRun::Success)
            }
            x if x == PDUType2::Pdutype2Control as u8 => {
                let control = global::read_control_payload(&mut payload)?;
                match control.action {
                    ControlAction::Cooperate => {
                        self.transition(ConnectionState::FinalizationClientGrantedControl);
                        Ok(StateRun::Success)
                    }
                    ControlAction::RequestControl => {
                        self.send_data_pdu(
                            PDUType2::Pdutype2Control,
                            global::control_granted_payload(SERVER_USER_ID, 0x03EA),
                        )?;
                        self.transition(ConnectionState::FinalizationClientFontMap);
                        Ok(StateRun::Success)
                    }
                    _ => Ok(StateRun::Success),
                }
            }
            x if x == PDUType2::Pdutype2Fontlist as u8 => {
                self.send_data_pdu(PDUType2::Pdutype2Fontmap, global::font_map_payload())?;
                Ok(StateRun::ActiveReady)
            }
            x if x == PDUType2::Pdutype2BitmapcachePersistentList as u8 => {
                // optional persistent key list, consumed and
                // skipped
                Ok(StateRun::Success)
            }
            other => {
                warn!(
                    "unexpected {} data PDU during finalization",
                    PDUType2::name(other)
                );
                Ok(StateRun::Success)
            }
        }
    }

    fn on_active(&mut self, input: Option<&mut tpkt::Payload>) -> RdpResult<StateRun> {
        match input {
            Some(tpkt::Payload::FastPath(_, stream)) => {
                let body = read_rest(stream)?;
                self.handler.on_update(&body);
                Ok(StateRun::Success)
            }
            other => {
                let mut payload = match self.open_global_payload(other)? {
                    Some(payload) => payload,
                    None => return Ok(StateRun::Success),
                };
                let header = match global::read_share_control_header(&mut payload)? {
                    Some(header) => header,
                    None => return Ok(StateRun::Success),
                };
                if header.pdu_type == PDUType::PdutypeDatapdu {
                    let data_header = global::read_share_data_header(&mut payload)?;
                    let body = read_rest(&mut payload)?;
                    self.handler.on_data_pdu(data_header.pdu_type2, &body);
                }
                Ok(StateRun::Success)
            }
        }
    }

    fn open_global_payload(
        &mut self,
        input: Option<&mut tpkt::Payload>,
    ) -> RdpResult<Option<Cursor<Vec<u8>>>> {
        let stream = match raw_input(input)? {
            Some(stream) => stream,
            None => return Ok(None),
        };
        let mut local = Cursor::new(read_rest(stream)?);
        self.mcs()?.read_indication(&mut local)?;
        if self.security.is_some() {
            let flags = sec::read_security_header(&mut local)?;
            if flags & SecurityFlag::SecEncrypt as u16 != 0 {
                let security = try_option!(
                    self.security.as_mut(),
                    "encrypted unit without session keys"
                )?;
                return Ok(Some(Cursor::new(sec::decrypt_payload(
                    security, flags, &mut local,
                )?)));
            }
        }
        Ok(Some(Cursor::new(read_rest(&mut local)?)))
    }

    fn send_share_control(&mut self, pdu_type: PDUType, payload: Vec<u8>) -> RdpResult<()> {
        let message = to_vec(&global::share_control(pdu_type, SERVER_USER_ID, payload));
        let sealed = match self.security.as_mut() {
            Some(security) => sec::seal_payload(Some(security), 0, message)?,
            None => trame![message],
        };
        self.mcs()?
            .write_indication(mcs::GLOBAL_CHANNEL_NAME, sealed)
    }

    fn send_data_pdu(&mut self, pdu_type2: PDUType2, payload: Vec<u8>) -> RdpResult<()> {
        let share = global::share_data(SERVER_SHARE_ID, pdu_type2, payload);
        self.send_share_control(PDUType::PdutypeDatapdu, share)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::license::NoopLicenseStore;
    use crate::model::link::Stream;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io::{self, ErrorKind};
    use std::rc::Rc;

    /// One end of an in-memory full duplex pipe
    ///
    /// Reads report WouldBlock when no byte is queued so both
    /// engines run through their non blocking path
    struct PipeEnd {
        incoming: Rc<RefCell<VecDeque<u8>>>,
        outgoing: Rc<RefCell<VecDeque<u8>>>,
    }

    fn pipe_pair() -> (PipeEnd, PipeEnd) {
        let a = Rc::new(RefCell::new(VecDeque::new()));
        let b = Rc::new(RefCell::new(VecDeque::new()));
        (
            PipeEnd {
                incoming: a.clone(),
                outgoing: b.clone(),
            },
            PipeEnd {
                incoming: b,
                outgoing: a,
            },
        )
    }

    impl Read for PipeEnd {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut incoming = self.incoming.borrow_mut();
            if incoming.is_empty() {
                return Err(io::Error::new(ErrorKind::WouldBlock, "no data yet"));
            }
            let mut count = 0;
            while count < buf.len() {
                match incoming.pop_front() {
                    Some(byte) => {
                        buf[count] = byte;
                        count += 1;
                    }
                    None => break,
                }
            }
            Ok(count)
        }
    }

    impl Write for PipeEnd {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outgoing.borrow_mut().extend(buf.iter().copied());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_client_config() -> ClientConfig {
        ClientConfig {
            client_name: "test-host".to_string(),
            credentials: Credentials::Password {
                domain: "dom".to_string(),
                username: "user".to_string(),
                password: "pass".to_string(),
            },
            // plain RDP so no TLS handshake is involved
            security_protocols: x224::Protocols::ProtocolRDP as u32,
            encryption_methods: 0,
            auto_detect: false,
            ..Default::default()
        }
    }

    fn paired_engines() -> (Connection<PipeEnd>, Acceptor<PipeEnd>) {
        let (client_end, server_end) = pipe_pair();

        let mut client_link = Link::new(Stream::Raw(client_end));
        client_link.set_blocking(false);
        let client = Connection::new(
            client_link,
            test_client_config(),
            Box::new(NoopHandler),
            Box::new(NoopLicenseStore),
        );

        let mut server_link = Link::new(Stream::Raw(server_end));
        server_link.set_blocking(false);
        let acceptor = Acceptor::new(server_link, ServerConfig::default(), Box::new(NoopHandler));

        (client, acceptor)
    }

    fn pump(client: &mut Connection<PipeEnd>, acceptor: &mut Acceptor<PipeEnd>) {
        for _ in 0..64 {
            client.step().unwrap();
            acceptor.step().unwrap();
            if client.state() == ConnectionState::Active
                && acceptor.state() == ConnectionState::Active
            {
                return;
            }
        }
        panic!(
            "handshake stalled, client in {} and acceptor in {}",
            client.state().name(),
            acceptor.state().name()
        );
    }

    #[test]
    fn test_full_handshake_reaches_active_on_both_sides() {
        let (mut client, mut acceptor) = paired_engines();
        assert_eq!(client.state(), ConnectionState::Initial);
        pump(&mut client, &mut acceptor);
        assert_eq!(client.state(), ConnectionState::Active);
        assert_eq!(acceptor.state(), ConnectionState::Active);
        assert!(client.last_error().is_none());
    }

    #[test]
    fn test_deactivate_all_loops_back_to_capability_exchange() {
        let (mut client, mut acceptor) = paired_engines();
        pump(&mut client, &mut acceptor);

        // reactivation: deactivate all then a fresh demand
        // active, without tearing the transport down
        acceptor
            .send_share_control(PDUType::PdutypeDeactivateallpdu, vec![0, 0, 0, 0])
            .unwrap();
        acceptor.on_send_demand_active().unwrap();
        pump(&mut client, &mut acceptor);
        assert_eq!(client.state(), ConnectionState::Active);
    }

    #[test]
    fn test_channel_data_is_chunked() {
        let (client_end, server_end) = pipe_pair();
        let wire = client_end.outgoing.clone();

        let mut client_link = Link::new(Stream::Raw(client_end));
        client_link.set_blocking(false);
        let mut client = Connection::new(
            client_link,
            test_client_config(),
            Box::new(NoopHandler),
            Box::new(NoopLicenseStore),
        );
        let mut server_link = Link::new(Stream::Raw(server_end));
        server_link.set_blocking(false);
        let mut acceptor =
            Acceptor::new(server_link, ServerConfig::default(), Box::new(NoopHandler));
        pump(&mut client, &mut acceptor);

        wire.borrow_mut().clear();
        let payload = vec![7_u8; CHANNEL_CHUNK_LENGTH + 10];
        client
            .send_channel_data(mcs::GLOBAL_CHANNEL_NAME, &payload)
            .unwrap();

        // two TPKT framed chunks left the client, each with
        // its own channel PDU header
        let written: Vec<u8> = wire.borrow().iter().copied().collect();
        assert_eq!(written[0], 3);
        let first_frame = ((written[2] as usize) << 8) + written[3] as usize;
        assert!(first_frame < written.len());
        assert_eq!(written[first_frame], 3);
    }

    #[test]
    fn test_malformed_nego_response_fails() {
        let (client_end, _server_end) = pipe_pair();
        // a valid TPKT frame holding garbage where the
        // connection confirm should be
        client_end
            .incoming
            .borrow_mut()
            .extend([3_u8, 0, 0, 11, 14, 0xEE, 0, 0, 0, 0, 0].iter().copied());

        let mut link = Link::new(Stream::Raw(client_end));
        link.set_blocking(false);
        let mut client = Connection::new(
            link,
            test_client_config(),
            Box::new(NoopHandler),
            Box::new(NoopLicenseStore),
        );
        // first step sends the request, second parses the junk
        client.step().unwrap();
        assert!(client.step().is_err());
        assert!(client.last_error().is_some());
    }

    #[test]
    fn test_malformed_fastpath_header_fails() {
        let (client_end, _server_end) = pipe_pair();
        // fast-path header claiming a total length of two
        client_end
            .incoming
            .borrow_mut()
            .extend([0x00_u8, 0x02].iter().copied());

        let mut link = Link::new(Stream::Raw(client_end));
        link.set_blocking(false);
        let mut client = Connection::new(
            link,
            test_client_config(),
            Box::new(NoopHandler),
            Box::new(NoopLicenseStore),
        );
        client.step().unwrap();
        assert!(client.step().is_err());
    }

    #[test]
    fn test_acceptor_rejects_unexpected_share_control() {
        let (mut client, mut acceptor) = paired_engines();
        pump(&mut client, &mut acceptor);

        // a demand active sent towards the acceptor is a
        // disallowed PDU for its role during finalization
        acceptor.state = ConnectionState::CapabilitiesExchangeConfirmActive;
        client
            .send_share_control(PDUType::PdutypeDemandactivepdu, vec![])
            .unwrap();
        assert!(acceptor.step().is_err());
    }

    #[test]
    fn test_state_names_are_stable() {
        assert_eq!(ConnectionState::Initial.name(), "INITIAL");
        assert_eq!(
            ConnectionState::ConnectTimeAutoDetectRequest.name(),
            "CONNECT_TIME_AUTO_DETECT_REQUEST"
        );
        assert_eq!(ConnectionState::Active.name(), "ACTIVE");
    }

    #[test]
    fn test_redirection_parse() {
        // flags, length, session id, redirFlags with target
        // net address and username
        let mut raw = Vec::new();
        raw.extend_from_slice(&0x0400_u16.to_le_bytes());
        raw.extend_from_slice(&0_u16.to_le_bytes());
        raw.extend_from_slice(&7_u32.to_le_bytes());
        raw.extend_from_slice(&0x0005_u32.to_le_bytes());
        let address: Vec<u8> = "fallback\0"
            .encode_utf16()
            .flat_map(|c| c.to_le_bytes())
            .collect();
        raw.extend_from_slice(&(address.len() as u32).to_le_bytes());
        raw.extend_from_slice(&address);
        let username: Vec<u8> = "bob\0".encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
        raw.extend_from_slice(&(username.len() as u32).to_le_bytes());
        raw.extend_from_slice(&username);

        let target = parse_redirection(&mut Cursor::new(raw)).unwrap();
        assert_eq!(target.session_id, 7);
        assert_eq!(target.target_net_address.unwrap(), "fallback");
        assert_eq!(target.username.unwrap(), "bob");
        assert!(target.load_balance_info.is_none());
    }
}
