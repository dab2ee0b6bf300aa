use crate::core::gcc;
use crate::core::tpkt;
use crate::core::x224;
use crate::model::data::{Message, U16};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use indexmap::IndexMap;
use std::io::{Cursor, Read, Write};
use yasna::Tag;

/// Name of the channel all core protocol PDUs go through
pub const GLOBAL_CHANNEL_NAME: &str = "global";
/// Name under which the user channel is registered
pub const USER_CHANNEL_NAME: &str = "user";
/// Name under which the MCS message channel is registered
/// when the server grants one
pub const MESSAGE_CHANNEL_NAME: &str = "message";

/// First id of the user channel range
const USER_CHANNEL_BASE: u16 = 1001;

/// Domain PDU codes of the T.125 domain phase
///
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/8e8a747b-155c-4e9b-b8ac-47bd9d58e2ae
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DomainMCSPDU {
    ErectDomainRequest = 1,
    DisconnectProviderUltimatum = 8,
    AttachUserRequest = 10,
    AttachUserConfirm = 11,
    ChannelJoinRequest = 14,
    ChannelJoinConfirm = 15,
    SendDataRequest = 25,
    SendDataIndication = 26,
}

/// T.125 domain parameters as BER sequence
fn write_domain_parameters(
    writer: yasna::DERWriter,
    max_channels: u32,
    max_users: u32,
    max_tokens: u32,
    max_pdu_size: u32,
) {
    writer.write_sequence(|writer| {
        writer.next().write_u32(max_channels);
        writer.next().write_u32(max_users);
        writer.next().write_u32(max_tokens);
        writer.next().write_u32(1); // numPriorities
        writer.next().write_u32(0); // minThroughput
        writer.next().write_u32(1); // maxHeight
        writer.next().write_u32(max_pdu_size);
        writer.next().write_u32(2); // protocolVersion
    })
}

fn read_domain_parameters(reader: yasna::BERReader) -> Result<(), yasna::ASN1Error> {
    reader.read_sequence(|reader| {
        for _ in 0..8 {
            reader.next().read_u32()?;
        }
        Ok(())
    })
}

/// Build the BER encoded Connect-Initial carrying the
/// client GCC blocks
fn connect_initial(user_data: &[u8]) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_tagged_implicit(Tag::application(101), |writer| {
            writer.write_sequence(|writer| {
                writer.next().write_bytes(&[1]); // callingDomainSelector
                writer.next().write_bytes(&[1]); // calledDomainSelector
                writer.next().write_bool(true); // upwardFlag
                write_domain_parameters(writer.next(), 34, 2, 0, 0xFFFF);
                write_domain_parameters(writer.next(), 1, 1, 1, 0x420);
                write_domain_parameters(writer.next(), 0xFFFF, 0xFC17, 0xFFFF, 0xFFFF);
                writer.next().write_bytes(user_data);
            })
        })
    })
}

/// Parse the Connect-Initial of the initiating peer,
/// accepting role
fn parse_connect_initial(data: &[u8]) -> RdpResult<Vec<u8>> {
    let user_data = yasna::parse_der(data, |reader| {
        reader.read_tagged_implicit(Tag::application(101), |reader| {
            reader.read_sequence(|reader| {
                reader.next().read_bytes()?;
                reader.next().read_bytes()?;
                reader.next().read_bool()?;
                read_domain_parameters(reader.next())?;
                read_domain_parameters(reader.next())?;
                read_domain_parameters(reader.next())?;
                reader.next().read_bytes()
            })
        })
    })?;
    Ok(user_data)
}

/// Build the BER encoded Connect-Response carrying the
/// server GCC blocks, accepting role
fn connect_response(user_data: &[u8]) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_tagged_implicit(Tag::application(102), |writer| {
            writer.write_sequence(|writer| {
                writer.next().write_enum(0); // rt-successful
                writer.next().write_u32(0); // calledConnectId
                write_domain_parameters(writer.next(), 34, 3, 0, 0xFFF8);
                writer.next().write_bytes(user_data);
            })
        })
    })
}

/// Parse the Connect-Response and return the server user data
fn parse_connect_response(data: &[u8]) -> RdpResult<Vec<u8>> {
    let (result, user_data) = yasna::parse_der(data, |reader| {
        reader.read_tagged_implicit(Tag::application(102), |reader| {
            reader.read_sequence(|reader| {
                let result = reader.next().read_enum()?;
                reader.next().read_u32()?;
                read_domain_parameters(reader.next())?;
                let user_data = reader.next().read_bytes()?;
                Ok((result, user_data))
            })
        })
    })?;
    if result != 0 {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::RejectedByServer,
            "MCS connect was rejected by the peer",
        )));
    }
    Ok(user_data)
}

/// An inbound send data unit once the domain header has
/// been consumed
pub struct DataIndication {
    pub initiator: u16,
    pub channel_id: u16,
}

/// MCS layer
///
/// Multiplexes all slow path traffic over joined channels and
/// exposes the domain handshake one operation at a time so the
/// connection state machine can drive it
pub struct Client<S> {
    pub x224: x224::Client<S>,
    /// joined channels, name to id
    channel_ids: IndexMap<String, u16>,
    /// static channels requested at connect time
    channel_names: Vec<String>,
    user_id: u16,
    server_data: Option<gcc::ServerData>,
}

impl<S: Read + Write> Client<S> {
    pub fn new(x224: x224::Client<S>) -> Self {
        Client {
            x224,
            channel_ids: IndexMap::new(),
            channel_names: Vec::new(),
            user_id: 0,
            server_data: None,
        }
    }

    /// Negotiated server blocks, available once the connect
    /// response has been parsed
    pub fn server_data(&self) -> Option<&gcc::ServerData> {
        self.server_data.as_ref()
    }

    pub fn user_id(&self) -> u16 {
        self.user_id
    }

    pub fn channel_ids(&self) -> &IndexMap<String, u16> {
        &self.channel_ids
    }

    /// Resolve a channel id back to its registered name
    pub fn channel_name(&self, channel_id: u16) -> Option<&str> {
        self.channel_ids
            .iter()
            .find(|(_, id)| **id == channel_id)
            .map(|(name, _)| name.as_str())
    }

    pub fn message_channel_id(&self) -> Option<u16> {
        self.channel_ids.get(MESSAGE_CHANNEL_NAME).copied()
    }

    /// Send the Connect-Initial with our GCC blocks
    pub fn send_connect_initial(
        &mut self,
        width: u16,
        height: u16,
        layout: u32,
        client_name: &str,
        encryption_methods: u32,
        channel_names: &[String],
    ) -> RdpResult<()> {
        self.channel_names = channel_names.to_vec();
        let user_data = gcc::client_gcc_blocks(
            width,
            height,
            layout,
            client_name,
            self.x224.selected_protocol as u32,
            encryption_methods,
            channel_names,
        )?;
        let conference = gcc::write_conference_create_request(&user_data)?;
        self.x224.write(connect_initial(&conference))
    }

    /// Parse the Connect-Response and remember the server
    /// blocks for the later phases
    pub fn recv_connect_response(&mut self, stream: &mut Cursor<Vec<u8>>) -> RdpResult<()> {
        let mut ber = Vec::new();
        stream.read_to_end(&mut ber)?;
        let conference = parse_connect_response(&ber)?;
        let user_data =
            gcc::read_conference_create_response(&mut Cursor::new(conference))?;
        self.server_data = Some(gcc::parse_server_data(user_data)?);
        Ok(())
    }

    /// Erect domain request, no response is expected
    pub fn send_erect_domain_request(&mut self) -> RdpResult<()> {
        let mut buffer = Cursor::new(Vec::new());
        crate::core::per::write_choice((DomainMCSPDU::ErectDomainRequest as u8) << 2, &mut buffer)?;
        crate::core::per::write_integer(0, &mut buffer)?;
        crate::core::per::write_integer(0, &mut buffer)?;
        self.x224.write(buffer.into_inner())
    }

    pub fn send_attach_user_request(&mut self) -> RdpResult<()> {
        let mut buffer = Cursor::new(Vec::new());
        crate::core::per::write_choice((DomainMCSPDU::AttachUserRequest as u8) << 2, &mut buffer)?;
        self.x224.write(buffer.into_inner())
    }

    /// Parse the attach user confirm and keep the granted
    /// user id
    pub fn recv_attach_user_confirm(&mut self, stream: &mut Cursor<Vec<u8>>) -> RdpResult<u16> {
        let choice = crate::core::per::read_choice(stream)?;
        if choice >> 2 != DomainMCSPDU::AttachUserConfirm as u8 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidRespond,
                "unexpected domain PDU while waiting for attach user confirm",
            )));
        }
        let result = crate::core::per::read_enumerates(stream)?;
        if result != 0 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::RejectedByServer,
                "server rejected the attach user request",
            )));
        }
        if choice & 0x2 == 0 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidOptionalField,
                "attach user confirm without an initiator",
            )));
        }
        self.user_id = crate::core::per::read_integer16(USER_CHANNEL_BASE, stream)?;
        Ok(self.user_id)
    }

    /// All channels the connection has to join, in join order
    ///
    /// The user channel comes first, then the global channel,
    /// the message channel when the server granted one and
    /// finally the requested static channels
    pub fn channels_to_join(&self) -> RdpResult<Vec<(String, u16)>> {
        let server_data = try_option!(self.server_data.as_ref(), "server data not negotiated")?;
        let mut result = vec![
            (USER_CHANNEL_NAME.to_string(), self.user_id),
            (
                GLOBAL_CHANNEL_NAME.to_string(),
                server_data.network.mcs_channel_id,
            ),
        ];
        if let Some(id) = server_data.message_channel_id {
            result.push((MESSAGE_CHANNEL_NAME.to_string(), id));
        }
        for (name, id) in self
            .channel_names
            .iter()
            .zip(server_data.network.channel_ids.iter())
        {
            result.push((name.clone(), *id));
        }
        Ok(result)
    }

    pub fn send_channel_join_request(&mut self, channel_id: u16) -> RdpResult<()> {
        let mut buffer = Cursor::new(Vec::new());
        crate::core::per::write_choice((DomainMCSPDU::ChannelJoinRequest as u8) << 2, &mut buffer)?;
        crate::core::per::write_integer16(self.user_id, USER_CHANNEL_BASE, &mut buffer)?;
        U16::BE(channel_id).write(&mut buffer)?;
        self.x224.write(buffer.into_inner())
    }

    /// Parse a channel join confirm and register the channel
    /// under `name` on success
    pub fn recv_channel_join_confirm(
        &mut self,
        name: &str,
        stream: &mut Cursor<Vec<u8>>,
    ) -> RdpResult<u16> {
        let choice = crate::core::per::read_choice(stream)?;
        if choice >> 2 != DomainMCSPDU::ChannelJoinConfirm as u8 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidRespond,
                "unexpected domain PDU while waiting for channel join confirm",
            )));
        }
        let result = crate::core::per::read_enumerates(stream)?;
        if result != 0 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::RejectedByServer,
                "server rejected the channel join request",
            )));
        }
        crate::core::per::read_integer16(USER_CHANNEL_BASE, stream)?;
        let mut requested = U16::BE(0);
        requested.read(stream)?;
        self.channel_ids
            .insert(name.to_string(), requested.inner());
        Ok(requested.inner())
    }

    /// Send a payload over a joined channel, initiating role
    pub fn write<T: 'static + Message>(&mut self, channel_name: &str, message: T) -> RdpResult<()> {
        self.write_domain_pdu(DomainMCSPDU::SendDataRequest, channel_name, message)
    }

    /// Send a payload over a joined channel, accepting role
    pub fn write_indication<T: 'static + Message>(
        &mut self,
        channel_name: &str,
        message: T,
    ) -> RdpResult<()> {
        self.write_domain_pdu(DomainMCSPDU::SendDataIndication, channel_name, message)
    }

    fn write_domain_pdu<T: 'static + Message>(
        &mut self,
        pdu: DomainMCSPDU,
        channel_name: &str,
        message: T,
    ) -> RdpResult<()> {
        let channel_id = *try_option!(
            self.channel_ids.get(channel_name),
            "send on a channel that was never joined"
        )?;
        let mut buffer = Cursor::new(Vec::new());
        crate::core::per::write_choice((pdu as u8) << 2, &mut buffer)?;
        crate::core::per::write_integer16(self.user_id, USER_CHANNEL_BASE, &mut buffer)?;
        U16::BE(channel_id).write(&mut buffer)?;
        0x70_u8.write(&mut buffer)?;
        let payload = crate::model::data::to_vec(&message);
        crate::core::per::write_length(payload.len() as u16, &mut buffer)?;
        buffer.write_all(&payload)?;
        self.x224.write(buffer.into_inner())
    }

    /// Consume the domain header of an inbound unit
    ///
    /// Returns the channel the payload belongs to, the stream
    /// is left at the start of the channel payload. A
    /// disconnect provider ultimatum maps to a Disconnect
    /// error so every caller stops on it.
    pub fn read_indication(&mut self, stream: &mut Cursor<Vec<u8>>) -> RdpResult<DataIndication> {
        let choice = crate::core::per::read_choice(stream)?;
        let pdu = choice >> 2;
        if pdu == DomainMCSPDU::DisconnectProviderUltimatum as u8 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::Disconnect,
                "server issued a disconnect provider ultimatum",
            )));
        }
        if pdu != DomainMCSPDU::SendDataIndication as u8
            && pdu != DomainMCSPDU::SendDataRequest as u8
        {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::UnexpectedType,
                "unexpected domain PDU in the data phase",
            )));
        }
        let initiator = crate::core::per::read_integer16(USER_CHANNEL_BASE, stream)?;
        let mut channel_id = U16::BE(0);
        channel_id.read(stream)?;
        let mut magic: u8 = 0;
        magic.read(stream)?;
        crate::core::per::read_length(stream)?;
        Ok(DataIndication {
            initiator,
            channel_id: channel_id.inner(),
        })
    }

    /// Orderly teardown of the domain
    pub fn shutdown(&mut self) -> RdpResult<()> {
        let mut buffer = Cursor::new(Vec::new());
        crate::core::per::write_choice(
            ((DomainMCSPDU::DisconnectProviderUltimatum as u8) << 2) | 1,
            &mut buffer,
        )?;
        // rn-user-requested, packed after the choice bits
        0x80_u8.write(&mut buffer)?;
        self.x224.write(buffer.into_inner())?;
        self.x224.get_transport().get_link().shutdown()
    }

    // --- accepting role -------------------------------------------------

    /// Parse the Connect-Initial, accepting role, and return
    /// the parsed client blocks
    pub fn recv_connect_initial(
        &mut self,
        stream: &mut Cursor<Vec<u8>>,
    ) -> RdpResult<Vec<u8>> {
        let mut ber = Vec::new();
        stream.read_to_end(&mut ber)?;
        let conference = parse_connect_initial(&ber)?;
        gcc::read_conference_create_request(&mut Cursor::new(conference))
    }

    /// Send the Connect-Response with the server blocks,
    /// accepting role
    pub fn send_connect_response(
        &mut self,
        user_data: &[u8],
        server_data: gcc::ServerData,
    ) -> RdpResult<()> {
        let conference = gcc::write_conference_create_response(user_data)?;
        self.server_data = Some(server_data);
        self.x224.write(connect_response(&conference))
    }

    /// Consume an erect domain request, accepting role
    pub fn recv_erect_domain_request(&mut self, stream: &mut Cursor<Vec<u8>>) -> RdpResult<()> {
        let choice = crate::core::per::read_choice(stream)?;
        if choice >> 2 != DomainMCSPDU::ErectDomainRequest as u8 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidRespond,
                "unexpected domain PDU while waiting for erect domain",
            )));
        }
        crate::core::per::read_integer(stream)?;
        crate::core::per::read_integer(stream)?;
        Ok(())
    }

    /// Consume an attach user request and grant `user_id`,
    /// accepting role
    pub fn recv_attach_user_request(&mut self, stream: &mut Cursor<Vec<u8>>) -> RdpResult<()> {
        let choice = crate::core::per::read_choice(stream)?;
        if choice >> 2 != DomainMCSPDU::AttachUserRequest as u8 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidRespond,
                "unexpected domain PDU while waiting for attach user",
            )));
        }
        Ok(())
    }

    pub fn send_attach_user_confirm(&mut self, user_id: u16) -> RdpResult<()> {
        self.user_id = user_id;
        let mut buffer = Cursor::new(Vec::new());
        crate::core::per::write_choice(
            ((DomainMCSPDU::AttachUserConfirm as u8) << 2) | 2,
            &mut buffer,
        )?;
        crate::core::per::write_enumerates(0, &mut buffer)?;
        crate::core::per::write_integer16(user_id, USER_CHANNEL_BASE, &mut buffer)?;
        self.x224.write(buffer.into_inner())
    }

    /// Consume a channel join request, accepting role, and
    /// return the requested channel id
    pub fn recv_channel_join_request(&mut self, stream: &mut Cursor<Vec<u8>>) -> RdpResult<u16> {
        let choice = crate::core::per::read_choice(stream)?;
        if choice >> 2 != DomainMCSPDU::ChannelJoinRequest as u8 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidRespond,
                "unexpected domain PDU while waiting for channel join",
            )));
        }
        crate::core::per::read_integer16(USER_CHANNEL_BASE, stream)?;
        let mut channel_id = U16::BE(0);
        channel_id.read(stream)?;
        Ok(channel_id.inner())
    }

    pub fn send_channel_join_confirm(&mut self, name: &str, channel_id: u16) -> RdpResult<()> {
        let user_id = self.user_id;
        let mut buffer = Cursor::new(Vec::new());
        crate::core::per::write_choice(
            ((DomainMCSPDU::ChannelJoinConfirm as u8) << 2) | 2,
            &mut buffer,
        )?;
        crate::core::per::write_enumerates(0, &mut buffer)?;
        crate::core::per::write_integer16(user_id, USER_CHANNEL_BASE, &mut buffer)?;
        U16::BE(channel_id).write(&mut buffer)?;
        self.channel_ids.insert(name.to_string(), channel_id);
        self.x224.write(buffer.into_inner())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_connect_initial_round_trip() {
        let encoded = connect_initial(&[1, 2, 3]);
        // application constructed tag 101 in high tag form
        assert_eq!(encoded[0], 0x7F);
        assert_eq!(encoded[1], 0x65);
        let conference = parse_connect_initial(&encoded).unwrap();
        assert_eq!(conference, [1, 2, 3]);
    }

    #[test]
    fn test_connect_response_round_trip() {
        let encoded = connect_response(&[9, 9]);
        assert_eq!(parse_connect_response(&encoded).unwrap(), [9, 9]);
    }

    #[test]
    fn test_domain_pdu_round_trip() {
        use crate::model::link::{Link, Stream};
        let tpkt = tpkt::Client::new(Link::new(Stream::Raw(Cursor::new(Vec::new()))));
        let x224 = x224::Client::new(tpkt, x224::Protocols::ProtocolSSL);
        let mut mcs = Client::new(x224);
        mcs.user_id = 1004;
        mcs.channel_ids.insert("global".to_string(), 1003);
        mcs.write("global", vec![1_u8, 2, 3]).unwrap();

        // what was written can be read back as an indication
        if let Stream::Raw(cursor) = mcs.x224.into_transport().into_link().get_stream() {
            let written = cursor.into_inner();
            // skip tpkt and x224 data headers
            let mut domain = Cursor::new(written[7..].to_vec());
            let tpkt_read = tpkt::Client::new(Link::new(Stream::Raw(Cursor::new(Vec::new()))));
            let x224_read = x224::Client::new(tpkt_read, x224::Protocols::ProtocolSSL);
            let mut reader = Client::new(x224_read);
            let indication = reader.read_indication(&mut domain).unwrap();
            assert_eq!(indication.channel_id, 1003);
            assert_eq!(indication.initiator, 1004);
            let mut rest = Vec::new();
            domain.read_to_end(&mut rest).unwrap();
            assert_eq!(rest, [1, 2, 3]);
        } else {
            panic!("expected raw stream")
        }
    }
}
