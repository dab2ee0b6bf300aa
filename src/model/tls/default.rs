use rustls::{
    client::{NoClientSessionStorage, ServerCertVerified, ServerCertVerifier},
    ClientConfig, ClientConnection, PrivateKey, RootCertStore, ServerConfig, ServerConnection,
    ServerName, Stream,
};
use std::convert::TryInto;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use crate::model::tls::ServerIdentity;

/// Marks all server certificates as valid
/// so it can be used to turn off the server certificate
/// validation on the client-side.
struct DummyTlsVerifier;

impl ServerCertVerifier for DummyTlsVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[derive(Clone)]
pub struct Certificate(rustls::Certificate);

impl Certificate {
    pub fn from_der(der: &[u8]) -> RdpResult<Self> {
        Ok(Self(rustls::Certificate(der.to_vec())))
    }

    pub fn to_der(&self) -> RdpResult<Vec<u8>> {
        Ok(self.0 .0.clone())
    }
}

enum Session {
    Client(ClientConnection),
    Server(ServerConnection),
}

/// A TLS session over any Read + Write stream,
/// client or server side
pub struct TlsStream<S: Sized> {
    session: Session,
    sock: S,
}

impl<S> TlsStream<S>
where
    S: Read + Write,
{
    pub fn connect(check_certificate: bool, sock: S) -> RdpResult<Self> {
        let root_store = RootCertStore::empty();
        let mut config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if !check_certificate {
            let mut config = config.dangerous();
            let verifier = Arc::new(DummyTlsVerifier {});
            config.set_certificate_verifier(verifier)
        }

        config.enable_sni = false;
        // We do not use the Server Name Indication (SNI) extension
        // during the client handshake, but the rustls library requires
        // a valid DNS domain name for the server regardless of that
        // setting, so we need to provide a valid name.
        // We can't use an empty string here.
        let server_name: ServerName = "servername".try_into().unwrap();
        config.session_storage = Arc::new(NoClientSessionStorage {});

        let arc = Arc::new(config);
        let conn = ClientConnection::new(arc, server_name).map_err(|_| Error::SslError)?;

        Ok(Self {
            session: Session::Client(conn),
            sock,
        })
    }

    pub fn accept(identity: &ServerIdentity, sock: S) -> RdpResult<Self> {
        let certs = identity
            .cert_chain
            .iter()
            .map(|der| rustls::Certificate(der.clone()))
            .collect();
        let key = PrivateKey(identity.private_key.clone());
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|_| Error::SslError)?;
        let conn = ServerConnection::new(Arc::new(config)).map_err(|_| Error::SslError)?;
        Ok(Self {
            session: Session::Server(conn),
            sock,
        })
    }

    pub fn get_ref(&self) -> &S {
        &self.sock
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.sock
    }

    pub fn peer_certificate(&self) -> RdpResult<Option<Certificate>> {
        let certs = match &self.session {
            Session::Client(conn) => conn.peer_certificates(),
            Session::Server(conn) => conn.peer_certificates(),
        };
        if let Some(certs) = certs {
            if let Some(cert) = certs.first() {
                Ok(Some(Certificate(cert.clone())))
            } else {
                Err(Error::RdpError(RdpError::new(
                    RdpErrorKind::InvalidData,
                    "certificates chain is empty",
                )))
            }
        } else {
            Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidData,
                "certificates chain is unavailable",
            )))
        }
    }

    pub fn shutdown(&mut self) -> io::Result<()> {
        match &mut self.session {
            Session::Client(conn) => conn.send_close_notify(),
            Session::Server(conn) => conn.send_close_notify(),
        }
        self.flush()?;
        Ok(())
    }
}

impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.session {
            Session::Client(conn) => Stream {
                conn,
                sock: &mut self.sock,
            }
            .read(buf),
            Session::Server(conn) => Stream {
                conn,
                sock: &mut self.sock,
            }
            .read(buf),
        }
    }
}

impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.session {
            Session::Client(conn) => Stream {
                conn,
                sock: &mut self.sock,
            }
            .write(buf),
            Session::Server(conn) => Stream {
                conn,
                sock: &mut self.sock,
            }
            .write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.session {
            Session::Client(conn) => Stream {
                conn,
                sock: &mut self.sock,
            }
            .flush(),
            Session::Server(conn) => Stream {
                conn,
                sock: &mut self.sock,
            }
            .flush(),
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for TlsStream<S> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.sock, fmt)
    }
}
