use crate::model::data::Message;
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use crate::model::tls::{Certificate, ServerIdentity, TlsStream};
use std::io::{Cursor, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Upper bound of write retries when the
/// underlying layer reports it is not writable
const WRITE_SPIN_LIMIT: u32 = 4096;
/// Wait between two write retries
const WRITE_SPIN_WAIT: Duration = Duration::from_millis(1);

/// Outcome of a single non blocking fill attempt
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadStatus {
    /// All requested bytes are available
    Complete,
    /// The layer has no more data for now,
    /// retry when the handle is readable again
    Pending,
}

/// This a wrapper to work equals
/// for a stream and a TLS stream
pub enum Stream<S> {
    /// Raw stream that implement Read + Write
    Raw(S),
    /// TLS Stream
    Ssl(TlsStream<S>),
}

impl<S: Read + Write> Stream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Raw(e) => e.read(buf),
            Stream::Ssl(e) => e.read(buf),
        }
    }

    fn write(&mut self, buffer: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Raw(e) => e.write(buffer),
            Stream::Ssl(e) => e.write(buffer),
        }
    }

    /// Shutdown the stream
    /// Only works when stream is a SSL stream
    pub fn shutdown(&mut self) -> RdpResult<()> {
        if let Stream::Ssl(stream) = self {
            stream.shutdown()?;
        }
        Ok(())
    }
}

/// Link layer is a wrapper around a TCP or TLS stream
///
/// It handles the byte level concerns of the transport:
/// switching from TCP to TLS, cooperative cancellation
/// through the abort signal, blocking and non blocking
/// reads, and write buffering with partial write retry
///
/// # Example
/// ```no_run
/// use rdp::model::link::{Link, Stream};
/// use std::net::{TcpStream, SocketAddr};
/// let addr = "127.0.0.1:3389".parse::<SocketAddr>().unwrap();
/// let link = Link::new(Stream::Raw(TcpStream::connect(&addr).unwrap()));
/// ```
pub struct Link<S> {
    stream: Stream<S>,
    /// true (default) blocks the caller until
    /// the requested bytes are available
    blocking: bool,
    /// polled between partial reads so that a
    /// blocked read can unwind cooperatively
    abort: Arc<AtomicBool>,
    /// bytes queued for transmission but not yet
    /// accepted by the underlying layer
    pending_write: Vec<u8>,
}

impl<S: Read + Write> Link<S> {
    /// Create a new link layer from a Stream
    pub fn new(stream: Stream<S>) -> Self {
        Link {
            stream,
            blocking: true,
            abort: Arc::new(AtomicBool::new(false)),
            pending_write: Vec::new(),
        }
    }

    /// Switch between blocking reads and non blocking reads
    ///
    /// The underlying handle must be configured accordingly
    /// by the caller, e.g. TcpStream::set_nonblocking
    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Shared abort signal
    ///
    /// Setting the returned flag from any thread makes all
    /// in flight and future read loops return an Aborted error
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    fn check_abort(&self) -> RdpResult<()> {
        if self.abort.load(Ordering::Relaxed) {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::Aborted,
                "connection aborted by caller",
            )));
        }
        Ok(())
    }

    /// Fill `buf` starting at offset `filled`
    ///
    /// Returns Complete once the whole buffer holds data and
    /// Pending when the layer would block in non blocking mode.
    /// `filled` is advanced by the number of bytes consumed so
    /// the caller can resume an interrupted fill later.
    pub fn fill(&mut self, buf: &mut [u8], filled: &mut usize) -> RdpResult<ReadStatus> {
        while *filled < buf.len() {
            self.check_abort()?;
            match self.stream.read(&mut buf[*filled..]) {
                Ok(0) => {
                    return Err(Error::RdpError(RdpError::new(
                        RdpErrorKind::Eof,
                        "connection closed by peer",
                    )))
                }
                Ok(size) => *filled += size,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    if self.blocking {
                        continue;
                    }
                    return Ok(ReadStatus::Pending);
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(ReadStatus::Complete)
    }

    /// This function will block until the expected size will be read
    ///
    /// # Example
    /// ```
    /// use rdp::model::link::{Link, Stream};
    /// use std::io::Cursor;
    /// let mut link = Link::new(Stream::Raw(Cursor::new(vec![0, 1, 2])));
    /// assert_eq!(link.read(2).unwrap(), [0, 1])
    /// ```
    pub fn read(&mut self, expected_size: usize) -> RdpResult<Vec<u8>> {
        let mut buffer = vec![0; expected_size];
        let mut filled = 0;
        loop {
            match self.fill(&mut buffer, &mut filled)? {
                ReadStatus::Complete => return Ok(buffer),
                ReadStatus::Pending => {
                    // non blocking link used through the blocking
                    // entry point, wait for readiness ourselves
                    thread::sleep(WRITE_SPIN_WAIT);
                }
            }
        }
    }

    /// This method is designed to write a Message
    /// either for TCP or TLS stream
    ///
    /// # Example
    /// ```
    /// # #[macro_use]
    /// # extern crate rdp;
    /// # use rdp::model::data::{Component, Message, U32, Trame};
    /// # use rdp::model::link::{Link, Stream};
    /// # use std::io::Cursor;
    /// # fn main() {
    ///     let mut link = Link::new(Stream::Raw(Cursor::new(vec![])));
    ///     link.write_msg(&component![
    ///         "foo" => U32::LE(1)
    ///     ]).unwrap();
    /// # }
    /// ```
    pub fn write_msg(&mut self, message: &dyn Message) -> RdpResult<()> {
        let mut buffer = Cursor::new(Vec::new());
        message.write(&mut buffer)?;
        self.write(buffer.into_inner().as_slice())
    }

    /// Queue a raw buffer and try to drain it
    ///
    /// Partial writes by the underlying layer are tolerated,
    /// the remainder is retried with a bounded wait on
    /// write readiness
    pub fn write(&mut self, buffer: &[u8]) -> RdpResult<()> {
        self.pending_write.extend_from_slice(buffer);
        self.drain()
    }

    fn drain(&mut self) -> RdpResult<()> {
        let mut spin = 0;
        while !self.pending_write.is_empty() {
            self.check_abort()?;
            match self.stream.write(&self.pending_write) {
                Ok(0) => {
                    return Err(Error::RdpError(RdpError::new(
                        RdpErrorKind::Eof,
                        "connection closed by peer",
                    )))
                }
                Ok(size) => {
                    self.pending_write.drain(..size);
                    spin = 0;
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    spin += 1;
                    if spin > WRITE_SPIN_LIMIT {
                        return Err(Error::RdpError(RdpError::new(
                            RdpErrorKind::InvalidAutomata,
                            "write side stalled",
                        )));
                    }
                    thread::sleep(WRITE_SPIN_WAIT);
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Start a ssl connection from a raw stream
    ///
    /// # Example
    /// ```no_run
    /// use rdp::model::link::{Link, Stream};
    /// use std::net::{TcpStream, SocketAddr};
    /// let addr = "127.0.0.1:3389".parse::<SocketAddr>().unwrap();
    /// let link_tcp = Link::new(Stream::Raw(TcpStream::connect(&addr).unwrap()));
    /// let link_ssl = link_tcp.start_ssl(false).unwrap();
    /// ```
    pub fn start_ssl(self, check_certificate: bool) -> RdpResult<Link<S>> {
        if let Stream::Raw(stream) = self.stream {
            let mut link = Link::new(Stream::Ssl(TlsStream::connect(check_certificate, stream)?));
            link.blocking = self.blocking;
            link.abort = self.abort;
            return Ok(link);
        }
        Err(Error::RdpError(RdpError::new(
            RdpErrorKind::NotImplemented,
            "start_ssl on ssl stream is forbidden",
        )))
    }

    /// Accept a ssl session over a raw stream, server side
    pub fn accept_ssl(self, identity: &ServerIdentity) -> RdpResult<Link<S>> {
        if let Stream::Raw(stream) = self.stream {
            let mut link = Link::new(Stream::Ssl(TlsStream::accept(identity, stream)?));
            link.blocking = self.blocking;
            link.abort = self.abort;
            return Ok(link);
        }
        Err(Error::RdpError(RdpError::new(
            RdpErrorKind::NotImplemented,
            "accept_ssl on ssl stream is forbidden",
        )))
    }

    /// Retrieve the peer certificate
    /// Use by the NLA authentication protocol
    /// to avoid MITM attack
    pub fn get_peer_certificate(&self) -> RdpResult<Option<Certificate>> {
        if let Stream::Ssl(stream) = &self.stream {
            stream.peer_certificate()
        } else {
            Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidData,
                "get peer certificate on non ssl link is impossible",
            )))
        }
    }

    /// Close the stream
    /// Only works on SSL Stream
    pub fn shutdown(&mut self) -> RdpResult<()> {
        self.stream.shutdown()
    }

    #[cfg(any(test, feature = "integration"))]
    pub fn get_stream(self) -> Stream<S> {
        self.stream
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_read_exact() {
        let mut link = Link::new(Stream::Raw(Cursor::new(vec![1, 2, 3])));
        assert_eq!(link.read(3).unwrap(), [1, 2, 3]);
    }

    #[test]
    fn test_read_eof() {
        let mut link = Link::new(Stream::Raw(Cursor::new(vec![1])));
        assert!(link.read(2).is_err());
    }

    #[test]
    fn test_write_drains_whole_buffer() {
        let mut link = Link::new(Stream::Raw(Cursor::new(Vec::new())));
        link.write(&[1, 2, 3, 4]).unwrap();
        if let Stream::Raw(r) = link.get_stream() {
            assert_eq!(r.into_inner(), [1, 2, 3, 4])
        } else {
            panic!("invalid")
        }
    }

    #[test]
    fn test_abort_unwinds_read() {
        let mut link = Link::new(Stream::Raw(Cursor::new(vec![1, 2, 3])));
        link.abort_handle().store(true, Ordering::Relaxed);
        match link.read(2) {
            Err(Error::RdpError(e)) => assert_eq!(e.kind(), RdpErrorKind::Aborted),
            _ => panic!("expected aborted error"),
        }
    }
}
