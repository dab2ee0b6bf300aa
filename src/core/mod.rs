pub mod autodetect;
pub mod capability;
pub mod connection;
pub mod gcc;
pub mod global;
pub mod license;
pub mod mcs;
pub mod multitransport;
pub mod per;
pub mod sec;
pub mod tpkt;
pub mod x224;

use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};

/// Bulk compression call-outs used by the transport when a
/// PDU declares compression
///
/// The MPPC family algorithms live outside this crate, the
/// engine only drives the adapter with the flags found in the
/// share data header.
pub trait BulkCompressor: Send {
    /// Compress `data`, returns the payload to put on the
    /// wire and the compression type byte to declare
    fn compress(&mut self, data: &[u8]) -> RdpResult<(Vec<u8>, u8)>;

    /// Decompress a payload declared with `compressed_type`
    fn decompress(
        &mut self,
        data: &[u8],
        compressed_type: u8,
        uncompressed_length: usize,
    ) -> RdpResult<Vec<u8>>;
}

/// Adapter used when no compressor is plugged in
///
/// Inbound compressed payloads are a hard error since nothing
/// can inflate them
pub struct NoBulkCompression;

impl BulkCompressor for NoBulkCompression {
    fn compress(&mut self, data: &[u8]) -> RdpResult<(Vec<u8>, u8)> {
        Ok((data.to_vec(), 0))
    }

    fn decompress(
        &mut self,
        _data: &[u8],
        _compressed_type: u8,
        _uncompressed_length: usize,
    ) -> RdpResult<Vec<u8>> {
        Err(Error::RdpError(RdpError::new(
            RdpErrorKind::NotImplemented,
            "compressed PDU received but no bulk compressor is plugged in",
        )))
    }
}
