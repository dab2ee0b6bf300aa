use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};

/// A borrowed DER element
///
/// The writer side of CredSSP uses yasna, which computes all
/// lengths bottom-up before emitting a single byte. Inbound
/// messages may use BER long form lengths, so the reading
/// side walks the raw bytes with this small tokenizer instead.
#[derive(Debug)]
pub struct DerElement<'a> {
    pub tag: u8,
    pub payload: &'a [u8],
}

impl<'a> DerElement<'a> {
    /// True when the element carries the given context tag
    /// number, constructed form
    pub fn is_context(&self, number: u8) -> bool {
        self.tag == (0xA0 | number)
    }
}

/// Read one tag, length, value triple starting at `offset`
///
/// Returns the element and the offset of the byte after it
pub fn read_element(data: &[u8], offset: usize) -> RdpResult<(DerElement, usize)> {
    if offset + 2 > data.len() {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidSize,
            "truncated DER element",
        )));
    }
    let tag = data[offset];
    let first_length = data[offset + 1];

    let (length, header) = if first_length & 0x80 == 0 {
        (first_length as usize, 2)
    } else {
        let length_octets = (first_length & 0x7F) as usize;
        if length_octets == 0 || length_octets > 4 || offset + 2 + length_octets > data.len() {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                "unhandled DER length form",
            )));
        }
        let mut length = 0_usize;
        for octet in &data[offset + 2..offset + 2 + length_octets] {
            length = (length << 8) | *octet as usize;
        }
        (length, 2 + length_octets)
    };

    let start = offset + header;
    let end = start + length;
    if end > data.len() {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidSize,
            "DER element length exceeds the message",
        )));
    }
    Ok((
        DerElement {
            tag,
            payload: &data[start..end],
        },
        end,
    ))
}

/// Split a constructed element into its children
pub fn read_children(payload: &[u8]) -> RdpResult<Vec<DerElement>> {
    let mut children = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let (element, next) = read_element(payload, offset)?;
        children.push(element);
        offset = next;
    }
    Ok(children)
}

/// Expect an outer SEQUENCE and return its children
pub fn read_sequence(data: &[u8]) -> RdpResult<Vec<DerElement>> {
    let (root, _) = read_element(data, 0)?;
    if root.tag != 0x30 {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidData,
            "expected a DER sequence",
        )));
    }
    read_children(root.payload)
}

/// Unwrap a context tag down to its single inner element
pub fn read_context_inner<'a>(element: &DerElement<'a>) -> RdpResult<DerElement<'a>> {
    let (inner, _) = read_element(element.payload, 0)?;
    Ok(inner)
}

/// Decode a small unsigned INTEGER payload
pub fn read_integer(element: &DerElement) -> RdpResult<u32> {
    if element.tag != 0x02 || element.payload.is_empty() || element.payload.len() > 5 {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidData,
            "expected a small DER integer",
        )));
    }
    let mut value: u64 = 0;
    for byte in element.payload {
        value = (value << 8) | *byte as u64;
    }
    Ok(value as u32)
}

/// Decode an OCTET STRING payload
pub fn read_octet_string(element: &DerElement) -> RdpResult<Vec<u8>> {
    if element.tag != 0x04 {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidData,
            "expected a DER octet string",
        )));
    }
    Ok(element.payload.to_vec())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_read_sequence_with_context_tags() {
        // SEQUENCE { [0] INTEGER 6, [2] OCTET STRING 01 02 }
        let der = yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer
                    .next()
                    .write_tagged(yasna::Tag::context(0), |writer| writer.write_u32(6));
                writer
                    .next()
                    .write_tagged(yasna::Tag::context(2), |writer| {
                        writer.write_bytes(&[1, 2])
                    });
            })
        });
        let children = read_sequence(&der).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children[0].is_context(0));
        assert!(children[1].is_context(2));

        let version = read_integer(&read_context_inner(&children[0]).unwrap()).unwrap();
        assert_eq!(version, 6);
        let data = read_octet_string(&read_context_inner(&children[1]).unwrap()).unwrap();
        assert_eq!(data, [1, 2]);
    }

    #[test]
    fn test_long_form_length() {
        let payload = vec![0x55_u8; 0x120];
        let der = yasna::construct_der(|writer| writer.write_bytes(&payload));
        let (element, end) = read_element(&der, 0).unwrap();
        assert_eq!(element.tag, 0x04);
        assert_eq!(element.payload.len(), 0x120);
        assert_eq!(end, der.len());
    }

    #[test]
    fn test_truncated_element_rejected() {
        let der = vec![0x30, 0x10, 0x01];
        assert!(read_sequence(&der).is_err());
    }
}
