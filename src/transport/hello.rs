//! TLS ClientHello inspection.
//!
//! Extracts the JA3 fields from the first TLS record a client sends, so a
//! server can see which fingerprint a peer actually presented.

use bytes::Buf;

use crate::error::{Error, Result};
use crate::transport::fingerprint::{is_grease, Ja3};

/// TLS record types
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ContentType {
    /// Handshake record
    Handshake = 22,
}

/// TLS handshake types
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HandshakeType {
    /// ClientHello message
    ClientHello = 1,
}

/// TLS extension types relevant to JA3
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExtensionType {
    /// supported_groups (formerly elliptic_curves)
    SupportedGroups = 10,
    /// ec_point_formats
    EcPointFormats = 11,
}

/// Size of a TLS record header.
pub const RECORD_HEADER_SIZE: usize = 5;

fn truncated(what: &str) -> Error {
    Error::InvalidMessage(format!("ClientHello truncated: {what}"))
}

fn take<'a>(buf: &mut &'a [u8], len: usize, what: &str) -> Result<&'a [u8]> {
    if buf.len() < len {
        return Err(truncated(what));
    }
    let slice: &'a [u8] = *buf;
    let (head, tail) = slice.split_at(len);
    *buf = tail;
    Ok(head)
}

fn take_u8(buf: &mut &[u8], what: &str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated(what));
    }
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8], what: &str) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(truncated(what));
    }
    Ok(buf.get_u16())
}

fn u16_list(mut data: &[u8]) -> Vec<u16> {
    let mut values = Vec::with_capacity(data.len() / 2);
    while data.remaining() >= 2 {
        let v = data.get_u16();
        if !is_grease(v) {
            values.push(v);
        }
    }
    values
}

/// Full length of the record starting at `data`, if the header is present.
pub fn record_len(data: &[u8]) -> Option<usize> {
    if data.len() < RECORD_HEADER_SIZE {
        return None;
    }
    Some(RECORD_HEADER_SIZE + u16::from_be_bytes([data[3], data[4]]) as usize)
}

/// Parse a TLS ClientHello record into its JA3 fields.
///
/// `data` must start at the TLS record header and contain the whole first
/// record. GREASE values are removed.
pub fn parse_client_hello(data: &[u8]) -> Result<Ja3> {
    let mut buf = data;

    // Record header
    if take_u8(&mut buf, "record type")? != ContentType::Handshake as u8 {
        return Err(Error::InvalidMessage("not a handshake record".into()));
    }
    let _record_version = take_u16(&mut buf, "record version")?;
    let record_len = take_u16(&mut buf, "record length")? as usize;
    let mut record = take(&mut buf, record_len, "record body")?;

    // Handshake header
    if take_u8(&mut record, "handshake type")? != HandshakeType::ClientHello as u8 {
        return Err(Error::InvalidMessage("not a ClientHello".into()));
    }
    let len = take(&mut record, 3, "handshake length")?;
    let body_len = ((len[0] as usize) << 16) | ((len[1] as usize) << 8) | (len[2] as usize);
    let mut body = take(&mut record, body_len, "handshake body")?;

    let version = take_u16(&mut body, "legacy version")?;
    take(&mut body, 32, "client random")?;

    let session_id_len = take_u8(&mut body, "session id length")? as usize;
    take(&mut body, session_id_len, "session id")?;

    let suites_len = take_u16(&mut body, "cipher suites length")? as usize;
    let ciphers = u16_list(take(&mut body, suites_len, "cipher suites")?);

    let compression_len = take_u8(&mut body, "compression length")? as usize;
    take(&mut body, compression_len, "compression methods")?;

    let mut ja3 = Ja3 {
        version,
        ciphers,
        ..Ja3::default()
    };

    // Extensions are optional in a ClientHello
    if body.is_empty() {
        return Ok(ja3);
    }

    let extensions_len = take_u16(&mut body, "extensions length")? as usize;
    let mut extensions = take(&mut body, extensions_len, "extensions")?;

    while !extensions.is_empty() {
        let ext_type = take_u16(&mut extensions, "extension type")?;
        let ext_len = take_u16(&mut extensions, "extension length")? as usize;
        let mut ext = take(&mut extensions, ext_len, "extension body")?;

        if is_grease(ext_type) {
            continue;
        }
        ja3.extensions.push(ext_type);

        if ext_type == ExtensionType::SupportedGroups as u16 {
            let list_len = take_u16(&mut ext, "supported groups length")? as usize;
            ja3.curves = u16_list(take(&mut ext, list_len, "supported groups")?);
        } else if ext_type == ExtensionType::EcPointFormats as u16 {
            let list_len = take_u8(&mut ext, "point formats length")? as usize;
            ja3.point_formats = take(&mut ext, list_len, "point formats")?.to_vec();
        }
    }

    Ok(ja3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    /// Assemble a ClientHello record from its parts.
    fn client_hello(ciphers: &[u16], extensions: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u16(0x0303);
        body.put_slice(&[0x11; 32]);
        body.put_u8(32);
        body.put_slice(&[0x22; 32]);
        body.put_u16((ciphers.len() * 2) as u16);
        for c in ciphers {
            body.put_u16(*c);
        }
        body.put_u8(1);
        body.put_u8(0);

        let mut exts = BytesMut::new();
        for (ty, data) in extensions {
            exts.put_u16(*ty);
            exts.put_u16(data.len() as u16);
            exts.put_slice(data);
        }
        body.put_u16(exts.len() as u16);
        body.put_slice(&exts);

        let mut handshake = BytesMut::new();
        handshake.put_u8(HandshakeType::ClientHello as u8);
        handshake.put_u8(0);
        handshake.put_u16(body.len() as u16);
        handshake.put_slice(&body);

        let mut record = BytesMut::new();
        record.put_u8(ContentType::Handshake as u8);
        record.put_u16(0x0301);
        record.put_u16(handshake.len() as u16);
        record.put_slice(&handshake);
        record.to_vec()
    }

    fn groups_ext(groups: &[u16]) -> Vec<u8> {
        let mut data = BytesMut::new();
        data.put_u16((groups.len() * 2) as u16);
        for g in groups {
            data.put_u16(*g);
        }
        data.to_vec()
    }

    #[test]
    fn test_parse_client_hello() {
        let hello = client_hello(
            &[0x0a0a, 0x1301, 0x1302, 0xc02b],
            &[
                (0x1a1a, vec![]),
                (0, vec![0, 0]),
                (10, groups_ext(&[0x2a2a, 29, 23])),
                (11, vec![1, 0]),
                (43, vec![2, 3, 4]),
            ],
        );

        assert_eq!(record_len(&hello), Some(hello.len()));

        let ja3 = parse_client_hello(&hello).unwrap();
        assert_eq!(ja3.version, 0x0303);
        assert_eq!(ja3.ciphers, vec![0x1301, 0x1302, 0xc02b]);
        assert_eq!(ja3.extensions, vec![0, 10, 11, 43]);
        assert_eq!(ja3.curves, vec![29, 23]);
        assert_eq!(ja3.point_formats, vec![0]);
        assert_eq!(ja3.to_string(), "771,4865-4866-49195,0-10-11-43,29-23,0");
    }

    #[test]
    fn test_truncated_hello() {
        let hello = client_hello(&[0x1301], &[(10, groups_ext(&[29]))]);
        for cut in [0, 3, 9, 20, hello.len() - 1] {
            assert!(parse_client_hello(&hello[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn test_not_a_hello() {
        let mut hello = client_hello(&[0x1301], &[]);
        hello[0] = 23;
        assert!(matches!(
            parse_client_hello(&hello),
            Err(Error::InvalidMessage(_))
        ));

        let mut hello = client_hello(&[0x1301], &[]);
        hello[5] = 2;
        assert!(parse_client_hello(&hello).is_err());
    }
}
