pub mod frame_errors;
pub mod request;
pub mod response;
pub mod server_event_type;
pub mod types;
pub mod value;

use crate::frame::frame_errors::FrameError;
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use std::collections::HashMap;
use std::fmt::Display;

use request::SerializableRequest;
use response::ResponseOpcode;

pub const HEADER_SIZE: usize = 9;

/// The only protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 0x04;

const RESPONSE_DIRECTION_BIT: u8 = 0x80;

// Bodies above this size are rejected before any allocation happens.
const MAX_BODY_LENGTH: u32 = 256 * 1024 * 1024;

// Frame flags
pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;
pub const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
pub const FLAG_WARNING: u8 = 0x08;

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Compression {
    /// Name used for this algorithm in STARTUP/SUPPORTED option maps.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed-width v4 frame header.
///
/// `version` holds the raw byte, so the direction bit (0x80 for responses)
/// is preserved across [`FrameHeader::encode`] and [`FrameHeader::decode`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
    pub opcode: u8,
    pub length: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        let mut buf = &mut raw[..];
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_i16(self.stream);
        buf.put_u8(self.opcode);
        buf.put_u32(self.length);
        raw
    }

    /// Parses a header without interpreting the direction bit or opcode.
    ///
    /// Fails if the version is not 4 or if the length does not fit into
    /// a signed 32-bit integer below the body size limit.
    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Result<Self, FrameError> {
        let mut buf = &raw[..];
        let version = buf.get_u8();
        if version & !RESPONSE_DIRECTION_BIT != PROTOCOL_VERSION {
            return Err(FrameError::VersionNotSupported(
                version & !RESPONSE_DIRECTION_BIT,
            ));
        }
        let flags = buf.get_u8();
        let stream = buf.get_i16();
        let opcode = buf.get_u8();
        let length = buf.get_u32();
        if length > MAX_BODY_LENGTH {
            // A length with the top bit set would be negative as [int].
            return Err(FrameError::InvalidBodyLength(length as i32 as i64));
        }

        Ok(FrameHeader {
            version,
            flags,
            stream,
            opcode,
            length,
        })
    }

    pub fn is_response(&self) -> bool {
        self.version & RESPONSE_DIRECTION_BIT != 0
    }
}

/// A request encoded into a full frame, waiting for its stream id.
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, FrameError> {
        let mut flags = 0;
        let mut data = vec![0; HEADER_SIZE];

        if let Some(compression) = compression {
            flags |= FLAG_COMPRESSION;
            let body = req.to_bytes()?;
            compress_append(&body, compression, &mut data)?;
        } else {
            req.serialize(&mut data)?;
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        let length = u32::try_from(data.len() - HEADER_SIZE)
            .map_err(|_| FrameError::InvalidBodyLength((data.len() - HEADER_SIZE) as i64))?;
        let header = FrameHeader {
            version: PROTOCOL_VERSION,
            flags,
            // Filled in by the connection router.
            stream: 0,
            opcode: R::OPCODE as u8,
            length,
        };
        data[..HEADER_SIZE].copy_from_slice(&header.encode());

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        self.data[2..4].copy_from_slice(&stream.to_be_bytes());
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0x00,
            stream: 0,
        }
    }
}

/// Reads one full response frame. The body is exactly `length` bytes long;
/// nothing past it is consumed.
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let header = FrameHeader::decode(&raw_header)?;
    if !header.is_response() {
        return Err(FrameError::FrameFromClient);
    }

    let frame_params = FrameParams {
        version: header.version,
        flags: header.flags,
        stream: header.stream,
    };
    let opcode = ResponseOpcode::try_from(header.opcode)?;

    let length = header.length as usize;
    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF, too early
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

/// Reads one full request frame; the server-side counterpart of
/// [`read_response_frame`], used by in-process test servers.
pub async fn read_request_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, u8, Bytes), FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let header = FrameHeader::decode(&raw_header)?;
    if header.is_response() {
        return Err(FrameError::FrameFromServer);
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    Ok((
        FrameParams {
            version: header.version,
            flags: header.flags,
            stream: header.stream,
        },
        header.opcode,
        body.into(),
    ))
}

#[derive(Debug)]
pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Vec<u8>>>,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id = types::read_uuid(buf)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

pub fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = u32::try_from(uncomp_body.len())
                .map_err(|_| FrameError::FrameCompression)?;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|_| FrameError::FrameCompression)?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

pub fn decompress(mut comp_body: &[u8], compression: Compression) -> Result<Vec<u8>, FrameError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(FrameError::FrameDecompression);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            let uncomp_body = lz4_flex::decompress(comp_body, uncomp_len)?;
            Ok(uncomp_body)
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|_| FrameError::FrameDecompression),
    }
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discrimant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}

#[cfg(test)]
mod test {
    use super::request::Options;
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader {
            version: 0x84,
            flags: FLAG_TRACING | FLAG_WARNING,
            stream: 1234,
            opcode: ResponseOpcode::Result as u8,
            length: 77,
        };
        let decoded = FrameHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_response());

        let negative_stream = FrameHeader {
            stream: -1,
            ..header
        };
        assert_eq!(
            FrameHeader::decode(&negative_stream.encode()).unwrap(),
            negative_stream
        );
    }

    #[test]
    fn header_rejects_bad_version_and_length() {
        let mut raw = FrameHeader {
            version: 0x83,
            flags: 0,
            stream: 0,
            opcode: 0,
            length: 0,
        }
        .encode();
        assert_matches!(
            FrameHeader::decode(&raw),
            Err(FrameError::VersionNotSupported(3))
        );

        raw[0] = 0x84;
        raw[5..9].copy_from_slice(&(-1_i32).to_be_bytes());
        assert_matches!(
            FrameHeader::decode(&raw),
            Err(FrameError::InvalidBodyLength(-1))
        );
    }

    #[test]
    fn serialized_request_layout() {
        let mut req = SerializedRequest::make(&Options, None, false).unwrap();
        req.set_stream(513);
        let data = req.get_data();
        assert_eq!(data.len(), HEADER_SIZE);
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(data);
        let header = FrameHeader::decode(&raw).unwrap();
        assert!(!header.is_response());
        assert_eq!(header.stream, 513);
        assert_eq!(header.opcode, 0x05);
        assert_eq!(header.length, 0);
    }

    #[tokio::test]
    async fn read_frame_stops_at_declared_length() {
        let header = FrameHeader {
            version: 0x84,
            flags: 0,
            stream: 3,
            opcode: ResponseOpcode::Ready as u8,
            length: 2,
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);

        let mut reader = &bytes[..];
        let (params, opcode, body) = read_response_frame(&mut reader).await.unwrap();
        assert_eq!(params.stream, 3);
        assert_eq!(opcode, ResponseOpcode::Ready);
        assert_eq!(&body[..], &[0xAA, 0xBB]);
        assert_eq!(reader, &[0xCC, 0xDD]);
    }

    #[tokio::test]
    async fn read_frame_reports_early_eof() {
        let header = FrameHeader {
            version: 0x84,
            flags: 0,
            stream: 0,
            opcode: ResponseOpcode::Result as u8,
            length: 10,
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        let mut reader = &bytes[..];
        assert_matches!(
            read_response_frame(&mut reader).await,
            Err(FrameError::ConnectionClosed(7, 10))
        );
    }

    #[tokio::test]
    async fn read_frame_rejects_client_frames() {
        let header = FrameHeader {
            version: 0x04,
            flags: 0,
            stream: 0,
            opcode: 0x05,
            length: 0,
        };
        let bytes = header.encode();
        let mut reader = &bytes[..];
        assert_matches!(
            read_response_frame(&mut reader).await,
            Err(FrameError::FrameFromClient)
        );
    }

    #[test]
    fn test_lz4_compress() {
        let mut out = Vec::from(&b"Hello"[..]);
        let uncomp_body = b", World!";
        let expect = vec![
            72, 101, 108, 108, 111, 0, 0, 0, 8, 128, 44, 32, 87, 111, 114, 108, 100, 33,
        ];

        compress_append(uncomp_body, Compression::Lz4, &mut out).unwrap();
        assert_eq!(expect, out);
    }

    #[test]
    fn corrupt_lz4_body_is_a_cloneable_frame_error() {
        // Declares 100 bytes, then a literal-length token with no data.
        let body = [0, 0, 0, 100, 0xFF];
        let err = decompress(&body, Compression::Lz4).unwrap_err();
        assert_matches!(err.clone(), FrameError::Lz4DecompressError(_));

        assert_matches!(
            decompress(&[0, 0], Compression::Lz4),
            Err(FrameError::FrameDecompression)
        );
    }

    #[test]
    fn compressed_body_is_restored_by_extensions_parser() {
        let uncomp_body = "Hello, World!".repeat(100);
        for compression in [Compression::Lz4, Compression::Snappy] {
            let mut comp_body = Vec::new();
            compress_append(uncomp_body.as_bytes(), compression, &mut comp_body).unwrap();
            assert!(comp_body.len() < uncomp_body.len());

            let parsed = parse_response_body_extensions(
                FLAG_COMPRESSION,
                Some(compression),
                comp_body.clone().into(),
            )
            .unwrap();
            assert_eq!(&parsed.body[..], uncomp_body.as_bytes());

            assert_matches!(
                parse_response_body_extensions(FLAG_COMPRESSION, None, comp_body.into()),
                Err(FrameError::NoCompressionNegotiated)
            );
        }
    }

    #[test]
    fn extensions_strip_tracing_and_warnings() {
        let trace_id = Uuid::new_v4();
        let mut body = Vec::new();
        types::write_uuid(&trace_id, &mut body);
        types::write_string_list(&["careful"], &mut body).unwrap();
        body.extend_from_slice(&[9, 9]);

        let parsed =
            parse_response_body_extensions(FLAG_TRACING | FLAG_WARNING, None, body.into())
                .unwrap();
        assert_eq!(parsed.trace_id, Some(trace_id));
        assert_eq!(parsed.warnings, vec!["careful".to_owned()]);
        assert_eq!(&parsed.body[..], &[9, 9]);
        assert!(parsed.custom_payload.is_none());
    }
}
