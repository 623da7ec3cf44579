//! Packet framing over byte streams
//!
//! Reads and writes header+body packets and provides big-endian
//! builders/readers for packet bodies.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::net::protocol::{Packet, PacketHeader, HEADER_SIZE, MAX_BODY_SIZE};

/// Errors that can occur during packet framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FramingError {
    /// Whether this error is an ordinary peer disconnect rather than a fault
    pub fn is_disconnect(&self) -> bool {
        match self {
            FramingError::ConnectionClosed => true,
            FramingError::Io(e) => is_disconnect(e),
            FramingError::BodyTooLarge { .. } => false,
        }
    }
}

/// End-of-stream and reset-style errors count as normal disconnects
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

fn map_read_error(e: io::Error) -> FramingError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FramingError::ConnectionClosed
    } else {
        FramingError::Io(e)
    }
}

/// Read exactly one packet header
pub async fn read_header<R: AsyncRead + Unpin>(stream: &mut R) -> Result<PacketHeader, FramingError> {
    let mut buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut buf).await.map_err(map_read_error)?;
    Ok(PacketHeader::decode(&buf))
}

/// Read the body announced by `header`
///
/// Oversized bodies are rejected before any body byte is consumed.
pub async fn read_body<R: AsyncRead + Unpin>(
    stream: &mut R,
    header: &PacketHeader,
) -> Result<Bytes, FramingError> {
    let len = header.body_length as usize;
    if !header.body_within_limit() {
        return Err(FramingError::BodyTooLarge {
            size: len,
            max: MAX_BODY_SIZE,
        });
    }

    if len == 0 {
        return Ok(Bytes::new());
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(map_read_error)?;
    Ok(Bytes::from(buf))
}

/// Read one complete packet: header, then exactly `body_length` bytes
pub async fn read_packet<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Packet, FramingError> {
    let header = read_header(stream).await?;
    let body = read_body(stream, &header).await?;
    Ok(Packet {
        service_id: header.service_id,
        method_id: header.method_id,
        correlation_id: header.correlation_id,
        body,
    })
}

/// Write one packet and flush
pub async fn write_packet<W: AsyncWrite + Unpin>(
    stream: &mut W,
    packet: &Packet,
) -> Result<(), FramingError> {
    if packet.body.len() > MAX_BODY_SIZE {
        return Err(FramingError::BodyTooLarge {
            size: packet.body.len(),
            max: MAX_BODY_SIZE,
        });
    }

    stream.write_all(&packet.encode()).await?;
    stream.flush().await?;
    Ok(())
}

/// Builder for packet bodies (big-endian)
pub struct FrameBuilder {
    buffer: Vec<u8>,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(64),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write(mut self, data: &[u8]) -> Self {
        self.buffer.extend_from_slice(data);
        self
    }

    pub fn write_u8(mut self, value: u8) -> Self {
        self.buffer.push(value);
        self
    }

    pub fn write_u16(mut self, value: u16) -> Self {
        self.buffer.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn write_u32(mut self, value: u32) -> Self {
        self.buffer.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn write_u64(mut self, value: u64) -> Self {
        self.buffer.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write a `[len:u8][bytes]` string, truncated to 255 bytes on a char boundary
    pub fn write_str8(mut self, value: &str) -> Self {
        let mut end = value.len().min(u8::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.buffer.push(end as u8);
        self.buffer.extend_from_slice(&value.as_bytes()[..end]);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over a packet body (big-endian)
pub struct FrameReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Read n bytes
    pub fn read(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.position.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.position..end];
        self.position = end;
        Some(slice)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read(1).map(|b| b[0])
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.read(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.read(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        self.read(8).map(|b| {
            u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    /// Get remaining bytes
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::{connection_method, service};
    use std::io::Cursor;

    #[tokio::test]
    async fn test_read_write_packet() {
        let packet = Packet::new(service::GAME_UTILITIES, 7, 0xDEAD_BEEF, b"Hello, World!".to_vec());
        let mut buffer = Vec::new();

        write_packet(&mut buffer, &packet).await.unwrap();
        assert_eq!(buffer.len(), HEADER_SIZE + 13);

        let mut cursor = Cursor::new(buffer);
        let result = read_packet(&mut cursor).await.unwrap();

        assert_eq!(result, packet);
    }

    #[tokio::test]
    async fn test_empty_body() {
        let packet = Packet::new(service::CONNECTION, connection_method::PING, 1, Vec::new());
        let mut buffer = Vec::new();

        write_packet(&mut buffer, &packet).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let result = read_packet(&mut cursor).await.unwrap();

        assert!(result.body.is_empty());
        assert_eq!(result.correlation_id, 1);
    }

    #[tokio::test]
    async fn test_max_body_round_trips() {
        let packet = Packet::new(1, 2, 3, vec![0xAB; MAX_BODY_SIZE]);
        let mut buffer = Vec::new();
        write_packet(&mut buffer, &packet).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let result = read_packet(&mut cursor).await.unwrap();
        assert_eq!(result.body.len(), MAX_BODY_SIZE);
        assert_eq!(result, packet);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_before_reading() {
        let header = PacketHeader {
            service_id: 1,
            method_id: 1,
            correlation_id: 0,
            body_length: MAX_BODY_SIZE as u32 + 1,
        };
        let mut buffer = header.encode().to_vec();
        buffer.extend_from_slice(&[0u8; 32]);

        let mut cursor = Cursor::new(buffer);
        let result = read_packet(&mut cursor).await;

        assert!(matches!(
            result,
            Err(FramingError::BodyTooLarge { size, max }) if size == MAX_BODY_SIZE + 1 && max == MAX_BODY_SIZE
        ));
        // Nothing past the header was consumed
        assert_eq!(cursor.position(), HEADER_SIZE as u64);
    }

    #[tokio::test]
    async fn test_write_oversized_rejected() {
        let packet = Packet::new(1, 1, 1, vec![0u8; MAX_BODY_SIZE + 1]);
        let mut buffer = Vec::new();

        let result = write_packet(&mut buffer, &packet).await;
        assert!(matches!(result, Err(FramingError::BodyTooLarge { .. })));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_read_truncated_header() {
        let mut cursor = Cursor::new(vec![0u8; 5]);

        let result = read_packet(&mut cursor).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_truncated_body() {
        let header = PacketHeader {
            service_id: 1,
            method_id: 1,
            correlation_id: 0,
            body_length: 10,
        };
        let mut buffer = header.encode().to_vec();
        buffer.extend_from_slice(&[1, 2, 3]);

        let mut cursor = Cursor::new(buffer);
        let result = read_packet(&mut cursor).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_split_reads_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let packet = Packet::new(4, 6, 42, b"split across writes".to_vec());
        let encoded = packet.encode();

        let writer = tokio::spawn(async move {
            for chunk in encoded.chunks(3) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        let received = read_packet(&mut server).await.unwrap();
        assert_eq!(received, packet);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_header_and_body_in_separate_reads() {
        let packet = Packet::new(service::GAME_UTILITIES, 3, 9, vec![2, 1]);
        let encoded = packet.encode();
        let mut stream = tokio_test::io::Builder::new()
            .read(&encoded[..HEADER_SIZE])
            .read(&encoded[HEADER_SIZE..])
            .build();

        let received = read_packet(&mut stream).await.unwrap();
        assert_eq!(received, packet);
    }

    #[tokio::test]
    async fn test_multiple_packets() {
        let packets = vec![
            Packet::new(1, 3, 1, b"first".to_vec()),
            Packet::new(2, 1, 2, Vec::new()),
            Packet::new(4, 6, 3, b"third packet here".to_vec()),
        ];

        let mut buffer = Vec::new();
        for packet in &packets {
            write_packet(&mut buffer, packet).await.unwrap();
        }

        let mut cursor = Cursor::new(buffer);
        for expected in &packets {
            let result = read_packet(&mut cursor).await.unwrap();
            assert_eq!(&result, expected);
        }
        assert!(matches!(
            read_packet(&mut cursor).await,
            Err(FramingError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(FramingError::ConnectionClosed.is_disconnect());
        assert!(FramingError::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_disconnect());
        assert!(!FramingError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_disconnect());
        assert!(!FramingError::BodyTooLarge { size: 1, max: 0 }.is_disconnect());
    }

    #[test]
    fn test_frame_builder_reader() {
        let data = FrameBuilder::new()
            .write_u8(42)
            .write_u16(1000)
            .write_u32(999_999)
            .write_u64(1 << 40)
            .write_str8("alice")
            .build();

        assert_eq!(&data[1..3], &1000u16.to_be_bytes());

        let mut reader = FrameReader::new(&data);
        assert_eq!(reader.read_u8(), Some(42));
        assert_eq!(reader.read_u16(), Some(1000));
        assert_eq!(reader.read_u32(), Some(999_999));
        assert_eq!(reader.read_u64(), Some(1 << 40));
        assert_eq!(reader.read_u8(), Some(5));
        assert_eq!(reader.read(5), Some(&b"alice"[..]));
        assert!(!reader.has_remaining());
    }

    #[test]
    fn test_str8_truncates_long_strings() {
        let long = "x".repeat(300);
        let data = FrameBuilder::new().write_str8(&long).build();
        assert_eq!(data[0], 255);
        assert_eq!(data.len(), 256);
    }

    #[test]
    fn test_frame_reader_overflow() {
        let data = vec![1, 2, 3];
        let mut reader = FrameReader::new(&data);

        assert!(reader.read_u16().is_some());
        assert!(reader.read_u16().is_none());
        assert_eq!(reader.position(), 2);
        assert!(reader.read(usize::MAX).is_none());
    }
}
