use crate::protocol::mysql::packet::{packet, Packet};

use std::io;
use std::io::prelude::*;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;

const PACKET_BUFFER_SIZE: usize = 4096;
const PACKET_LARGE_BUFFER_SIZE: usize = 1048576;

#[macro_export]
macro_rules! read_logical_packet {
    ($reader: expr) => {{
        use tracing::warn;
        let rs = $reader.next_async().await;
        if rs.is_err() {
            warn!("read packet err = {:?}", rs);
        }
        rs?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "connection disconnect.",
            )
        })?
    }};
}

/// Reads a byte stream and yields complete logical MySQL packets together
/// with the sequence number of their final physical frame. Partial packets
/// are buffered; the caller never sees a header without its payload.
pub struct PacketReader<R> {
    bytes: Vec<u8>,
    pub r: R,
}

impl<R> PacketReader<R> {
    pub fn new(r: R) -> Self {
        PacketReader {
            bytes: Vec::new(),
            r,
        }
    }

    fn parse_buffered(&mut self) -> io::Result<Option<(u8, Packet)>> {
        if self.bytes.is_empty() {
            return Ok(None);
        }
        match packet(&self.bytes) {
            Ok((rest, p)) => {
                let consumed = self.bytes.len() - rest.len();
                self.bytes.drain(0..consumed);
                Ok(Some(p))
            }
            Err(nom::Err::Incomplete(_)) | Err(nom::Err::Error(_)) => Ok(None),
            Err(nom::Err::Failure(ctx)) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{:?}", ctx),
            )),
        }
    }
}

impl<R: Read> PacketReader<R> {
    /// Blocking variant, used by tests driving a `Cursor`.
    pub fn next_read(&mut self) -> io::Result<Option<(u8, Packet)>> {
        loop {
            if let Some(p) = self.parse_buffered()? {
                return Ok(Some(p));
            }

            let mut buf = [0u8; PACKET_BUFFER_SIZE];
            let read = self.r.read(&mut buf)?;
            if read == 0 {
                return if self.bytes.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} unhandled bytes", self.bytes.len()),
                    ))
                };
            }
            self.bytes.extend_from_slice(&buf[..read]);
        }
    }
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub async fn next_async(&mut self) -> io::Result<Option<(u8, Packet)>> {
        let mut buffer_size = PACKET_BUFFER_SIZE;
        loop {
            if let Some(p) = self.parse_buffered()? {
                return Ok(Some(p));
            }

            let end = self.bytes.len();
            self.bytes.resize(end + buffer_size, 0);
            let read = self.r.read(&mut self.bytes[end..]).await?;
            self.bytes.truncate(end + read);
            // use a larger buffer size to reduce resize rounds on big resultsets.
            buffer_size = PACKET_LARGE_BUFFER_SIZE;

            if read == 0 {
                return if self.bytes.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} unhandled bytes", self.bytes.len()),
                    ))
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PacketReader;
    use crate::protocol::mysql::constants::MAX_PAYLOAD_LEN;
    use std::io::Cursor;

    #[test]
    fn test_single_packet() {
        let bytes = [0x01, 0x00, 0x00, 0x00, 0x0e];
        let mut reader = PacketReader::new(Cursor::new(&bytes[..]));
        let (seq, pkt) = reader.next_read().unwrap().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(&*pkt, &[0x0e]);
        assert!(reader.next_read().unwrap().is_none());
    }

    #[test]
    fn test_back_to_back_packets() {
        let bytes = [0x01, 0, 0, 0, 0x0e, 0x01, 0, 0, 0, 0x01];
        let mut reader = PacketReader::new(Cursor::new(&bytes[..]));
        let (_, first) = reader.next_read().unwrap().unwrap();
        let (_, second) = reader.next_read().unwrap().unwrap();
        assert_eq!(&*first, &[0x0e]);
        assert_eq!(&*second, &[0x01]);
    }

    #[test]
    fn test_trailing_garbage_is_an_error() {
        let bytes = [0x05, 0x00, 0x00];
        let mut reader = PacketReader::new(Cursor::new(&bytes[..]));
        assert!(reader.next_read().is_err());
    }

    // Property: any byte-split of a legal stream yields the same packets.
    #[tokio::test]
    async fn test_every_split_of_a_stream() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&[0x03, 0, 0, 0, 0x03, 0x31, 0x32]);
        stream.extend_from_slice(&[0x01, 0, 0, 1, 0x00]);

        for split in 1..stream.len() - 1 {
            let (a, b) = stream.split_at(split);
            let (mut tx, rx) = tokio::io::duplex(64);
            let mut reader = PacketReader::new(rx);
            use tokio::io::AsyncWriteExt;
            tx.write_all(a).await.unwrap();
            let handle = tokio::spawn(async move {
                let (s1, p1) = reader.next_async().await.unwrap().unwrap();
                let (s2, p2) = reader.next_async().await.unwrap().unwrap();
                ((s1, p1.into_vec()), (s2, p2.into_vec()))
            });
            tx.write_all(b).await.unwrap();
            drop(tx);
            let (first, second) = handle.await.unwrap();
            assert_eq!(first, (0, vec![0x03, 0x31, 0x32]));
            assert_eq!(second, (1, vec![0x00]));
        }
    }

    #[tokio::test]
    async fn test_large_packet_reassembly() {
        let mut stream = vec![0xff, 0xff, 0xff, 0x00];
        stream.extend(std::iter::repeat(0x41).take(MAX_PAYLOAD_LEN));
        stream.extend_from_slice(&[0x02, 0x00, 0x00, 0x01, 0x42, 0x43]);

        let (mut tx, rx) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn(async move {
            let mut reader = PacketReader::new(rx);
            reader.next_async().await.unwrap().unwrap()
        });
        use tokio::io::AsyncWriteExt;
        tx.write_all(&stream).await.unwrap();
        drop(tx);
        let (seq, pkt) = handle.await.unwrap();
        assert_eq!(seq, 1);
        assert_eq!(pkt.len(), MAX_PAYLOAD_LEN + 2);
        assert_eq!(&pkt[MAX_PAYLOAD_LEN..], &[0x42, 0x43]);
    }
}
