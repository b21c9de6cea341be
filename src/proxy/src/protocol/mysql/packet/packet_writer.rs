use crate::protocol::mysql::constants;
use byteorder::{ByteOrder, LittleEndian};

use std::io;
use std::io::prelude::*;
use std::io::IoSlice;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Buffers one packet payload and emits it with headers on `end_packet`,
/// splitting at the MAX_PAYLOAD_LEN boundary and advancing the sequence
/// number per physical frame.
pub struct PacketWriter<W> {
    buf: Vec<u8>,
    seq: u8,
    pub inner_writer: W,
}

impl<W> PacketWriter<W> {
    pub fn new(write: W) -> Self {
        Self {
            buf: Vec::new(),
            seq: 0,
            inner_writer: write,
        }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    fn increase_seq(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }

    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }
}

impl<W> Write for PacketWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub async fn end_packet(&mut self) -> io::Result<()> {
        let mut header = [0; constants::PACKET_HEADER_LEN];
        if !self.is_empty() {
            let raw_packet = self.take_buffer();
            let chunks = raw_packet.chunks(constants::MAX_PAYLOAD_LEN);
            for chunk in chunks {
                LittleEndian::write_u24(&mut header, chunk.len() as u32);
                header[3] = self.seq();
                self.increase_seq();
                let written = self
                    .inner_writer
                    .write_vectored(&[IoSlice::new(&header), IoSlice::new(chunk)])
                    .await?;

                // if the vectored write did not drain, fall back to write_all
                if written != constants::PACKET_HEADER_LEN + chunk.len() {
                    let remaining: Vec<u8> = header
                        .iter()
                        .chain(chunk.iter())
                        .skip(written)
                        .cloned()
                        .collect();
                    self.inner_writer.write_all(&remaining).await?
                }
            }
            // a chunk of exactly MAX_PAYLOAD_LEN must be terminated by an
            // empty continuation frame
            if raw_packet.len() % constants::MAX_PAYLOAD_LEN == 0 {
                self.write_empty_packet(&mut header).await?;
            }
            Ok(())
        } else {
            self.write_empty_packet(&mut header).await
        }
    }

    async fn write_empty_packet(
        &mut self,
        header: &mut [u8; constants::PACKET_HEADER_LEN],
    ) -> io::Result<()> {
        LittleEndian::write_u24(header, 0);
        header[3] = self.seq();
        self.increase_seq();
        self.inner_writer.write_all(&header[..]).await
    }

    /// Write raw, already-framed bytes through unchanged.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner_writer.write_all(bytes).await
    }

    pub async fn flush_all(&mut self) -> io::Result<()> {
        self.inner_writer.flush().await
    }
}
