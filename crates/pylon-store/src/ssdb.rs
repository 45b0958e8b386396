//! SSDB client
//!
//! Speaks the SSDB block protocol over TCP: a packet is a sequence of
//! `<length>\n<data>\n` blocks terminated by an empty line, and a response
//! carries a status block first (`ok`, `not_found`, or an error name).

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{KvStore, StoreError};

/// Client for an SSDB server. One TCP connection per request.
#[derive(Debug, Clone)]
pub struct SsdbStore {
    addr: String,
}

impl SsdbStore {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    async fn request(&self, args: &[&str]) -> Result<Vec<String>, StoreError> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        stream.write_all(&encode_packet(args)).await?;

        let mut buf = BytesMut::with_capacity(4096);
        loop {
            if let Some(blocks) = parse_packet(&buf)? {
                debug!(command = args[0], blocks = blocks.len(), "SSDB response");
                return Ok(blocks);
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(StoreError::Protocol(
                    "connection closed mid-response".to_string(),
                ));
            }
        }
    }
}

#[async_trait]
impl KvStore for SsdbStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut blocks = self.request(&["get", key]).await?;
        match blocks.first().map(String::as_str) {
            Some("ok") => {
                if blocks.len() < 2 {
                    return Err(StoreError::Protocol(
                        "get response has no value".to_string(),
                    ));
                }
                Ok(Some(blocks.swap_remove(1)))
            }
            Some("not_found") => Ok(None),
            Some(status) => Err(StoreError::Request(status.to_string())),
            None => Err(StoreError::Protocol("empty response".to_string())),
        }
    }

    async fn scan_hash(
        &self,
        key: &str,
        field_start: &str,
        field_end: &str,
        limit: u64,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let limit = limit.to_string();
        let blocks = self
            .request(&["hscan", key, field_start, field_end, &limit])
            .await?;

        match blocks.first().map(String::as_str) {
            Some("ok") => {
                // Status block plus field/value pairs.
                if blocks.len() % 2 == 0 {
                    return Err(StoreError::Protocol(
                        "hscan returned a dangling field".to_string(),
                    ));
                }
                let mut pairs = Vec::with_capacity((blocks.len() - 1) / 2);
                let mut rest = blocks.into_iter().skip(1);
                while let (Some(field), Some(value)) = (rest.next(), rest.next()) {
                    pairs.push((field, value));
                }
                Ok(pairs)
            }
            Some("not_found") => Ok(Vec::new()),
            Some(status) => Err(StoreError::Request(status.to_string())),
            None => Err(StoreError::Protocol("empty response".to_string())),
        }
    }
}

fn encode_packet(args: &[&str]) -> BytesMut {
    let mut packet = BytesMut::new();
    for arg in args {
        packet.put_slice(arg.len().to_string().as_bytes());
        packet.put_u8(b'\n');
        packet.put_slice(arg.as_bytes());
        packet.put_u8(b'\n');
    }
    packet.put_u8(b'\n');
    packet
}

/// Parse one packet out of `buf`. Returns `Ok(None)` while the packet is
/// still incomplete.
fn parse_packet(buf: &[u8]) -> Result<Option<Vec<String>>, StoreError> {
    let mut blocks = Vec::new();
    let mut pos = 0;

    loop {
        let line_end = match buf[pos..].iter().position(|&b| b == b'\n') {
            Some(offset) => pos + offset,
            None => return Ok(None),
        };

        let line = &buf[pos..line_end];
        if line.is_empty() || line == b"\r" {
            return Ok(Some(blocks));
        }

        let length: usize = std::str::from_utf8(line)
            .ok()
            .and_then(|text| text.trim_end_matches('\r').parse().ok())
            .ok_or_else(|| {
                StoreError::Protocol(format!("bad block length: {:?}", String::from_utf8_lossy(line)))
            })?;

        let data_start = line_end + 1;
        if buf.len() < data_start + length + 1 {
            return Ok(None);
        }
        if buf[data_start + length] != b'\n' {
            return Err(StoreError::Protocol(
                "missing block terminator".to_string(),
            ));
        }

        blocks.push(String::from_utf8_lossy(&buf[data_start..data_start + length]).into_owned());
        pos = data_start + length + 1;
    }
}
