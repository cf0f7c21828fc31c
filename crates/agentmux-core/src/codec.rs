//! CBOR record codec for the shared transport.
//!
//! Wire format: CBOR items written back to back, no length prefix. The
//! decoder buffers incoming bytes and yields a record as soon as one complete
//! item is available; a truncated item simply waits for more bytes.

use std::io::{self, Cursor};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MuxError, MuxResult};
use crate::messages::Packet;

/// Read size used when pulling bytes off the transport.
const READ_CHUNK: usize = 16 * 1024;

/// Encode a serializable value into a standalone CBOR record.
pub fn encode_record<T: serde::Serialize>(value: &T) -> MuxResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    Ok(buf)
}

/// Decode a complete CBOR record into a typed value.
pub fn decode_record<T: serde::de::DeserializeOwned>(data: &[u8]) -> MuxResult<T> {
    let value: T = ciborium::from_reader(Cursor::new(data))?;
    Ok(value)
}

/// Streaming record decoder: accumulates bytes and yields complete records.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    buffer: Vec<u8>,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Append raw bytes read from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next record.
    ///
    /// Returns `Ok(None)` when the buffer holds no complete record yet. Only
    /// item headers are inspected until the whole record has arrived, so a
    /// large record costs one full decode no matter how it was split. Any
    /// decode failure is returned as an error and leaves the buffer untouched.
    pub fn next_record<T: serde::de::DeserializeOwned>(&mut self) -> MuxResult<Option<T>> {
        let Some(len) = complete_item_len(&self.buffer)? else {
            return Ok(None);
        };

        let mut cursor = Cursor::new(&self.buffer[..len]);
        match ciborium::from_reader::<T, _>(&mut cursor) {
            Ok(record) => {
                let consumed = cursor.position() as usize;
                self.buffer.drain(..consumed);
                Ok(Some(record))
            }
            Err(ciborium::de::Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Err(
                MuxError::Codec("record shorter than its declared length".into()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of buffered bytes not yet consumed by a record.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Length of the first complete CBOR item in `buf`, or `None` while bytes are
/// still missing.
///
/// Walks item heads only: byte and text strings are skipped by their declared
/// length, containers push the number of items still expected.
fn complete_item_len(buf: &[u8]) -> MuxResult<Option<usize>> {
    let malformed = || MuxError::Codec("malformed CBOR item header".into());

    // Items still expected per open container; `None` is indefinite length.
    let mut open: Vec<Option<u64>> = vec![Some(1)];
    let mut pos = 0usize;

    loop {
        while matches!(open.last(), Some(Some(0))) {
            open.pop();
        }
        if open.is_empty() {
            return Ok(Some(pos));
        }

        let Some(&initial) = buf.get(pos) else {
            return Ok(None);
        };
        pos += 1;

        if initial == 0xff {
            if open.last() == Some(&None) {
                open.pop();
                continue;
            }
            return Err(malformed());
        }
        if let Some(Some(n)) = open.last_mut() {
            *n -= 1;
        }

        let major = initial >> 5;
        let arg = match initial & 0x1f {
            info @ 0..=23 => Some(u64::from(info)),
            info @ 24..=27 => {
                let size = 1usize << (info - 24);
                let Some(bytes) = buf.get(pos..pos + size) else {
                    return Ok(None);
                };
                pos += size;
                Some(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
            }
            31 => None,
            _ => return Err(malformed()),
        };

        match (major, arg) {
            // Integers, simple values and floats: the head is the whole item.
            (0 | 1 | 7, Some(_)) => {}
            (2 | 3, Some(len)) => {
                let end = usize::try_from(len)
                    .ok()
                    .and_then(|len| pos.checked_add(len))
                    .ok_or_else(malformed)?;
                if buf.len() < end {
                    return Ok(None);
                }
                pos = end;
            }
            // Indefinite strings are a run of definite chunks up to a break.
            (2 | 3, None) => open.push(None),
            (4, count) => open.push(count),
            (5, Some(pairs)) => open.push(Some(pairs.checked_mul(2).ok_or_else(malformed)?)),
            (5, None) => open.push(None),
            (6, Some(_)) => open.push(Some(1)),
            _ => return Err(malformed()),
        }
    }
}

/// Decode half of the shared transport.
pub struct PacketReader<R> {
    inner: R,
    decoder: RecordDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: RecordDecoder::new(),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    /// Wait for the next complete packet.
    ///
    /// End of stream on a record boundary is a [`MuxError::Transport`]; end of
    /// stream in the middle of a record is a [`MuxError::Codec`].
    pub async fn read_packet(&mut self) -> MuxResult<Packet> {
        loop {
            if let Some(packet) = self.decoder.next_record::<Packet>()? {
                return Ok(packet);
            }

            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.pending() == 0 {
                    return Err(MuxError::Transport("peer closed the stream".into()));
                }
                return Err(MuxError::Codec(format!(
                    "stream ended with {} bytes of an incomplete record",
                    self.decoder.pending()
                )));
            }
            self.decoder.feed(&self.chunk[..n]);
        }
    }
}

/// Encode half of the shared transport.
///
/// Each packet is serialized in full before touching the stream, so one call
/// writes exactly one record.
pub struct PacketWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> MuxResult<()> {
        let record = encode_record(packet)?;
        self.inner.write_all(&record).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
