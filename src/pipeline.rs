//! Single-pass streaming between databases and the object store.
//!
//! Backup: dump stream → SHA-256 + gzip → sealed frames → store upload.
//! Restore: store download → opened frames → gunzip + SHA-256 → target load.
//!
//! The two halves of each direction run concurrently and are joined by a bounded
//! channel of chunks, so at most a few frames are ever held in memory. A failure on the
//! producing side is pushed into the channel as an I/O error, which makes the consumer
//! fail as well instead of seeing a clean (and therefore seemingly complete) end of
//! stream.

use crate::backup::BackupRecord;
use crate::crypto::{EncryptionKey, Opener, Sealer, FLAG_GZIP, MAX_FRAME_PLAINTEXT};
use crate::source::DatabaseTarget;
use crate::store::{ByteReader, ObjectStore};
use crate::{OrchestratorError, Result};
use bytes::Bytes;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::{self, Write};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Chunks buffered between producer and consumer
const CHANNEL_DEPTH: usize = 8;

/// Producing half of a chunk channel
pub type ChunkSender = mpsc::Sender<io::Result<Bytes>>;

/// Bounded chunk channel whose receiving half is an [`AsyncRead`]
pub fn channel() -> (ChunkSender, ByteReader) {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    (tx, Box::pin(StreamReader::new(ReceiverStream::new(rx))))
}

/// Options for sealing
#[derive(Debug, Clone, Copy)]
pub struct SealOptions {
    /// Plaintext bytes read per frame
    pub chunk_size: usize,
    /// Gzip the plaintext before sealing
    pub compress: bool,
}

impl Default for SealOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            compress: true,
        }
    }
}

/// What a pass over the plaintext observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    /// Plaintext bytes
    pub plaintext_bytes: u64,
    /// Hex SHA-256 of the plaintext
    pub checksum: String,
}

/// Hex SHA-256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    hex(&Sha256::digest(data))
}

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Hash a plaintext stream in fixed-size chunks without holding it in memory.
/// Cancellation is checked between chunks.
pub async fn digest_stream<R>(reader: &mut R, chunk_size: usize, cancel: &CancellationToken) -> Result<StreamSummary>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut total: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    Ok(StreamSummary {
        plaintext_bytes: total,
        checksum: hex(&hasher.finalize()),
    })
}

/// Whether `error` only says the other half of a channel went away
pub fn is_closed_pipe(error: &OrchestratorError) -> bool {
    matches!(error, OrchestratorError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe)
}

fn closed_pipe() -> OrchestratorError {
    OrchestratorError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "consumer stopped reading"))
}

async fn send(tx: &ChunkSender, chunk: Vec<u8>) -> Result<()> {
    if chunk.is_empty() {
        return Ok(());
    }
    tx.send(Ok(Bytes::from(chunk))).await.map_err(|_| closed_pipe())
}

async fn fail(tx: &ChunkSender, error: OrchestratorError) -> OrchestratorError {
    let _ = tx
        .send(Err(io::Error::new(io::ErrorKind::Other, error.to_string())))
        .await;
    error
}

/// Fill `buffer` from `reader`, returning fewer bytes only at end of stream
async fn read_chunk<R>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read a plaintext dump, hash it, optionally compress it and push sealed frames
/// into `tx`. Cancellation is checked between chunks.
pub async fn seal_stream(
    source: ByteReader,
    tx: ChunkSender,
    key: &EncryptionKey,
    options: SealOptions,
    cancel: &CancellationToken,
) -> Result<StreamSummary> {
    match seal_inner(source, &tx, key, options, MAX_FRAME_PLAINTEXT, cancel).await {
        Ok(summary) => Ok(summary),
        Err(e) => Err(fail(&tx, e).await),
    }
}

/// Seal `plaintext` as one or more frames of at most `frame_limit` bytes. Gzip output
/// of incompressible input is larger than the chunk that produced it.
async fn send_frames(
    tx: &ChunkSender,
    sealer: &mut Sealer,
    plaintext: &[u8],
    frame_limit: usize,
    last: bool,
) -> Result<()> {
    if plaintext.is_empty() {
        if last {
            send(tx, sealer.seal_frame(&[], true)?).await?;
        }
        return Ok(());
    }
    let mut parts = plaintext.chunks(frame_limit).peekable();
    while let Some(part) = parts.next() {
        let final_part = last && parts.peek().is_none();
        send(tx, sealer.seal_frame(part, final_part)?).await?;
    }
    Ok(())
}

async fn seal_inner(
    mut source: ByteReader,
    tx: &ChunkSender,
    key: &EncryptionKey,
    options: SealOptions,
    frame_limit: usize,
    cancel: &CancellationToken,
) -> Result<StreamSummary> {
    let frame_limit = frame_limit.clamp(1, MAX_FRAME_PLAINTEXT);
    let flags = if options.compress { FLAG_GZIP } else { 0 };
    let mut sealer = Sealer::new(key, flags);
    let mut hasher = Sha256::new();
    let mut encoder = options
        .compress
        .then(|| GzEncoder::new(Vec::new(), Compression::default()));
    let mut buffer = vec![0u8; options.chunk_size.max(1)];
    let mut total: u64 = 0;

    send(tx, sealer.header().to_vec()).await?;

    loop {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let n = read_chunk(&mut source, &mut buffer)
            .await
            .map_err(|e| OrchestratorError::SourceUnavailable(format!("dump stream failed: {}", e)))?;
        if n == 0 {
            break;
        }
        let chunk = &buffer[..n];
        hasher.update(chunk);
        total += n as u64;

        let plaintext = match encoder.as_mut() {
            Some(gz) => {
                gz.write_all(chunk)
                    .map_err(|e| crate::crypto::CryptoError::Compression(e.to_string()))?;
                std::mem::take(gz.get_mut())
            }
            None => chunk.to_vec(),
        };
        send_frames(tx, &mut sealer, &plaintext, frame_limit, false).await?;
    }

    let tail = match encoder {
        Some(gz) => gz
            .finish()
            .map_err(|e| crate::crypto::CryptoError::Compression(e.to_string()))?,
        None => Vec::new(),
    };
    send_frames(tx, &mut sealer, &tail, frame_limit, true).await?;

    let summary = StreamSummary {
        plaintext_bytes: total,
        checksum: hex(&hasher.finalize()),
    };
    debug!(plaintext_bytes = summary.plaintext_bytes, "Sealed dump stream");
    Ok(summary)
}

/// Open a sealed artifact, decompress it and push plaintext chunks into `tx`.
pub async fn open_stream(
    sealed: ByteReader,
    tx: ChunkSender,
    key: &EncryptionKey,
    cancel: &CancellationToken,
) -> Result<StreamSummary> {
    match open_inner(sealed, &tx, key, cancel).await {
        Ok(summary) => Ok(summary),
        Err(e) => Err(fail(&tx, e).await),
    }
}

async fn open_inner(
    mut sealed: ByteReader,
    tx: &ChunkSender,
    key: &EncryptionKey,
    cancel: &CancellationToken,
) -> Result<StreamSummary> {
    let mut opener = Opener::read_header(key, &mut sealed).await?;
    let mut decoder = (opener.flags() & FLAG_GZIP != 0).then(|| GzDecoder::new(Vec::new()));
    let mut hasher = Sha256::new();
    let mut total: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        let frame = match opener.next_frame(&mut sealed).await? {
            Some(frame) => frame,
            None => break,
        };

        let plaintext = match decoder.as_mut() {
            Some(gz) => {
                gz.write_all(&frame)
                    .map_err(|e| crate::crypto::CryptoError::Compression(e.to_string()))?;
                std::mem::take(gz.get_mut())
            }
            None => frame,
        };
        hasher.update(&plaintext);
        total += plaintext.len() as u64;
        send(tx, plaintext).await?;
    }

    if let Some(gz) = decoder {
        let tail = gz
            .finish()
            .map_err(|e| crate::crypto::CryptoError::Compression(e.to_string()))?;
        hasher.update(&tail);
        total += tail.len() as u64;
        send(tx, tail).await?;
    }

    Ok(StreamSummary {
        plaintext_bytes: total,
        checksum: hex(&hasher.finalize()),
    })
}

/// Download `record`, open it and load it into `target`, checking the plaintext
/// checksum on the way. Shared by verification and disaster recovery so both exercise
/// the same restore path.
pub async fn restore_into<T>(
    store: &dyn ObjectStore,
    record: &BackupRecord,
    key: &EncryptionKey,
    target: &T,
    cancel: &CancellationToken,
) -> Result<StreamSummary>
where
    T: DatabaseTarget + ?Sized,
{
    let (sealed, _) = store.get(&record.key).await?;
    let (tx, plaintext) = channel();

    let (opened, loaded) = tokio::join!(open_stream(sealed, tx, key, cancel), target.restore(plaintext));

    let summary = match (opened, loaded) {
        (Err(open_err), Err(load_err)) if is_closed_pipe(&open_err) => return Err(load_err),
        (Err(open_err), _) => return Err(open_err),
        (Ok(_), Err(load_err)) => return Err(load_err),
        (Ok(summary), Ok(())) => summary,
    };

    if summary.checksum != record.checksum {
        return Err(OrchestratorError::Integrity(format!(
            "checksum mismatch for {}: recorded {}, restored {}",
            record.key, record.checksum, summary.checksum
        )));
    }
    if summary.plaintext_bytes != record.size_bytes {
        return Err(OrchestratorError::Integrity(format!(
            "size mismatch for {}: recorded {}, restored {}",
            record.key, record.size_bytes, summary.plaintext_bytes
        )));
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::reader_from_bytes;

    async fn seal(data: &[u8], options: SealOptions) -> (Vec<u8>, StreamSummary) {
        let (tx, mut sealed) = channel();
        let key = EncryptionKey::from_bytes([9u8; 32]);
        let cancel = CancellationToken::new();
        let source = reader_from_bytes(data.to_vec());

        let (summary, collected) = tokio::join!(seal_stream(source, tx, &key, options, &cancel), async move {
            let mut out = Vec::new();
            sealed.read_to_end(&mut out).await.map(|_| out)
        });
        (collected.unwrap(), summary.unwrap())
    }

    async fn open(sealed: Vec<u8>) -> Result<(Vec<u8>, StreamSummary)> {
        let (tx, mut plaintext) = channel();
        let key = EncryptionKey::from_bytes([9u8; 32]);
        let cancel = CancellationToken::new();

        let (summary, collected) = tokio::join!(open_stream(reader_from_bytes(sealed), tx, &key, &cancel), async move {
            let mut out = Vec::new();
            plaintext.read_to_end(&mut out).await.map(|_| out)
        });
        let summary = summary?;
        Ok((collected?, summary))
    }

    #[tokio::test]
    async fn test_seal_then_open_with_compression() {
        let data: Vec<u8> = (0..50_000u32).flat_map(|i| (i % 251).to_le_bytes()).collect();
        let options = SealOptions {
            chunk_size: 4096,
            compress: true,
        };

        let (sealed, sealed_summary) = seal(&data, options).await;
        assert_eq!(sealed_summary.plaintext_bytes, data.len() as u64);
        assert_eq!(sealed_summary.checksum, sha256_hex(&data));

        let (opened, opened_summary) = open(sealed).await.expect("opens");
        assert_eq!(opened, data);
        assert_eq!(opened_summary, sealed_summary);
    }

    fn incompressible(len: usize) -> Vec<u8> {
        let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    fn frame_lengths(sealed: &[u8]) -> Vec<usize> {
        let mut lengths = Vec::new();
        let mut at = crate::crypto::HEADER_LEN;
        while at < sealed.len() {
            let mut length = [0u8; 4];
            length.copy_from_slice(&sealed[at..at + 4]);
            let length = u32::from_be_bytes(length) as usize;
            lengths.push(length - 16);
            at += 4 + length;
        }
        lengths
    }

    #[tokio::test]
    async fn test_compressed_output_larger_than_frame_limit_is_split() {
        let data = incompressible(40_000);
        let options = SealOptions {
            chunk_size: 8192,
            compress: true,
        };
        let limit = 1024;

        let (tx, mut sealed) = channel();
        let key = EncryptionKey::from_bytes([9u8; 32]);
        let cancel = CancellationToken::new();
        let source = reader_from_bytes(data.clone());
        let sealing = async move { seal_inner(source, &tx, &key, options, limit, &cancel).await };
        let (summary, collected) = tokio::join!(sealing, async move {
            let mut out = Vec::new();
            sealed.read_to_end(&mut out).await.map(|_| out)
        });
        let summary = summary.unwrap();
        let sealed = collected.unwrap();

        let lengths = frame_lengths(&sealed);
        assert!(lengths.len() > data.len() / limit);
        assert!(lengths.iter().all(|&len| len <= limit));

        let (opened, opened_summary) = open(sealed).await.expect("opens");
        assert_eq!(opened, data);
        assert_eq!(opened_summary, summary);
    }

    #[tokio::test]
    async fn test_digest_stream_matches_whole_buffer_hash() {
        let data = incompressible(100_003);
        let mut reader = reader_from_bytes(data.clone());
        let summary = digest_stream(&mut reader, 4096, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.checksum, sha256_hex(&data));
        assert_eq!(summary.plaintext_bytes, data.len() as u64);
    }

    #[tokio::test]
    async fn test_empty_dump_without_compression() {
        let options = SealOptions {
            chunk_size: 16,
            compress: false,
        };
        let (sealed, summary) = seal(b"", options).await;
        assert_eq!(summary.plaintext_bytes, 0);

        let (opened, _) = open(sealed).await.expect("opens");
        assert!(opened.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_artifact_fails_the_consumer() {
        let (mut sealed, _) = seal(b"some documents", SealOptions::default()).await;
        let middle = sealed.len() / 2;
        sealed[middle] ^= 0xff;

        let (tx, mut plaintext) = channel();
        let key = EncryptionKey::from_bytes([9u8; 32]);
        let cancel = CancellationToken::new();
        let (opened, consumed) = tokio::join!(open_stream(reader_from_bytes(sealed), tx, &key, &cancel), async move {
            let mut out = Vec::new();
            plaintext.read_to_end(&mut out).await
        });

        assert!(opened.is_err());
        // The consumer sees an error, not a clean end of stream
        assert!(consumed.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_seal_stops() {
        let (tx, _rx) = channel();
        let key = EncryptionKey::from_bytes([9u8; 32]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = seal_stream(reader_from_bytes(vec![1u8; 100]), tx, &key, SealOptions::default(), &cancel).await;
        assert!(matches!(result, Err(OrchestratorError::Cancelled)));
    }
}
