//! Framed streaming AEAD.
//!
//! Layout: `header || frame*`, where the header is
//! `magic (4) || version (1) || flags (1) || nonce prefix (19)` and every frame is
//! `ciphertext length (u32 BE) || ciphertext+tag`. Frame `i` is sealed with the nonce
//! `prefix || i (u32 BE) || last (1)` and the header as associated data, so reordered,
//! dropped or appended frames fail to open.

use super::{CryptoError, EncryptionKey};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt};

const MAGIC: &[u8; 4] = b"TBK1";
const VERSION: u8 = 1;
const PREFIX_LEN: usize = 19;
const TAG_LEN: usize = 16;

/// Serialized header size
pub const HEADER_LEN: usize = 4 + 1 + 1 + PREFIX_LEN;

/// Largest plaintext accepted in a single frame
pub const MAX_FRAME_PLAINTEXT: usize = 16 * 1024 * 1024;

/// Header flag: frame plaintext is gzip-compressed
pub const FLAG_GZIP: u8 = 0b0000_0001;

fn frame_nonce(prefix: &[u8; PREFIX_LEN], counter: u32, last: bool) -> XNonce {
    let mut nonce = [0u8; 24];
    nonce[..PREFIX_LEN].copy_from_slice(prefix);
    nonce[PREFIX_LEN..PREFIX_LEN + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[23] = u8::from(last);
    *XNonce::from_slice(&nonce)
}

/// Produces the header and sealed frames of one envelope
pub struct Sealer {
    cipher: XChaCha20Poly1305,
    header: [u8; HEADER_LEN],
    prefix: [u8; PREFIX_LEN],
    counter: u32,
    finished: bool,
}

impl Sealer {
    /// Start an envelope with a fresh random nonce prefix
    pub fn new(key: &EncryptionKey, flags: u8) -> Self {
        let mut prefix = [0u8; PREFIX_LEN];
        rand::thread_rng().fill_bytes(&mut prefix);

        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(MAGIC);
        header[4] = VERSION;
        header[5] = flags;
        header[6..].copy_from_slice(&prefix);

        Self {
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
            header,
            prefix,
            counter: 0,
            finished: false,
        }
    }

    /// Header bytes; must be written before the first frame
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Seal one frame, returning the length-prefixed ciphertext
    pub fn seal_frame(&mut self, plaintext: &[u8], last: bool) -> Result<Vec<u8>, CryptoError> {
        if self.finished {
            return Err(CryptoError::TrailingData);
        }
        if plaintext.len() > MAX_FRAME_PLAINTEXT {
            return Err(CryptoError::Compression(format!(
                "frame of {} bytes exceeds {}",
                plaintext.len(),
                MAX_FRAME_PLAINTEXT
            )));
        }

        let nonce = frame_nonce(&self.prefix, self.counter, last);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &self.header,
                },
            )
            .map_err(|_| CryptoError::Authentication("seal failed".to_string()))?;

        self.counter = self.counter.checked_add(1).ok_or(CryptoError::FrameLimit)?;
        self.finished = last;

        let mut frame = Vec::with_capacity(4 + ciphertext.len());
        frame.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }
}

/// Reads and authenticates frames from an envelope stream
pub struct Opener {
    cipher: XChaCha20Poly1305,
    header: [u8; HEADER_LEN],
    prefix: [u8; PREFIX_LEN],
    counter: u32,
    finished: bool,
}

fn map_eof(e: std::io::Error) -> CryptoError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CryptoError::Truncated
    } else {
        CryptoError::BadHeader(e.to_string())
    }
}

impl Opener {
    /// Read and check the header
    pub async fn read_header<R>(key: &EncryptionKey, reader: &mut R) -> Result<Self, CryptoError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await.map_err(map_eof)?;

        if &header[..4] != MAGIC {
            return Err(CryptoError::BadHeader("magic mismatch".to_string()));
        }
        if header[4] != VERSION {
            return Err(CryptoError::BadHeader(format!("unsupported version {}", header[4])));
        }

        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&header[6..]);

        Ok(Self {
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
            header,
            prefix,
            counter: 0,
            finished: false,
        })
    }

    /// Header flags
    pub fn flags(&self) -> u8 {
        self.header[5]
    }

    /// Next plaintext frame, or `None` once the final frame was consumed and the
    /// stream is verified to end there.
    pub async fn next_frame<R>(&mut self, reader: &mut R) -> Result<Option<Vec<u8>>, CryptoError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if self.finished {
            let mut lookahead = [0u8; 1];
            let n = reader
                .read(&mut lookahead)
                .await
                .map_err(|e| CryptoError::BadHeader(e.to_string()))?;
            return if n == 0 { Ok(None) } else { Err(CryptoError::TrailingData) };
        }

        let mut length = [0u8; 4];
        reader.read_exact(&mut length).await.map_err(map_eof)?;
        let length = u32::from_be_bytes(length) as usize;
        if !(TAG_LEN..=MAX_FRAME_PLAINTEXT + TAG_LEN).contains(&length) {
            return Err(CryptoError::Authentication(format!("implausible frame length {}", length)));
        }

        let mut ciphertext = vec![0u8; length];
        reader.read_exact(&mut ciphertext).await.map_err(map_eof)?;

        // Try as a middle frame first, then as the final one
        let middle = frame_nonce(&self.prefix, self.counter, false);
        let payload = Payload {
            msg: &ciphertext,
            aad: &self.header,
        };
        let plaintext = match self.cipher.decrypt(&middle, payload) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                let last = frame_nonce(&self.prefix, self.counter, true);
                let payload = Payload {
                    msg: &ciphertext,
                    aad: &self.header,
                };
                let plaintext = self
                    .cipher
                    .decrypt(&last, payload)
                    .map_err(|_| CryptoError::Authentication(format!("frame {} rejected", self.counter)))?;
                self.finished = true;
                plaintext
            }
        };

        self.counter = self.counter.checked_add(1).ok_or(CryptoError::FrameLimit)?;
        Ok(Some(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> EncryptionKey {
        EncryptionKey::from_bytes([42u8; 32])
    }

    fn seal_all(chunks: &[&[u8]]) -> Vec<u8> {
        let mut sealer = Sealer::new(&key(), 0);
        let mut out = sealer.header().to_vec();
        for (i, chunk) in chunks.iter().enumerate() {
            out.extend(sealer.seal_frame(chunk, i + 1 == chunks.len()).unwrap());
        }
        out
    }

    async fn open_all(data: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CryptoError> {
        let mut reader = data;
        let mut opener = Opener::read_header(key, &mut reader).await?;
        let mut out = Vec::new();
        while let Some(frame) = opener.next_frame(&mut reader).await? {
            out.extend(frame);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_envelope_opens_with_same_key() {
        let sealed = seal_all(&[&b"hello "[..], &b"world"[..], &b""[..]]);
        let opened = open_all(&sealed, &key()).await.expect("open");
        assert_eq!(opened, b"hello world");
    }

    #[tokio::test]
    async fn test_wrong_key_is_rejected() {
        let sealed = seal_all(&[&b"secret"[..]]);
        let other = EncryptionKey::from_bytes([1u8; 32]);
        assert!(matches!(open_all(&sealed, &other).await, Err(CryptoError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_truncation_is_detected() {
        let sealed = seal_all(&[&b"first frame"[..], &b"second frame"[..]]);
        // Drop the final frame entirely: 4-byte length + 12 bytes + 16-byte tag
        let cut = sealed.len() - (4 + 12 + 16);
        assert!(matches!(open_all(&sealed[..cut], &key()).await, Err(CryptoError::Truncated)));
    }

    #[tokio::test]
    async fn test_trailing_data_is_detected() {
        let mut sealed = seal_all(&[&b"only"[..]]);
        sealed.extend_from_slice(b"junk");
        assert!(matches!(open_all(&sealed, &key()).await, Err(CryptoError::TrailingData)));
    }

    #[tokio::test]
    async fn test_bit_flip_is_detected() {
        let mut sealed = seal_all(&[&b"payload bytes"[..]]);
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(open_all(&sealed, &key()).await, Err(CryptoError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_bad_magic() {
        let mut sealed = seal_all(&[&b"x"[..]]);
        sealed[0] = b'X';
        assert!(matches!(open_all(&sealed, &key()).await, Err(CryptoError::BadHeader(_))));
    }
}
