//! Streaming copy pipeline between source trees and the encrypted archive.
//!
//! Sealed files are `MAGIC` and a random per-stream salt, followed by
//! ChaCha20-Poly1305 frames, one per `SEGMENT_LEN` bytes of gzip output. Writing always goes through
//! `GzEncoder<SealWriter<_>>` and reading through `GzDecoder<OpenReader<_>>`,
//! so compression sits inside encryption in both directions.
//!
//! All file outputs are written to a temporary file next to the destination
//! and renamed into place once complete.

use crate::crypto::{self, Encryptor, KeyMaterial, SALT_LEN, TAG_LEN};
use crate::types::Direction;
use crate::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

const MAGIC: &[u8; 4] = b"CSX1";
const HEADER_LEN: usize = MAGIC.len() + SALT_LEN;
pub const SEGMENT_LEN: usize = 64 * 1024;
const FRAME_LEN: usize = SEGMENT_LEN + TAG_LEN;

/// Crypto failure carried through `std::io` plumbing.
#[derive(Debug)]
struct SealError(String);

impl fmt::Display for SealError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SealError {}

fn into_io(err: Error) -> io::Error {
    match err {
        Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, SealError(other.to_string())),
    }
}

fn from_io(err: io::Error) -> Error {
    let crypto = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<SealError>())
        .map(|seal| seal.0.clone());
    match crypto {
        Some(msg) => Error::CryptoFailure(msg),
        None => Error::Io(err),
    }
}

/// Buffers plaintext into segments and writes each one sealed.
pub struct SealWriter<W: Write> {
    inner: W,
    encryptor: Encryptor,
    buffer: Vec<u8>,
    index: u64,
}

impl<W: Write> SealWriter<W> {
    pub fn new(mut inner: W, key: &KeyMaterial) -> Result<Self> {
        let salt = crypto::stream_salt()?;
        let encryptor = Encryptor::new(key, &salt)?;
        inner.write_all(MAGIC)?;
        inner.write_all(&salt)?;
        Ok(Self {
            inner,
            encryptor,
            buffer: Vec::with_capacity(SEGMENT_LEN),
            index: 0,
        })
    }

    fn emit(&mut self, last: bool) -> io::Result<()> {
        let sealed = self
            .encryptor
            .seal_segment(self.index, last, &self.buffer)
            .map_err(into_io)?;
        self.inner.write_all(&sealed)?;
        self.buffer.clear();
        self.index += 1;
        Ok(())
    }

    /// Seals the final segment (possibly empty) and returns the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.emit(true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for SealWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // A full buffer is only sealed once more data shows it is not the last one.
        if self.buffer.len() == SEGMENT_LEN {
            self.emit(false)?;
        }
        let n = (SEGMENT_LEN - self.buffer.len()).min(buf.len());
        self.buffer.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reads and authenticates sealed frames, yielding plaintext.
pub struct OpenReader<R: Read> {
    inner: R,
    encryptor: Encryptor,
    plain: Vec<u8>,
    pos: usize,
    index: u64,
    carry: Option<u8>,
    finished: bool,
}

impl<R: Read> OpenReader<R> {
    pub fn new(mut inner: R, key: &KeyMaterial) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        match inner.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(Error::CryptoFailure("not a sealed stream: too short".to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        let (magic, salt) = header.split_at(MAGIC.len());
        if magic != MAGIC {
            return Err(Error::CryptoFailure("not a sealed stream: bad header".to_string()));
        }
        let mut stream_salt = [0u8; SALT_LEN];
        stream_salt.copy_from_slice(salt);
        let encryptor = Encryptor::new(key, &stream_salt)?;
        Ok(Self {
            inner,
            encryptor,
            plain: Vec::new(),
            pos: 0,
            index: 0,
            carry: None,
            finished: false,
        })
    }

    fn next_segment(&mut self) -> io::Result<()> {
        let mut frame = Vec::with_capacity(FRAME_LEN);
        if let Some(b) = self.carry.take() {
            frame.push(b);
        }
        let want = (FRAME_LEN - frame.len()) as u64;
        self.inner.by_ref().take(want).read_to_end(&mut frame)?;

        let last = if frame.len() < FRAME_LEN {
            true
        } else {
            let mut probe = [0u8; 1];
            loop {
                match self.inner.read(&mut probe) {
                    Ok(0) => break true,
                    Ok(_) => {
                        self.carry = Some(probe[0]);
                        break false;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        };

        if frame.is_empty() {
            return Err(into_io(Error::CryptoFailure(
                "sealed stream truncated: final segment missing".to_string(),
            )));
        }

        self.plain = self
            .encryptor
            .open_segment(self.index, last, &frame)
            .map_err(into_io)?;
        self.pos = 0;
        self.index += 1;
        self.finished = last;
        Ok(())
    }
}

impl<R: Read> Read for OpenReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.plain.len() {
            if self.finished {
                return Ok(0);
            }
            self.next_segment()?;
        }
        let n = (self.plain.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Copies `source` to `destination`, sealing or opening it when a key is given.
///
/// Without a key this is a plain copy regardless of `direction`.
/// Returns the number of plaintext bytes moved.
pub fn copy(
    source: &Path,
    destination: &Path,
    key: Option<&KeyMaterial>,
    direction: Direction,
) -> Result<u64> {
    match (key, direction) {
        (None, _) => plain_copy(source, destination),
        (Some(key), Direction::Encrypt) => encrypt_copy(source, destination, key),
        (Some(key), Direction::Decrypt) => decrypt_copy(source, destination, key),
    }
}

pub fn encrypt_copy(source: &Path, destination: &Path, key: &KeyMaterial) -> Result<u64> {
    let mut input = BufReader::new(File::open(source)?);
    write_atomically(destination, |out| {
        let mut gz = GzEncoder::new(SealWriter::new(out, key)?, Compression::default());
        let n = io::copy(&mut input, &mut gz).map_err(from_io)?;
        gz.finish().and_then(SealWriter::finish).map_err(from_io)?;
        Ok(n)
    })
}

pub fn decrypt_copy(source: &Path, destination: &Path, key: &KeyMaterial) -> Result<u64> {
    let input = BufReader::new(File::open(source)?);
    let mut gz = GzDecoder::new(OpenReader::new(input, key)?);
    write_atomically(destination, |out| io::copy(&mut gz, out).map_err(from_io))
}

/// Byte-for-byte copy keeping permissions and modification time.
pub fn plain_copy(source: &Path, destination: &Path) -> Result<u64> {
    let modified = fs::metadata(source)?.modified()?;
    let temp = NamedTempFile::new_in(parent_dir(destination))?;
    let n = fs::copy(source, temp.path())?;
    temp.as_file().set_modified(modified)?;
    temp.persist(destination).map_err(|e| Error::Io(e.error))?;
    Ok(n)
}

pub fn write_encrypted_text(data: &str, destination: &Path, key: &KeyMaterial) -> Result<()> {
    write_atomically(destination, |out| {
        let mut gz = GzEncoder::new(SealWriter::new(out, key)?, Compression::default());
        gz.write_all(data.as_bytes()).map_err(from_io)?;
        gz.finish().and_then(SealWriter::finish).map_err(from_io)?;
        Ok(data.len() as u64)
    })?;
    Ok(())
}

pub fn read_encrypted_text(source: &Path, key: &KeyMaterial) -> Result<String> {
    let input = BufReader::new(File::open(source)?);
    let mut text = String::new();
    GzDecoder::new(OpenReader::new(input, key)?)
        .read_to_string(&mut text)
        .map_err(from_io)?;
    Ok(text)
}

pub(crate) fn write_plain_text(data: &str, destination: &Path) -> Result<()> {
    write_atomically(destination, |out| {
        out.write_all(data.as_bytes())?;
        Ok(data.len() as u64)
    })?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
}

fn write_atomically<F>(destination: &Path, write: F) -> Result<u64>
where
    F: FnOnce(&mut dyn Write) -> Result<u64>,
{
    let mut temp = NamedTempFile::new_in(parent_dir(destination))?;
    let written = {
        let mut out = BufWriter::new(temp.as_file_mut());
        let n = write(&mut out)?;
        out.flush()?;
        n
    };
    temp.as_file().sync_all()?;
    temp.persist(destination).map_err(|e| Error::Io(e.error))?;
    Ok(written)
}

/// Runs blocking file work on tokio's blocking pool inside the caller's span.
pub(crate) async fn run_blocking<F, T>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let span = tracing::Span::current();
    tokio::task::spawn_blocking(move || span.in_scope(work))
        .await
        .map_err(|e| Error::Other(format!("blocking task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn sample(len: usize) -> Vec<u8> {
        // Mildly compressible but not constant.
        (0..len).map(|i| ((i * 31) ^ (i >> 7)) as u8).collect()
    }

    fn roundtrip(len: usize) {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyMaterial::generate().unwrap();
        let src = dir.path().join("plain.bin");
        let sealed = dir.path().join("sealed.aes");
        let restored = dir.path().join("restored.bin");
        let data = sample(len);
        fs::write(&src, &data).unwrap();

        let n = copy(&src, &sealed, Some(&key), Direction::Encrypt).unwrap();
        assert_eq!(n, len as u64);
        assert_ne!(fs::read(&sealed).unwrap(), data);

        copy(&sealed, &restored, Some(&key), Direction::Decrypt).unwrap();
        assert_eq!(fs::read(&restored).unwrap(), data, "length {}", len);
    }

    #[test]
    fn test_roundtrip_sizes() {
        for len in [0, 1, 4096, SEGMENT_LEN - 1, SEGMENT_LEN, SEGMENT_LEN * 3 + 17] {
            roundtrip(len);
        }
    }

    #[test]
    fn test_incompressible_data_spans_segments() {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyMaterial::generate().unwrap();
        let src = dir.path().join("random.bin");
        let sealed = dir.path().join("random.aes");
        let restored = dir.path().join("random.out");
        let mut data = vec![0u8; SEGMENT_LEN * 2 + 100];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut data);
        fs::write(&src, &data).unwrap();

        encrypt_copy(&src, &sealed, &key).unwrap();
        assert!(fs::metadata(&sealed).unwrap().len() > (SEGMENT_LEN * 2) as u64);
        decrypt_copy(&sealed, &restored, &key).unwrap();
        assert_eq!(fs::read(&restored).unwrap(), data);
    }

    #[test]
    fn test_tampered_stream_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyMaterial::generate().unwrap();
        let src = dir.path().join("a");
        let sealed = dir.path().join("a.aes");
        fs::write(&src, sample(10_000)).unwrap();
        encrypt_copy(&src, &sealed, &key).unwrap();

        let mut bytes = fs::read(&sealed).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        fs::write(&sealed, &bytes).unwrap();

        let err = decrypt_copy(&sealed, &dir.path().join("out"), &key).unwrap_err();
        assert!(matches!(err, Error::CryptoFailure(_)), "{:?}", err);
    }

    #[test]
    fn test_dropped_final_frame_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyMaterial::generate().unwrap();
        let src = dir.path().join("big");
        let sealed = dir.path().join("big.aes");
        let mut data = vec![0u8; SEGMENT_LEN * 2 + 10];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut data);
        fs::write(&src, &data).unwrap();
        encrypt_copy(&src, &sealed, &key).unwrap();

        let bytes = fs::read(&sealed).unwrap();
        let whole_frames = HEADER_LEN + 2 * FRAME_LEN;
        assert!(bytes.len() > whole_frames);
        fs::write(&sealed, &bytes[..whole_frames]).unwrap();

        let err = decrypt_copy(&sealed, &dir.path().join("out"), &key).unwrap_err();
        assert!(matches!(err, Error::CryptoFailure(_)), "{:?}", err);
    }

    #[test]
    fn test_wrong_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyMaterial::generate().unwrap();
        let other = KeyMaterial::generate().unwrap();
        let sealed = dir.path().join("index");
        write_encrypted_text("[]", &sealed, &key).unwrap();

        assert_eq!(read_encrypted_text(&sealed, &key).unwrap(), "[]");
        assert!(matches!(
            read_encrypted_text(&sealed, &other),
            Err(Error::CryptoFailure(_))
        ));
    }

    #[test]
    fn test_each_blob_gets_its_own_salt() {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyMaterial::generate().unwrap();
        let src = dir.path().join("same");
        fs::write(&src, b"identical contents in two blobs").unwrap();
        encrypt_copy(&src, &dir.path().join("one.aes"), &key).unwrap();
        encrypt_copy(&src, &dir.path().join("two.aes"), &key).unwrap();

        let one = fs::read(dir.path().join("one.aes")).unwrap();
        let two = fs::read(dir.path().join("two.aes")).unwrap();
        assert_eq!(one.len(), two.len());
        assert_ne!(one[MAGIC.len()..HEADER_LEN], two[MAGIC.len()..HEADER_LEN]);
        assert_ne!(one[HEADER_LEN..], two[HEADER_LEN..]);

        let out = dir.path().join("out");
        decrypt_copy(&dir.path().join("two.aes"), &out, &key).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"identical contents in two blobs");
    }

    #[test]
    fn test_plain_file_is_not_a_sealed_stream() {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyMaterial::generate().unwrap();
        let path = dir.path().join("plain.json");
        fs::write(&path, "[]").unwrap();
        assert!(matches!(
            read_encrypted_text(&path, &key),
            Err(Error::CryptoFailure(_))
        ));
    }

    #[test]
    fn test_plain_copy_preserves_mtime_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        fs::write(&src, b"fresh contents").unwrap();
        fs::write(&dst, b"stale").unwrap();
        let old = SystemTime::now() - Duration::from_secs(3600);
        File::options().write(true).open(&src).unwrap().set_modified(old).unwrap();

        copy(&src, &dst, None, Direction::Encrypt).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"fresh contents");
        let copied = fs::metadata(&dst).unwrap().modified().unwrap();
        let delta = copied.duration_since(old).unwrap_or_else(|e| e.duration());
        assert!(delta < Duration::from_secs(1));
    }

    #[test]
    fn test_failed_encrypt_leaves_destination_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyMaterial::generate().unwrap();
        let dst = dir.path().join("blob.aes");
        fs::write(&dst, b"previous archive").unwrap();

        let missing = dir.path().join("does-not-exist");
        assert!(matches!(encrypt_copy(&missing, &dst, &key), Err(Error::Io(_))));
        assert_eq!(fs::read(&dst).unwrap(), b"previous archive");
    }
}
