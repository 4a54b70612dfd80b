//! Content hash codecs for NimbusFS.
//!
//! Three algorithms: standard SHA-1 and SHA-256, and the remote-specific
//! [`quickxor`] hash used for body integrity. The streaming reader
//! variants share one contract: **the reader is rewound to position 0
//! before the function returns**, so a body file can be hashed and then
//! immediately served or uploaded without the caller re-seeking.

pub mod quickxor;

use std::io::{self, Read, Seek, SeekFrom};

use sha1::Sha1;
use sha2::{Digest, Sha256};

pub use quickxor::{quick_xor, quick_xor_base64, QuickXorHasher};

/// Read buffer for streaming digests; a multiple of the QuickXor block.
const READ_BUF: usize = 64 * 1024;

/// SHA-1 of a byte slice, uppercase hex (the remote's wire form).
#[must_use]
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    to_upper_hex(&hasher.finalize())
}

/// SHA-256 of a byte slice, uppercase hex.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    to_upper_hex(&hasher.finalize())
}

/// Streams a reader through SHA-1 and rewinds it.
pub fn sha1_stream<R: Read + Seek>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha1::new();
    drive(reader, |chunk| hasher.update(chunk))?;
    Ok(to_upper_hex(&hasher.finalize()))
}

/// Streams a reader through SHA-256 and rewinds it.
pub fn sha256_stream<R: Read + Seek>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    drive(reader, |chunk| hasher.update(chunk))?;
    Ok(to_upper_hex(&hasher.finalize()))
}

/// Streams a reader through QuickXorHash and rewinds it.
///
/// Returns the Base64 wire form.
pub fn quick_xor_stream<R: Read + Seek>(reader: &mut R) -> io::Result<String> {
    let mut hasher = QuickXorHasher::new();
    drive(reader, |chunk| hasher.update(chunk))?;
    Ok(hasher.finalize_base64())
}

/// Runs a reader from its start to EOF through `sink`, then seeks it
/// back to the start. The rewind happens on the success path only; an
/// I/O error mid-stream leaves the position undefined and the caller
/// must not reuse the reader.
fn drive<R, F>(reader: &mut R, mut sink: F) -> io::Result<()>
where
    R: Read + Seek,
    F: FnMut(&[u8]),
{
    reader.seek(SeekFrom::Start(0))?;
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sink(&buf[..n]);
    }
    reader.seek(SeekFrom::Start(0))?;
    Ok(())
}

fn to_upper_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02X}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_sha1_known_vector() {
        // FIPS 180 test vector for "abc".
        assert_eq!(sha1_hex(b"abc"), "A9993E364706816ABA3E25717850C26C9CD0D89D");
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD"
        );
    }

    #[test]
    fn test_stream_matches_one_shot() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
        let mut cursor = Cursor::new(data.clone());
        assert_eq!(sha1_stream(&mut cursor).unwrap(), sha1_hex(&data));
        assert_eq!(sha256_stream(&mut cursor).unwrap(), sha256_hex(&data));
        assert_eq!(
            quick_xor_stream(&mut cursor).unwrap(),
            quickxor::quick_xor_base64(&data)
        );
    }

    #[test]
    fn test_reader_rewound_after_hash() {
        let mut cursor = Cursor::new(b"hello world".to_vec());
        cursor.seek(SeekFrom::Start(5)).unwrap();

        quick_xor_stream(&mut cursor).unwrap();
        assert_eq!(cursor.stream_position().unwrap(), 0);

        sha1_stream(&mut cursor).unwrap();
        assert_eq!(cursor.stream_position().unwrap(), 0);

        // And the full content is readable again.
        let mut out = Vec::new();
        cursor.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn test_stream_hashes_from_start_regardless_of_position() {
        let mut cursor = Cursor::new(b"abc".to_vec());
        cursor.seek(SeekFrom::End(0)).unwrap();
        assert_eq!(
            sha1_stream(&mut cursor).unwrap(),
            "A9993E364706816ABA3E25717850C26C9CD0D89D"
        );
    }
}
