//! Digest computation shared by backup publication, restore validation and
//! post-write verification. One algorithm everywhere: MD5, hex-encoded.

use std::io::{self, Read};

use md5::{Digest, Md5};

const READ_BUF_LEN: usize = 64 * 1024;

/// Computes the digest of an in-memory byte slice.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Computes the digest of a reader without loading it whole into memory.
pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Md5::new();
    let mut buf = [0u8; READ_BUF_LEN];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Checks `bytes` against a previously recorded digest.
pub fn matches(bytes: &[u8], expected: &str) -> bool {
    digest(bytes).eq_ignore_ascii_case(expected)
}

/// Incremental digest fed chunk by chunk while streaming to disk.
#[derive(Default)]
pub struct StreamDigest {
    inner: Md5,
}

impl StreamDigest {
    pub fn new() -> StreamDigest {
        StreamDigest::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_compute_the_reference_digest() {
        assert_eq!(digest(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn it_should_match_regardless_of_digest_case() {
        assert!(matches(b"abc", "900150983CD24FB0D6963F7D28E17F72"));
        assert!(!matches(b"abd", "900150983cd24fb0d6963f7d28e17f72"));
    }

    #[test]
    fn it_should_agree_between_slice_reader_and_stream() {
        let data = vec![0xa5u8; 200_000];

        let from_reader = digest_reader(&data[..]).unwrap();

        let mut stream = StreamDigest::new();
        for chunk in data.chunks(4096) {
            stream.update(chunk);
        }

        assert_eq!(digest(&data), from_reader);
        assert_eq!(digest(&data), stream.finish());
    }
}
