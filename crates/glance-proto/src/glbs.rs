// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! GLBS: a self-describing sequence of GLB blobs.
//!
//! Layout (all integers are unsigned 32-bit little-endian):
//!
//! ``MAGIC("GLBS") || COUNT || { LENGTH || BLOB }*``
//!
//! * COUNT is [`UNKNOWN_COUNT`] when the producer does not know the number of
//!   blobs up front; readers then consume blobs until end of stream.
//! * Each BLOB is an independently valid GLB file.

use std::io::{self, Read};

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, Stream, StreamExt};
use thiserror::Error;

/// Stream magic "GLBS".
pub const MAGIC: [u8; 4] = *b"GLBS";
/// COUNT value used when the number of blobs is not known in advance.
pub const UNKNOWN_COUNT: u32 = u32::MAX;
/// Size of MAGIC + COUNT.
pub const HEADER_BYTES: usize = 8;

/// Errors produced while framing or parsing a GLBS stream.
#[derive(Debug, Error)]
pub enum GlbsError {
    /// The stream does not start with "GLBS".
    #[error("bad magic {0:02x?}, expected \"GLBS\"")]
    BadMagic([u8; 4]),
    /// The stream ended inside the 8-byte header.
    #[error("truncated header")]
    TruncatedHeader,
    /// The stream ended inside a length prefix.
    #[error("truncated length prefix for blob {index}")]
    TruncatedLength {
        /// Zero-based index of the blob.
        index: u32,
    },
    /// The stream ended inside a blob body.
    #[error("truncated blob {index}: expected {expected} bytes, got {got}")]
    TruncatedBlob {
        /// Zero-based index of the blob.
        index: u32,
        /// Length announced by the prefix.
        expected: usize,
        /// Bytes actually available.
        got: usize,
    },
    /// The stream ended before the declared number of blobs was read.
    #[error("stream declared {declared} blobs but ended after {found}")]
    MissingBlobs {
        /// COUNT from the header.
        declared: u32,
        /// Blobs read before end of stream.
        found: u32,
    },
    /// A blob exceeds the reader limit or the 32-bit length field.
    #[error("blob of {len} bytes exceeds the limit of {max}")]
    BlobTooLarge {
        /// Blob length.
        len: usize,
        /// Limit that was exceeded.
        max: usize,
    },
    /// Underlying reader failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// The 8-byte stream header for `count` blobs.
pub fn header(count: u32) -> [u8; HEADER_BYTES] {
    let mut out = [0u8; HEADER_BYTES];
    out[0..4].copy_from_slice(&MAGIC);
    out[4..8].copy_from_slice(&count.to_le_bytes());
    out
}

fn length_prefix(blob: &[u8]) -> Result<[u8; 4], GlbsError> {
    let len = u32::try_from(blob.len()).map_err(|_| GlbsError::BlobTooLarge {
        len: blob.len(),
        max: u32::MAX as usize,
    })?;
    Ok(len.to_le_bytes())
}

/// Encode a complete GLBS stream into memory (static export).
pub fn encode_to_vec<B: AsRef<[u8]>>(blobs: &[B], count: u32) -> Result<Vec<u8>, GlbsError> {
    let body: usize = blobs.iter().map(|b| 4 + b.as_ref().len()).sum();
    let mut out = BytesMut::with_capacity(HEADER_BYTES + body);
    out.put_slice(&header(count));
    for blob in blobs {
        let blob = blob.as_ref();
        out.put_slice(&length_prefix(blob)?);
        out.put_slice(blob);
    }
    Ok(out.to_vec())
}

/// Lazily frame a stream of blobs as GLBS chunks, suitable for a chunked HTTP
/// body.
///
/// The header is emitted first, then for every blob its length prefix and the
/// blob itself as separate chunks. Upstream errors are forwarded unchanged;
/// the stream continues after them so the consumer decides whether to stop.
pub fn encode<S, E>(blobs: S, count: u32) -> impl Stream<Item = Result<Bytes, E>>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: From<GlbsError>,
{
    let head = stream::once(async move { Ok(Bytes::copy_from_slice(&header(count))) });
    let body = blobs.flat_map(|item| {
        let chunks: Vec<Result<Bytes, E>> = match item {
            Ok(blob) => match length_prefix(&blob) {
                Ok(prefix) => vec![Ok(Bytes::copy_from_slice(&prefix)), Ok(blob)],
                Err(err) => vec![Err(E::from(err))],
            },
            Err(err) => vec![Err(err)],
        };
        stream::iter(chunks)
    });
    head.chain(body)
}

/// Read up to `buf.len()` bytes, stopping early only at end of stream.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Iterator over the blobs of a GLBS stream.
///
/// With a known COUNT it yields exactly that many blobs and reports an early
/// end of stream as [`GlbsError::MissingBlobs`]; with [`UNKNOWN_COUNT`] it
/// yields blobs until the stream ends cleanly on a blob boundary.
#[derive(Debug)]
pub struct GlbsReader<R> {
    reader: R,
    declared: Option<u32>,
    read: u32,
    max_blob: usize,
    done: bool,
}

impl<R: Read> GlbsReader<R> {
    /// Parse the header and prepare to read blobs of any size.
    pub fn new(reader: R) -> Result<Self, GlbsError> {
        Self::with_max_blob(reader, u32::MAX as usize)
    }

    /// Like [`new`](Self::new) but rejects blobs longer than `max_blob` bytes
    /// before allocating for them.
    pub fn with_max_blob(mut reader: R, max_blob: usize) -> Result<Self, GlbsError> {
        let mut head = [0u8; HEADER_BYTES];
        if read_full(&mut reader, &mut head)? < HEADER_BYTES {
            return Err(GlbsError::TruncatedHeader);
        }
        let magic = [head[0], head[1], head[2], head[3]];
        if magic != MAGIC {
            return Err(GlbsError::BadMagic(magic));
        }
        let count = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        Ok(Self {
            reader,
            declared: (count != UNKNOWN_COUNT).then_some(count),
            read: 0,
            max_blob,
            done: false,
        })
    }

    /// COUNT from the header, or `None` when unknown.
    pub fn declared_count(&self) -> Option<u32> {
        self.declared
    }

    fn next_blob(&mut self) -> Result<Option<Bytes>, GlbsError> {
        if self.declared.is_some_and(|n| self.read >= n) {
            return Ok(None);
        }
        let index = self.read;
        let mut len_buf = [0u8; 4];
        match read_full(&mut self.reader, &mut len_buf)? {
            0 => {
                return match self.declared {
                    None => Ok(None),
                    Some(declared) => Err(GlbsError::MissingBlobs {
                        declared,
                        found: index,
                    }),
                }
            }
            4 => {}
            _ => return Err(GlbsError::TruncatedLength { index }),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > self.max_blob {
            return Err(GlbsError::BlobTooLarge {
                len,
                max: self.max_blob,
            });
        }
        let mut blob = vec![0u8; len];
        let got = read_full(&mut self.reader, &mut blob)?;
        if got < len {
            return Err(GlbsError::TruncatedBlob {
                index,
                expected: len,
                got,
            });
        }
        self.read += 1;
        Ok(Some(Bytes::from(blob)))
    }
}

impl<R: Read> Iterator for GlbsReader<R> {
    type Item = Result<Bytes, GlbsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_blob() {
            Ok(Some(blob)) => Some(Ok(blob)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Decode an in-memory GLBS stream into its blobs.
pub fn decode(bytes: &[u8]) -> Result<Vec<Bytes>, GlbsError> {
    GlbsReader::new(bytes)?.collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    #[test]
    fn empty_stream_is_header_only() {
        let bytes = encode_to_vec::<&[u8]>(&[], 0).unwrap();
        assert_eq!(bytes, b"GLBS\x00\x00\x00\x00");
        assert!(decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn two_blob_layout_matches_vector() {
        let bytes = encode_to_vec(&[&b"AB"[..], &b"CDE"[..]], 2).unwrap();
        assert_eq!(
            hex::encode(&bytes),
            "474c4253\
             02000000\
             02000000 4142\
             03000000 434445"
                .replace(' ', "")
        );
    }

    #[tokio::test]
    async fn streaming_encoder_matches_in_memory_encoder() {
        let blobs = vec![Bytes::from_static(b"glb00001"), Bytes::from_static(b"glb2")];
        let source = stream::iter(blobs.clone().into_iter().map(Ok::<_, GlbsError>));
        let chunks: Vec<Bytes> = encode(source, UNKNOWN_COUNT).try_collect().await.unwrap();
        assert_eq!(chunks.len(), 1 + 2 * blobs.len());
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(joined, encode_to_vec(&blobs, UNKNOWN_COUNT).unwrap());
    }

    #[tokio::test]
    async fn streaming_encoder_forwards_upstream_errors() {
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"x")),
            Err(GlbsError::TruncatedHeader),
        ]);
        let items: Vec<_> = encode(source, 2).collect().await;
        assert_eq!(items.len(), 4);
        assert!(matches!(items[3], Err(GlbsError::TruncatedHeader)));
    }

    #[test]
    fn unknown_count_reads_until_end_of_stream() {
        let bytes = encode_to_vec(&[&b"one"[..], &b""[..], &b"three"[..]], UNKNOWN_COUNT).unwrap();
        let reader = GlbsReader::new(bytes.as_slice()).unwrap();
        assert_eq!(reader.declared_count(), None);
        let blobs: Vec<Bytes> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(blobs, vec![&b"one"[..], &b""[..], &b"three"[..]]);
    }

    #[test]
    fn known_count_ignores_trailing_bytes() {
        let mut bytes = encode_to_vec(&[&b"a"[..]], 1).unwrap();
        bytes.extend_from_slice(b"trailing");
        assert_eq!(decode(&bytes).unwrap(), vec![Bytes::from_static(b"a")]);
    }

    #[test]
    fn known_count_reports_missing_blobs() {
        let bytes = encode_to_vec(&[&b"a"[..]], 3).unwrap();
        let err = decode(&bytes).expect_err("two blobs missing");
        assert!(matches!(
            err,
            GlbsError::MissingBlobs {
                declared: 3,
                found: 1
            }
        ));
    }

    #[test]
    fn rejects_bad_magic_and_short_header() {
        assert!(matches!(decode(b"GLBX\0\0\0\0"), Err(GlbsError::BadMagic(_))));
        assert!(matches!(decode(b"GLB"), Err(GlbsError::TruncatedHeader)));
    }

    #[test]
    fn truncated_blob_is_an_error() {
        let mut bytes = encode_to_vec(&[&b"abcdef"[..]], UNKNOWN_COUNT).unwrap();
        bytes.truncate(bytes.len() - 2);
        let err = decode(&bytes).expect_err("truncated");
        assert!(matches!(
            err,
            GlbsError::TruncatedBlob {
                index: 0,
                expected: 6,
                got: 4
            }
        ));
    }

    #[test]
    fn truncated_length_prefix_is_an_error() {
        let mut bytes = encode_to_vec::<&[u8]>(&[], UNKNOWN_COUNT).unwrap();
        bytes.extend_from_slice(&[1, 0]);
        assert!(matches!(
            decode(&bytes),
            Err(GlbsError::TruncatedLength { index: 0 })
        ));
    }

    #[test]
    fn reader_limit_rejects_oversized_blobs() {
        let bytes = encode_to_vec(&[vec![0u8; 64]], 1).unwrap();
        let mut reader = GlbsReader::with_max_blob(bytes.as_slice(), 16).unwrap();
        assert!(matches!(
            reader.next(),
            Some(Err(GlbsError::BlobTooLarge { len: 64, max: 16 }))
        ));
        assert!(reader.next().is_none());
    }
}
