//! Request body descriptors: chunk streams and the file-region fast path.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_core::Stream;

/// Regions are capped at 1 MiB so a single write never monopolizes the
/// connection's write queue (see the HTTP/1.x engine's file-region fast path).
pub const MAX_FILE_REGION_LEN: u64 = 1 << 20;

/// A `(offset, length)` slice of a file, handed to the transport's
/// `write_file_region` for a zero-copy send where the transport supports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRegion {
    pub offset: u64,
    pub len: u64,
}

/// A file opened for the zero-copy fast path, along with the total length to
/// transmit starting at offset 0.
///
/// Compressed or zip-backed resources are not representable here: the
/// resource collaborator (out of scope for this crate) must fall back to a
/// chunk stream for those.
#[derive(Clone)]
pub struct FileRegionBody {
    pub file: Arc<std::fs::File>,
    pub len: u64,
}

impl FileRegionBody {
    pub fn new(file: Arc<std::fs::File>, len: u64) -> Self {
        Self { file, len }
    }

    /// Split `self.len` bytes, starting at 0, into ascending regions of at
    /// most [`MAX_FILE_REGION_LEN`] bytes each.
    pub fn regions(&self) -> impl Iterator<Item = FileRegion> + '_ {
        let total = self.len;
        let mut offset = 0u64;
        std::iter::from_fn(move || {
            if offset >= total {
                return None;
            }
            let len = (total - offset).min(MAX_FILE_REGION_LEN);
            let region = FileRegion { offset, len };
            offset += len;
            Some(region)
        })
    }
}

/// A request body: either a (possibly multi-chunk) byte stream or a
/// file-region source. These are mutually exclusive.
pub enum RequestBody {
    /// A chunk stream. `content_length`, when `Some`, is already known and
    /// the engine emits a full message instead of switching to chunked
    /// transfer-encoding even if more than one chunk arrives.
    Chunks {
        content_length: Option<u64>,
        source: Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>,
    },
    /// A zero-copy fast path, ineligible over TLS or when a content
    /// compressor sits in the pipeline (see `Http1Connection::supports_file_region`).
    FileRegion(FileRegionBody),
}

impl RequestBody {
    pub fn from_bytes(data: Bytes) -> Self {
        let len = data.len() as u64;
        Self::Chunks {
            content_length: Some(len),
            source: Box::pin(futures_util::stream::once(async move { Ok(data) })),
        }
    }

    pub fn from_stream<S>(content_length: Option<u64>, source: S) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        Self::Chunks {
            content_length,
            source: Box::pin(source),
        }
    }

    pub fn file_region(body: FileRegionBody) -> Self {
        Self::FileRegion(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_split_at_one_mebibyte_boundaries() {
        let file = Arc::new(tempfile_stub());
        let body = FileRegionBody::new(file, MAX_FILE_REGION_LEN * 2 + 100);
        let regions: Vec<_> = body.regions().collect();
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0], FileRegion { offset: 0, len: MAX_FILE_REGION_LEN });
        assert_eq!(
            regions[1],
            FileRegion {
                offset: MAX_FILE_REGION_LEN,
                len: MAX_FILE_REGION_LEN
            }
        );
        assert_eq!(
            regions[2],
            FileRegion {
                offset: MAX_FILE_REGION_LEN * 2,
                len: 100
            }
        );
    }

    #[test]
    fn empty_body_yields_no_regions() {
        let file = Arc::new(tempfile_stub());
        let body = FileRegionBody::new(file, 0);
        assert_eq!(body.regions().count(), 0);
    }

    fn tempfile_stub() -> std::fs::File {
        let path = std::env::temp_dir().join(format!(
            "exchange-core-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::File::create(&path).expect("create temp file");
        std::fs::File::open(&path).expect("open temp file")
    }
}
