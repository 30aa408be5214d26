use std::fmt;
use std::io::{BufRead, BufReader, Cursor};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use futures::stream::BoxStream;
use object_store::{
    gcp::GoogleCloudStorageBuilder, local::LocalFileSystem, memory::InMemory, path::Path,
    ObjectMeta, ObjectStore,
};
use thiserror::Error;
use url::Url;

use crate::s3;

pub fn new<S: AsRef<str>>(store_url: S) -> Result<Store, anyhow::Error> {
    let store_url = store_url.as_ref();
    let url = match Url::parse(store_url) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let absolute_path = std::fs::canonicalize(store_url)
                .map_err(|e| anyhow::anyhow!("Invalid store URL: {}: {}", store_url, e))?;

            Url::parse(&format!("file://{}", absolute_path.to_string_lossy()))
                .with_context(|| format!("Invalid store URL: {}", store_url))?
        }
        Err(e) => Err(e).with_context(|| format!("Invalid store URL: {}", store_url))?,
    };

    match url.scheme() {
        "s3" => {
            let bucket = bucket(&url)?;
            let store = s3::builder_from_env(bucket)?
                .build()
                .with_context(|| format!("new s3 store for bucket {}", bucket))?;

            Ok(Store::from_object_store(Arc::new(store), url.path()))
        }
        "gs" => {
            let bucket = bucket(&url)?;

            let store = GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(bucket.to_string())
                .build()?;

            Ok(Store::from_object_store(Arc::new(store), url.path()))
        }
        "file" => {
            let store = LocalFileSystem::new_with_prefix(url.path()).context("new local store")?;

            Ok(Store::from_object_store(Arc::new(store), ""))
        }
        "memory" => Ok(Store::from_object_store(Arc::new(InMemory::new()), url.path())),
        _ => Err(anyhow::anyhow!("Unsupported scheme: {}", url.scheme()))?,
    }
}

fn bucket(url: &Url) -> Result<&str, anyhow::Error> {
    url.host_str()
        .ok_or_else(|| anyhow::anyhow!("No bucket in store URL: {}", url))
}

/// An object store plus the base path every key is resolved against.
#[derive(Clone)]
pub struct Store {
    store: Arc<dyn ObjectStore>,
    base: String,
}

impl Store {
    pub fn from_object_store(store: Arc<dyn ObjectStore>, base: &str) -> Self {
        Store {
            store,
            base: base.trim_matches('/').to_string(),
        }
    }

    pub fn inner(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Lazily enumerates every object under `prefix`.
    ///
    /// Pagination is driven by the underlying store: the next page is only
    /// requested once the consumer has drained the current one. Calling this
    /// again starts a fresh listing.
    pub fn list_objects(
        &self,
        prefix: &str,
    ) -> BoxStream<'_, Result<ObjectMeta, object_store::Error>> {
        let prefix = self.join_path(prefix);
        log::debug!("listing objects under {}", prefix);
        self.store.list(Some(&prefix))
    }

    /// Fetches a gzip compressed, newline delimited object. Decompression
    /// happens lazily as the returned lines are consumed.
    pub async fn read_gzip_lines(&self, location: &Path) -> Result<GzipLines, ReadError> {
        let content = match self.store.get(location).await {
            Ok(content) => content,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(ReadError::NotFound(location.to_string()))
            }
            Err(e) => return Err(ReadError::Storage(e)),
        };
        let bytes = content.bytes().await?;
        Ok(GzipLines::new(location.to_string(), bytes))
    }

    fn join_path(&self, path: &str) -> Path {
        Path::from(format!("{}/{}", self.base, path.trim_start_matches('/')))
    }
}

/// Lines of a (possibly multi-member) gzip object, decoded on demand.
///
/// Each item is the line without its terminator, or its raw bytes when it is
/// not UTF-8 so the caller can count it. Empty lines are skipped. A broken
/// gzip stream yields one `Decompress` error and then ends.
pub struct GzipLines {
    path: String,
    reader: Option<BufReader<MultiGzDecoder<Cursor<Bytes>>>>,
    buf: Vec<u8>,
}

impl GzipLines {
    fn new(path: String, compressed: Bytes) -> Self {
        GzipLines {
            path,
            reader: Some(BufReader::new(MultiGzDecoder::new(Cursor::new(compressed)))),
            buf: Vec::new(),
        }
    }
}

impl fmt::Debug for GzipLines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GzipLines").field("path", &self.path).finish()
    }
}

impl Iterator for GzipLines {
    type Item = Result<Result<String, Vec<u8>>, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let reader = self.reader.as_mut()?;
            self.buf.clear();
            match reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => {
                    self.reader = None;
                    return None;
                }
                Ok(_) => {}
                Err(source) => {
                    self.reader = None;
                    return Some(Err(ReadError::Decompress {
                        path: self.path.clone(),
                        source,
                    }));
                }
            }
            while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
                self.buf.pop();
            }
            if self.buf.is_empty() {
                continue;
            }
            let line = std::mem::take(&mut self.buf);
            return Some(Ok(String::from_utf8(line).map_err(|e| e.into_bytes())));
        }
    }
}

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Path '{0}' not found")]
    NotFound(String),
    #[error("Storage error: {0}")]
    Storage(#[from] object_store::Error),
    #[error("Failed to decompress '{path}': {source}")]
    Decompress {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression};
    use futures::TryStreamExt;

    use super::*;

    fn gzip(text: &[u8]) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    #[tokio::test]
    async fn lists_only_objects_under_the_prefix() {
        let store = new("memory:///logs").unwrap();
        let inner = store.inner();
        inner
            .put(&Path::from("logs/2024/05/a.log.gz"), gzip(b"a"))
            .await
            .unwrap();
        inner
            .put(&Path::from("logs/2024/06/b.log.gz"), gzip(b"b"))
            .await
            .unwrap();

        let listed: Vec<ObjectMeta> = store.list_objects("2024/05/").try_collect().await.unwrap();

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].location.as_ref(), "logs/2024/05/a.log.gz");
    }

    #[tokio::test]
    async fn reads_lines_across_gzip_members() {
        let store = new("memory://").unwrap();
        let mut body = gzip(b"first\r\nsecond\n").to_vec();
        body.extend_from_slice(&gzip(b"\nthird\n"));
        body.extend_from_slice(&gzip(b"\xff\xfe\n"));
        let path = Path::from("one.gz");
        store.inner().put(&path, Bytes::from(body)).await.unwrap();

        let lines: Vec<Result<String, Vec<u8>>> = store
            .read_gzip_lines(&path)
            .await
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(
            lines,
            vec![
                Ok("first".to_string()),
                Ok("second".to_string()),
                Ok("third".to_string()),
                Err(vec![0xff, 0xfe]),
            ]
        );
    }

    #[tokio::test]
    async fn corrupt_object_is_a_decompress_error() {
        let store = new("memory://").unwrap();
        let path = Path::from("broken.gz");
        store
            .inner()
            .put(&path, Bytes::from_static(b"not gzip at all"))
            .await
            .unwrap();

        let mut lines = store.read_gzip_lines(&path).await.unwrap();
        assert!(matches!(lines.next(), Some(Err(ReadError::Decompress { .. }))));
        assert!(lines.next().is_none());
    }

    #[tokio::test]
    async fn truncated_object_ends_in_a_decompress_error() {
        let store = new("memory://").unwrap();
        let whole = gzip(b"first\nsecond\n");
        let path = Path::from("cut.gz");
        store
            .inner()
            .put(&path, whole.slice(..whole.len() - 4))
            .await
            .unwrap();

        let items: Vec<_> = store.read_gzip_lines(&path).await.unwrap().collect();
        assert!(matches!(items.last(), Some(Err(ReadError::Decompress { .. }))));
        assert!(items[..items.len() - 1].iter().all(|item| item.is_ok()));
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = new("memory://").unwrap();
        let err = store
            .read_gzip_lines(&Path::from("nope.gz"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::NotFound(_)));
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(new("ftp://example.com/logs").is_err());
    }
}
