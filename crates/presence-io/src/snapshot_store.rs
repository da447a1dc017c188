//! Where serialized snapshots live: a local cache file, and a remote
//! location shared between hosts (an object-store style directory or an
//! HTTP endpoint).

use presence_core::{RemoteSnapshotStore, SnapshotCache, StoreError};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on a downloaded snapshot.
const MAX_SNAPSHOT_BYTES: u64 = 256 * 1024 * 1024;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Write `bytes` to `path` through a sibling temp file and a rename, so
/// readers never see a half-written snapshot.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Snapshot persisted next to the daemon, e.g. `/var/lib/presence/snapshot.json`.
#[derive(Debug, Clone)]
pub struct FileSnapshotCache {
    path: PathBuf,
}

impl FileSnapshotCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotCache for FileSnapshotCache {
    fn read(&self) -> Result<Option<Vec<u8>>, StoreError> {
        read_optional(&self.path)
            .map_err(|e| StoreError::Cache(format!("{}: {e}", self.path.display())))
    }

    fn write(&self, bytes: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.path, bytes)
            .map_err(|e| StoreError::Cache(format!("{}: {e}", self.path.display())))?;
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "snapshot cached");
        Ok(())
    }
}

/// Object-store layout on a shared filesystem: `<root>/<key>`.
#[derive(Debug, Clone)]
pub struct DirRemoteStore {
    root: PathBuf,
    key: String,
}

impl DirRemoteStore {
    pub fn new(root: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            key: key.into(),
        }
    }

    pub fn object_path(&self) -> PathBuf {
        self.root.join(&self.key)
    }
}

impl RemoteSnapshotStore for DirRemoteStore {
    fn get(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.object_path();
        read_optional(&path).map_err(|e| StoreError::Remote(format!("{}: {e}", path.display())))
    }

    fn put(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.object_path();
        write_atomic(&path, bytes)
            .map_err(|e| StoreError::Remote(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "snapshot published");
        Ok(())
    }
}

/// Snapshot object behind a plain HTTP URL: GET to fetch, PUT to publish.
/// A 404 means nothing has been published yet.
pub struct HttpRemoteStore {
    url: String,
    agent: ureq::Agent,
}

impl HttpRemoteStore {
    pub fn new(url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(HTTP_TIMEOUT)
            .timeout_read(HTTP_TIMEOUT)
            .timeout_write(HTTP_TIMEOUT)
            .build();
        Self {
            url: url.into(),
            agent,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RemoteSnapshotStore for HttpRemoteStore {
    fn get(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match self.agent.get(&self.url).call() {
            Ok(resp) => {
                let mut bytes = Vec::new();
                resp.into_reader()
                    .take(MAX_SNAPSHOT_BYTES)
                    .read_to_end(&mut bytes)
                    .map_err(|e| StoreError::Remote(format!("GET {}: {e}", self.url)))?;
                Ok(Some(bytes))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(ureq::Error::Status(code, resp)) => {
                let text = resp.into_string().unwrap_or_default();
                Err(StoreError::Remote(format!("GET {} returned {code}: {text}", self.url)))
            }
            Err(err) => Err(StoreError::Remote(format!("GET {} failed: {err}", self.url))),
        }
    }

    fn put(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let response = self
            .agent
            .put(&self.url)
            .set("content-type", "application/json")
            .send_bytes(bytes);
        match response {
            Ok(_) => {
                tracing::info!(url = %self.url, bytes = bytes.len(), "snapshot published");
                Ok(())
            }
            Err(ureq::Error::Status(code, resp)) => {
                let text = resp.into_string().unwrap_or_default();
                Err(StoreError::Remote(format!("PUT {} returned {code}: {text}", self.url)))
            }
            Err(err) => Err(StoreError::Remote(format!("PUT {} failed: {err}", self.url))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    /// Answer a single HTTP request with `status` and `body`; the thread
    /// returns the raw request it received.
    fn serve_once(status: &'static str, body: &'static [u8]) -> (String, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/snapshot.json", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            let header_end = loop {
                let n = stream.read(&mut chunk).unwrap();
                assert!(n > 0, "client closed before sending headers");
                request.extend_from_slice(&chunk[..n]);
                if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while request.len() < header_end + length {
                let n = stream.read(&mut chunk).unwrap();
                assert!(n > 0, "client closed mid-body");
                request.extend_from_slice(&chunk[..n]);
            }

            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .unwrap();
            stream.write_all(body).unwrap();
            request
        });
        (url, handle)
    }

    #[test]
    fn test_file_cache_missing_then_written() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSnapshotCache::new(dir.path().join("state/snapshot.json"));

        assert_eq!(cache.read().unwrap(), None);
        cache.write(b"{\"format\":1}").unwrap();
        assert_eq!(cache.read().unwrap().as_deref(), Some(&b"{\"format\":1}"[..]));

        cache.write(b"second").unwrap();
        assert_eq!(cache.read().unwrap().as_deref(), Some(&b"second"[..]));
        assert!(!dir.path().join("state/snapshot.json.tmp").exists());
    }

    #[test]
    fn test_file_cache_unreadable_path_is_cache_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be.
        let cache = FileSnapshotCache::new(dir.path());
        assert!(matches!(cache.read(), Err(StoreError::Cache(_))));
    }

    #[test]
    fn test_dir_remote_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let remote = DirRemoteStore::new(dir.path(), "faces/embeddings.json");

        assert_eq!(remote.get().unwrap(), None);
        remote.put(b"payload").unwrap();
        assert_eq!(remote.get().unwrap().as_deref(), Some(&b"payload"[..]));
        assert!(dir.path().join("faces/embeddings.json").is_file());
    }

    #[test]
    fn test_http_store_unreachable_is_remote_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let remote = HttpRemoteStore::new(format!("http://127.0.0.1:{port}/snapshot.json"));
        assert!(matches!(remote.get(), Err(StoreError::Remote(_))));
        assert!(matches!(remote.put(b"x"), Err(StoreError::Remote(_))));
    }

    #[test]
    fn test_http_store_not_found_is_no_snapshot() {
        let (url, server) = serve_once("404 Not Found", b"");
        let remote = HttpRemoteStore::new(url);
        assert_eq!(remote.get().unwrap(), None);
        let request = server.join().unwrap();
        assert!(request.starts_with(b"GET /snapshot.json "));
    }

    #[test]
    fn test_http_store_get_returns_body() {
        let (url, server) = serve_once("200 OK", b"{\"format\":1}");
        let remote = HttpRemoteStore::new(url);
        assert_eq!(remote.get().unwrap().as_deref(), Some(&b"{\"format\":1}"[..]));
        server.join().unwrap();
    }

    #[test]
    fn test_http_store_server_error_is_remote_error() {
        let (url, server) = serve_once("500 Internal Server Error", b"disk full");
        let remote = HttpRemoteStore::new(url);
        match remote.get() {
            Err(StoreError::Remote(message)) => assert!(message.contains("500"), "{message}"),
            other => panic!("expected remote error, got {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn test_http_store_put_sends_snapshot_bytes() {
        let (url, server) = serve_once("204 No Content", b"");
        let remote = HttpRemoteStore::new(url);
        remote.put(b"payload").unwrap();

        let request = server.join().unwrap();
        assert!(request.starts_with(b"PUT /snapshot.json "));
        assert!(request.ends_with(b"\r\n\r\npayload"));
    }
}
