use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Address of an engine control endpoint: a unix socket path, or a named
/// pipe name on Windows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    path: PathBuf,
}

impl Endpoint {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Fresh endpoint, unique per host process and per call.
    #[cfg(unix)]
    pub fn for_host_process(directory: &Path, prefix: &str) -> Self {
        Self::from_path(directory.join(format!("{}.sock", unique_name(prefix))))
    }

    #[cfg(windows)]
    pub fn for_host_process(_directory: &Path, prefix: &str) -> Self {
        Self::from_path(format!(r"\\.\pipe\{}", unique_name(prefix)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Engine flag pointing it at this endpoint.
    pub fn engine_arg(&self) -> String {
        format!("--input-ipc-server={}", self.path.display())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

fn unique_name(prefix: &str) -> String {
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", std::process::id())
}

pub trait IpcStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IpcStream for T {}

#[cfg(unix)]
pub(crate) async fn open_stream(endpoint: &Endpoint) -> io::Result<Box<dyn IpcStream>> {
    let stream = tokio::net::UnixStream::connect(endpoint.path()).await?;
    Ok(Box::new(stream))
}

#[cfg(windows)]
pub(crate) async fn open_stream(endpoint: &Endpoint) -> io::Result<Box<dyn IpcStream>> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let client = ClientOptions::new().open(endpoint.path())?;
    Ok(Box::new(client))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_unique_within_a_process() {
        let dir = Path::new("/tmp");
        let a = Endpoint::for_host_process(dir, "lora");
        let b = Endpoint::for_host_process(dir, "lora");
        assert_ne!(a, b);

        let pid = std::process::id().to_string();
        assert!(a.to_string().contains(&format!("lora-{pid}-")));
    }

    #[test]
    fn engine_arg_carries_the_path() {
        let endpoint = Endpoint::from_path("/run/lora.sock");
        assert_eq!(endpoint.engine_arg(), "--input-ipc-server=/run/lora.sock");
    }
}
