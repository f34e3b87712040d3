//! Host resources the broker reaches on behalf of workers.
//!
//! File operations go through `tokio::fs` directly; everything that would
//! need a platform service sits behind [`ResourceProvider`] so hosts can
//! plug in their own and tests can observe calls.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::net::TcpStream;

use crate::broker::ops::SystemInfo;

/// Boxed future returned by provider methods.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send + 'a>>;

/// Platform services used by the broker.
pub trait ResourceProvider: Send + Sync {
    /// Open a TCP connection to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns a description of the connect failure.
    fn connect(&self, host: &str, port: u16) -> ProviderFuture<'_, TcpStream>;

    /// Resolve `host` to its addresses.
    ///
    /// # Errors
    ///
    /// Returns a description of the lookup failure.
    fn resolve(&self, host: &str) -> ProviderFuture<'_, Vec<IpAddr>>;

    /// Open a graphics adapter; an empty name selects the default.
    ///
    /// # Errors
    ///
    /// Returns a description when no such adapter exists.
    fn open_graphics_device(&self, adapter: &str) -> Result<String, String>;

    /// Current clipboard text.
    ///
    /// # Errors
    ///
    /// Returns a description when the clipboard is unavailable.
    fn clipboard_read(&self) -> Result<String, String>;

    /// Replace the clipboard text.
    ///
    /// # Errors
    ///
    /// Returns a description when the clipboard is unavailable.
    fn clipboard_write(&self, text: String) -> Result<(), String>;

    /// Empty the clipboard.
    ///
    /// # Errors
    ///
    /// Returns a description when the clipboard is unavailable.
    fn clipboard_clear(&self) -> Result<(), String> {
        self.clipboard_write(String::new())
    }

    /// Describe the host.
    fn system_info(&self) -> SystemInfo;
}

/// Default provider: real sockets, a process-local clipboard, and a single
/// software adapter.
#[derive(Debug)]
pub struct HostProvider {
    connect_timeout: Duration,
    clipboard: Mutex<String>,
}

impl HostProvider {
    /// Name of the adapter returned for an empty request.
    pub const DEFAULT_ADAPTER: &'static str = "software";

    /// Provider with the given connect timeout.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            clipboard: Mutex::new(String::new()),
        }
    }
}

impl Default for HostProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl ResourceProvider for HostProvider {
    fn connect(&self, host: &str, port: u16) -> ProviderFuture<'_, TcpStream> {
        let addr = format!("{host}:{port}");
        Box::pin(async move {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(err)) => Err(format!("connect to {addr} failed: {err}")),
                Err(_) => Err(format!("connect to {addr} timed out")),
            }
        })
    }

    fn resolve(&self, host: &str) -> ProviderFuture<'_, Vec<IpAddr>> {
        let host = host.to_owned();
        Box::pin(async move {
            let lookup = tokio::net::lookup_host((host.as_str(), 0));
            match tokio::time::timeout(self.connect_timeout, lookup).await {
                Ok(Ok(addrs)) => {
                    let mut resolved: Vec<IpAddr> = Vec::new();
                    for addr in addrs {
                        if !resolved.contains(&addr.ip()) {
                            resolved.push(addr.ip());
                        }
                    }
                    Ok(resolved)
                }
                Ok(Err(err)) => Err(format!("lookup of {host} failed: {err}")),
                Err(_) => Err(format!("lookup of {host} timed out")),
            }
        })
    }

    fn open_graphics_device(&self, adapter: &str) -> Result<String, String> {
        if adapter.is_empty() || adapter == Self::DEFAULT_ADAPTER {
            Ok(Self::DEFAULT_ADAPTER.to_owned())
        } else {
            Err(format!("no graphics adapter named {adapter}"))
        }
    }

    fn clipboard_read(&self) -> Result<String, String> {
        Ok(self
            .clipboard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn clipboard_write(&self, text: String) -> Result<(), String> {
        *self.clipboard.lock().unwrap_or_else(PoisonError::into_inner) = text;
        Ok(())
    }

    fn system_info(&self) -> SystemInfo {
        SystemInfo {
            os: std::env::consts::OS.to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
            cpus: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        }
    }
}
