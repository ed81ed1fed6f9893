//! Virtual network device adapter
//!
//! The data plane consumes the device through the [`TunDevice`] trait: raw
//! IP frames in, raw IP frames out, nothing else. [`OsTun`] backs it with a
//! kernel TUN interface on Linux; [`MemTun`] backs it with in-memory queues
//! so the data plane is testable without `CAP_NET_ADMIN`.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{MeshError, Result};

/// Receive buffer size; comfortably above any sane MTU
const READ_BUF_SIZE: usize = 1 << 16;

/// Contract between the data plane and the virtual network device
///
/// The adapter performs no routing or parsing; it only moves raw frames.
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one raw IP frame, blocking until one is available
    async fn recv(&self) -> Result<Vec<u8>>;

    /// Write one raw IP frame, returning the byte count written
    async fn send(&self, frame: &[u8]) -> Result<usize>;

    /// OS-visible interface name
    fn name(&self) -> &str;
}

// =============================================================================
// Kernel TUN device (Linux)
// =============================================================================

/// Kernel TUN interface
///
/// [`OsTun::open`] creates the device and brings the link up with the
/// configured MTU; dropping the value closes it.
#[cfg(target_os = "linux")]
pub struct OsTun {
    tun: tokio_tun::Tun,
    name: String,
}

#[cfg(target_os = "linux")]
impl OsTun {
    /// Create and activate a TUN interface
    ///
    /// # Errors
    ///
    /// Returns a tun error if device creation fails (typically missing
    /// `CAP_NET_ADMIN`).
    pub fn open(name: &str, mtu: i32) -> Result<Self> {
        let tun = tokio_tun::Tun::builder()
            .name(name)
            .tap(false)
            .packet_info(false)
            .mtu(mtu)
            .up()
            .try_build()
            .map_err(|e| MeshError::tun(format!("create {name}: {e}")))?;
        let name = tun.name().to_string();
        Ok(Self { tun, name })
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl TunDevice for OsTun {
    async fn recv(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let n = self
            .tun
            .recv(&mut buf)
            .await
            .map_err(|e| MeshError::tun(format!("read {}: {e}", self.name)))?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn send(&self, frame: &[u8]) -> Result<usize> {
        self.tun
            .send(frame)
            .await
            .map_err(|e| MeshError::tun(format!("write {}: {e}", self.name)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// =============================================================================
// In-memory device
// =============================================================================

/// In-memory device backed by channels
///
/// Frames pushed into the inject side come out of [`TunDevice::recv`];
/// frames passed to [`TunDevice::send`] land on the observe side. Used by
/// tests and by deployments embedding the data plane behind another frame
/// source.
pub struct MemTun {
    name: String,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl MemTun {
    /// Build a device plus its inject/observe endpoints
    #[must_use]
    pub fn new(name: &str) -> (Self, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (inject_tx, inject_rx) = mpsc::channel(256);
        let (observe_tx, observe_rx) = mpsc::channel(256);
        let dev = Self {
            name: name.to_string(),
            inbound: tokio::sync::Mutex::new(inject_rx),
            outbound: observe_tx,
        };
        (dev, inject_tx, observe_rx)
    }
}

#[async_trait]
impl TunDevice for MemTun {
    async fn recv(&self) -> Result<Vec<u8>> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| MeshError::tun(format!("{} closed", self.name)))
    }

    async fn send(&self, frame: &[u8]) -> Result<usize> {
        self.outbound
            .send(frame.to_vec())
            .await
            .map_err(|_| MeshError::tun(format!("{} closed", self.name)))?;
        Ok(frame.len())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
