//! Peer connection manager and the edge data plane
//!
//! Each peer subnet maps to one outbound framed TCP link. The manager owns
//! the connect/reconnect lifecycle, the OS and VPC route programming that
//! goes with it, and the per-packet dispatch from the tun device to the
//! matching link. The inbound half, peers dialing us, is the
//! [`DataPlaneServer`].
//!
//! Per-entry state machine:
//! `Connecting -> Connected -> (Dead -> Reconnecting -> Connected) | Removed`

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command as ProcessCommand;
use tokio::time::{interval, sleep, timeout};

use crate::error::{MeshError, Result};
use crate::packet::Packet;
use crate::protocol::{read_frame, write_frame, AddRouteMsg, Command, DelRouteMsg, EdgeInfo};
use crate::route::{normalize_cidr, RouteTable};
use crate::stat::StatCollector;
use crate::tun::TunDevice;
use crate::vpc::VpcRouter;

// =============================================================================
// OS route programming
// =============================================================================

/// Installs and removes the local static routes that steer matching traffic
/// into the tun device
#[async_trait]
pub trait RouteProgrammer: Send + Sync {
    /// Install (or overwrite) the route for `cidr` via `dev`
    async fn replace(&self, cidr: &str, dev: &str) -> Result<()>;

    /// Remove the route for `cidr` via `dev`
    ///
    /// Must be safe to call for a route that was never installed.
    async fn remove(&self, cidr: &str, dev: &str) -> Result<()>;
}

/// Programs kernel routes through the `ip` tool
pub struct OsRoutes;

impl OsRoutes {
    async fn run(args: &[&str]) -> Result<()> {
        let output = ProcessCommand::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| MeshError::route(format!("spawn ip: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(MeshError::route(format!(
                "ip {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl RouteProgrammer for OsRoutes {
    async fn replace(&self, cidr: &str, dev: &str) -> Result<()> {
        Self::run(&["route", "replace", cidr, "dev", dev]).await
    }

    async fn remove(&self, cidr: &str, dev: &str) -> Result<()> {
        Self::run(&["route", "del", cidr, "dev", dev]).await
    }
}

/// Route programmer that does nothing
///
/// For tests and for deployments where an outer supervisor owns the kernel
/// routing table.
pub struct NoopRoutes;

#[async_trait]
impl RouteProgrammer for NoopRoutes {
    async fn replace(&self, _cidr: &str, _dev: &str) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _cidr: &str, _dev: &str) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Peer link
// =============================================================================

/// Pump inbound frames from a peer stream into the tun device
///
/// Returns when the stream errors or closes. Non-packet commands are logged
/// and skipped; the connection is only torn down by transport errors.
async fn pump_frames_to_tun<R>(
    mut reader: R,
    tun: Arc<dyn TunDevice>,
    stats: Arc<StatCollector>,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    loop {
        let (header, body) = read_frame(&mut reader).await?;
        match header.cmd() {
            Command::Packet => {
                let packet = Packet::new(&body);
                if !packet.is_valid() {
                    tracing::debug!("dropping invalid frame from peer");
                    continue;
                }
                tracing::trace!(src = %packet.src(), dst = %packet.dst(), "inbound packet");
                #[allow(clippy::cast_possible_wrap)]
                stats.add_traffic_in(body.len() as i64);
                if let Err(e) = tun.send(&body).await {
                    tracing::warn!(error = %e, "tun write failed");
                }
            }
            Command::Heartbeat => {}
            other => tracing::warn!(cmd = ?other, "unsupported command on data link"),
        }
    }
}

/// One outbound framed link to a peer edge
pub struct PeerLink {
    remote_addr: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    closed: Arc<AtomicBool>,
    reader: tokio::task::AbortHandle,
    write_timeout: Duration,
}

impl PeerLink {
    /// Dial a peer and start its inbound reader
    ///
    /// # Errors
    ///
    /// Returns a connection error if the dial fails.
    pub async fn connect(
        remote_addr: &str,
        tun: Arc<dyn TunDevice>,
        stats: Arc<StatCollector>,
        write_timeout: Duration,
    ) -> Result<Self> {
        let stream = TcpStream::connect(remote_addr).await?;
        let (read_half, write_half) = stream.into_split();

        let closed = Arc::new(AtomicBool::new(false));
        let reader_closed = Arc::clone(&closed);
        let reader = tokio::spawn(async move {
            if let Err(e) = pump_frames_to_tun(read_half, tun, stats).await {
                tracing::debug!(error = %e, "peer link reader stopped");
            }
            reader_closed.store(true, Ordering::Release);
        })
        .abort_handle();

        Ok(Self {
            remote_addr: remote_addr.to_string(),
            writer: tokio::sync::Mutex::new(write_half),
            closed,
            reader,
            write_timeout,
        })
    }

    /// Remote address this link is dialed to
    #[must_use]
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Whether the underlying connection is known dead
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one IP packet as a framed message
    ///
    /// The write runs under a deadline that applies to this call only; a
    /// timed-out or failed write marks the link dead for the liveness
    /// checker.
    ///
    /// # Errors
    ///
    /// Returns a connection error when the link is dead or the write fails,
    /// or a timeout error when the deadline elapses.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(MeshError::connection_msg(format!(
                "link to {} is closed",
                self.remote_addr
            )));
        }
        let mut writer = self.writer.lock().await;
        let result = timeout(self.write_timeout, write_frame(&mut *writer, Command::Packet, frame))
            .await
            .map_err(|_| MeshError::timeout())
            .and_then(|inner| inner);
        if result.is_err() {
            self.closed.store(true, Ordering::Release);
        }
        result
    }

    /// Tear the link down: stop the reader and close the socket
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.reader.abort();
        let _ = self.writer.lock().await.shutdown().await;
    }
}

// =============================================================================
// Peer manager
// =============================================================================

/// Timing knobs for the peer lifecycle
#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    /// Fixed backoff between failed dial attempts
    pub dial_backoff: Duration,
    /// How often each liveness checker polls its link
    pub liveness_interval: Duration,
    /// Per-send write deadline on peer links
    pub write_timeout: Duration,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            dial_backoff: Duration::from_secs(3),
            liveness_interval: Duration::from_secs(1),
            write_timeout: Duration::from_secs(3),
        }
    }
}

/// Owns every outbound peer link and the routing table over them
pub struct PeerManager {
    table: RouteTable<Arc<PeerLink>>,
    tun: Arc<dyn TunDevice>,
    stats: Arc<StatCollector>,
    os_routes: Arc<dyn RouteProgrammer>,
    vpc: RwLock<Option<Arc<dyn VpcRouter>>>,
    config: PeerManagerConfig,
}

impl PeerManager {
    /// Create a manager over the given device
    #[must_use]
    pub fn new(
        tun: Arc<dyn TunDevice>,
        stats: Arc<StatCollector>,
        os_routes: Arc<dyn RouteProgrammer>,
        config: PeerManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            table: RouteTable::new(),
            tun,
            stats,
            os_routes,
            vpc: RwLock::new(None),
            config,
        })
    }

    /// Bind the cloud-provider route injector
    ///
    /// Only the first binding takes effect; registration replays after a
    /// reconnect keep the original injector.
    pub fn bind_vpc(&self, vpc: Arc<dyn VpcRouter>) {
        let mut slot = self.vpc.write();
        if slot.is_none() {
            tracing::info!(provider = vpc.provider(), "vpc route injection enabled");
            *slot = Some(vpc);
        }
    }

    /// Number of live peer entries
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.table.len()
    }

    /// Whether a peer entry exists for the (normalized) cidr
    ///
    /// # Errors
    ///
    /// Returns a route error for an unparseable cidr.
    pub fn has_peer(&self, cidr: &str) -> Result<bool> {
        Ok(self.table.contains(normalize_cidr(cidr)?))
    }

    /// Add a peer: tear down any entry for the same subnet, then dial and
    /// install in the background, retrying the dial forever
    pub fn add_peer(self: &Arc<Self>, edge: EdgeInfo) {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.install_peer(edge).await });
    }

    /// Remove a peer in the background
    pub fn del_peer(self: &Arc<Self>, edge: EdgeInfo) {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.remove_peer(edge).await });
    }

    /// Install an administrative route as a synthetic peer
    pub fn add_route(self: &Arc<Self>, msg: AddRouteMsg) {
        self.add_peer(EdgeInfo {
            listen_addr: msg.nexthop,
            cidr: msg.cidr,
        });
    }

    /// Remove an administrative route
    pub fn del_route(self: &Arc<Self>, msg: DelRouteMsg) {
        self.del_peer(EdgeInfo {
            listen_addr: msg.nexthop,
            cidr: msg.cidr,
        });
    }

    /// Send one IP packet toward its destination
    ///
    /// # Errors
    ///
    /// Returns a route error when no entry contains `dst`, or a connection
    /// error when the matching link rejects the write.
    pub async fn send(&self, dst: Ipv4Addr, frame: &[u8]) -> Result<()> {
        let Some(link) = self.table.resolve(dst) else {
            return Err(MeshError::route(format!("no route to {dst}")));
        };
        #[allow(clippy::cast_possible_wrap)]
        self.stats.add_traffic_out(frame.len() as i64);
        link.send(frame).await
    }

    /// Outbound loop: frames off the tun device, through the route table,
    /// onto peer links
    ///
    /// Runs until the device fails.
    pub async fn run_outbound(self: Arc<Self>) {
        loop {
            let frame = match self.tun.recv().await {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "tun read failed, stopping outbound loop");
                    return;
                }
            };
            let packet = Packet::new(&frame);
            if !packet.is_valid() {
                tracing::debug!("dropping invalid frame from tun");
                continue;
            }
            let dst = packet.dst();
            tracing::trace!(src = %packet.src(), dst = %dst, "outbound packet");
            if let Err(e) = self.send(dst, &frame).await {
                tracing::debug!(dst = %dst, error = %e, "dropping packet");
            }
        }
    }

    async fn install_peer(self: Arc<Self>, edge: EdgeInfo) {
        let net = match normalize_cidr(&edge.cidr) {
            Ok(net) => net,
            Err(e) => {
                tracing::error!(cidr = %edge.cidr, error = %e, "rejecting peer");
                self.stats.record_error(e.to_string());
                return;
            }
        };
        tracing::info!(peer = %edge.listen_addr, cidr = %net, "adding peer");

        // Same subnet re-announced: the old link goes first.
        if let Some(old) = self.table.remove(net) {
            old.close().await;
        }

        let link = loop {
            match PeerLink::connect(
                &edge.listen_addr,
                Arc::clone(&self.tun),
                Arc::clone(&self.stats),
                self.config.write_timeout,
            )
            .await
            {
                Ok(link) => break Arc::new(link),
                Err(e) => {
                    tracing::error!(peer = %edge.listen_addr, error = %e, "dial peer failed");
                    self.stats
                        .record_error(format!("dial {}: {e}", edge.listen_addr));
                    sleep(self.config.dial_backoff).await;
                }
            }
        };

        // VPC route programming is best-effort: local connectivity proceeds
        // even when the provider rejects the route.
        let vpc = self.vpc.read().clone();
        if let Some(vpc) = vpc {
            if let Err(e) = vpc.create_route(&edge.cidr).await {
                tracing::error!(cidr = %edge.cidr, error = %e, "vpc route injection failed");
                self.stats.record_error(format!("vpc route {}: {e}", edge.cidr));
            }
        }

        if let Err(e) = self
            .os_routes
            .replace(&net.to_string(), self.tun.name())
            .await
        {
            tracing::error!(cidr = %net, error = %e, "static route install failed");
            self.stats.record_error(format!("route add {net}: {e}"));
            link.close().await;
            return;
        }

        if let Some(displaced) = self.table.insert(net, Arc::clone(&link)) {
            displaced.close().await;
        }
        tracing::info!(peer = %edge.listen_addr, cidr = %net, "peer added");

        let manager = Arc::clone(&self);
        tokio::spawn(async move { manager.liveness_loop(edge, net, link).await });
    }

    async fn remove_peer(self: Arc<Self>, edge: EdgeInfo) {
        let net = match normalize_cidr(&edge.cidr) {
            Ok(net) => net,
            Err(e) => {
                tracing::error!(cidr = %edge.cidr, error = %e, "rejecting peer removal");
                return;
            }
        };
        tracing::info!(peer = %edge.listen_addr, cidr = %net, "removing peer");

        // Removal must hold even for an entry that never finished connecting.
        if let Err(e) = self.os_routes.remove(&net.to_string(), self.tun.name()).await {
            tracing::debug!(cidr = %net, error = %e, "static route removal failed");
        }
        if let Some(link) = self.table.remove(net) {
            link.close().await;
        }
        tracing::info!(peer = %edge.listen_addr, cidr = %net, "peer removed");
    }

    /// Poll one link for death and rebuild it in place until the entry is
    /// administratively removed
    async fn liveness_loop(self: Arc<Self>, edge: EdgeInfo, net: Ipv4Net, link: Arc<PeerLink>) {
        let mut current = link;
        let mut ticker = interval(self.config.liveness_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !self.table.contains(net) {
                return;
            }
            if !current.is_closed() {
                continue;
            }

            tracing::warn!(peer = %edge.listen_addr, cidr = %net, "peer link dead, reconnecting");
            loop {
                // The entry may have been deleted while this reconnect was in
                // flight; a removed peer must not be resurrected.
                if !self.table.contains(net) {
                    tracing::info!(cidr = %net, "peer removed, abandoning reconnect");
                    return;
                }
                match PeerLink::connect(
                    &edge.listen_addr,
                    Arc::clone(&self.tun),
                    Arc::clone(&self.stats),
                    self.config.write_timeout,
                )
                .await
                {
                    Ok(new_link) => {
                        let new_link = Arc::new(new_link);
                        let expected = Arc::clone(&current);
                        match self.table.swap_entry_if(net, Arc::clone(&new_link), |cur| {
                            Arc::ptr_eq(cur, &expected)
                        }) {
                            Some(old) => {
                                old.close().await;
                                tracing::info!(peer = %edge.listen_addr, cidr = %net, "peer link re-established");
                                current = new_link;
                                break;
                            }
                            None => {
                                // Someone else owns the slot now.
                                new_link.close().await;
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(peer = %edge.listen_addr, error = %e, "redial peer failed");
                        sleep(self.config.dial_backoff).await;
                    }
                }
            }
        }
    }
}

// =============================================================================
// Inbound data plane
// =============================================================================

/// Accepts connections from peer edges and moves their packets onto the tun
/// device
pub struct DataPlaneServer {
    tun: Arc<dyn TunDevice>,
    stats: Arc<StatCollector>,
}

impl DataPlaneServer {
    /// Create a server writing into the given device
    #[must_use]
    pub fn new(tun: Arc<dyn TunDevice>, stats: Arc<StatCollector>) -> Self {
        Self { tun, stats }
    }

    /// Bind the listen address and serve forever
    ///
    /// # Errors
    ///
    /// Returns a connection error if the bind or an accept fails.
    pub async fn serve(&self, listen_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(listen_addr).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already-bound listener
    ///
    /// # Errors
    ///
    /// Returns a connection error if an accept fails.
    pub async fn serve_on(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "data plane listening");
        loop {
            // The whole stream moves into the task: shutting down the write
            // direction here would FIN the dialing peer's reader and trip its
            // liveness checker.
            let (stream, peer) = listener.accept().await?;
            tracing::debug!(peer = %peer, "peer connection accepted");
            let tun = Arc::clone(&self.tun);
            let stats = Arc::clone(&self.stats);
            tokio::spawn(async move {
                if let Err(e) = pump_frames_to_tun(stream, tun, stats).await {
                    tracing::debug!(peer = %peer, error = %e, "peer connection closed");
                }
            });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
