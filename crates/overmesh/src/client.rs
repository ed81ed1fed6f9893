//! Edge-side control connection to the controller
//!
//! The [`EdgeClient`] owns registration, the heartbeat/report timers, and
//! the dispatch of topology pushes into the [`PeerManager`]. The whole
//! cycle is idempotent: every reconnect re-derives state from the
//! registration snapshot, and existing peer links survive a lost control
//! channel untouched.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};

use crate::error::{MeshError, Result};
use crate::peer::PeerManager;
use crate::protocol::{
    read_frame, read_json, write_json, AddRouteMsg, BroadcastOfflineMsg, BroadcastOnlineMsg,
    Command, DelRouteMsg, EdgeInfo, Header, Heartbeat, RegisterReply, RegisterReq,
};
use crate::stat::StatCollector;
use crate::vpc::vpc_for;

/// Timing and identity configuration for the control connection
#[derive(Debug, Clone)]
pub struct EdgeClientConfig {
    /// Controller `ip:port` to dial
    pub controller: String,
    /// Tenant namespace this edge belongs to
    pub namespace: String,
    /// Edge name within the namespace
    pub name: String,
    /// Registration secret
    pub secret_key: String,
    /// Publicly visible IP override, when the source address is not it
    pub public_ip: Option<String>,
    /// Heartbeat period
    pub heartbeat_interval: Duration,
    /// Report period
    pub report_interval: Duration,
    /// Sleep between reconnect attempts
    pub reconnect_backoff: Duration,
    /// Deadline on the controller dial
    pub dial_timeout: Duration,
    /// Per-write deadline on the control connection
    pub write_timeout: Duration,
}

impl Default for EdgeClientConfig {
    fn default() -> Self {
        Self {
            controller: String::new(),
            namespace: String::new(),
            name: String::new(),
            secret_key: String::new(),
            public_ip: None,
            heartbeat_interval: Duration::from_secs(10),
            report_interval: Duration::from_secs(30),
            reconnect_backoff: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(3),
        }
    }
}

/// Maintains the control connection and applies topology pushes
pub struct EdgeClient {
    config: EdgeClientConfig,
    peers: Arc<PeerManager>,
    stats: Arc<StatCollector>,
}

impl EdgeClient {
    /// Create a client bound to a peer manager
    #[must_use]
    pub fn new(config: EdgeClientConfig, peers: Arc<PeerManager>, stats: Arc<StatCollector>) -> Self {
        Self {
            config,
            peers,
            stats,
        }
    }

    /// Supervisory loop: run one registration cycle, sleep, repeat
    ///
    /// Never returns; the controller coming and going is normal operation
    /// from the edge's point of view.
    pub async fn run(&self) {
        loop {
            match self.cycle().await {
                Ok(()) => tracing::info!("control connection closed"),
                Err(e) => tracing::warn!(error = %e, "control connection lost"),
            }
            sleep(self.config.reconnect_backoff).await;
        }
    }

    /// One full registration cycle: dial, register, apply snapshot, then
    /// heartbeat/report until the connection dies or the controller says
    /// exit
    async fn cycle(&self) -> Result<()> {
        let stream = timeout(
            self.config.dial_timeout,
            TcpStream::connect(&self.config.controller),
        )
        .await
        .map_err(|_| MeshError::timeout())??;
        let (mut reader, mut writer) = stream.into_split();

        let request = RegisterReq {
            namespace: self.config.namespace.clone(),
            name: self.config.name.clone(),
            secret_key: self.config.secret_key.clone(),
            public_ip: self.config.public_ip.clone(),
        };
        write_json(&mut writer, Command::Register, &request).await?;
        let (_, reply): (Header, RegisterReply) = read_json(&mut reader).await?;
        tracing::info!(
            peers = reply.edge_list.len(),
            routes = reply.routes.len(),
            "registered with controller"
        );

        // The VPC capability must be in place before the snapshot replays,
        // so freshly-added peers get provider routes too.
        if let Some(csp) = &reply.csp_info {
            match vpc_for(csp) {
                Ok(vpc) => self.peers.bind_vpc(vpc),
                Err(e) => tracing::warn!(error = %e, "vpc unavailable, continuing without it"),
            }
        }

        for edge in reply.edge_list {
            self.peers.add_peer(edge);
        }
        for route in reply.routes {
            self.peers.add_route(AddRouteMsg {
                cidr: route.cidr,
                nexthop: route.nexthop,
            });
        }

        let mut read_task = tokio::spawn(read_loop(reader, Arc::clone(&self.peers)));

        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = interval(self.config.report_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Both intervals fire immediately once; eat that so the first
        // heartbeat/report land one period after registration.
        heartbeat.tick().await;
        report.tick().await;

        let result = loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    tracing::debug!("sending heartbeat");
                    if let Err(e) = self.write_with_deadline(&mut writer, Command::Heartbeat, &Heartbeat {}).await {
                        break Err(e);
                    }
                }
                _ = report.tick() => {
                    let msg = self.stats.snapshot_reset();
                    tracing::debug!(traffic_in = msg.traffic_in, traffic_out = msg.traffic_out, "sending report");
                    if let Err(e) = self.write_with_deadline(&mut writer, Command::Report, &msg).await {
                        break Err(e);
                    }
                }
                joined = &mut read_task => {
                    break match joined {
                        Ok(result) => result,
                        Err(e) => Err(MeshError::connection_msg(format!("reader task failed: {e}"))),
                    };
                }
            }
        };
        read_task.abort();
        result
    }

    async fn write_with_deadline<T: serde::Serialize + Sync>(
        &self,
        writer: &mut OwnedWriteHalf,
        cmd: Command,
        obj: &T,
    ) -> Result<()> {
        timeout(self.config.write_timeout, write_json(writer, cmd, obj))
            .await
            .map_err(|_| MeshError::timeout())?
    }
}

/// Inbound control dispatch, strictly in arrival order
///
/// Returns `Ok(())` on a deliberate exit command, `Err` on transport
/// failure. A malformed body drops that message only.
async fn read_loop(mut reader: OwnedReadHalf, peers: Arc<PeerManager>) -> Result<()> {
    loop {
        let (header, body) = read_frame(&mut reader).await?;
        match header.cmd() {
            Command::Heartbeat => tracing::debug!("heartbeat from controller"),
            Command::Add => match serde_json::from_slice::<BroadcastOnlineMsg>(&body) {
                Ok(msg) => {
                    tracing::info!(peer = %msg.listen_addr, cidr = %msg.cidr, "peer online");
                    peers.add_peer(EdgeInfo {
                        listen_addr: msg.listen_addr,
                        cidr: msg.cidr,
                    });
                }
                Err(e) => tracing::error!(error = %e, "invalid online message"),
            },
            Command::Del => match serde_json::from_slice::<BroadcastOfflineMsg>(&body) {
                Ok(msg) => {
                    tracing::info!(peer = %msg.listen_addr, cidr = %msg.cidr, "peer offline");
                    peers.del_peer(EdgeInfo {
                        listen_addr: msg.listen_addr,
                        cidr: msg.cidr,
                    });
                }
                Err(e) => tracing::error!(error = %e, "invalid offline message"),
            },
            Command::AddRoute => match serde_json::from_slice::<AddRouteMsg>(&body) {
                Ok(msg) => {
                    tracing::info!(cidr = %msg.cidr, nexthop = %msg.nexthop, "route added");
                    peers.add_route(msg);
                }
                Err(e) => tracing::error!(error = %e, "invalid add-route message"),
            },
            Command::DelRoute => match serde_json::from_slice::<DelRouteMsg>(&body) {
                Ok(msg) => {
                    tracing::info!(cidr = %msg.cidr, nexthop = %msg.nexthop, "route removed");
                    peers.del_route(msg);
                }
                Err(e) => tracing::error!(error = %e, "invalid del-route message"),
            },
            Command::Exit => {
                tracing::info!("controller ordered exit");
                return Ok(());
            }
            other => tracing::warn!(cmd = ?other, "unsupported command from controller"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{NoopRoutes, PeerManagerConfig};
    use crate::protocol::write_frame;
    use crate::tun::MemTun;
    use tokio::net::TcpListener;

    fn test_peers() -> Arc<PeerManager> {
        let (tun, _inject, _observe) = MemTun::new("test0");
        PeerManager::new(
            Arc::new(tun),
            Arc::new(StatCollector::new()),
            Arc::new(NoopRoutes),
            PeerManagerConfig {
                dial_backoff: Duration::from_millis(30),
                liveness_interval: Duration::from_millis(30),
                write_timeout: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn test_read_loop_exit_is_clean() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (reader, _client_writer) = client.into_split();
        let (_server_reader, mut server_writer) = server.into_split();

        let handle = tokio::spawn(read_loop(reader, test_peers()));
        write_json(&mut server_writer, Command::Exit, &Heartbeat {})
            .await
            .unwrap();

        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_read_loop_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (reader, _client_writer) = client.into_split();

        let handle = tokio::spawn(read_loop(reader, test_peers()));
        drop(server);

        let result = handle.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_loop_malformed_body_keeps_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (reader, _client_writer) = client.into_split();
        let (_server_reader, mut server_writer) = server.into_split();

        let handle = tokio::spawn(read_loop(reader, test_peers()));

        // Garbage body: dropped, connection stays up for the exit below.
        write_frame(&mut server_writer, Command::Add, b"not json")
            .await
            .unwrap();
        write_json(&mut server_writer, Command::Exit, &Heartbeat {})
            .await
            .unwrap();

        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }
}
