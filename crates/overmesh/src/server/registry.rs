//! Registry server and session table
//!
//! One task per accepted edge connection. Authentication failures drop the
//! connection without a reply, so a scanner learns nothing about which
//! namespaces or edges exist.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::error::{MeshError, Result};
use crate::protocol::{
    read_frame, read_json, write_json, AlarmMsg, Command, EdgeInfo, Header, Heartbeat,
    RegisterReply, RegisterReq, ReportMsg, RouteInfo,
};
use crate::store::{Edge, EdgeManager, NamespaceManager, RouteManager};

// =============================================================================
// Configuration
// =============================================================================

const fn default_read_timeout() -> Duration {
    Duration::from_secs(15)
}

const fn default_max_read_failures() -> u32 {
    3
}

const fn default_failure_retry_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_broadcast_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Registry server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// TCP address edges dial, e.g. `0.0.0.0:58422`
    pub listen_addr: String,

    /// Per-read deadline on edge sessions; a quiet-but-healthy edge
    /// heartbeats well inside this
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Consecutive failed reads before a session is declared dead
    #[serde(default = "default_max_read_failures")]
    pub max_read_failures: u32,

    /// Sleep between failed reads
    #[serde(default = "default_failure_retry_delay", with = "humantime_serde")]
    pub failure_retry_delay: Duration,

    /// Write deadline on broadcasts and replies, so one wedged edge cannot
    /// stall the fan-out
    #[serde(default = "default_broadcast_timeout", with = "humantime_serde")]
    pub broadcast_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:58422".to_string(),
            read_timeout: default_read_timeout(),
            max_read_failures: default_max_read_failures(),
            failure_retry_delay: default_failure_retry_delay(),
            broadcast_timeout: default_broadcast_timeout(),
        }
    }
}

impl RegistryConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns a config error on an empty listen address or a zero failure
    /// budget.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(MeshError::config("listen_addr cannot be empty"));
        }
        if self.max_read_failures == 0 {
            return Err(MeshError::config("max_read_failures must be > 0"));
        }
        Ok(())
    }
}

// =============================================================================
// Sessions
// =============================================================================

/// A live control connection to one registered edge
pub struct Session {
    /// Session identifier, for logs
    pub id: Uuid,
    /// Namespace the edge registered into
    pub namespace: String,
    /// The edge's data-plane listen address (session key)
    pub listen_addr: String,
    /// Edge record snapshot taken at registration
    pub edge: Edge,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
}

impl Session {
    fn new(edge: Edge, writer: OwnedWriteHalf) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: edge.namespace.clone(),
            listen_addr: edge.listen_addr.clone(),
            edge,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
        }
    }

    /// Send a JSON message to the edge under a write deadline
    ///
    /// The deadline covers lock acquisition too, so a send wedged behind a
    /// stuck peer still times out.
    ///
    /// # Errors
    ///
    /// Returns a timeout error when the deadline elapses, or a connection
    /// error if the write fails.
    pub async fn send_json<T: Serialize + Sync>(
        &self,
        cmd: Command,
        obj: &T,
        deadline: Duration,
    ) -> Result<()> {
        let writer = Arc::clone(&self.writer);
        timeout(deadline, async move {
            let mut writer = writer.lock().await;
            write_json(&mut *writer, cmd, obj).await
        })
        .await
        .map_err(|_| MeshError::timeout())?
    }
}

/// All live sessions, keyed by `(namespace, listen_addr)`
pub struct SessionTable {
    sessions: DashMap<(String, String), Arc<Session>>,
}

impl SessionTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Insert a session, rejecting a duplicate key
    ///
    /// # Errors
    ///
    /// Returns a registry error when a session for the same
    /// `(namespace, listen_addr)` is already live; no silent takeover.
    pub fn insert(&self, session: Arc<Session>) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        let key = (session.namespace.clone(), session.listen_addr.clone());
        match self.sessions.entry(key) {
            Entry::Occupied(_) => Err(MeshError::registry(format!(
                "session already exists for {}/{}",
                session.namespace, session.listen_addr
            ))),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    /// Remove a session only if it is still the one with the given id
    ///
    /// Keeps a stale cleanup guard from evicting a successor session that
    /// reused the key.
    pub fn remove_if_id(&self, namespace: &str, listen_addr: &str, id: Uuid) {
        self.sessions
            .remove_if(&(namespace.to_string(), listen_addr.to_string()), |_, s| {
                s.id == id
            });
    }

    /// Look up one session
    #[must_use]
    pub fn get(&self, namespace: &str, listen_addr: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(&(namespace.to_string(), listen_addr.to_string()))
            .map(|entry| Arc::clone(&entry))
    }

    /// All live sessions in a namespace
    #[must_use]
    pub fn sessions_in(&self, namespace: &str) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the session from the table exactly once, on any exit path
struct SessionGuard {
    table: Arc<SessionTable>,
    namespace: String,
    listen_addr: String,
    id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.table
            .remove_if_id(&self.namespace, &self.listen_addr, self.id);
        tracing::info!(
            namespace = %self.namespace,
            edge = %self.listen_addr,
            "session removed"
        );
    }
}

// =============================================================================
// Report sink
// =============================================================================

/// Where edge reports go; persistence is outside the core
#[async_trait]
pub trait StatSink: Send + Sync {
    /// Record one report from an edge
    async fn record(&self, namespace: &str, edge: &str, report: &ReportMsg);
}

/// Report sink that only logs
pub struct LogStatSink;

#[async_trait]
impl StatSink for LogStatSink {
    async fn record(&self, namespace: &str, edge: &str, report: &ReportMsg) {
        tracing::info!(
            namespace = %namespace,
            edge = %edge,
            traffic_in = report.traffic_in,
            traffic_out = report.traffic_out,
            cpu = report.cpu,
            mem = report.mem,
            errors = report.errors.len(),
            "edge report"
        );
    }
}

// =============================================================================
// Registry server
// =============================================================================

/// Accepts and serves edge control connections
pub struct RegistryServer {
    config: RegistryConfig,
    sessions: Arc<SessionTable>,
    edges: Arc<EdgeManager>,
    routes: Arc<RouteManager>,
    namespaces: Arc<NamespaceManager>,
    stats: Arc<dyn StatSink>,
}

impl RegistryServer {
    /// Create a server over the given managers
    #[must_use]
    pub fn new(
        config: RegistryConfig,
        sessions: Arc<SessionTable>,
        edges: Arc<EdgeManager>,
        routes: Arc<RouteManager>,
        namespaces: Arc<NamespaceManager>,
        stats: Arc<dyn StatSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions,
            edges,
            routes,
            namespaces,
            stats,
        })
    }

    /// Bind the configured address and serve forever
    ///
    /// # Errors
    ///
    /// Returns a connection error if the bind or an accept fails.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already-bound listener
    ///
    /// # Errors
    ///
    /// Returns a connection error if an accept fails.
    pub async fn serve_on(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "registry listening");
        loop {
            let (stream, client_addr) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.serve_edge(stream, client_addr).await {
                    // Rejections are silent on the wire; the reason only
                    // shows up here.
                    tracing::warn!(client = %client_addr, error = %e, "edge connection closed");
                }
            });
        }
    }

    async fn serve_edge(&self, stream: TcpStream, client_addr: SocketAddr) -> Result<()> {
        let (mut reader, writer) = stream.into_split();

        let (header, request): (Header, RegisterReq) =
            timeout(self.config.read_timeout, read_json(&mut reader))
                .await
                .map_err(|_| MeshError::timeout())??;
        if header.cmd() != Command::Register {
            return Err(MeshError::protocol(format!(
                "expected register, got {:?}",
                header.cmd()
            )));
        }
        tracing::info!(
            client = %client_addr,
            namespace = %request.namespace,
            name = %request.name,
            "edge register request"
        );

        // Secret first; an unknown secret drops the connection with no reply.
        let namespace = self
            .namespaces
            .resolve_secret(&request.secret_key)
            .await?
            .ok_or_else(|| MeshError::auth("unknown secret"))?;
        if !request.namespace.is_empty() && request.namespace != namespace.name {
            return Err(MeshError::auth("namespace mismatch"));
        }

        // The edge must already be configured; registration cannot create it.
        let all_edges = self.edges.get_edges(&namespace.name).await?;
        let (current, others) = split_edges(all_edges, &request, &client_addr);
        let current = current.ok_or_else(|| {
            MeshError::auth(format!(
                "no edge matches name={} client={client_addr}",
                request.name
            ))
        })?;

        let routes = self.routes.get_routes(&namespace.name).await?;
        let reply = RegisterReply {
            edge_list: others
                .into_iter()
                .map(|e| EdgeInfo {
                    listen_addr: e.listen_addr,
                    cidr: e.cidr,
                })
                .collect(),
            routes: routes
                .into_iter()
                .filter(|r| r.nexthop != current.listen_addr)
                .map(|r| RouteInfo {
                    cidr: r.cidr,
                    nexthop: r.nexthop,
                    name: r.name,
                })
                .collect(),
            csp_info: None,
        };

        let session = Arc::new(Session::new(current, writer));
        // Duplicate registration for a live key: warn and drop this
        // connection, leaving the first session untouched.
        self.sessions.insert(Arc::clone(&session))?;
        let _guard = SessionGuard {
            table: Arc::clone(&self.sessions),
            namespace: session.namespace.clone(),
            listen_addr: session.listen_addr.clone(),
            id: session.id,
        };

        session
            .send_json(Command::Register, &reply, self.config.broadcast_timeout)
            .await?;
        tracing::info!(
            session = %session.id,
            namespace = %session.namespace,
            edge = %session.listen_addr,
            "edge registered"
        );

        self.session_loop(&mut reader, &session).await;
        Ok(())
    }

    /// Heartbeat-tolerant read loop; the sole exit path for a session
    async fn session_loop(&self, reader: &mut OwnedReadHalf, session: &Session) {
        let mut failures = 0u32;
        loop {
            let frame = timeout(self.config.read_timeout, read_frame(reader)).await;
            let (header, body) = match frame {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!(
                        session = %session.id,
                        failures,
                        error = %e,
                        "session read failed"
                    );
                    if failures >= self.config.max_read_failures {
                        break;
                    }
                    sleep(self.config.failure_retry_delay).await;
                    continue;
                }
                Err(_) => {
                    failures += 1;
                    tracing::warn!(session = %session.id, failures, "session read timed out");
                    if failures >= self.config.max_read_failures {
                        break;
                    }
                    sleep(self.config.failure_retry_delay).await;
                    continue;
                }
            };
            failures = 0;

            match header.cmd() {
                Command::Heartbeat => {
                    tracing::debug!(session = %session.id, "heartbeat");
                    if let Err(e) = session
                        .send_json(Command::Heartbeat, &Heartbeat {}, self.config.broadcast_timeout)
                        .await
                    {
                        tracing::warn!(session = %session.id, error = %e, "heartbeat echo failed");
                    }
                }
                Command::Report => match serde_json::from_slice::<ReportMsg>(&body) {
                    Ok(report) => {
                        self.stats
                            .record(&session.namespace, &session.edge.name, &report)
                            .await;
                    }
                    Err(e) => tracing::error!(session = %session.id, error = %e, "invalid report"),
                },
                Command::Alarm => match serde_json::from_slice::<AlarmMsg>(&body) {
                    Ok(alarm) => tracing::warn!(
                        session = %session.id,
                        edge = %session.edge.name,
                        alarm = %alarm.message,
                        "edge alarm"
                    ),
                    Err(e) => tracing::error!(session = %session.id, error = %e, "invalid alarm"),
                },
                other => {
                    tracing::warn!(session = %session.id, cmd = ?other, "unsupported command");
                }
            }
        }
    }
}

/// Partition the namespace's edges into this connection's identity and the
/// rest
fn split_edges(
    edges: Vec<Edge>,
    request: &RegisterReq,
    client_addr: &SocketAddr,
) -> (Option<Edge>, Vec<Edge>) {
    let client_ip = client_addr.ip().to_string();
    let mut current = None;
    let mut others = Vec::new();
    for edge in edges {
        let edge_host = edge.listen_addr.split(':').next().unwrap_or_default();
        let matches = (!request.name.is_empty() && edge.name == request.name)
            || request.public_ip.as_deref() == Some(edge_host)
            || edge_host == client_ip;
        if matches && current.is_none() {
            current = Some(edge);
        } else {
            others.push(edge);
        }
    }
    (current, others)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_edge(name: &str, listen: &str) -> Edge {
        Edge {
            name: name.to_string(),
            namespace: "ns".to_string(),
            cidr: "10.1.0.0/24".to_string(),
            listen_addr: listen.to_string(),
            csp_type: None,
            comment: String::new(),
        }
    }

    fn session_for(edge: Edge) -> Arc<Session> {
        // A writer half needs a real socket pair; tests that only exercise
        // the table never write, so a connected loopback pair is enough.
        let (_client, writer) = {
            let rt_pair = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = rt_pair.local_addr().unwrap();
            let client = std::net::TcpStream::connect(addr).unwrap();
            let (server, _) = rt_pair.accept().unwrap();
            server.set_nonblocking(true).unwrap();
            let server = TcpStream::from_std(server).unwrap();
            let (_r, w) = server.into_split();
            (client, w)
        };
        Arc::new(Session::new(edge, writer))
    }

    #[tokio::test]
    async fn test_session_table_rejects_duplicates() {
        let table = SessionTable::new();
        let first = session_for(test_edge("e1", "a:1"));
        let second = session_for(test_edge("e1", "a:1"));

        table.insert(Arc::clone(&first)).unwrap();
        let err = table.insert(second).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        // The first session is untouched.
        assert_eq!(table.get("ns", "a:1").unwrap().id, first.id);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_session_table_remove_if_id() {
        let table = SessionTable::new();
        let session = session_for(test_edge("e1", "a:1"));
        table.insert(Arc::clone(&session)).unwrap();

        // Wrong id: no-op.
        table.remove_if_id("ns", "a:1", Uuid::new_v4());
        assert_eq!(table.len(), 1);

        table.remove_if_id("ns", "a:1", session.id);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_sessions_in_filters_by_namespace() {
        let table = SessionTable::new();
        table.insert(session_for(test_edge("e1", "a:1"))).unwrap();
        table.insert(session_for(test_edge("e2", "b:2"))).unwrap();

        let mut other = test_edge("e3", "c:3");
        other.namespace = "other".to_string();
        table.insert(session_for(other)).unwrap();

        assert_eq!(table.sessions_in("ns").len(), 2);
        assert_eq!(table.sessions_in("other").len(), 1);
        assert!(table.sessions_in("absent").is_empty());
    }

    #[test]
    fn test_split_edges_by_name() {
        let edges = vec![test_edge("e1", "198.51.100.1:9000"), test_edge("e2", "198.51.100.2:9000")];
        let request = RegisterReq {
            namespace: "ns".to_string(),
            name: "e2".to_string(),
            secret_key: String::new(),
            public_ip: None,
        };
        let client: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let (current, others) = split_edges(edges, &request, &client);
        assert_eq!(current.unwrap().name, "e2");
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].name, "e1");
    }

    #[test]
    fn test_split_edges_by_source_ip() {
        let edges = vec![test_edge("e1", "127.0.0.1:9000"), test_edge("e2", "198.51.100.2:9000")];
        let request = RegisterReq::default();
        let client: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let (current, others) = split_edges(edges, &request, &client);
        assert_eq!(current.unwrap().name, "e1");
        assert_eq!(others.len(), 1);
    }

    #[test]
    fn test_split_edges_no_match() {
        let edges = vec![test_edge("e1", "198.51.100.1:9000")];
        let request = RegisterReq {
            name: "ghost".to_string(),
            ..RegisterReq::default()
        };
        let client: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let (current, others) = split_edges(edges, &request, &client);
        assert!(current.is_none());
        assert_eq!(others.len(), 1);
    }

    #[test]
    fn test_registry_config_validate() {
        assert!(RegistryConfig::default().validate().is_ok());

        let mut config = RegistryConfig::default();
        config.listen_addr = String::new();
        assert!(config.validate().is_err());

        let mut config = RegistryConfig::default();
        config.max_read_failures = 0;
        assert!(config.validate().is_err());
    }
}
