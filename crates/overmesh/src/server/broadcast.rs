//! Topology change broadcaster
//!
//! Watches the edge and route prefixes of the store and fans each change out
//! to the affected live sessions. Every delivery runs as its own task under
//! a write deadline, so sessions never block each other and a wedged edge
//! only costs its own message.

use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{
    AddRouteMsg, BroadcastOfflineMsg, BroadcastOnlineMsg, Command, DelRouteMsg, Heartbeat,
};
use crate::server::registry::{Session, SessionTable};
use crate::store::{
    route_key_namespace, Edge, EdgeManager, Route, RouteManager, StoreEvent, StoreEventKind,
};

/// Watches the store and pushes deltas to live sessions
pub struct TopologyBroadcaster {
    sessions: Arc<SessionTable>,
    deadline: Duration,
    edge_events: tokio::sync::Mutex<Option<tokio::sync::mpsc::Receiver<StoreEvent>>>,
    route_events: tokio::sync::Mutex<Option<tokio::sync::mpsc::Receiver<StoreEvent>>>,
}

impl TopologyBroadcaster {
    /// Subscribe to the edge and route watch streams
    ///
    /// The watches are registered before this returns, so records written
    /// afterwards are never missed even if [`TopologyBroadcaster::run`]
    /// starts later.
    pub async fn subscribe(
        sessions: Arc<SessionTable>,
        edges: &EdgeManager,
        routes: &RouteManager,
        deadline: Duration,
    ) -> Arc<Self> {
        let edge_events = edges.watch().await;
        let route_events = routes.watch().await;
        Arc::new(Self {
            sessions,
            deadline,
            edge_events: tokio::sync::Mutex::new(Some(edge_events)),
            route_events: tokio::sync::Mutex::new(Some(route_events)),
        })
    }

    /// Consume both watch streams until the store closes them
    ///
    /// The subscription is consumed on first run; a second call is a no-op.
    pub async fn run(self: Arc<Self>) {
        let Some(mut edge_events) = self.edge_events.lock().await.take() else {
            tracing::error!("broadcaster already running");
            return;
        };
        let Some(mut route_events) = self.route_events.lock().await.take() else {
            tracing::error!("broadcaster already running");
            return;
        };
        tracing::info!("topology broadcaster running");
        loop {
            tokio::select! {
                event = edge_events.recv() => match event {
                    Some(event) => self.on_edge_event(event),
                    None => break,
                },
                event = route_events.recv() => match event {
                    Some(event) => self.on_route_event(event),
                    None => break,
                },
            }
        }
        tracing::info!("topology broadcaster stopped");
    }

    fn on_edge_event(&self, event: StoreEvent) {
        match event.kind {
            StoreEventKind::Put => {
                let Some(edge) = decode_edge(event.value.as_deref(), &event.key) else {
                    return;
                };
                tracing::info!(namespace = %edge.namespace, edge = %edge.listen_addr, "edge online");
                self.broadcast_online(&edge);
            }
            StoreEventKind::Delete => {
                // Deletes only carry the previous value.
                let Some(edge) = decode_edge(event.prev_value.as_deref(), &event.key) else {
                    return;
                };
                tracing::info!(namespace = %edge.namespace, edge = %edge.listen_addr, "edge offline");
                self.broadcast_offline(&edge);
                // The deleted edge gets a deliberate exit rather than an
                // abrupt close; its own read loop observes the teardown.
                if let Some(session) = self.sessions.get(&edge.namespace, &edge.listen_addr) {
                    tracing::info!(session = %session.id, "sending exit to deleted edge");
                    self.deliver(session, Command::Exit, Heartbeat {});
                }
            }
        }
    }

    fn on_route_event(&self, event: StoreEvent) {
        let Some(namespace) = route_key_namespace(&event.key).map(str::to_string) else {
            tracing::warn!(key = %event.key, "unsupported route key");
            return;
        };
        match event.kind {
            StoreEventKind::Put => {
                let Some(route) = decode_route(event.value.as_deref(), &event.key) else {
                    return;
                };
                tracing::info!(namespace = %namespace, cidr = %route.cidr, nexthop = %route.nexthop, "route added");
                let msg = AddRouteMsg {
                    cidr: route.cidr,
                    nexthop: route.nexthop.clone(),
                };
                self.fan_out(&namespace, &route.nexthop, Command::AddRoute, msg);
            }
            StoreEventKind::Delete => {
                let Some(route) = decode_route(event.prev_value.as_deref(), &event.key) else {
                    return;
                };
                tracing::info!(namespace = %namespace, cidr = %route.cidr, nexthop = %route.nexthop, "route removed");
                let msg = DelRouteMsg {
                    cidr: route.cidr,
                    nexthop: route.nexthop.clone(),
                };
                self.fan_out(&namespace, &route.nexthop, Command::DelRoute, msg);
            }
        }
    }

    fn broadcast_online(&self, edge: &Edge) {
        let msg = BroadcastOnlineMsg {
            listen_addr: edge.listen_addr.clone(),
            cidr: edge.cidr.clone(),
        };
        self.fan_out(&edge.namespace, &edge.listen_addr, Command::Add, msg);
    }

    fn broadcast_offline(&self, edge: &Edge) {
        let msg = BroadcastOfflineMsg {
            listen_addr: edge.listen_addr.clone(),
            cidr: edge.cidr.clone(),
        };
        self.fan_out(&edge.namespace, &edge.listen_addr, Command::Del, msg);
    }

    /// Send to every session in the namespace except the excluded listen
    /// address (the subject edge, or a route's nexthop, which already knows)
    fn fan_out<T>(&self, namespace: &str, exclude_addr: &str, cmd: Command, msg: T)
    where
        T: serde::Serialize + Clone + Send + Sync + 'static,
    {
        for session in self.sessions.sessions_in(namespace) {
            if session.listen_addr == exclude_addr {
                continue;
            }
            self.deliver(session, cmd, msg.clone());
        }
    }

    /// Fire one delivery as an independent task; a failed send is logged
    /// and skipped, never retried
    fn deliver<T>(&self, session: Arc<Session>, cmd: Command, msg: T)
    where
        T: serde::Serialize + Send + Sync + 'static,
    {
        let deadline = self.deadline;
        tokio::spawn(async move {
            if let Err(e) = session.send_json(cmd, &msg, deadline).await {
                tracing::error!(
                    session = %session.id,
                    edge = %session.listen_addr,
                    cmd = ?cmd,
                    error = %e,
                    "broadcast send failed"
                );
            }
        });
    }
}

fn decode_edge(value: Option<&str>, key: &str) -> Option<Edge> {
    let value = value?;
    match serde_json::from_str(value) {
        Ok(edge) => Some(edge),
        Err(e) => {
            tracing::error!(key = %key, error = %e, "undecodable edge event");
            None
        }
    }
}

fn decode_route(value: Option<&str>, key: &str) -> Option<Route> {
    let value = value?;
    match serde_json::from_str(value) {
        Ok(route) => Some(route),
        Err(e) => {
            tracing::error!(key = %key, error = %e, "undecodable route event");
            None
        }
    }
}
