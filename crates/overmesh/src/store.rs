//! Key/value store interface and the managers built on it
//!
//! The controller keeps its authoritative edge/route/namespace records in an
//! external watched store. The core only depends on the narrow [`Store`]
//! contract; [`MemStore`] implements it in-process for tests and
//! single-node deployments.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{MeshError, Result};

/// Key prefix for edge records: `/edges/<namespace>/<name>`
pub const EDGE_PREFIX: &str = "/edges/";
/// Key prefix for route records: `/routes/<namespace>/<name>`
pub const ROUTE_PREFIX: &str = "/routes/";
/// Key prefix for namespace records: `/namespace/<name>`
pub const NAMESPACE_PREFIX: &str = "/namespace/";
/// Key prefix for the secret index: `/auth/<secret>`
pub const AUTH_PREFIX: &str = "/auth/";

// =============================================================================
// Store contract
// =============================================================================

/// Kind of a watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    /// Key created or updated
    Put,
    /// Key deleted
    Delete,
}

/// One change observed on a watched prefix
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// What happened
    pub kind: StoreEventKind,
    /// Affected key
    pub key: String,
    /// New value (present on put)
    pub value: Option<String>,
    /// Previous value (present on delete, and on put over an existing key)
    pub prev_value: Option<String>,
}

/// Narrow contract to the external key/value store
#[async_trait]
pub trait Store: Send + Sync {
    /// Set a key to a value
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Get a key's value, `None` when absent
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete a key; deleting an absent key is a no-op
    async fn del(&self, key: &str) -> Result<()>;

    /// List all key/value pairs under a prefix
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Watch a prefix for put/delete events
    async fn watch(&self, prefix: &str) -> mpsc::Receiver<StoreEvent>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// Capacity of each watcher channel
const WATCH_BUFFER: usize = 128;

/// In-process [`Store`] with watch fan-out
pub struct MemStore {
    data: RwLock<BTreeMap<String, String>>,
    watchers: Mutex<Vec<(String, mpsc::Sender<StoreEvent>)>>,
}

impl MemStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    fn notify(&self, event: &StoreEvent) {
        // Prune watchers whose receiver is gone while fanning out.
        self.watchers.lock().retain(|(prefix, tx)| {
            if tx.is_closed() {
                return false;
            }
            if event.key.starts_with(prefix.as_str()) {
                let _ = tx.try_send(event.clone());
            }
            true
        });
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let prev = self
            .data
            .write()
            .insert(key.to_string(), value.to_string());
        self.notify(&StoreEvent {
            kind: StoreEventKind::Put,
            key: key.to_string(),
            value: Some(value.to_string()),
            prev_value: prev,
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let prev = self.data.write().remove(key);
        if let Some(prev) = prev {
            self.notify(&StoreEvent {
                kind: StoreEventKind::Delete,
                key: key.to_string(),
                value: None,
                prev_value: Some(prev),
            });
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> mpsc::Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        self.watchers.lock().push((prefix.to_string(), tx));
        rx
    }
}

// =============================================================================
// Records
// =============================================================================

/// Identity and network placement of one overlay node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Edge {
    /// Edge name, unique within its namespace
    pub name: String,
    /// Tenant namespace
    pub namespace: String,
    /// The subnet this edge fronts
    pub cidr: String,
    /// Public `ip:port` other edges dial
    pub listen_addr: String,
    /// Cloud provider for route injection, when any
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub csp_type: Option<String>,
    /// Free-form operator note
    #[serde(default)]
    pub comment: String,
}

/// A manually injected forwarding rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Route {
    /// Route name, unique within its namespace
    pub name: String,
    /// Destination subnet
    pub cidr: String,
    /// Listen address of the edge receiving traffic for `cidr`
    pub nexthop: String,
}

/// A tenant boundary with its registration secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Namespace {
    /// Namespace name
    pub name: String,
    /// Shared secret edges present at registration
    pub secret: String,
}

fn decode<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    serde_json::from_str(value).map_err(|e| MeshError::registry(format!("decode record: {e}")))
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| MeshError::registry(format!("encode record: {e}")))
}

// =============================================================================
// Edge manager
// =============================================================================

/// CRUD and watch over edge records
pub struct EdgeManager {
    store: Arc<dyn Store>,
}

impl EdgeManager {
    /// Create a manager over the given store
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn key(namespace: &str, name: &str) -> String {
        format!("{EDGE_PREFIX}{namespace}/{name}")
    }

    /// Create or update an edge record
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn add_edge(&self, edge: &Edge) -> Result<()> {
        self.store
            .set(&Self::key(&edge.namespace, &edge.name), &encode(edge)?)
            .await
    }

    /// Delete an edge record
    ///
    /// # Errors
    ///
    /// Returns an error if the store delete fails.
    pub async fn del_edge(&self, namespace: &str, name: &str) -> Result<()> {
        self.store.del(&Self::key(namespace, name)).await
    }

    /// Fetch one edge record
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails or the record is corrupt.
    pub async fn get_edge(&self, namespace: &str, name: &str) -> Result<Option<Edge>> {
        match self.store.get(&Self::key(namespace, name)).await? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// List all edges in a namespace
    ///
    /// Corrupt records are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn get_edges(&self, namespace: &str) -> Result<Vec<Edge>> {
        let pairs = self
            .store
            .list(&format!("{EDGE_PREFIX}{namespace}/"))
            .await?;
        let mut edges = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            match decode::<Edge>(&value) {
                Ok(edge) => edges.push(edge),
                Err(e) => tracing::error!(key = %key, error = %e, "skipping corrupt edge record"),
            }
        }
        Ok(edges)
    }

    /// Watch all edge records for changes
    pub async fn watch(&self) -> mpsc::Receiver<StoreEvent> {
        self.store.watch(EDGE_PREFIX).await
    }

    /// Check a new edge CIDR for conflicts with existing edges
    ///
    /// Currently always passes; overlap enforcement would reject
    /// configurations the deployed system accepts today.
    #[must_use]
    pub fn verify_cidr(&self, _cidr: &str) -> bool {
        true
    }
}

// =============================================================================
// Route manager
// =============================================================================

/// CRUD and watch over administrative route records
pub struct RouteManager {
    store: Arc<dyn Store>,
}

impl RouteManager {
    /// Create a manager over the given store
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn key(namespace: &str, name: &str) -> String {
        format!("{ROUTE_PREFIX}{namespace}/{name}")
    }

    /// Create or update a route record
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn add_route(&self, namespace: &str, route: &Route) -> Result<()> {
        self.store
            .set(&Self::key(namespace, &route.name), &encode(route)?)
            .await
    }

    /// Delete a route record
    ///
    /// # Errors
    ///
    /// Returns an error if the store delete fails.
    pub async fn del_route(&self, namespace: &str, name: &str) -> Result<()> {
        self.store.del(&Self::key(namespace, name)).await
    }

    /// List all routes in a namespace
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn get_routes(&self, namespace: &str) -> Result<Vec<Route>> {
        let pairs = self
            .store
            .list(&format!("{ROUTE_PREFIX}{namespace}/"))
            .await?;
        let mut routes = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            match decode::<Route>(&value) {
                Ok(route) => routes.push(route),
                Err(e) => tracing::error!(key = %key, error = %e, "skipping corrupt route record"),
            }
        }
        Ok(routes)
    }

    /// Watch all route records for changes
    pub async fn watch(&self) -> mpsc::Receiver<StoreEvent> {
        self.store.watch(ROUTE_PREFIX).await
    }
}

/// Extract the namespace segment from a `/routes/<ns>/<name>` key
#[must_use]
pub fn route_key_namespace(key: &str) -> Option<&str> {
    key.strip_prefix(ROUTE_PREFIX)?.split('/').next()
}

// =============================================================================
// Namespace manager
// =============================================================================

/// Namespace records plus the secret index used at registration
pub struct NamespaceManager {
    store: Arc<dyn Store>,
}

impl NamespaceManager {
    /// Create a manager over the given store
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create a namespace and index its secret
    ///
    /// # Errors
    ///
    /// Returns an error if either store write fails.
    pub async fn add_namespace(&self, ns: &Namespace) -> Result<()> {
        let value = encode(ns)?;
        self.store
            .set(&format!("{NAMESPACE_PREFIX}{}", ns.name), &value)
            .await?;
        self.store
            .set(&format!("{AUTH_PREFIX}{}", ns.secret), &value)
            .await
    }

    /// Delete a namespace and its secret index entry
    ///
    /// # Errors
    ///
    /// Returns an error if the store access fails.
    pub async fn del_namespace(&self, name: &str) -> Result<()> {
        if let Some(ns) = self.get_namespace(name).await? {
            self.store
                .del(&format!("{AUTH_PREFIX}{}", ns.secret))
                .await?;
        }
        self.store.del(&format!("{NAMESPACE_PREFIX}{name}")).await
    }

    /// Fetch a namespace by name
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails or the record is corrupt.
    pub async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        match self.store.get(&format!("{NAMESPACE_PREFIX}{name}")).await? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Resolve a registration secret to its namespace
    ///
    /// This is the auth collaborator call the registry makes for every
    /// incoming connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails or the record is corrupt.
    pub async fn resolve_secret(&self, secret: &str) -> Result<Option<Namespace>> {
        match self.store.get(&format!("{AUTH_PREFIX}{secret}")).await? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_edge(namespace: &str, name: &str, cidr: &str, listen: &str) -> Edge {
        Edge {
            name: name.to_string(),
            namespace: namespace.to_string(),
            cidr: cidr.to_string(),
            listen_addr: listen.to_string(),
            csp_type: None,
            comment: String::new(),
        }
    }

    #[tokio::test]
    async fn test_memstore_set_get_del() {
        let store = MemStore::new();
        store.set("/k", "v1").await.unwrap();
        assert_eq!(store.get("/k").await.unwrap(), Some("v1".to_string()));

        store.set("/k", "v2").await.unwrap();
        assert_eq!(store.get("/k").await.unwrap(), Some("v2".to_string()));

        store.del("/k").await.unwrap();
        assert_eq!(store.get("/k").await.unwrap(), None);

        // Deleting an absent key is a no-op.
        store.del("/k").await.unwrap();
    }

    #[tokio::test]
    async fn test_memstore_list_prefix() {
        let store = MemStore::new();
        store.set("/edges/ns/a", "1").await.unwrap();
        store.set("/edges/ns/b", "2").await.unwrap();
        store.set("/edges/other/c", "3").await.unwrap();
        store.set("/routes/ns/r", "4").await.unwrap();

        let listed = store.list("/edges/ns/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "/edges/ns/a");
        assert_eq!(listed[1].0, "/edges/ns/b");
    }

    #[tokio::test]
    async fn test_memstore_watch_put_and_delete() {
        let store = MemStore::new();
        let mut events = store.watch("/edges/").await;

        store.set("/edges/ns/a", "v1").await.unwrap();
        store.set("/routes/ns/r", "x").await.unwrap(); // outside prefix
        store.del("/edges/ns/a").await.unwrap();

        let put = events.recv().await.unwrap();
        assert_eq!(put.kind, StoreEventKind::Put);
        assert_eq!(put.key, "/edges/ns/a");
        assert_eq!(put.value.as_deref(), Some("v1"));
        assert!(put.prev_value.is_none());

        let del = events.recv().await.unwrap();
        assert_eq!(del.kind, StoreEventKind::Delete);
        assert_eq!(del.key, "/edges/ns/a");
        assert!(del.value.is_none());
        assert_eq!(del.prev_value.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_memstore_watch_put_carries_prev_value() {
        let store = MemStore::new();
        store.set("/edges/ns/a", "old").await.unwrap();

        let mut events = store.watch("/edges/").await;
        store.set("/edges/ns/a", "new").await.unwrap();

        let evt = events.recv().await.unwrap();
        assert_eq!(evt.value.as_deref(), Some("new"));
        assert_eq!(evt.prev_value.as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn test_edge_manager_crud() {
        let store = Arc::new(MemStore::new());
        let mgr = EdgeManager::new(store);

        let e1 = test_edge("ns", "e1", "10.1.0.0/24", "a:1");
        let e2 = test_edge("ns", "e2", "10.2.0.0/24", "b:2");
        mgr.add_edge(&e1).await.unwrap();
        mgr.add_edge(&e2).await.unwrap();
        mgr.add_edge(&test_edge("other", "e3", "10.3.0.0/24", "c:3"))
            .await
            .unwrap();

        assert_eq!(mgr.get_edge("ns", "e1").await.unwrap(), Some(e1.clone()));
        assert_eq!(mgr.get_edges("ns").await.unwrap().len(), 2);

        mgr.del_edge("ns", "e1").await.unwrap();
        assert_eq!(mgr.get_edge("ns", "e1").await.unwrap(), None);
        assert_eq!(mgr.get_edges("ns").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_verify_cidr_always_passes() {
        let mgr = EdgeManager::new(Arc::new(MemStore::new()));
        assert!(mgr.verify_cidr("10.0.0.0/24"));
        assert!(mgr.verify_cidr("10.0.0.0/16")); // overlaps, still passes
    }

    #[tokio::test]
    async fn test_route_manager_crud() {
        let store = Arc::new(MemStore::new());
        let mgr = RouteManager::new(store);

        let route = Route {
            name: "to-office".to_string(),
            cidr: "192.168.50.0/24".to_string(),
            nexthop: "a:1".to_string(),
        };
        mgr.add_route("ns", &route).await.unwrap();
        assert_eq!(mgr.get_routes("ns").await.unwrap(), vec![route]);

        mgr.del_route("ns", "to-office").await.unwrap();
        assert!(mgr.get_routes("ns").await.unwrap().is_empty());
    }

    #[test]
    fn test_route_key_namespace() {
        assert_eq!(route_key_namespace("/routes/ns/r1"), Some("ns"));
        assert_eq!(route_key_namespace("/edges/ns/e1"), None);
    }

    #[tokio::test]
    async fn test_namespace_secret_resolution() {
        let store = Arc::new(MemStore::new());
        let mgr = NamespaceManager::new(store);

        let ns = Namespace {
            name: "prod".to_string(),
            secret: "s3cret".to_string(),
        };
        mgr.add_namespace(&ns).await.unwrap();

        assert_eq!(mgr.resolve_secret("s3cret").await.unwrap(), Some(ns.clone()));
        assert_eq!(mgr.resolve_secret("wrong").await.unwrap(), None);
        assert_eq!(mgr.get_namespace("prod").await.unwrap(), Some(ns));

        mgr.del_namespace("prod").await.unwrap();
        assert_eq!(mgr.resolve_secret("s3cret").await.unwrap(), None);
        assert_eq!(mgr.get_namespace("prod").await.unwrap(), None);
    }
}
