//! Overmesh controller daemon
//!
//! Runs the registry server and the topology broadcaster over an in-process
//! store, optionally seeded with namespaces, edges and routes from the
//! config file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use overmesh::{
    ControllerConfig, EdgeManager, LogStatSink, MemStore, NamespaceManager, RegistryServer, Route,
    RouteManager, SessionTable, Store, TopologyBroadcaster,
};

/// Overmesh controller daemon
#[derive(Parser)]
#[command(name = "overmesh-controller", version, about = "Overmesh controller daemon")]
struct Cli {
    /// Path to the controller configuration file
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "overmesh=info,overmesh_controller=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ControllerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let edges = Arc::new(EdgeManager::new(Arc::clone(&store)));
    let routes = Arc::new(RouteManager::new(Arc::clone(&store)));
    let namespaces = Arc::new(NamespaceManager::new(Arc::clone(&store)));
    let sessions = Arc::new(SessionTable::new());

    let broadcaster = TopologyBroadcaster::subscribe(
        Arc::clone(&sessions),
        &edges,
        &routes,
        config.registry.broadcast_timeout,
    )
    .await;
    tokio::spawn(broadcaster.run());

    seed(&config, &edges, &routes, &namespaces).await?;

    let server = RegistryServer::new(
        config.registry.clone(),
        sessions,
        edges,
        routes,
        namespaces,
        Arc::new(LogStatSink),
    );
    server.serve().await.context("registry server failed")
}

/// Load the configured seed records into the store
async fn seed(
    config: &ControllerConfig,
    edges: &EdgeManager,
    routes: &RouteManager,
    namespaces: &NamespaceManager,
) -> Result<()> {
    for ns in &config.seed.namespaces {
        namespaces
            .add_namespace(ns)
            .await
            .with_context(|| format!("seeding namespace {}", ns.name))?;
        tracing::info!(namespace = %ns.name, "namespace seeded");
    }
    for edge in &config.seed.edges {
        if !edges.verify_cidr(&edge.cidr) {
            tracing::warn!(edge = %edge.name, cidr = %edge.cidr, "cidr conflict check failed");
            continue;
        }
        edges
            .add_edge(edge)
            .await
            .with_context(|| format!("seeding edge {}", edge.name))?;
        tracing::info!(namespace = %edge.namespace, edge = %edge.name, "edge seeded");
    }
    for route in &config.seed.routes {
        routes
            .add_route(
                &route.namespace,
                &Route {
                    name: route.name.clone(),
                    cidr: route.cidr.clone(),
                    nexthop: route.nexthop.clone(),
                },
            )
            .await
            .with_context(|| format!("seeding route {}", route.name))?;
        tracing::info!(namespace = %route.namespace, route = %route.name, "route seeded");
    }
    Ok(())
}
