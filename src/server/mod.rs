//! Request dispatcher and Unix socket server
//!
//! One HTTP endpoint, /cni, served over a local socket that only root can
//! reach. The shim forwards its CNI invocation there and writes whatever
//! comes back to its own stdout.

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::delegate::NetworkDelegate;
use crate::netns;
use crate::portmap::{parse_port_spec, MappingStore, PortMapper};
use crate::types::{AllocationResult, CniCommand, CniRequest, PodRequest};

/// Sequences one request through namespace prep, delegation and port
/// mapping
pub struct Dispatcher {
    delegate: Arc<dyn NetworkDelegate>,
    store: MappingStore,
    mapper: Arc<dyn PortMapper>,
}

impl Dispatcher {
    pub fn new(
        delegate: Arc<dyn NetworkDelegate>,
        store: MappingStore,
        mapper: Arc<dyn PortMapper>,
    ) -> Self {
        Self {
            delegate,
            store,
            mapper,
        }
    }

    /// Handle a parsed request. `Ok(None)` is success with nothing to
    /// report, which the server turns into an empty 200.
    pub async fn handle(&self, req: &PodRequest) -> Result<Option<AllocationResult>> {
        let started = Instant::now();
        info!("handling {}", req);
        let outcome = match req.command {
            CniCommand::Add => self.add(req).await.map(Some),
            CniCommand::Del => self.del(req).await.map(|()| None),
        };
        match &outcome {
            Ok(_) => info!("completed {} in {:?}", req, started.elapsed()),
            Err(e) => warn!("failed {}: {:#}", req, e),
        }
        outcome
    }

    async fn add(&self, req: &PodRequest) -> Result<AllocationResult> {
        if !req.netns.is_empty() {
            // Pods are IPv4-only; losing this sysctl is survivable, so a
            // failure is logged and the request continues.
            let path = req.netns.clone();
            match tokio::task::spawn_blocking(move || netns::disable_ipv6(&path)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("could not disable IPv6 in {}: {:#}", req.netns, e),
                Err(e) => warn!("IPv6 disable task failed: {}", e),
            }
        }

        let result = self.delegate.add(req).await?;

        if !req.port_spec.is_empty() {
            self.install_port_mappings(req, &result).await?;
        }
        Ok(result)
    }

    async fn install_port_mappings(
        &self,
        req: &PodRequest,
        result: &AllocationResult,
    ) -> Result<()> {
        let mut mappings = parse_port_spec(&req.port_spec)?;
        let pod_ip = result
            .pod_ipv4()
            .context("port mappings requested but the delegate reported no IPv4 address")?;
        for mapping in &mut mappings {
            mapping.pod_ip = Some(pod_ip);
        }

        self.store.save(&req.container_id, &req.port_spec).await?;
        if let Err(e) = self.mapper.install(req, &mappings).await {
            // Keep the store in step with the kernel: drop the record that
            // no longer describes installed rules.
            if let Err(cleanup) = self.store.consume(&req.container_id).await {
                warn!(
                    "could not drop mapping record for {}: {}",
                    req.container_id, cleanup
                );
            }
            return Err(e);
        }
        Ok(())
    }

    async fn del(&self, req: &PodRequest) -> Result<()> {
        self.delegate.del(req).await?;
        // No record means no rules were installed; DEL stays idempotent.
        if let Some(spec) = self.store.consume(&req.container_id).await? {
            let mappings = parse_port_spec(&spec)?;
            self.mapper.remove(req, &mappings).await?;
        }
        Ok(())
    }
}

fn parse_request(body: &[u8]) -> Result<PodRequest> {
    let wire: CniRequest =
        serde_json::from_slice(body).context("Failed to parse request body")?;
    wire.into_pod_request()
}

fn bad_request(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, format!("{:#}", e))
}

async fn cni_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    body: Bytes,
) -> Result<Response, (StatusCode, String)> {
    let req = parse_request(&body).map_err(bad_request)?;
    match dispatcher.handle(&req).await {
        Ok(Some(result)) => Ok(Json(result).into_response()),
        Ok(None) => Ok(StatusCode::OK.into_response()),
        Err(e) => Err(bad_request(e)),
    }
}

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/cni", get(cni_handler).post(cni_handler))
        .with_state(dispatcher)
}

/// Bind the socket with owner-only permissions, replacing a stale one left
/// by an unclean shutdown.
pub fn bind_socket(path: &Path) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .context("Failed to restrict socket permissions")?;
    Ok(listener)
}

pub async fn serve(path: &Path, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let listener = bind_socket(path)?;
    info!(socket = %path.display(), "listening for CNI requests");
    axum::serve(listener, router(dispatcher))
        .await
        .context("server terminated")?;
    Ok(())
}
