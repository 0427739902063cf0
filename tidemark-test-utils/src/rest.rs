//! Mock REST surface serving depth snapshots.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

struct SnapshotQueue {
    /// Responses served in order; the last one keeps being served.
    queue: Mutex<VecDeque<Value>>,
    served: AtomicUsize,
}

/// Serves `GET /depth` from a scripted queue of snapshot payloads.
pub struct MockSnapshotApi {
    addr: SocketAddr,
    snapshots: Arc<SnapshotQueue>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockSnapshotApi {
    pub async fn spawn(snapshots: Vec<Value>) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let std_listener = listener.into_std()?;
        std_listener.set_nonblocking(true)?;

        let queue = Arc::new(SnapshotQueue {
            queue: Mutex::new(snapshots.into()),
            served: AtomicUsize::new(0),
        });
        let service_queue = queue.clone();
        let make_svc = make_service_fn(move |_| {
            let queue = service_queue.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let queue = queue.clone();
                    async move { Ok::<_, Infallible>(route(req, queue)) }
                }))
            }
        });
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = Server::from_tcp(std_listener)?.serve(make_svc);
        let handle = tokio::spawn(async move {
            if let Err(err) = server
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                tracing::error!(error = %err, "mock snapshot server exited with error");
            }
        });
        Ok(Self {
            addr,
            snapshots: queue,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// How many snapshot requests were answered so far.
    #[must_use]
    pub fn served_count(&self) -> usize {
        self.snapshots.served.load(Ordering::SeqCst)
    }

    /// Replace the scripted responses.
    pub fn set_snapshots(&self, snapshots: Vec<Value>) {
        *self
            .snapshots
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = snapshots.into();
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

impl Drop for MockSnapshotApi {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

fn route(req: Request<Body>, queue: Arc<SnapshotQueue>) -> Response<Body> {
    if req.method() != Method::GET || !req.uri().path().starts_with("/depth") {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found"))
            .unwrap_or_default();
    }
    let payload = {
        let mut snapshots = queue
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if snapshots.len() > 1 {
            snapshots.pop_front()
        } else {
            snapshots.front().cloned()
        }
    };
    match payload {
        Some(snapshot) => {
            queue.served.fetch_add(1, Ordering::SeqCst);
            debug!(uri = %req.uri(), "serving scripted snapshot");
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Body::from(snapshot.to_string()))
                .unwrap_or_default()
        }
        None => Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Body::from("no snapshot scripted"))
            .unwrap_or_default(),
    }
}
