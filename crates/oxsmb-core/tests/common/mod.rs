//! Shared setup for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use oxsmb_core::testing::{MockServer, mock_volume};
use oxsmb_core::{FileNode, NodeKind, RemotePath, Request, RequestKind, Volume, VolumeConfig};
use tracing_subscriber::EnvFilter;

/// Installs a test-writer subscriber once. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A mock server and a volume on it.
pub fn setup(config: VolumeConfig) -> (Arc<MockServer>, Volume<MockServer>) {
    init_tracing();
    mock_volume(config).expect("Failed to create volume")
}

pub fn file(volume: &Volume<MockServer>, path: &str) -> Arc<FileNode> {
    volume.lookup(&RemotePath::new(path), NodeKind::File, None)
}

pub fn dir(volume: &Volume<MockServer>, path: &str) -> Arc<FileNode> {
    volume.lookup(&RemotePath::new(path), NodeKind::Directory, None)
}

/// Makes the server drop and re-establish its connection when it receives
/// the first request of `kind`, before processing it. Returns a flag set once
/// that has happened.
pub fn reconnect_on_first(server: &Arc<MockServer>, kind: RequestKind) -> Arc<AtomicBool> {
    let fired = Arc::new(AtomicBool::new(false));
    let weak = Arc::downgrade(server);
    let flag = Arc::clone(&fired);
    server.set_hook(Arc::new(move |req: &Request| {
        if req.kind() == kind
            && !flag.swap(true, Ordering::SeqCst)
            && let Some(server) = weak.upgrade()
        {
            server.reconnect();
        }
    }));
    fired
}

/// Runs `f` on its own thread, failing the test if it has not returned
/// within five seconds.
pub fn finishes<R, F>(f: F) -> R
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("operation did not finish")
}
