//! Handle acquisition and release against the mock server.
//!
//! Focus areas:
//! - Compatible acquisitions share one server handle
//! - Incompatible access modes get separate handles
//! - The last release closes on the wire, with pending size pushed first
//! - Misuse of tokens is rejected

mod common;

use std::sync::Arc;
use std::thread;

use common::{dir, file, setup};
use oxsmb_core::{AccessMode, CloseMode, Error, Request, RequestKind, VolumeConfig, WireStatus};

const RW: AccessMode = AccessMode::READ.union(AccessMode::WRITE);

#[test]
fn test_read_then_write_opens_two_handles() {
    let (server, volume) = setup(VolumeConfig::default());
    server.add_file("a.txt", 10);
    let node = file(&volume, "a.txt");

    let read = volume.acquire(&node, AccessMode::READ).unwrap();
    let write = volume.acquire(&node, AccessMode::WRITE).unwrap();
    assert_eq!(node.open_handle_count(), 2);
    assert_eq!(server.open_handles(), 2);

    volume.release(&node, read, CloseMode::Normal).unwrap();
    volume.release(&node, write, CloseMode::Normal).unwrap();
    assert_eq!(node.open_handle_count(), 0);
    assert_eq!(server.open_handles(), 0);
    assert_eq!(server.count(RequestKind::Close), 2);
}

#[test]
fn test_compatible_acquisitions_share_handle() {
    let (server, volume) = setup(VolumeConfig::default());
    server.add_file("shared", 1);
    let node = file(&volume, "shared");

    let first = volume.acquire(&node, AccessMode::READ).unwrap();
    let second = volume.acquire(&node, AccessMode::READ).unwrap();
    assert_eq!(server.count(RequestKind::Open), 1);
    assert_eq!(node.handle_refs(), 2);
    assert_eq!(first.slot(), second.slot());

    volume.release(&node, first, CloseMode::Normal).unwrap();
    assert_eq!(server.count(RequestKind::Close), 0);
    assert_eq!(node.handle_refs(), 1);

    volume.release(&node, second, CloseMode::Normal).unwrap();
    assert_eq!(server.count(RequestKind::Close), 1);

    let stats = volume.stats();
    assert_eq!(stats.wire_opens, 1);
    assert_eq!(stats.handle_reuses, 1);
    assert_eq!(stats.wire_closes, 1);
}

#[test]
fn test_read_write_handle_preferred() {
    let (server, volume) = setup(VolumeConfig::default());
    server.add_file("f", 1);
    let node = file(&volume, "f");

    let read = volume.acquire(&node, AccessMode::READ).unwrap();
    let rw = volume.acquire(&node, RW).unwrap();
    let again = volume.acquire(&node, AccessMode::READ).unwrap();

    assert_eq!(again.slot(), rw.slot());
    assert_eq!(server.count(RequestKind::Open), 2);

    for token in [read, rw, again] {
        volume.release(&node, token, CloseMode::Normal).unwrap();
    }
    assert_eq!(server.open_handles(), 0);
}

#[test]
fn test_open_requests_exact_access() {
    let (server, volume) = setup(VolumeConfig::default());
    server.add_file("f", 1);
    let node = file(&volume, "f");

    let token = volume.acquire(&node, AccessMode::WRITE).unwrap();
    let handle = volume.server_handle(&node, &token).unwrap();
    assert_eq!(server.handle_access(handle), Some(AccessMode::WRITE));
    assert!(server.requests().contains(&Request::Open {
        path: node.path(),
        access: AccessMode::WRITE,
        directory: false,
    }));
    volume.release(&node, token, CloseMode::Normal).unwrap();
}

#[test]
fn test_directory_handles_are_private() {
    let (server, volume) = setup(VolumeConfig::default());
    server.add_dir("docs");
    let node = dir(&volume, "docs");

    let a = volume.acquire(&node, AccessMode::READ).unwrap();
    let b = volume.acquire(&node, AccessMode::READ).unwrap();
    assert_ne!(a.slot(), b.slot());
    assert_eq!(server.count(RequestKind::Open), 2);
    assert_eq!(node.open_handle_count(), 2);

    volume.release(&node, a, CloseMode::Normal).unwrap();
    volume.release(&node, b, CloseMode::Normal).unwrap();
    assert_eq!(server.open_handles(), 0);
}

#[test]
fn test_token_of_other_node_rejected() {
    let (server, volume) = setup(VolumeConfig::default());
    server.add_file("a", 1);
    server.add_file("b", 1);
    let a = file(&volume, "a");
    let b = file(&volume, "b");

    let token = volume.acquire(&a, AccessMode::READ).unwrap();
    let err = volume.release(&b, token, CloseMode::Normal).unwrap_err();
    assert!(matches!(err, Error::InvalidHandle(_)));
    assert_eq!(a.open_handle_count(), 1);
    assert_eq!(server.count(RequestKind::Close), 0);
}

#[test]
fn test_final_close_pushes_pending_size() {
    let (server, volume) = setup(VolumeConfig::default());
    server.add_file("grow", 1);
    let node = file(&volume, "grow");

    let token = volume.acquire(&node, AccessMode::WRITE).unwrap();
    volume.set_pending_size(&node, 4096).unwrap();
    server.clear_log();
    volume.release(&node, token, CloseMode::Final).unwrap();

    let kinds: Vec<RequestKind> = server.requests().iter().map(Request::kind).collect();
    assert_eq!(kinds, [RequestKind::SetEndOfFile, RequestKind::Close]);
    assert_eq!(server.attributes("grow").map(|a| a.size), Some(4096));
}

#[test]
fn test_normal_close_keeps_size_pending() {
    let (server, volume) = setup(VolumeConfig::default());
    server.add_file("grow", 1);
    let node = file(&volume, "grow");

    let token = volume.acquire(&node, AccessMode::WRITE).unwrap();
    volume.set_pending_size(&node, 10).unwrap();
    volume.release(&node, token, CloseMode::Normal).unwrap();
    assert_eq!(server.count(RequestKind::SetEndOfFile), 0);

    let token = volume.acquire(&node, AccessMode::WRITE).unwrap();
    volume.release(&node, token, CloseMode::Final).unwrap();
    assert_eq!(server.attributes("grow").map(|a| a.size), Some(10));
}

#[test]
fn test_failed_size_push_still_closes() {
    let (server, volume) = setup(VolumeConfig::default());
    server.add_file("f", 1);
    let node = file(&volume, "f");

    let token = volume.acquire(&node, AccessMode::WRITE).unwrap();
    volume.set_pending_size(&node, 99).unwrap();
    server.fail_next(RequestKind::SetEndOfFile, WireStatus::AccessDenied);

    let err = volume.release(&node, token, CloseMode::Final).unwrap_err();
    assert!(matches!(err, Error::AccessDenied(_)));
    assert_eq!(node.open_handle_count(), 0);
    assert_eq!(server.open_handles(), 0);
}

#[test]
fn test_lock_handles_closed_with_primary() {
    let (server, volume) = setup(VolumeConfig::default());
    server.add_file("locked", 1);
    let node = file(&volume, "locked");

    let token = volume.acquire(&node, AccessMode::WRITE).unwrap();
    let lock = volume.open_lock_handle(&node, &token).unwrap();
    assert_eq!(server.handle_access(lock), Some(AccessMode::WRITE));
    assert_eq!(server.open_handles(), 2);
    assert_eq!(node.open_handle_count(), 1);

    volume.release(&node, token, CloseMode::Normal).unwrap();
    assert_eq!(server.open_handles(), 0);
    assert_eq!(server.count(RequestKind::Close), 2);
}

#[test]
fn test_access_denied_leaves_no_handle() {
    let (server, volume) = setup(VolumeConfig::default());
    server.add_file("secret", 1);
    server.deny_access("secret");
    let node = file(&volume, "secret");

    let err = volume.acquire(&node, AccessMode::READ).unwrap_err();
    assert!(matches!(err, Error::AccessDenied(_)));
    assert!(!err.is_transient());
    assert_eq!(node.open_handle_count(), 0);
}

#[test]
fn test_transport_failure_is_transient() {
    let (server, volume) = setup(VolumeConfig::default());
    server.add_file("f", 1);
    server.fail_next(RequestKind::Open, WireStatus::Disconnected);
    let node = file(&volume, "f");

    let err = volume.acquire(&node, AccessMode::READ).unwrap_err();
    assert!(err.is_transient());
    assert_eq!(err.to_errno(), libc::EIO);

    let token = volume.acquire(&node, AccessMode::READ).unwrap();
    volume.release(&node, token, CloseMode::Normal).unwrap();
}

#[test]
fn test_close_failure_is_not_reported() {
    let (server, volume) = setup(VolumeConfig::default());
    server.add_file("f", 1);
    let node = file(&volume, "f");

    let token = volume.acquire(&node, AccessMode::READ).unwrap();
    server.fail_next(RequestKind::Close, WireStatus::TimedOut);
    volume.release(&node, token, CloseMode::Normal).unwrap();
    assert_eq!(node.open_handle_count(), 0);
}

#[test]
fn test_concurrent_acquire_shares_one_handle() {
    let (server, volume) = setup(VolumeConfig::default());
    server.add_file("hot", 1);
    let volume = Arc::new(volume);
    let node = file(&volume, "hot");

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let volume = Arc::clone(&volume);
            let node = Arc::clone(&node);
            thread::spawn(move || volume.acquire(&node, AccessMode::READ).unwrap())
        })
        .collect();
    let tokens: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(server.count(RequestKind::Open), 1);
    assert_eq!(node.handle_refs(), 8);

    for token in tokens {
        volume.release(&node, token, CloseMode::Normal).unwrap();
    }
    assert_eq!(server.count(RequestKind::Close), 1);
    assert_eq!(server.open_handles(), 0);
}

#[test]
fn test_wire_handles_bounded_by_access_groups() {
    let (server, volume) = setup(VolumeConfig::default());
    server.add_file("f", 1);
    let node = file(&volume, "f");

    let modes = [
        AccessMode::READ,
        AccessMode::READ,
        AccessMode::WRITE,
        AccessMode::WRITE,
        AccessMode::READ,
    ];
    let tokens: Vec<_> = modes
        .iter()
        .map(|m| volume.acquire(&node, *m).unwrap())
        .collect();
    assert_eq!(server.open_handles(), 2);
    assert_eq!(node.handle_refs(), 5);

    for token in tokens {
        volume.release(&node, token, CloseMode::Normal).unwrap();
    }
    assert_eq!(server.open_handles(), 0);
}
