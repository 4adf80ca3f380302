//! Unlinking files that are still open.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{file, finishes, reconnect_on_first, setup};
use oxsmb_core::{
    AccessMode, CloseMode, Error, InfoLevel, NodeKind, RemotePath, RequestKind, VolumeConfig,
    WireStatus,
};

fn config() -> VolumeConfig {
    VolumeConfig::default().process_id(0x1f)
}

#[test]
fn test_unlink_closed_file_deletes() {
    let (server, volume) = setup(config());
    server.add_file("f", 1);
    let node = file(&volume, "f");

    volume.unlink(&volume.root(), &node).unwrap();
    assert!(!server.exists("f"));
    assert_eq!(server.count(RequestKind::Rename), 0);
    assert_eq!(volume.stats().silly_renames, 0);
}

#[test]
fn test_unlink_open_file_renames_and_deletes_on_close() {
    let (server, volume) = setup(config());
    server.add_file("busy", 1);
    let node = file(&volume, "busy");
    let token = volume.acquire(&node, AccessMode::WRITE).unwrap();

    volume.unlink(&volume.root(), &node).unwrap();

    assert!(!server.exists("busy"));
    assert!(server.exists(".smbdelete1f000"));
    assert_eq!(node.path(), RemotePath::new(".smbdelete1f000"));
    assert_eq!(server.attributes(".smbdelete1f000").map(|a| a.hidden), Some(true));
    assert!(server.delete_pending(".smbdelete1f000"));
    assert!(!node.delete_on_close_pending());
    assert_eq!(volume.stats().silly_renames, 1);

    volume.release(&node, token, CloseMode::Final).unwrap();
    assert!(!server.exists(".smbdelete1f000"));
}

#[test]
fn test_collision_tries_next_candidate() {
    let (server, volume) = setup(config());
    server.add_file("busy", 1);
    server.add_file(".smbdelete1f000", 1);
    let node = file(&volume, "busy");
    let token = volume.acquire(&node, AccessMode::WRITE).unwrap();

    volume.unlink(&volume.root(), &node).unwrap();
    assert!(server.exists(".smbdelete1f001"));
    assert_eq!(server.count(RequestKind::Rename), 2);

    volume.release(&node, token, CloseMode::Normal).unwrap();
}

#[test]
fn test_probing_skips_taken_names() {
    let (server, volume) = setup(config().probe_silly_names(true));
    server.add_file("busy", 1);
    server.add_file(".smbdelete1f000", 1);
    let node = file(&volume, "busy");
    let token = volume.acquire(&node, AccessMode::WRITE).unwrap();

    volume.unlink(&volume.root(), &node).unwrap();
    assert!(server.exists(".smbdelete1f001"));
    assert_eq!(server.count(RequestKind::Rename), 1);
    assert_eq!(server.count(RequestKind::FindFirst), 2);

    volume.release(&node, token, CloseMode::Normal).unwrap();
}

#[test]
fn test_refused_delete_on_close_recorded_locally() {
    let (server, volume) = setup(config());
    server.add_file("ro", 1);
    let node = file(&volume, "ro");
    let token = volume.acquire(&node, AccessMode::READ).unwrap();

    volume.unlink(&volume.root(), &node).unwrap();
    assert!(node.delete_on_close_pending());
    assert!(!server.delete_pending(".smbdelete1f000"));

    volume.release(&node, token, CloseMode::Final).unwrap();
    assert!(!server.exists(".smbdelete1f000"));
    assert!(!node.delete_on_close_pending());
    assert_eq!(server.count(RequestKind::Delete), 1);
}

#[test]
fn test_recorded_delete_survives_reconnect() {
    let (server, volume) = setup(config());
    server.add_file("ro", 1);
    let node = file(&volume, "ro");
    let token = volume.acquire(&node, AccessMode::READ).unwrap();
    volume.unlink(&volume.root(), &node).unwrap();
    assert!(node.delete_on_close_pending());

    server.reconnect();
    server.clear_log();
    volume.release(&node, token, CloseMode::Final).unwrap();

    assert!(!server.exists(".smbdelete1f000"));
    assert!(!node.delete_on_close_pending());
    assert_eq!(server.count(RequestKind::Delete), 1);
    assert_eq!(server.count(RequestKind::Close), 0);
}

#[test]
fn test_server_disposition_applies_at_reconnect() {
    let (server, volume) = setup(config());
    server.add_file("busy", 1);
    let node = file(&volume, "busy");
    let token = volume.acquire(&node, AccessMode::WRITE).unwrap();
    volume.unlink(&volume.root(), &node).unwrap();
    assert!(server.delete_pending(".smbdelete1f000"));

    server.reconnect();
    assert!(!server.exists(".smbdelete1f000"));

    server.clear_log();
    volume.release(&node, token, CloseMode::Final).unwrap();
    assert!(server.requests().is_empty());
    assert_eq!(node.open_handle_count(), 0);
}

#[test]
fn test_reconnect_during_unlink_still_deletes() {
    let (server, volume) = setup(config());
    server.add_file("busy", 1);
    let volume = Arc::new(volume);
    let node = file(&volume, "busy");
    let token = volume.acquire(&node, AccessMode::WRITE).unwrap();

    // The disposition request reaches a server that has just dropped the
    // handle it names, so the delete has to be remembered locally.
    let fired = reconnect_on_first(&server, RequestKind::SetDeleteOnClose);
    let unlinked = {
        let volume = Arc::clone(&volume);
        let node = Arc::clone(&node);
        finishes(move || volume.unlink(&volume.root(), &node))
    };
    unlinked.unwrap();
    assert!(fired.load(Ordering::SeqCst));
    assert!(node.delete_on_close_pending());
    server.clear_hook();

    volume.release(&node, token, CloseMode::Final).unwrap();
    assert!(!server.exists(".smbdelete1f000"));
    assert!(!server.exists("busy"));
}

#[test]
fn test_hiding_can_be_disabled() {
    let (server, volume) = setup(config().hide_silly_renamed(false));
    server.add_file("f", 1);
    let node = file(&volume, "f");
    let token = volume.acquire(&node, AccessMode::WRITE).unwrap();

    volume.unlink(&volume.root(), &node).unwrap();
    assert_eq!(server.count(RequestKind::SetHidden), 0);

    volume.release(&node, token, CloseMode::Normal).unwrap();
}

#[test]
fn test_file_id_name_used_once() {
    let (server, volume) = setup(config().info_level(InfoLevel::IdBothDirectory));
    let id = server.add_file("f", 1);
    let node = volume.lookup(&RemotePath::new("f"), NodeKind::File, Some(id));
    let token = volume.acquire(&node, AccessMode::WRITE).unwrap();

    let expected = format!(".smbdelete{id:016x}");
    server.add_file(&expected, 1);

    let err = volume.unlink(&volume.root(), &node).unwrap_err();
    assert!(matches!(err, Error::NamesExhausted(_)));
    assert_eq!(err.to_errno(), libc::EBUSY);
    assert!(server.exists("f"));

    volume.release(&node, token, CloseMode::Normal).unwrap();
}

#[test]
fn test_transient_rename_failure_keeps_file_id_name() {
    let (server, volume) = setup(config().info_level(InfoLevel::IdBothDirectory));
    let id = server.add_file("f", 1);
    let node = volume.lookup(&RemotePath::new("f"), NodeKind::File, Some(id));
    let token = volume.acquire(&node, AccessMode::WRITE).unwrap();

    server.fail_next(RequestKind::Rename, WireStatus::TimedOut);
    let err = volume.unlink(&volume.root(), &node).unwrap_err();
    assert!(err.is_transient());
    assert!(server.exists("f"));

    volume.unlink(&volume.root(), &node).unwrap();
    let expected = format!(".smbdelete{id:016x}");
    assert!(server.exists(&expected));
    assert!(!server.exists("f"));

    volume.release(&node, token, CloseMode::Final).unwrap();
    assert!(!server.exists(&expected));
}

#[test]
fn test_next_candidate_advances_per_node() {
    let (server, volume) = setup(config());
    server.add_file("a", 1);
    server.add_file("b", 1);
    let a = file(&volume, "a");
    let b = file(&volume, "b");

    assert_eq!(volume.next_candidate(&a).unwrap(), ".smbdelete1f000");
    assert_eq!(volume.next_candidate(&a).unwrap(), ".smbdelete1f001");
    assert_eq!(volume.next_candidate(&b).unwrap(), ".smbdelete1f000");
}
