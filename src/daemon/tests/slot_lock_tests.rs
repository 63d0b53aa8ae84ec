use std::time::Duration;

use crate::daemon::error::DaemonError;
use crate::daemon::slot_lock::{running_daemon_ports, SlotLockFile};

#[test]
fn test_enumerate_empty_storage() {
    let storage = tempfile::tempdir().unwrap();
    assert_eq!(running_daemon_ports(storage.path()).unwrap(), Vec::<u16>::new());
}

#[test]
fn test_enumerate_missing_storage_has_no_daemons() {
    let storage = tempfile::tempdir().unwrap();
    let missing = storage.path().join("never-created");
    assert_eq!(running_daemon_ports(&missing).unwrap(), Vec::<u16>::new());
}

#[test]
fn test_acquire_publish_enumerate_close() {
    let storage = tempfile::tempdir().unwrap();

    let mut slot = SlotLockFile::open(storage.path())
        .unwrap()
        .acquire_slot()
        .unwrap();
    assert_eq!(slot.index(), 0);

    slot.lock_data().unwrap();
    slot.write_port(3500).unwrap();
    slot.unlock_data().unwrap();

    // the enumerator opens the file separately, so its probe locks conflict
    // with the slot lock held above even inside one process
    assert_eq!(running_daemon_ports(storage.path()).unwrap(), vec![3500]);

    slot.close();
    assert_eq!(running_daemon_ports(storage.path()).unwrap(), Vec::<u16>::new());
}

#[test]
fn test_concurrent_slots_get_distinct_indices() {
    let storage = tempfile::tempdir().unwrap();

    let mut first = SlotLockFile::open(storage.path())
        .unwrap()
        .acquire_slot()
        .unwrap();
    let mut second = SlotLockFile::open(storage.path())
        .unwrap()
        .acquire_slot()
        .unwrap();
    assert_ne!(first.index(), second.index());

    first.lock_data().unwrap();
    first.write_port(4000).unwrap();
    first.unlock_data().unwrap();

    second.lock_data().unwrap();
    second.write_port(4001).unwrap();
    second.unlock_data().unwrap();

    let mut ports = running_daemon_ports(storage.path()).unwrap();
    ports.sort_unstable();
    assert_eq!(ports, vec![4000, 4001]);

    first.close();
    second.close();
}

#[test]
fn test_closed_slot_index_is_reacquired() {
    let storage = tempfile::tempdir().unwrap();

    let first = SlotLockFile::open(storage.path())
        .unwrap()
        .acquire_slot()
        .unwrap();
    let index = first.index();
    first.close();

    let second = SlotLockFile::open(storage.path())
        .unwrap()
        .acquire_slot()
        .unwrap();
    assert_eq!(second.index(), index);
    second.close();
}

#[test]
fn test_stale_port_bytes_of_free_slot_are_ignored() {
    let storage = tempfile::tempdir().unwrap();

    let mut slot = SlotLockFile::open(storage.path())
        .unwrap()
        .acquire_slot()
        .unwrap();
    slot.lock_data().unwrap();
    slot.write_port(5123).unwrap();
    slot.unlock_data().unwrap();
    slot.close();

    // the port bytes survive the close, but the slot lock is gone
    assert_eq!(running_daemon_ports(storage.path()).unwrap(), Vec::<u16>::new());
}

/// An enumerator that races a mid-initialization daemon blocks on the data
/// lock and observes the final port, never the zeroed bytes.
#[test]
fn test_enumerate_blocks_on_in_progress_initialization() {
    let storage = tempfile::tempdir().unwrap();

    let mut slot = SlotLockFile::open(storage.path())
        .unwrap()
        .acquire_slot()
        .unwrap();
    slot.lock_data().unwrap();

    let (started_tx, started_rx) = std::sync::mpsc::channel();
    let enumerator = {
        let storage_path = storage.path().to_path_buf();
        std::thread::spawn(move || {
            started_tx.send(()).unwrap();
            running_daemon_ports(&storage_path)
        })
    };

    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("enumerator thread never started");
    // hold the data lock long enough for the enumerator to reach it
    std::thread::sleep(Duration::from_millis(150));

    slot.write_port(7777).unwrap();
    slot.unlock_data().unwrap();

    let ports = enumerator.join().unwrap().unwrap();
    assert_eq!(ports, vec![7777]);

    slot.close();
}

#[test]
fn test_open_in_missing_directory_is_a_lock_io_error() {
    let storage = tempfile::tempdir().unwrap();
    let result = SlotLockFile::open(&storage.path().join("no-such-dir"));
    assert!(matches!(result, Err(DaemonError::LockIo { .. })));
}
