use std::path::Path;

use queuectl::controller::Controller;
use tempfile::TempDir;

// count = 0 exercises the PID-file bookkeeping without spawning children.

#[test]
fn start_records_pid_and_refuses_double_start() {
    let dir = TempDir::new().unwrap();
    let state_dir = dir.path().join(".queuectl");
    let controller = Controller::new(&state_dir);

    let children = controller.start_workers(0, Path::new("queue.db")).unwrap();
    assert!(children.is_empty());
    assert!(state_dir.join("controller.pid").exists());
    assert!(state_dir.join("children.json").exists());

    let err = controller
        .start_workers(0, Path::new("queue.db"))
        .unwrap_err();
    assert!(err.to_string().contains("already running"));
}

#[test]
fn stop_cleans_up_and_is_a_noop_without_a_controller() {
    let dir = TempDir::new().unwrap();
    let state_dir = dir.path().join(".queuectl");
    let controller = Controller::new(&state_dir);

    assert!(!controller.stop_workers().unwrap(), "nothing to stop yet");

    controller.start_workers(0, Path::new("queue.db")).unwrap();
    assert!(controller.stop_workers().unwrap());
    assert!(!state_dir.join("controller.pid").exists());
    assert!(!state_dir.join("children.json").exists());

    // A fresh start works again after cleanup.
    controller.start_workers(0, Path::new("queue.db")).unwrap();
    assert!(controller.stop_workers().unwrap());
}
