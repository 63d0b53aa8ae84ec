//! Debug log for daemon components.
//!
//! Lifecycle transitions, connection churn and reconnect attempts are
//! appended to `<home>/logs/daemon-debug.log`. Several daemons on one
//! machine share that file, so every record carries the writing process id,
//! a per-process sequence number and a UTC timestamp; interleaved daemons
//! can be told apart and reordered when debugging slot or cluster issues.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn format_record(sequence: u64, pid: u32, tag: &str, msg: &str) -> String {
    let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
    format!("{timestamp} {pid}#{sequence:06} {tag}: {msg}\n")
}

/// Appends one record to the shared debug log.
///
/// The `tag` names the writing component (e.g. "environment", "reconnect",
/// "rpc_server"). The log is best effort; failures to resolve or open it are
/// ignored.
pub fn daemon_log(tag: &str, msg: &str) {
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let record = format_record(sequence, std::process::id(), tag, msg);
    let Ok(path) = crate::daemon_paths::daemon_debug_log_path() else {
        return;
    };
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    {
        let _ = file.write_all(record.as_bytes());
    }
}
