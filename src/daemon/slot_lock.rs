//! Daemon slot lock file.
//!
//! A single byte-range-locked file coordinates every daemon instance sharing
//! a storage directory and publishes each instance's server port so outside
//! processes can enumerate live daemons without races.
//!
//! ## File layout (on-disk contract)
//!
//! - Data region at offset 0: 4 bytes per slot, 65,535 slots, each holding
//!   the slot owner's port as a big-endian u32 (0 = unused or still
//!   initializing). The byte order is part of the contract.
//! - Slot-lock region at offset `2^62`: 4 bytes per slot, never read or
//!   written, used purely as lock-granularity substrate. The offset keeps the
//!   regions trivially non-overlapping and is likewise part of the contract;
//!   every process on a host must use the same value to interoperate.
//!
//! Locks are open-file-description (`F_OFD_*`) locks so that two opens of the
//! file conflict even within a single process; the operating system is the
//! single source of truth, with no in-process locks layered on top. The
//! `F_OFD_*` commands are a Linux interface, and this module is compiled for
//! Linux targets only; elsewhere the daemon refuses server-port
//! configurations.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::daemon::error::DaemonError;

/// Number of addressable daemon slots.
pub const SLOT_COUNT: u32 = 65_535;

/// Bytes per slot in both regions.
const SLOT_BYTES: u64 = 4;

/// Offset of the slot-lock region. Part of the on-disk contract.
pub const SLOT_LOCK_REGION_OFFSET: u64 = 1 << 62;

/// Name of the lock file inside the storage directory.
pub const LOCK_FILE_NAME: &str = ".lock.daemon";

/// Path of the lock file for a storage directory.
pub fn lock_file_path(storage_directory: &Path) -> PathBuf {
    storage_directory.join(LOCK_FILE_NAME)
}

fn range_of_slots(first: u32, count: u32) -> (u64, u64) {
    (
        SLOT_LOCK_REGION_OFFSET + u64::from(first) * SLOT_BYTES,
        u64::from(count) * SLOT_BYTES,
    )
}

fn data_range(index: u32) -> (u64, u64) {
    (u64::from(index) * SLOT_BYTES, SLOT_BYTES)
}

fn flock_struct(lock_type: i32, start: u64, len: u64) -> nix::libc::flock {
    let mut fl: nix::libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type as _;
    fl.l_whence = nix::libc::SEEK_SET as _;
    fl.l_start = start as nix::libc::off_t;
    fl.l_len = len as nix::libc::off_t;
    fl
}

/// Non-blocking lock attempt. `Ok(false)` means the range is held elsewhere.
fn try_lock(file: &File, lock_type: i32, start: u64, len: u64) -> io::Result<bool> {
    let fl = flock_struct(lock_type, start, len);
    loop {
        let rc = unsafe { nix::libc::fcntl(file.as_raw_fd(), nix::libc::F_OFD_SETLK, &fl) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(nix::libc::EINTR) => continue,
            Some(nix::libc::EAGAIN) | Some(nix::libc::EACCES) => return Ok(false),
            _ => return Err(err),
        }
    }
}

/// Blocking lock acquisition.
fn lock_wait(file: &File, lock_type: i32, start: u64, len: u64) -> io::Result<()> {
    let fl = flock_struct(lock_type, start, len);
    loop {
        let rc = unsafe { nix::libc::fcntl(file.as_raw_fd(), nix::libc::F_OFD_SETLKW, &fl) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(nix::libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

fn unlock(file: &File, start: u64, len: u64) -> io::Result<()> {
    let fl = flock_struct(nix::libc::F_UNLCK as i32, start, len);
    let rc = unsafe { nix::libc::fcntl(file.as_raw_fd(), nix::libc::F_OFD_SETLK, &fl) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Reads the published port of a slot, tolerating a file shorter than the
/// slot's data range (reads as 0).
fn read_port(file: &File, index: u32) -> io::Result<u32> {
    let (offset, _) = data_range(index);
    let mut buf = [0u8; 4];
    let mut total = 0usize;
    while total < buf.len() {
        match file.read_at(&mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    if total == buf.len() {
        Ok(u32::from_be_bytes(buf))
    } else {
        Ok(0)
    }
}

/// The opened lock file, prior to slot acquisition.
pub struct SlotLockFile {
    file: File,
    path: PathBuf,
}

impl SlotLockFile {
    /// Opens (creating if necessary) the lock file of a storage directory.
    pub fn open(storage_directory: &Path) -> Result<Self, DaemonError> {
        let path = lock_file_path(storage_directory);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| DaemonError::lock_io(&path, e))?;
        Ok(Self { file, path })
    }

    /// Acquires the first free slot.
    ///
    /// The returned slot holds an exclusive lock on its slot-lock range for
    /// the lifetime of the value. If every slot is taken, fails with
    /// [`DaemonError::SlotsExhausted`]. An enumerator holding the last free
    /// slot's range in shared mode at this exact moment also reports
    /// exhaustion; the realistic daemon count stays far below the slot count,
    /// so that window is accepted.
    pub fn acquire_slot(self) -> Result<DaemonInstanceSlot, DaemonError> {
        for index in 0..SLOT_COUNT {
            let (start, len) = range_of_slots(index, 1);
            let locked = try_lock(&self.file, nix::libc::F_WRLCK as i32, start, len)
                .map_err(|e| DaemonError::lock_io(&self.path, e))?;
            if locked {
                return Ok(DaemonInstanceSlot {
                    file: self.file,
                    path: self.path,
                    index,
                    data_locked: false,
                });
            }
        }
        Err(DaemonError::SlotsExhausted)
    }
}

/// One acquired daemon slot: the slot index, the held slot-lock range and the
/// published port bytes.
pub struct DaemonInstanceSlot {
    file: File,
    path: PathBuf,
    index: u32,
    data_locked: bool,
}

impl DaemonInstanceSlot {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Acquires the exclusive data lock for this slot, blocking.
    ///
    /// Held only across initialization; enumerators reading this slot block
    /// until [`Self::unlock_data`] runs, which guarantees they observe the
    /// published port rather than a half-initialized zero.
    pub fn lock_data(&mut self) -> Result<(), DaemonError> {
        let (start, len) = data_range(self.index);
        lock_wait(&self.file, nix::libc::F_WRLCK as i32, start, len)
            .map_err(|e| DaemonError::lock_io(&self.path, e))?;
        self.data_locked = true;
        Ok(())
    }

    /// Publishes the server port in this slot's data bytes.
    ///
    /// Must only be called while the data lock is held.
    pub fn write_port(&self, port: u16) -> Result<(), DaemonError> {
        debug_assert!(self.data_locked);
        let (offset, _) = data_range(self.index);
        self.file
            .write_all_at(&u32::from(port).to_be_bytes(), offset)
            .map_err(|e| DaemonError::lock_io(&self.path, e))
    }

    /// Releases the data lock, completing initialization for observers.
    pub fn unlock_data(&mut self) -> Result<(), DaemonError> {
        if self.data_locked {
            let (start, len) = data_range(self.index);
            unlock(&self.file, start, len).map_err(|e| DaemonError::lock_io(&self.path, e))?;
            self.data_locked = false;
        }
        Ok(())
    }

    /// Releases every held lock and closes the file, freeing the slot for
    /// other processes.
    pub fn close(mut self) {
        let _ = self.unlock_data();
        let (start, len) = range_of_slots(self.index, 1);
        let _ = unlock(&self.file, start, len);
        // dropping the file closes the description and any remaining locks
    }
}

/// Probes whether a contiguous run of slots has no live owner.
fn slots_free(file: &File, first: u32, count: u32) -> io::Result<bool> {
    let (start, len) = range_of_slots(first, count);
    if try_lock(file, nix::libc::F_RDLCK as i32, start, len)? {
        unlock(file, start, len)?;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Enumerates the published ports of daemons running on a storage directory.
///
/// Opens the lock file read-only with its own file description, so the probe
/// locks conflict with daemons in this same process too. A held slot is read
/// under a blocking shared data lock, which waits out an initializer that has
/// not yet published its port. On every free slot the remaining region is
/// probed in two halves, upper first so concurrent startups scanning from the
/// low end are not serialized behind the enumeration; when both halves are
/// free the scan terminates.
pub fn running_daemon_ports(storage_directory: &Path) -> Result<Vec<u16>, DaemonError> {
    let path = lock_file_path(storage_directory);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DaemonError::lock_io(&path, e)),
    };

    let io_err = |e| DaemonError::lock_io(&path, e);

    let mut ports = Vec::new();
    let mut index = 0u32;
    while index < SLOT_COUNT {
        let (start, len) = range_of_slots(index, 1);
        let free = try_lock(&file, nix::libc::F_RDLCK as i32, start, len).map_err(io_err)?;
        if free {
            unlock(&file, start, len).map_err(io_err)?;
            let remaining = SLOT_COUNT - index - 1;
            if remaining == 0 {
                break;
            }
            let lower_first = index + 1;
            let lower_count = remaining / 2;
            let upper_first = lower_first + lower_count;
            let upper_count = remaining - lower_count;
            let upper_free =
                upper_count == 0 || slots_free(&file, upper_first, upper_count).map_err(io_err)?;
            let lower_free =
                lower_count == 0 || slots_free(&file, lower_first, lower_count).map_err(io_err)?;
            if upper_free && lower_free {
                break;
            }
            index += 1;
        } else {
            let (data_start, data_len) = data_range(index);
            lock_wait(&file, nix::libc::F_RDLCK as i32, data_start, data_len).map_err(io_err)?;
            let port = read_port(&file, index).map_err(io_err)?;
            unlock(&file, data_start, data_len).map_err(io_err)?;
            if port > 0 && port <= u32::from(u16::MAX) {
                ports.push(port as u16);
            }
            index += 1;
        }
    }
    Ok(ports)
}
