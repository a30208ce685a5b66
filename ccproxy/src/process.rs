//! Single-instance process discipline: PID file, lock file, reference
//! count, and graceful shutdown.
//!
//! No teacher module covers this — the gateway always ran under a
//! supervisor. It follows the corpus's general posture of reaching for a
//! vetted crate over hand-rolled platform code: `fs2` for the advisory file
//! lock, `nix`/`windows-sys` for OS process probing, matching the
//! `{is_alive(pid), terminate(pid)}` capability split called out as the
//! redesign for "OS-specific process probing".

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Serializes the refcount file's read-modify-write sequence across
/// concurrently attached client sessions in this process.
static REFCOUNT_LOCK: StdMutex<()> = StdMutex::new(());

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("service already running with PID {0}")]
    AlreadyRunning(u32),
    #[error("could not acquire startup lock within the attempt window")]
    StartupLockTimeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no running instance found")]
    NotRunning,
}

pub struct ProcessGuard {
    home: PathBuf,
    pid_lock: Option<File>,
}

fn pid_file(home: &Path) -> PathBuf {
    home.join(".ccproxy.pid")
}

fn pid_lock_file(home: &Path) -> PathBuf {
    home.join(".ccproxy.pid.lock")
}

fn startup_lock_file(home: &Path) -> PathBuf {
    home.join(".startup.lock")
}

fn refcount_file(home: &Path) -> PathBuf {
    home.join(".refcount")
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

impl ProcessGuard {
    /// Acquire the startup lock, check for a live prior instance, and claim
    /// the PID file. Call once at process start; drop (or call
    /// [`ProcessGuard::release`]) at shutdown.
    pub fn acquire(home: impl Into<PathBuf>) -> Result<Self, ProcessError> {
        let home = home.into();
        fs::create_dir_all(&home)?;

        let startup_lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(startup_lock_file(&home))?;

        let deadline = Instant::now() + Duration::from_millis(100);
        loop {
            match startup_lock.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(_) => return Err(ProcessError::StartupLockTimeout),
            }
        }

        let pid_path = pid_file(&home);
        if let Ok(existing) = fs::read_to_string(&pid_path) {
            if let Ok(pid) = existing.trim().parse::<u32>() {
                if is_alive(pid) {
                    let _ = fs2::FileExt::unlock(&startup_lock);
                    return Err(ProcessError::AlreadyRunning(pid));
                }
            }
        }

        let pid_lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(pid_lock_file(&home))?;
        pid_lock.lock_exclusive()?;

        write_atomic(&pid_path, &std::process::id().to_string())?;

        let _ = fs2::FileExt::unlock(&startup_lock);

        Ok(Self {
            home,
            pid_lock: Some(pid_lock),
        })
    }

    pub fn release(&mut self) {
        let _ = fs::remove_file(pid_file(&self.home));
        if let Some(lock) = self.pid_lock.take() {
            let _ = fs2::FileExt::unlock(&lock);
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub fn read_pid(home: &Path) -> Option<u32> {
    fs::read_to_string(pid_file(home))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Increment the reference count of attached client sessions.
pub fn increment_refcount(home: &Path) -> std::io::Result<u64> {
    let _guard = REFCOUNT_LOCK.lock().unwrap();
    let count = read_refcount(home).saturating_add(1);
    write_atomic(&refcount_file(home), &count.to_string())?;
    Ok(count)
}

/// Decrement, floored at zero. Returns the new count.
pub fn decrement_refcount(home: &Path) -> std::io::Result<u64> {
    let _guard = REFCOUNT_LOCK.lock().unwrap();
    let count = read_refcount(home).saturating_sub(1);
    write_atomic(&refcount_file(home), &count.to_string())?;
    Ok(count)
}

/// A corrupted or absent count file reads as zero.
pub fn read_refcount(home: &Path) -> u64 {
    fs::read_to_string(refcount_file(home))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Send a termination signal, poll for exit, force-kill on timeout.
/// Windows has no SIGTERM equivalent, so it always force-kills.
pub async fn graceful_shutdown(
    pid: u32,
    shutdown_timeout: Duration,
) -> Result<(), ProcessError> {
    if !is_alive(pid) {
        return Err(ProcessError::NotRunning);
    }

    terminate_gracefully(pid);

    let deadline = Instant::now() + shutdown_timeout;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    force_kill(pid);
    Ok(())
}

#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(unix)]
fn terminate_gracefully(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(unix)]
fn force_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(windows)]
pub fn is_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, FALSE, STILL_ACTIVE};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, FALSE, pid);
        if handle == 0 {
            return false;
        }
        let mut exit_code: u32 = 0;
        let ok = GetExitCodeProcess(handle, &mut exit_code);
        CloseHandle(handle);
        ok != 0 && exit_code as i32 == STILL_ACTIVE
    }
}

#[cfg(windows)]
fn terminate_gracefully(pid: u32) {
    // No SIGTERM equivalent; Windows stop is always forceful.
    force_kill(pid);
}

#[cfg(windows)]
fn force_kill(pid: u32) {
    use windows_sys::Win32::Foundation::{CloseHandle, FALSE};
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, FALSE, pid);
        if handle != 0 {
            TerminateProcess(handle, 1);
            CloseHandle(handle);
        }
    }
}
