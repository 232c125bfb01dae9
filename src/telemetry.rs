//! Host diagnostics used to enrich transfer failure reports
//!
//! Nothing here influences admission or transfer decisions; a probe that cannot
//! read a value reports `None` for it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Point-in-time host resource telemetry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSnapshot {
    /// Free space on the download volume, in bytes
    pub free_disk_bytes: Option<u64>,
    /// Free physical memory, in bytes
    pub free_memory_bytes: Option<u64>,
}

/// Read-only source of host telemetry
pub trait DiagnosticsProbe: Send + Sync {
    /// Take a snapshot; must not fail or block for long
    fn snapshot(&self) -> HostSnapshot;
}

/// Probe reading the real host through OS APIs
#[derive(Clone, Debug)]
pub struct SystemProbe {
    volume: PathBuf,
}

impl SystemProbe {
    /// Probe the volume holding `volume`
    pub fn new(volume: impl Into<PathBuf>) -> Self {
        Self {
            volume: volume.into(),
        }
    }
}

impl DiagnosticsProbe for SystemProbe {
    fn snapshot(&self) -> HostSnapshot {
        let free_disk_bytes = match get_available_space(&self.volume) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::debug!(path = ?self.volume, error = %e, "free space probe failed");
                None
            }
        };
        HostSnapshot {
            free_disk_bytes,
            free_memory_bytes: get_free_memory(),
        }
    }
}

/// Probe that reports nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpProbe;

impl DiagnosticsProbe for NoOpProbe {
    fn snapshot(&self) -> HostSnapshot {
        HostSnapshot::default()
    }
}

/// Get available disk space for a given path
///
/// Returns the space available to unprivileged users on the filesystem that
/// holds `path`, or an IO error if the check fails.
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid NUL-terminated string, stat is zero-initialized
        // and only read after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            // f_bavail: blocks available to unprivileged users, f_frsize: fragment size
            #[allow(clippy::unnecessary_cast)]
            let available_bytes = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
            Ok(available_bytes)
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is NUL-terminated and every out pointer refers to a live u64.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut _total_bytes: u64 = 0;
            let mut _total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut _total_bytes as *mut u64 as *mut _,
                &mut _total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Disk space checking is not supported on this platform",
        ))
    }
}

/// Free physical memory in bytes, if the platform exposes it
pub fn get_free_memory() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: info is zero-initialized and only read after sysinfo succeeds.
        unsafe {
            let mut info: libc::sysinfo = std::mem::zeroed();
            if libc::sysinfo(&mut info) != 0 {
                return None;
            }
            #[allow(clippy::unnecessary_cast)]
            Some((info.freeram as u64).saturating_mul(info.mem_unit as u64))
        }
    }

    #[cfg(windows)]
    {
        use winapi::um::sysinfoapi::{GlobalMemoryStatusEx, MEMORYSTATUSEX};

        // SAFETY: status is zeroed with dwLength set as the API requires.
        unsafe {
            let mut status: MEMORYSTATUSEX = std::mem::zeroed();
            status.dwLength = std::mem::size_of::<MEMORYSTATUSEX>() as u32;
            if GlobalMemoryStatusEx(&mut status) == 0 {
                return None;
            }
            Some(status.ullAvailPhys)
        }
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    {
        None
    }
}
