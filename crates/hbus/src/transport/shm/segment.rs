// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment management.
//!
//! Safe wrappers around `shm_open`, `ftruncate`, and `mmap` for creating and
//! mapping the named segments used by the sample channel and the host-local
//! registration ring.
//!
//! Segment names must start with `/` and contain no other `/`, e.g.
//! `/hbus_4711_3`. The mapping is released on drop; unlinking the name is the
//! creator's responsibility.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::io;
use std::ptr;

/// A mapped POSIX shared memory segment.
pub struct Segment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the mapping is shared between threads and processes by design; all
// concurrent access goes through atomics inside the mapped structures.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a segment, replacing any existing one with the same name.
    ///
    /// The memory is zero-initialized.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name)
            .map_err(|_| Error::InvalidArgument(format!("segment name {:?}", name)))?;

        // SAFETY: c_name is a valid NUL-terminated string. shm_unlink on a
        // missing name is harmless; shm_open returns -1 on failure (checked).
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(Error::TransportUnavailable(io::Error::last_os_error()));
        }

        // SAFETY: fd is a valid descriptor from shm_open above.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used again on this error path.
            unsafe { libc::close(fd) };
            return Err(Error::TransportUnavailable(err));
        }

        let ptr = Self::map(fd, size)?;

        // SAFETY: ptr points to a fresh MAP_SHARED mapping of exactly `size`
        // bytes with write permission and no other references yet.
        unsafe { ptr::write_bytes(ptr, 0, size) };

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Create a segment only if the name is free.
    ///
    /// Unlike [`Segment::create`] this never replaces an existing segment;
    /// concurrent creators race cleanly, losers get `Error::AlreadyExists`.
    pub fn create_exclusive(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name)
            .map_err(|_| Error::InvalidArgument(format!("segment name {:?}", name)))?;

        // SAFETY: c_name is a valid NUL-terminated string; the return value
        // is checked before use.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::AlreadyExists {
                return Err(Error::AlreadyExists(name.to_string()));
            }
            return Err(Error::TransportUnavailable(err));
        }

        // SAFETY: fd is a valid descriptor from shm_open above.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used again on this error path.
            unsafe { libc::close(fd) };
            return Err(Error::TransportUnavailable(err));
        }

        let ptr = Self::map(fd, size)?;
        // SAFETY: fresh MAP_SHARED mapping of `size` bytes, no other
        // references yet.
        unsafe { ptr::write_bytes(ptr, 0, size) };

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Open an existing segment with a known size.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        let (fd, _actual) = Self::open_fd(name)?;
        let ptr = Self::map(fd, size)?;
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Open an existing segment, mapping its full current size.
    pub fn open_auto(name: &str) -> Result<Self> {
        let (fd, actual) = Self::open_fd(name)?;
        let ptr = Self::map(fd, actual)?;
        Ok(Self {
            ptr,
            size: actual,
            name: name.to_string(),
        })
    }

    fn open_fd(name: &str) -> Result<(libc::c_int, usize)> {
        Self::validate_name(name)?;
        let c_name = CString::new(name)
            .map_err(|_| Error::InvalidArgument(format!("segment name {:?}", name)))?;

        // SAFETY: c_name is a valid NUL-terminated string; the return value
        // is checked before use.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(Error::NotFound);
            }
            return Err(Error::TransportUnavailable(err));
        }

        // SAFETY: fd is valid; stat is an out parameter fully written by
        // fstat on success.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: see above.
        let ret = unsafe { libc::fstat(fd, &mut stat) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and abandoned on this error path.
            unsafe { libc::close(fd) };
            return Err(Error::TransportUnavailable(err));
        }
        Ok((fd, stat.st_size as usize))
    }

    fn map(fd: libc::c_int, size: usize) -> Result<*mut u8> {
        // SAFETY: fd is a valid descriptor; MAP_SHARED with PROT_READ|WRITE
        // is the standard shared mapping; MAP_FAILED is checked below. The
        // fd is closed right after - the mapping keeps its own reference.
        let ptr = unsafe {
            let p = libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            p
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::TransportUnavailable(io::Error::last_os_error()));
        }
        Ok(ptr as *mut u8)
    }

    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') || name.len() > 255 || name[1..].contains('/') {
            return Err(Error::InvalidArgument(format!(
                "segment name must be '/<name>' with no inner '/': {:?}",
                name
            )));
        }
        Ok(())
    }

    /// Remove the segment name; the memory lives until all mappings close.
    ///
    /// Unlinking a name that is already gone is not an error.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name)
            .map_err(|_| Error::InvalidArgument(format!("segment name {:?}", name)))?;
        // SAFETY: c_name is a valid NUL-terminated string; shm_unlink only
        // touches the filesystem namespace.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(Error::TransportUnavailable(err));
            }
        }
        Ok(())
    }

    /// Whether a segment with the given name currently exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: c_name is valid; a non-negative fd is closed immediately.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            // SAFETY: fd is valid and not used afterwards.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    /// Raw pointer to the mapping.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The segment name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: ptr/size came from a successful mmap and Drop runs once.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

/// Remove stale hbus segments left behind by crashed processes.
///
/// Scans `/dev/shm` for `hbus_<pid>_*` names whose owning pid no longer
/// exists and unlinks them. Returns the number of segments removed.
pub fn cleanup_stale_segments() -> usize {
    let mut cleaned = 0;
    let shm_dir = std::path::Path::new("/dev/shm");
    let Ok(entries) = std::fs::read_dir(shm_dir) else {
        return 0;
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(rest) = name.strip_prefix("hbus_") else {
            continue;
        };
        let Some(pid_str) = rest.split('_').next() else {
            continue;
        };
        let Ok(pid) = pid_str.parse::<u32>() else {
            continue;
        };
        if pid_alive(pid) {
            continue;
        }
        let segment_name = format!("/{}", name);
        if Segment::unlink(&segment_name).is_ok() {
            log::debug!("[SHM] removed stale segment {}", segment_name);
            cleaned += 1;
        }
    }
    cleaned
}

fn pid_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/hbus_test_{}_{}", tag, ts)
    }

    #[test]
    fn validate_name_rules() {
        assert!(Segment::validate_name("/ok").is_ok());
        assert!(Segment::validate_name("missing_slash").is_err());
        assert!(Segment::validate_name("/inner/slash").is_err());
    }

    #[test]
    fn create_open_share_bytes() {
        let name = unique_name("share");
        let seg1 = Segment::create(&name, 4096).expect("create");
        assert_eq!(seg1.size(), 4096);

        // SAFETY: the segment was just created with 4096 bytes; offset 0 is
        // in bounds and no concurrent writer exists yet.
        unsafe { *seg1.as_ptr() = 0x5A };

        let seg2 = Segment::open_auto(&name).expect("open");
        assert_eq!(seg2.size(), 4096);
        // SAFETY: same mapping, same bounds.
        unsafe { assert_eq!(*seg2.as_ptr(), 0x5A) };

        Segment::unlink(&name).ok();
    }

    #[test]
    fn open_missing_is_not_found() {
        let result = Segment::open_auto("/hbus_test_missing_segment");
        assert!(matches!(result, Err(Error::NotFound)));
    }

    #[test]
    fn unlink_is_idempotent() {
        let name = unique_name("unlink");
        let _seg = Segment::create(&name, 1024).expect("create");
        assert!(Segment::unlink(&name).is_ok());
        assert!(Segment::unlink(&name).is_ok());
    }

    #[test]
    fn exists_tracks_lifecycle() {
        let name = unique_name("exists");
        assert!(!Segment::exists(&name));
        let _seg = Segment::create(&name, 1024).expect("create");
        assert!(Segment::exists(&name));
        Segment::unlink(&name).ok();
        assert!(!Segment::exists(&name));
    }
}
