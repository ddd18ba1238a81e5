// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segments.
//!
//! Safe wrappers around `shm_open`, `ftruncate` and `mmap`. The creator of
//! a segment owns it: creation is exclusive (an existing name is an error,
//! not something to silently replace), permissions are relaxed so that
//! unprivileged client processes can attach read-write, and the segment is
//! unlinked when the owning handle drops. Attachers merely map and unmap.

use super::{Result, ShmError};
use std::ffi::CString;
use std::io;
use std::ptr;

/// A mapped POSIX shared memory segment.
///
/// The mapping is removed on drop; the name is additionally unlinked when
/// this handle created the segment.
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
    owner: bool,
}

// SAFETY: the mapped region is plain memory shared between processes; all
// concurrent access goes through the robust interprocess mutex stored
// inside the control segment, never through this handle alone.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a new segment of exactly `size` bytes.
    ///
    /// Fails with [`ShmError::Exists`] when the name is already taken.
    /// The created segment is zero-filled and world-accessible so that
    /// client processes need no special privileges to attach.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string. O_CREAT|O_EXCL
        // either creates a fresh object or fails with EEXIST; the returned
        // fd is checked below.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o666,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                return Err(ShmError::Exists(name.to_string()));
            }
            return Err(ShmError::SegmentCreate(err));
        }

        // shm_open honours the umask, which would lock clients out; widen
        // the permissions explicitly so unprivileged peers can map r/w.
        // SAFETY: fd is the valid descriptor obtained above.
        let ret = unsafe { libc::fchmod(fd, 0o666) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used after this error path.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(ShmError::SegmentCreate(err));
        }

        // SAFETY: fd is valid; ftruncate sets the object size and fails
        // gracefully on unreasonable sizes.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: as above, error-path cleanup of a valid fd and name.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(ShmError::SegmentCreate(err));
        }

        let ptr = Self::map(fd, size);
        // SAFETY: fd is valid; the mapping (if any) holds its own reference
        // to the object, so closing the descriptor is always safe here.
        unsafe { libc::close(fd) };

        let ptr = match ptr {
            Ok(p) => p,
            Err(e) => {
                // SAFETY: c_name is valid; unlink of a fresh name we own.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(e);
            }
        };

        // SAFETY: ptr points to a writable mapping of exactly `size` bytes
        // that no other process has attached yet (the name was fresh).
        unsafe { ptr::write_bytes(ptr, 0, size) };

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Attach to an existing segment.
    ///
    /// Fails with [`ShmError::NotFound`] when no segment of that name
    /// exists. `size` must not exceed the actual object size.
    pub fn attach(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string; without O_CREAT
        // the mode argument is ignored.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }

        let ptr = Self::map(fd, size);
        // SAFETY: fd is valid; the mapping keeps the object alive.
        unsafe { libc::close(fd) };

        Ok(Self {
            ptr: ptr?,
            size,
            name: name.to_string(),
            owner: false,
        })
    }

    fn map(fd: libc::c_int, size: usize) -> Result<*mut u8> {
        // SAFETY: null address lets the kernel pick a placement; fd is a
        // valid shared-memory descriptor; MAP_SHARED makes stores visible
        // to all attached processes. MAP_FAILED is checked below.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Mmap(io::Error::last_os_error()));
        }
        Ok(ptr.cast::<u8>())
    }

    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') || name.len() < 2 {
            return Err(ShmError::InvalidName(format!(
                "segment name must be '/<name>': {name}"
            )));
        }
        if name[1..].contains('/') {
            return Err(ShmError::InvalidName(format!(
                "segment name cannot contain '/' after the prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(ShmError::InvalidName(format!(
                "segment name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Remove a named segment. Absent names are not an error.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;
        // SAFETY: c_name is a valid NUL-terminated string; shm_unlink only
        // touches the filesystem namespace.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::SegmentOpen(err));
            }
        }
        Ok(())
    }

    /// Whether a segment of this name currently exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: c_name is valid; a read-only open probes for existence.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            // SAFETY: fd is valid and unused afterwards.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe exactly the mapping established in
        // create()/attach(); Drop runs at most once.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
        }
        if self.owner {
            let _ = Self::unlink(&self.name);
        }
    }
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
        format!("/dcp_test_{tag}_{ts}")
    }

    #[test]
    fn test_validate_name() {
        assert!(ShmSegment::validate_name("/dcp-bp-vardis").is_ok());
        assert!(ShmSegment::validate_name("no-slash").is_err());
        assert!(ShmSegment::validate_name("/a/b").is_err());
        assert!(ShmSegment::validate_name("/").is_err());
    }

    #[test]
    fn test_create_attach_share_bytes() {
        let name = unique_name("seg");
        let seg = ShmSegment::create(&name, 4096).expect("create failed");
        assert!(seg.is_owner());

        // SAFETY: the segment was just created with 4096 bytes.
        unsafe {
            *seg.as_ptr() = 0x42;
            *seg.as_ptr().add(4095) = 0x99;
        }

        let peer = ShmSegment::attach(&name, 4096).expect("attach failed");
        assert!(!peer.is_owner());
        // SAFETY: same segment, same 4096-byte extent.
        unsafe {
            assert_eq!(*peer.as_ptr(), 0x42);
            assert_eq!(*peer.as_ptr().add(4095), 0x99);
        }
    }

    #[test]
    fn test_create_conflict() {
        let name = unique_name("dup");
        let _seg = ShmSegment::create(&name, 1024).expect("create failed");
        assert!(matches!(
            ShmSegment::create(&name, 1024),
            Err(ShmError::Exists(_))
        ));
    }

    #[test]
    fn test_attach_missing() {
        assert!(matches!(
            ShmSegment::attach("/dcp_test_does_not_exist_42", 1024),
            Err(ShmError::NotFound(_))
        ));
    }

    #[test]
    fn test_owner_unlinks_on_drop() {
        let name = unique_name("drop");
        {
            let _seg = ShmSegment::create(&name, 1024).expect("create failed");
            assert!(ShmSegment::exists(&name));
        }
        assert!(!ShmSegment::exists(&name));
    }

    #[test]
    fn test_attacher_does_not_unlink() {
        let name = unique_name("keep");
        let seg = ShmSegment::create(&name, 1024).expect("create failed");
        {
            let _peer = ShmSegment::attach(&name, 1024).expect("attach failed");
        }
        assert!(ShmSegment::exists(&name));
        drop(seg);
    }
}
