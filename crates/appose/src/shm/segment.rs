//! Named POSIX shared-memory segments
//!
//! A segment is created by one process (`shm_open` + `ftruncate` + `mmap`)
//! and attached by name from another. The creating side owns the name and
//! unlinks it when dropped unless ownership was handed to the peer with
//! [`SharedMemory::disown`].
//!
//! There is no synchronization on the mapped bytes. Ordering between the two
//! processes comes from the task protocol only.

use std::ffi::CString;
use std::io;
use std::ptr;

use tracing::{debug, trace, warn};

use super::ShmError;

/// Prefix of generated segment names
pub const NAME_PREFIX: &str = "/appose-";

/// Hex characters taken from a v4 UUID for generated names. Keeps names
/// below the 31 byte limit macOS places on shm names.
const GENERATED_NAME_LEN: usize = 20;

/// A mapped, named shared-memory segment
pub struct SharedMemory {
    name: String,
    ptr: *mut u8,
    size: usize,
    mapped: bool,
    owner: bool,
    unlinked: bool,
}

// SAFETY: the mapping is process-wide memory. Mutable access goes through
// `&mut self`, and cross-process access is governed by the task protocol.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create a new segment of exactly `size` bytes.
    ///
    /// A unique name is generated when `name` is `None`. The returned handle
    /// owns the segment.
    pub fn create(name: Option<&str>, size: usize) -> Result<Self, ShmError> {
        let name = match name {
            Some(name) => normalize_name(name)?,
            None => generate_name(),
        };
        let c_name = c_name(&name)?;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                return Err(ShmError::AlreadyExists(name));
            }
            return Err(ShmError::os("shm_open", &name, err));
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(ShmError::os("ftruncate", &name, err));
        }

        let mapped = map(fd, size);
        unsafe {
            libc::close(fd);
        }
        let ptr = match mapped {
            Ok(ptr) => ptr,
            Err(err) => {
                unsafe {
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(ShmError::os("mmap", &name, err));
            }
        };

        debug!("Created shared memory {} ({} bytes)", name, size);
        Ok(Self {
            name,
            ptr,
            size,
            mapped: true,
            owner: true,
            unlinked: false,
        })
    }

    /// Map an existing segment by name.
    ///
    /// The returned handle does not own the segment.
    pub fn attach(name: &str, expected_size: usize) -> Result<Self, ShmError> {
        let name = normalize_name(name)?;
        let c_name = c_name(&name)?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0 as libc::c_uint) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Err(ShmError::NotFound(name));
            }
            return Err(ShmError::os("shm_open", &name, err));
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(ShmError::os("fstat", &name, err));
        }
        let actual = stat.st_size as usize;
        if !size_matches(expected_size, actual) {
            unsafe {
                libc::close(fd);
            }
            return Err(ShmError::SizeMismatch {
                name,
                expected: expected_size,
                actual,
            });
        }

        let mapped = map(fd, expected_size);
        unsafe {
            libc::close(fd);
        }
        let ptr = mapped.map_err(|err| ShmError::os("mmap", &name, err))?;

        trace!("Attached shared memory {} ({} bytes)", name, expected_size);
        Ok(Self {
            name,
            ptr,
            size: expected_size,
            mapped: true,
            owner: false,
            unlinked: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// Whether dropping this handle unlinks the segment
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Give up responsibility for unlinking. Used when the segment's
    /// ownership is passed to the peer process.
    pub fn disown(&mut self) {
        self.owner = false;
    }

    /// Take responsibility for unlinking a segment created elsewhere
    pub fn adopt(&mut self) {
        if !self.unlinked {
            self.owner = true;
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], ShmError> {
        if !self.mapped {
            return Err(ShmError::Closed(self.name.clone()));
        }
        if self.size == 0 {
            return Ok(&[]);
        }
        Ok(unsafe { std::slice::from_raw_parts(self.ptr, self.size) })
    }

    pub fn as_bytes_mut(&mut self) -> Result<&mut [u8], ShmError> {
        if !self.mapped {
            return Err(ShmError::Closed(self.name.clone()));
        }
        if self.size == 0 {
            return Ok(&mut []);
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) })
    }

    /// Unmap the local view. Idempotent.
    pub fn close(&mut self) {
        if !self.mapped {
            return;
        }
        if !self.ptr.is_null() {
            let rc = unsafe { libc::munmap(self.ptr.cast(), self.size) };
            if rc != 0 {
                warn!(
                    "Failed to unmap shared memory {}: {}",
                    self.name,
                    io::Error::last_os_error()
                );
            }
        }
        self.ptr = ptr::null_mut();
        self.mapped = false;
    }

    /// Remove the segment's name from the system.
    ///
    /// Existing mappings stay valid. Calling this a second time, or after
    /// the peer already unlinked the name, is a no-op.
    pub fn unlink(&mut self) -> Result<(), ShmError> {
        if self.unlinked {
            return Ok(());
        }
        unlink_name(&self.name)?;
        self.unlinked = true;
        self.owner = false;
        Ok(())
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        self.close();
        if self.owner {
            if let Err(e) = self.unlink() {
                warn!("Failed to unlink shared memory {}: {}", self.name, e);
            }
        }
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("mapped", &self.mapped)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Unlink a segment by name without mapping it. A missing name is not an
/// error.
pub fn unlink_name(name: &str) -> Result<(), ShmError> {
    let name = normalize_name(name)?;
    let c_name = c_name(&name)?;
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            debug!("Shared memory {} was already unlinked", name);
            return Ok(());
        }
        return Err(ShmError::os("shm_unlink", &name, err));
    }
    debug!("Unlinked shared memory {}", name);
    Ok(())
}

fn generate_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", NAME_PREFIX, &id[..GENERATED_NAME_LEN])
}

fn normalize_name(name: &str) -> Result<String, ShmError> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() || bare.contains('/') || bare.contains('\0') {
        return Err(ShmError::InvalidName(name.to_string()));
    }
    Ok(format!("/{}", bare))
}

fn c_name(name: &str) -> Result<CString, ShmError> {
    CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))
}

fn map(fd: libc::c_int, size: usize) -> Result<*mut u8, io::Error> {
    // mmap rejects zero-length mappings
    if size == 0 {
        return Ok(ptr::null_mut());
    }
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
        return Err(io::Error::last_os_error());
    }
    Ok(ptr.cast())
}

#[cfg(target_os = "macos")]
fn size_matches(expected: usize, actual: usize) -> bool {
    // macOS reports the page-rounded size of a segment
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(1) as usize;
    actual >= expected && actual - expected < page
}

#[cfg(not(target_os = "macos"))]
fn size_matches(expected: usize, actual: usize) -> bool {
    expected == actual
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_are_short_and_unique() {
        let a = generate_name();
        let b = generate_name();
        assert_ne!(a, b);
        assert!(a.starts_with(NAME_PREFIX));
        assert!(a.len() < 31);
    }

    #[test]
    fn normalizes_names() {
        assert_eq!(normalize_name("frame").unwrap(), "/frame");
        assert_eq!(normalize_name("/frame").unwrap(), "/frame");
        assert!(normalize_name("/").is_err());
        assert!(normalize_name("a/b").is_err());
    }

    #[test]
    fn attached_mapping_sees_creator_writes() {
        let mut created = SharedMemory::create(None, 64).unwrap();
        created
            .as_bytes_mut()
            .unwrap()
            .iter_mut()
            .enumerate()
            .for_each(|(i, b)| *b = i as u8);

        let mut attached = SharedMemory::attach(created.name(), 64).unwrap();
        assert!(!attached.is_owner());
        assert_eq!(attached.as_bytes().unwrap(), created.as_bytes().unwrap());

        attached.as_bytes_mut().unwrap()[0] = 0xff;
        assert_eq!(created.as_bytes().unwrap()[0], 0xff);
    }

    #[test]
    fn attach_reports_missing_and_mismatched_segments() {
        let missing = SharedMemory::attach("/appose-does-not-exist-0", 8);
        assert!(matches!(missing, Err(ShmError::NotFound(_))));

        let created = SharedMemory::create(None, 4096).unwrap();
        let mismatch = SharedMemory::attach(created.name(), 1 << 20);
        assert!(matches!(mismatch, Err(ShmError::SizeMismatch { .. })));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let created = SharedMemory::create(None, 8).unwrap();
        let again = SharedMemory::create(Some(created.name()), 8);
        assert!(matches!(again, Err(ShmError::AlreadyExists(_))));
    }

    #[test]
    fn zero_length_segments_round_trip() {
        let created = SharedMemory::create(None, 0).unwrap();
        assert!(created.as_bytes().unwrap().is_empty());
        let attached = SharedMemory::attach(created.name(), 0).unwrap();
        assert!(attached.as_bytes().unwrap().is_empty());
    }

    #[test]
    fn unlink_twice_is_a_no_op() {
        let mut created = SharedMemory::create(None, 8).unwrap();
        let name = created.name().to_string();
        created.unlink().unwrap();
        created.unlink().unwrap();
        assert!(matches!(
            SharedMemory::attach(&name, 8),
            Err(ShmError::NotFound(_))
        ));
        // The local mapping outlives the name
        assert_eq!(created.as_bytes().unwrap().len(), 8);
    }

    #[test]
    fn closed_segments_refuse_access() {
        let mut created = SharedMemory::create(None, 8).unwrap();
        created.close();
        created.close();
        assert!(matches!(created.as_bytes(), Err(ShmError::Closed(_))));
    }

    #[test]
    fn drop_unlinks_only_when_owned() {
        let created = SharedMemory::create(None, 8).unwrap();
        let name = created.name().to_string();

        let attached = SharedMemory::attach(&name, 8).unwrap();
        drop(attached);
        assert!(SharedMemory::attach(&name, 8).is_ok());

        drop(created);
        assert!(matches!(
            SharedMemory::attach(&name, 8),
            Err(ShmError::NotFound(_))
        ));
    }

    #[test]
    fn disowned_segments_survive_drop() {
        let mut created = SharedMemory::create(None, 8).unwrap();
        created.disown();
        let name = created.name().to_string();
        drop(created);

        let mut adopted = SharedMemory::attach(&name, 8).unwrap();
        adopted.adopt();
        drop(adopted);
        assert!(matches!(
            SharedMemory::attach(&name, 8),
            Err(ShmError::NotFound(_))
        ));
    }
}
