//! System V shared-memory attach/detach, the out-of-band channel the
//! client uses to hand the engine a new database (`spec.md` §4.2,
//! `examples/original_source/pird/pird.c`'s `shmat`/`shmdt` calls).
use std::io;
use std::ptr;

use crate::error::ExternalError;

/// A read-only attachment of a System V shared-memory segment, sized and
/// validated against the configured database size. Detached on `Drop`,
/// the same ownership discipline `arb::MappedHost` uses for its mapping.
pub struct ShmAttachment {
    addr: *const u8,
    len: usize,
}

// Safety: `addr` points at memory owned by the kernel's shm subsystem for
// the lifetime of this attachment; no other thread in this process holds
// a live reference to it.
unsafe impl Send for ShmAttachment {}

impl ShmAttachment {
    /// Attach `handle` read-only and verify it holds at least `needed`
    /// bytes, per the size-check resolution of `spec.md` §9's Open
    /// Question on undersized segments.
    pub fn attach(handle: i32, needed: usize) -> Result<Self, ExternalError> {
        let actual = segment_size(handle)?;
        if actual < needed {
            return Err(ExternalError::ShmTooSmall { actual, needed });
        }

        let addr = unsafe { libc::shmat(handle, ptr::null(), libc::SHM_RDONLY) };
        if addr == usize::MAX as *mut libc::c_void {
            return Err(ExternalError::ShmAttachFailed { handle, source: io::Error::last_os_error() });
        }

        Ok(ShmAttachment { addr: addr as *const u8, len: actual })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr, self.len) }
    }
}

impl Drop for ShmAttachment {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.addr as *const libc::c_void);
        }
    }
}

fn segment_size(handle: i32) -> Result<usize, ExternalError> {
    let mut info: libc::shmid_ds = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::shmctl(handle, libc::IPC_STAT, &mut info) };
    if rc == -1 {
        return Err(ExternalError::ShmStatFailed(io::Error::last_os_error()));
    }
    Ok(info.shm_segsz as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_rejects_undersized_segment() {
        let handle = unsafe { libc::shmget(libc::IPC_PRIVATE, 16, libc::IPC_CREAT | 0o600) };
        assert!(handle >= 0, "shmget failed, cannot exercise this test in this environment");

        let result = ShmAttachment::attach(handle, 4096);
        unsafe { libc::shmctl(handle, libc::IPC_RMID, ptr::null_mut()) };

        match result {
            Err(ExternalError::ShmTooSmall { actual, needed }) => {
                assert_eq!(actual, 16);
                assert_eq!(needed, 4096);
            }
            other => panic!("expected ShmTooSmall, got {other:?}"),
        }
    }

    #[test]
    fn attach_succeeds_and_exposes_contents() {
        let handle = unsafe { libc::shmget(libc::IPC_PRIVATE, 64, libc::IPC_CREAT | 0o600) };
        assert!(handle >= 0, "shmget failed, cannot exercise this test in this environment");

        let write_addr = unsafe { libc::shmat(handle, ptr::null(), 0) };
        assert!(write_addr != usize::MAX as *mut libc::c_void);
        unsafe {
            std::ptr::write_bytes(write_addr as *mut u8, 0xAB, 64);
            libc::shmdt(write_addr);
        }

        let attachment = ShmAttachment::attach(handle, 64).expect("attach should succeed");
        assert_eq!(attachment.as_slice(), &[0xABu8; 64][..]);
        drop(attachment);

        unsafe { libc::shmctl(handle, libc::IPC_RMID, ptr::null_mut()) };
    }
}
