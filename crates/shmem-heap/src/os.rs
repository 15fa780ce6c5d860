//! Thin wrappers over the POSIX named shared-memory and named semaphore
//! primitives the region is built on.
//!
//! Names are normalized to the leading-slash form the OS expects. Creation
//! always unlinks a stale object of the same name first, so a crashed owner
//! does not wedge the next run. Connection polls for the name to appear, since
//! a peer may race the owner's setup.

use std::ffi::CString;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind};

/// Interval between polls while waiting on a name or semaphore.
pub(crate) const DEFAULT_POLL: Duration = Duration::from_millis(10);

/// How long connection and lock waits keep polling before giving up.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(100);

/// A mapped view of a named shared-memory object.
#[derive(Clone, Copy)]
pub(crate) struct Mapping {
    pub fd: libc::c_int,
    pub ptr: *mut u8,
    pub len: usize,
}

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn os_name(name: &str) -> Result<CString, Error> {
    if name.is_empty() || name.len() > 250 {
        return Err(Error::new(ErrorKind::InvalidName {
            name: name.to_owned(),
        }));
    }
    let mut full = String::with_capacity(name.len() + 1);
    if !name.starts_with('/') {
        full.push('/');
    }
    full.push_str(name);
    if full[1..].contains('/') {
        return Err(Error::new(ErrorKind::InvalidName {
            name: name.to_owned(),
        }));
    }
    CString::new(full).map_err(|_| {
        Error::new(ErrorKind::InvalidName {
            name: name.to_owned(),
        })
    })
}

fn map(fd: libc::c_int, len: usize) -> Result<*mut u8, Error> {
    // SAFETY: mapping a shared file descriptor we own; the result is checked.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::os("mmap"));
    }
    Ok(ptr.cast())
}

/// Create (or re-create) the named object at the given size, zero-filled.
pub(crate) fn create_shm(name: &str, len: usize) -> Result<Mapping, Error> {
    let c = os_name(name)?;
    // SAFETY: plain libc calls on a validated name; every failure path is
    // checked and cleans up the descriptor.
    unsafe {
        libc::shm_unlink(c.as_ptr());
        let fd = libc::shm_open(
            c.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o666,
        );
        if fd < 0 {
            return Err(Error::os("shm_open"));
        }
        if libc::ftruncate(fd, len as libc::off_t) != 0 {
            let err = Error::os("ftruncate");
            libc::close(fd);
            libc::shm_unlink(c.as_ptr());
            return Err(err);
        }
        let ptr = match map(fd, len) {
            Ok(ptr) => ptr,
            Err(err) => {
                libc::close(fd);
                libc::shm_unlink(c.as_ptr());
                return Err(err);
            }
        };
        Ok(Mapping { fd, ptr, len })
    }
}

/// Attach to an existing named object, waiting for it to appear.
pub(crate) fn connect_shm(name: &str, poll: Duration, timeout: Duration) -> Result<Mapping, Error> {
    let c = os_name(name)?;
    let start = Instant::now();
    let fd = loop {
        // SAFETY: opening an existing object read-write; checked below.
        let fd = unsafe { libc::shm_open(c.as_ptr(), libc::O_RDWR, 0) };
        if fd >= 0 {
            break fd;
        }
        if start.elapsed() >= timeout {
            return Err(Error::os("shm_open"));
        }
        thread::sleep(poll);
    };
    let len = match shm_len(fd) {
        Ok(len) => len,
        Err(err) => {
            // SAFETY: fd was opened above.
            unsafe { libc::close(fd) };
            return Err(err);
        }
    };
    match map(fd, len) {
        Ok(ptr) => Ok(Mapping { fd, ptr, len }),
        Err(err) => {
            // SAFETY: fd was opened above.
            unsafe { libc::close(fd) };
            Err(err)
        }
    }
}

fn shm_len(fd: libc::c_int) -> Result<usize, Error> {
    // SAFETY: stat buffer is zero-initialized and only read on success.
    unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        if libc::fstat(fd, &mut st) != 0 {
            return Err(Error::os("fstat"));
        }
        Ok(st.st_size as usize)
    }
}

/// Drop the mapping and descriptor. The name stays until unlinked.
pub(crate) fn close_shm(m: Mapping) {
    // SAFETY: tearing down resources this module created.
    unsafe {
        libc::munmap(m.ptr.cast(), m.len);
        libc::close(m.fd);
    }
}

pub(crate) fn unlink_shm(name: &str) -> Result<(), Error> {
    let c = os_name(name)?;
    // SAFETY: plain unlink of a validated name.
    let rc = unsafe { libc::shm_unlink(c.as_ptr()) };
    if rc != 0 {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno != libc::ENOENT {
            return Err(Error::new(ErrorKind::Os {
                call: "shm_unlink",
                errno,
            }));
        }
    }
    Ok(())
}

/// A named counting semaphore.
pub(crate) struct Semaphore {
    sem: *mut libc::sem_t,
    name: String,
}

impl Semaphore {
    /// Create the semaphore with the given initial value, replacing any
    /// stale object of the same name.
    pub(crate) fn create(name: &str, initial: u32) -> Result<Self, Error> {
        let c = os_name(name)?;
        // SAFETY: libc calls on a validated name, result checked.
        let sem = unsafe {
            libc::sem_unlink(c.as_ptr());
            libc::sem_open(
                c.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o666 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(Error::os("sem_open"));
        }
        Ok(Self {
            sem,
            name: name.to_owned(),
        })
    }

    /// Attach to an existing semaphore, waiting for it to appear.
    pub(crate) fn connect(name: &str, poll: Duration, timeout: Duration) -> Result<Self, Error> {
        let c = os_name(name)?;
        let start = Instant::now();
        loop {
            // SAFETY: opening an existing semaphore, result checked.
            let sem = unsafe { libc::sem_open(c.as_ptr(), 0) };
            if sem != libc::SEM_FAILED {
                return Ok(Self {
                    sem,
                    name: name.to_owned(),
                });
            }
            if start.elapsed() >= timeout {
                return Err(Error::os("sem_open"));
            }
            thread::sleep(poll);
        }
    }

    /// Current counter value.
    pub(crate) fn value(&self) -> Result<i32, Error> {
        let mut value: libc::c_int = 0;
        // SAFETY: self.sem is a live semaphore handle.
        if unsafe { libc::sem_getvalue(self.sem, &mut value) } != 0 {
            return Err(Error::os("sem_getvalue"));
        }
        Ok(value)
    }

    pub(crate) fn post(&self) -> Result<(), Error> {
        // SAFETY: self.sem is a live semaphore handle.
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(Error::os("sem_post"));
        }
        Ok(())
    }

    /// Wait for the counter to become positive and decrement it.
    ///
    /// Polls with `sem_trywait` so the wait can honor a timeout and an abort
    /// callback; the callback is polled once per sleep interval and aborts
    /// the wait with [`ErrorKind::Interrupted`] when it returns true.
    pub(crate) fn wait(
        &self,
        poll: Duration,
        timeout: Option<Duration>,
        mut callback: Option<&mut dyn FnMut() -> bool>,
    ) -> Result<(), Error> {
        let start = Instant::now();
        loop {
            // SAFETY: self.sem is a live semaphore handle.
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(());
            }
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EAGAIN && errno != libc::EINTR {
                return Err(Error::new(ErrorKind::Os {
                    call: "sem_trywait",
                    errno,
                }));
            }
            if let Some(cb) = callback.as_deref_mut() {
                if cb() {
                    return Err(Error::new(ErrorKind::Interrupted {
                        name: self.name.clone(),
                    }));
                }
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Err(Error::new(ErrorKind::Os {
                        call: "sem_wait",
                        errno: libc::ETIMEDOUT,
                    }));
                }
            }
            thread::sleep(poll);
        }
    }

    pub(crate) fn close(&self) {
        // SAFETY: closing the handle; the named object survives.
        unsafe { libc::sem_close(self.sem) };
    }

    pub(crate) fn unlink(name: &str) -> Result<(), Error> {
        let c = os_name(name)?;
        // SAFETY: plain unlink of a validated name.
        let rc = unsafe { libc::sem_unlink(c.as_ptr()) };
        if rc != 0 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::ENOENT {
                return Err(Error::new(ErrorKind::Os {
                    call: "sem_unlink",
                    errno,
                }));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn rejects_bad_names() {
        assert!(matches!(
            os_name("").unwrap_err().kind(),
            ErrorKind::InvalidName { .. }
        ));
        assert!(matches!(
            os_name("a/b").unwrap_err().kind(),
            ErrorKind::InvalidName { .. }
        ));
        assert!(os_name("plain").is_ok());
        assert!(os_name("/slashed").is_ok());
    }
}
