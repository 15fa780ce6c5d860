//! Region lifecycle: the mapped bytes plus the three named semaphores that
//! coordinate concurrent processes.
//!
//! A region handle caches the version-semaphore value it last mapped under.
//! Any other process that resizes the region bumps the version semaphore, and
//! every public entry point compares the cached value against it; on mismatch
//! the handle drops its mapping and re-opens the name, which may land at a
//! different base address and size. Offsets stored inside the region survive
//! this because nothing in the region is an absolute pointer.

use std::cell::Cell;
use std::time::Duration;

use log::{error, info, warn};

use crate::error::{Error, ErrorKind};
use crate::os::{self, Mapping, Semaphore, DEFAULT_POLL, DEFAULT_TIMEOUT};

fn write_sem_name(name: &str) -> String {
    format!("{name}_write_sem")
}

fn version_sem_name(name: &str) -> String {
    format!("{name}_version_sem")
}

fn counter_sem_name(name: &str) -> String {
    format!("{name}_counter_sem")
}

pub(crate) struct Region {
    name: String,
    mapping: Cell<Mapping>,
    write_sem: Semaphore,
    version_sem: Semaphore,
    counter_sem: Semaphore,
    version: Cell<i32>,
    owner: bool,
    connected: Cell<bool>,
}

impl Region {
    /// Create the named region and its semaphores, zero-filled.
    pub(crate) fn create(name: &str, capacity: usize) -> Result<Self, Error> {
        let mapping = os::create_shm(name, capacity)?;
        let counter_sem = Semaphore::create(&counter_sem_name(name), 0)?;
        let version_sem = Semaphore::create(&version_sem_name(name), 0)?;
        let write_sem = Semaphore::create(&write_sem_name(name), 1)?;
        info!("created region {name} with {capacity} bytes");
        Ok(Self {
            name: name.to_owned(),
            mapping: Cell::new(mapping),
            write_sem,
            version_sem,
            counter_sem,
            version: Cell::new(0),
            owner: true,
            connected: Cell::new(true),
        })
    }

    /// Attach to an existing named region, waiting for the owner to finish
    /// creating it.
    pub(crate) fn connect(name: &str) -> Result<Self, Error> {
        let mapping = os::connect_shm(name, DEFAULT_POLL, DEFAULT_TIMEOUT)?;
        let counter_sem = Semaphore::connect(&counter_sem_name(name), DEFAULT_POLL, DEFAULT_TIMEOUT)?;
        let version_sem = Semaphore::connect(&version_sem_name(name), DEFAULT_POLL, DEFAULT_TIMEOUT)?;
        let write_sem = Semaphore::connect(&write_sem_name(name), DEFAULT_POLL, DEFAULT_TIMEOUT)?;
        let version = version_sem.value()?;
        info!("connected to region {name} with {} bytes", mapping.len);
        Ok(Self {
            name: name.to_owned(),
            mapping: Cell::new(mapping),
            write_sem,
            version_sem,
            counter_sem,
            version: Cell::new(version),
            owner: false,
            connected: Cell::new(true),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_owner(&self) -> bool {
        self.owner
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.mapping.get().ptr
    }

    pub(crate) fn capacity(&self) -> usize {
        self.mapping.get().len
    }

    pub(crate) fn version(&self) -> i32 {
        self.version.get()
    }

    /// Check connection and version; remap when another process resized.
    pub(crate) fn ensure_current(&self) -> Result<(), Error> {
        if !self.connected.get() {
            return Err(Error::new(ErrorKind::NotConnected));
        }
        let current = self.version_sem.value()?;
        if current != self.version.get() {
            self.remap()?;
        }
        Ok(())
    }

    fn remap(&self) -> Result<(), Error> {
        os::close_shm(self.mapping.get());
        self.connected.set(false);
        let mapping = os::connect_shm(&self.name, DEFAULT_POLL, DEFAULT_TIMEOUT)?;
        self.mapping.set(mapping);
        self.connected.set(true);
        self.version.set(self.version_sem.value()?);
        info!(
            "remapped region {} at version {} with {} bytes",
            self.name,
            self.version.get(),
            mapping.len
        );
        Ok(())
    }

    /// Acquire the region-wide write lock.
    pub(crate) fn lock(&self) -> Result<WriteGuard<'_>, Error> {
        self.lock_with(DEFAULT_POLL, Some(DEFAULT_TIMEOUT), None)
    }

    /// Acquire the write lock with explicit poll/timeout/abort settings.
    pub(crate) fn lock_with(
        &self,
        poll: Duration,
        timeout: Option<Duration>,
        callback: Option<&mut dyn FnMut() -> bool>,
    ) -> Result<WriteGuard<'_>, Error> {
        self.write_sem.wait(poll, timeout, callback)?;
        Ok(WriteGuard { region: self })
    }

    /// Announce a resize to every other process mapping this region.
    pub(crate) fn bump_version(&self) -> Result<(), Error> {
        self.version_sem.post()
    }

    /// Announce a completed mutation to consumers watching the counter.
    pub(crate) fn bump_counter(&self) {
        if let Err(err) = self.counter_sem.post() {
            warn!("failed to post counter semaphore: {err}");
        }
    }

    /// Throw away the current mapping and re-create the named object at a new
    /// capacity. The content is NOT preserved; callers snapshot and restore.
    ///
    /// Between closing the old mapping and mapping the new one this handle
    /// has no region at all, so it is marked disconnected until the swap
    /// lands. A handle left disconnected by a failed swap refuses all
    /// further operations.
    pub(crate) fn recreate(&self, capacity: usize) -> Result<(), Error> {
        os::close_shm(self.mapping.get());
        self.connected.set(false);
        let mapping = os::create_shm(&self.name, capacity)?;
        self.mapping.set(mapping);
        self.version.set(self.version_sem.value()?);
        self.connected.set(true);
        Ok(())
    }

    pub(crate) fn close(&self) {
        if !self.connected.get() {
            return;
        }
        os::close_shm(self.mapping.get());
        self.counter_sem.close();
        self.version_sem.close();
        self.write_sem.close();
        self.connected.set(false);
        info!("closed region {}", self.name);
    }

    /// Remove the region and its semaphores from the system namespace.
    /// Only meaningful on the owning handle.
    pub(crate) fn unlink(&self) {
        if !self.owner {
            return;
        }
        for result in [
            os::unlink_shm(&self.name),
            Semaphore::unlink(&counter_sem_name(&self.name)),
            Semaphore::unlink(&version_sem_name(&self.name)),
            Semaphore::unlink(&write_sem_name(&self.name)),
        ] {
            if let Err(err) = result {
                error!("unlink of region {} left residue: {err}", self.name);
            }
        }
        info!("unlinked region {}", self.name);
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.close();
        self.unlink();
    }
}

/// RAII hold on the region write lock; releases on drop.
pub(crate) struct WriteGuard<'a> {
    region: &'a Region,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.region.write_sem.post() {
            error!("failed to release write lock: {err}");
        }
    }
}
