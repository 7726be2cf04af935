//! Instance counting and session-id sharing across a group of plugin instances.
//!
//! A group is backed by a small named segment `registry_<group>` holding a
//! `RegistryBlock`. The first instance to arrive initialises it and gets
//! index 1; later ones bump the counter under a spin lock that lives in the
//! block itself. The last one to leave removes the file and marks the block
//! Released, so anyone still holding the old mapping knows to reopen.

use crate::error::{Result, ShmError};
use crate::segment::{self, Segment};
use panlink_core::RegistryConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const REGISTRY_SIZE: usize = 4096;
const MAGIC: u32 = 0x504C_4E4B; // "PLNK"
const VERSION: u32 = 1;
const SESSION_ID_LEN: usize = 128;

const LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const REOPEN_RETRIES: usize = 16;

const STATE_VACANT: u32 = 0;
const STATE_INITIALIZING: u32 = 1;
const STATE_LIVE: u32 = 2;
const STATE_RELEASED: u32 = 3;

#[repr(C)]
struct RegistryBlock {
    magic: AtomicU32,
    version: AtomicU32,
    state: AtomicU32,
    lock: AtomicU32,
    counter: AtomicU32,
    identifier_received: AtomicU32,
    session_len: AtomicU32,
    _pad: u32,
    session_id: [AtomicU8; SESSION_ID_LEN],
}

const _: () = assert!(std::mem::size_of::<RegistryBlock>() <= REGISTRY_SIZE);

struct LockGuard<'a> {
    lock: &'a AtomicU32,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(0, Ordering::Release);
    }
}

/// This instance's membership in an instance group.
///
/// Dropping it leaves the group. Use [`InstanceRegistry::leave`] to observe
/// teardown errors instead of having them logged.
pub struct InstanceRegistry {
    segment: Segment,
    group: String,
    index: u32,
    left: bool,
}

impl InstanceRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        config.validate()?;
        let dir = segment::resolve_directory(config.directory.as_deref())?;
        Self::join_in(&dir, &config.group_key())
    }

    /// Join `group`, creating its block if this is the first instance.
    pub fn join_in(dir: &Path, group: &str) -> Result<Self> {
        let name = format!("registry_{}", group);
        let path = segment::segment_path(dir, &name);

        for attempt in 0..REOPEN_RETRIES {
            let segment = Segment::open(&path, &name, REGISTRY_SIZE, true)
                .map_err(|e| ShmError::RegistryInconsistency(format!("cannot map: {}", e)))?;
            if segment.len() < std::mem::size_of::<RegistryBlock>() {
                return Err(ShmError::RegistryInconsistency(format!(
                    "{} is only {} bytes",
                    path.display(),
                    segment.len()
                )));
            }

            match Self::claim(&segment, &path)? {
                Some(index) => {
                    info!("Joined instance group '{}' as instance {}", group, index);
                    return Ok(Self {
                        segment,
                        group: group.to_string(),
                        index,
                        left: false,
                    });
                }
                None => {
                    debug!("Instance group '{}' was released, reopening", group);
                    drop(segment);
                    std::thread::sleep(Duration::from_millis(1 << attempt.min(5)));
                }
            }
        }

        Err(ShmError::RegistryInconsistency(format!(
            "group '{}' kept being released while joining",
            group
        )))
    }

    /// Take an index in the mapped block. `None` means the block was
    /// released and the file must be reopened.
    fn claim(segment: &Segment, path: &Path) -> Result<Option<u32>> {
        let block = Self::block_of(segment);
        let deadline = Instant::now() + LOCK_TIMEOUT;

        loop {
            match block.state.compare_exchange(
                STATE_VACANT,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    block.magic.store(MAGIC, Ordering::Relaxed);
                    block.version.store(VERSION, Ordering::Relaxed);
                    block.lock.store(0, Ordering::Relaxed);
                    block.counter.store(1, Ordering::Relaxed);
                    block.identifier_received.store(0, Ordering::Relaxed);
                    block.session_len.store(0, Ordering::Relaxed);
                    block.state.store(STATE_LIVE, Ordering::Release);
                    return Ok(Some(1));
                }
                Err(STATE_RELEASED) => return Ok(None),
                Err(STATE_INITIALIZING) => {
                    if Instant::now() > deadline {
                        return Err(ShmError::RegistryInconsistency(format!(
                            "{} stuck initializing",
                            path.display()
                        )));
                    }
                    std::thread::yield_now();
                }
                Err(STATE_LIVE) => {
                    Self::check_magic(block)?;
                    let _guard = Self::lock_block(block)?;
                    // Released between the state check and the lock.
                    if block.state.load(Ordering::Acquire) != STATE_LIVE {
                        return Ok(None);
                    }
                    let index = block.counter.load(Ordering::Relaxed) + 1;
                    block.counter.store(index, Ordering::Release);
                    return Ok(Some(index));
                }
                Err(other) => {
                    return Err(ShmError::RegistryInconsistency(format!(
                        "unknown state {} in {}",
                        other,
                        path.display()
                    )));
                }
            }
        }
    }

    fn block_of(segment: &Segment) -> &RegistryBlock {
        // SAFETY: the mapping is page aligned and at least a block long.
        unsafe { &*(segment.base() as *const RegistryBlock) }
    }

    fn block(&self) -> &RegistryBlock {
        Self::block_of(&self.segment)
    }

    fn check_magic(block: &RegistryBlock) -> Result<()> {
        let magic = block.magic.load(Ordering::Acquire);
        let version = block.version.load(Ordering::Acquire);
        if magic != MAGIC || version != VERSION {
            return Err(ShmError::RegistryInconsistency(format!(
                "bad block header (magic {:#x}, version {})",
                magic, version
            )));
        }
        Ok(())
    }

    /// Called with the lock held once the last instance has left.
    ///
    /// A removed file is marked Released so holders of the old mapping reopen.
    /// A file that is still on disk goes back to Vacant, so the next joiner
    /// initializes it in place instead of waiting for a file that never goes.
    fn release_block(block: &RegistryBlock, removed: bool) {
        if removed {
            block.state.store(STATE_RELEASED, Ordering::Release);
        } else {
            block.identifier_received.store(0, Ordering::Relaxed);
            block.session_len.store(0, Ordering::Relaxed);
            block.state.store(STATE_VACANT, Ordering::Release);
        }
    }

    fn lock_block(block: &RegistryBlock) -> Result<LockGuard<'_>> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        let mut spins = 0u32;
        while block
            .lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if Instant::now() > deadline {
                return Err(ShmError::RegistryInconsistency(format!(
                    "lock not released within {:?}",
                    LOCK_TIMEOUT
                )));
            }
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(Duration::from_micros(50));
            }
        }
        Ok(LockGuard { lock: &block.lock })
    }

    /// Decrement the shared counter, never below zero. Returns the new count.
    pub fn decrease_counter(&self) -> Result<u32> {
        let block = self.block();
        let _guard = Self::lock_block(block)?;
        let count = block.counter.load(Ordering::Relaxed).saturating_sub(1);
        block.counter.store(count, Ordering::Release);
        Ok(count)
    }

    /// Record the session id handed out by the mixer.
    ///
    /// Only the first call in a group takes effect; returns whether this one did.
    /// Ids longer than 128 bytes are truncated at a char boundary.
    pub fn set_instance_identifier(&self, id: &str) -> Result<bool> {
        let block = self.block();
        let _guard = Self::lock_block(block)?;
        if block.identifier_received.load(Ordering::Relaxed) != 0 {
            return Ok(false);
        }

        let mut len = id.len().min(SESSION_ID_LEN);
        while !id.is_char_boundary(len) {
            len -= 1;
        }
        for (slot, &b) in block.session_id.iter().zip(&id.as_bytes()[..len]) {
            slot.store(b, Ordering::Relaxed);
        }
        block.session_len.store(len as u32, Ordering::Relaxed);
        block.identifier_received.store(1, Ordering::Release);
        debug!("Instance group '{}' session id set", self.group);
        Ok(true)
    }

    /// Shared session id, empty until one has been received.
    pub fn session_id(&self) -> String {
        let block = self.block();
        if block.identifier_received.load(Ordering::Acquire) == 0 {
            return String::new();
        }
        let len = (block.session_len.load(Ordering::Relaxed) as usize).min(SESSION_ID_LEN);
        let bytes: Vec<u8> = block.session_id[..len]
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// 1-based position of this instance when it joined.
    pub fn instantiation_index(&self) -> u32 {
        self.index
    }

    pub fn is_identifier_received(&self) -> bool {
        self.block().identifier_received.load(Ordering::Acquire) != 0
    }

    pub fn live_instances(&self) -> u32 {
        self.block().counter.load(Ordering::Acquire)
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn path(&self) -> PathBuf {
        self.segment.path().to_path_buf()
    }

    /// Leave the group now, reporting teardown errors.
    pub fn leave(mut self) -> Result<()> {
        self.leave_inner()
    }

    fn leave_inner(&mut self) -> Result<()> {
        if self.left {
            return Ok(());
        }
        self.left = true;

        let block = self.block();
        let _guard = Self::lock_block(block)?;
        let previous = block.counter.load(Ordering::Relaxed);
        let remaining = previous.saturating_sub(1);
        block.counter.store(remaining, Ordering::Release);

        if remaining == 0 {
            let removed = self.segment.remove_file();
            if !removed {
                warn!(
                    "Could not remove {}, resetting it for reuse",
                    self.segment.path().display()
                );
            }
            Self::release_block(block, removed);
            info!("Instance group '{}' released", self.group);
        } else {
            debug!(
                "Left instance group '{}' ({} remaining)",
                self.group, remaining
            );
        }
        Ok(())
    }
}

impl Drop for InstanceRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.leave_inner() {
            error!("Leaving instance group '{}' failed: {}", self.group, e);
        }
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("group", &self.group)
            .field("index", &self.index)
            .field("live", &self.live_instances())
            .finish()
    }
}
