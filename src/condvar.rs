//! Shared wake primitive.
//!
//! A [`ConditionVariable`] is a handle to a small block of atomics living in a
//! shared mapping: a binary "notified" flag, a futex sequence word and a
//! counter of parked waiters. Any number of threads or processes holding a
//! handle may [`notify`](ConditionVariable::notify); exactly one
//! [`ConditionVariableWaiter`] blocks on it.

use std::fmt;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::mmap::MmapFile;
use crate::wait::{futex_wait, futex_wake};
use crate::{Error, Result};

pub const CONDVAR_MAGIC: u32 = 0x5753_4554; // 'WSET'
pub const CONDVAR_VERSION: u32 = 1;

const INIT_WRITING: u32 = 1;
const INIT_READY: u32 = 2;
const DEFAULT_SPIN_US: u32 = 10;
const READY_SPIN_LIMIT: u32 = 1 << 16;

#[repr(C, align(128))]
pub struct ConditionVariableData {
    // Written once at creation.
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub init_state: AtomicU32,
    pub _pad0: [u8; 116],

    // Signaler / waiter coordination.
    pub notified: AtomicU32,
    pub notify_seq: AtomicU32,
    pub waiters_pending: AtomicU32,
    pub _pad1: [u8; 116],
}

/// How a waiter burns time before parking in the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStrategy {
    /// True busy-spinning on the notified flag; never parks.
    BusySpin,
    /// Spins for `spin_us` microseconds, then parks on the futex word.
    SpinThenPark { spin_us: u32 },
    /// Polls the notified flag, sleeping for the given period in between.
    Sleep(Duration),
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self::SpinThenPark {
            spin_us: DEFAULT_SPIN_US,
        }
    }
}

struct Region {
    _mmap: MmapFile,
    ptr: *const ConditionVariableData,
    unlink_on_drop: Option<PathBuf>,
}

// SAFETY: the pointer targets a mapping owned by `_mmap` and is only ever
// accessed through atomics.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        if let Some(path) = self.unlink_on_drop.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Cloneable handle to a wake region.
#[derive(Clone)]
pub struct ConditionVariable {
    region: Arc<Region>,
}

impl ConditionVariable {
    /// Maps a process-local wake region.
    pub fn anonymous() -> Result<Self> {
        let mut mmap = MmapFile::anonymous(size_of::<ConditionVariableData>())?;
        let ptr = initialize(&mut mmap);
        Ok(Self::from_parts(mmap, ptr, None))
    }

    /// Creates a named wake region at `path` that other processes can
    /// [`open`](Self::open). The file is removed when the last handle created
    /// here is dropped.
    pub fn create(path: &Path) -> Result<Self> {
        let tmp_path = path.with_extension("tmp");
        let mut mmap = MmapFile::create(&tmp_path, size_of::<ConditionVariableData>())?;
        let ptr = initialize(&mut mmap);
        std::fs::rename(&tmp_path, path)?;
        Ok(Self::from_parts(mmap, ptr, Some(path.to_path_buf())))
    }

    /// Maps an existing named wake region.
    pub fn open(path: &Path) -> Result<Self> {
        let mmap = MmapFile::open(path)?;
        if mmap.len() < size_of::<ConditionVariableData>() {
            return Err(Error::CorruptMetadata("wake region too small"));
        }
        let ptr = mmap.as_slice().as_ptr().cast::<ConditionVariableData>();
        let condvar = Self::from_parts(mmap, ptr, None);
        condvar.wait_ready()?;
        Ok(condvar)
    }

    fn from_parts(
        mmap: MmapFile,
        ptr: *const ConditionVariableData,
        unlink_on_drop: Option<PathBuf>,
    ) -> Self {
        Self {
            region: Arc::new(Region {
                _mmap: mmap,
                ptr,
                unlink_on_drop,
            }),
        }
    }

    fn wait_ready(&self) -> Result<()> {
        let data = self.data();
        let mut spins = 0;
        while data.init_state.load(Ordering::Acquire) != INIT_READY {
            spins += 1;
            if spins >= READY_SPIN_LIMIT {
                return Err(Error::CorruptMetadata("wake region never became ready"));
            }
            std::thread::yield_now();
        }
        if data.magic.load(Ordering::Acquire) != CONDVAR_MAGIC {
            return Err(Error::CorruptMetadata("wake region magic mismatch"));
        }
        let version = data.version.load(Ordering::Acquire);
        if version != CONDVAR_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        Ok(())
    }

    pub fn data(&self) -> &ConditionVariableData {
        unsafe { &*self.region.ptr }
    }

    /// Raises the notified flag and wakes a parked waiter. Never blocks.
    pub fn notify(&self) {
        let data = self.data();
        data.notified.store(1, Ordering::SeqCst);
        data.notify_seq.fetch_add(1, Ordering::SeqCst);
        if data.waiters_pending.load(Ordering::SeqCst) == 0 {
            return;
        }
        if let Err(err) = futex_wake(&data.notify_seq) {
            log::warn!("wake primitive: futex wake failed: {err}");
        }
    }

    pub fn was_notified(&self) -> bool {
        self.data().notified.load(Ordering::SeqCst) != 0
    }

    /// True when both handles refer to the same mapping.
    pub fn same_region(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }

    pub fn waiter(&self, strategy: WaitStrategy) -> ConditionVariableWaiter {
        ConditionVariableWaiter::new(self.clone(), strategy)
    }
}

impl fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("notified", &self.was_notified())
            .field("named", &self.region.unlink_on_drop)
            .finish()
    }
}

fn initialize(mmap: &mut MmapFile) -> *const ConditionVariableData {
    mmap.as_mut_slice().fill(0);
    let ptr = mmap.as_mut_slice().as_mut_ptr().cast::<ConditionVariableData>();
    let data = unsafe { &*ptr };
    data.init_state.store(INIT_WRITING, Ordering::Relaxed);
    data.version.store(CONDVAR_VERSION, Ordering::Relaxed);
    data.notified.store(0, Ordering::Relaxed);
    data.notify_seq.store(0, Ordering::Relaxed);
    data.waiters_pending.store(0, Ordering::Relaxed);
    data.magic.store(CONDVAR_MAGIC, Ordering::Relaxed);
    data.init_state.store(INIT_READY, Ordering::Release);
    ptr
}

/// The single consumer side of a wake region.
#[derive(Debug)]
pub struct ConditionVariableWaiter {
    condvar: ConditionVariable,
    strategy: WaitStrategy,
    clock: quanta::Clock,
}

impl ConditionVariableWaiter {
    pub fn new(condvar: ConditionVariable, strategy: WaitStrategy) -> Self {
        Self {
            condvar,
            strategy,
            clock: quanta::Clock::new(),
        }
    }

    pub fn condition_variable(&self) -> &ConditionVariable {
        &self.condvar
    }

    pub fn strategy(&self) -> WaitStrategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: WaitStrategy) {
        self.strategy = strategy;
    }

    /// Clears the notified flag. Any notify that lands afterwards re-arms it.
    pub fn reset(&self) {
        self.condvar.data().notified.store(0, Ordering::SeqCst);
    }

    pub fn was_notified(&self) -> bool {
        self.condvar.was_notified()
    }

    /// Blocks until the notified flag is raised.
    pub fn wait(&self) {
        let _ = self.wait_until(None);
    }

    /// Blocks until the notified flag is raised or `timeout` elapses.
    /// Returns whether the flag was observed.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        self.wait_until(Some(Instant::now() + timeout))
    }

    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        if self.spin(deadline) {
            return true;
        }
        loop {
            if self.was_notified() {
                return true;
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            if let WaitStrategy::Sleep(period) = self.strategy {
                std::thread::sleep(remaining.map_or(period, |left| left.min(period)));
                continue;
            }
            if self.park(remaining) {
                return true;
            }
        }
    }

    fn spin(&self, deadline: Option<Instant>) -> bool {
        let budget = match self.strategy {
            WaitStrategy::BusySpin => None,
            WaitStrategy::SpinThenPark { spin_us } => Some(Duration::from_micros(u64::from(spin_us))),
            WaitStrategy::Sleep(_) => return false,
        };
        let start = self.clock.now();
        let mut i: u32 = 0;
        loop {
            if self.was_notified() {
                return true;
            }
            i = i.wrapping_add(1);
            if i % 128 == 0 {
                if let Some(budget) = budget {
                    if self.clock.now().duration_since(start) >= budget {
                        return false;
                    }
                }
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    return false;
                }
            }
            std::hint::spin_loop();
        }
    }

    fn park(&self, timeout: Option<Duration>) -> bool {
        let data = self.condvar.data();

        // 1. Register presence so signalers know to issue the syscall.
        data.waiters_pending.fetch_add(1, Ordering::SeqCst);

        // 2. Load seq before the check-after-set to avoid missing a wake.
        let seq = data.notify_seq.load(Ordering::SeqCst);

        // 3. A notify that raced with registration already raised the flag.
        let notified = if data.notified.load(Ordering::SeqCst) != 0 {
            true
        } else {
            if let Err(err) = futex_wait(&data.notify_seq, seq, timeout) {
                log::warn!("wake primitive: futex wait failed: {err}");
                std::thread::yield_now();
            }
            data.notified.load(Ordering::SeqCst) != 0
        };

        data.waiters_pending.fetch_sub(1, Ordering::SeqCst);
        notified
    }
}
