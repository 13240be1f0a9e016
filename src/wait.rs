//! Futex primitives backing the shared wake word.
//!
//! The wait side never reports "timed out" or "value changed" as an error: the
//! caller always re-checks its own flag after returning.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

use crate::Result;

/// Parks the calling thread while `*addr == expected`, for at most `timeout`.
#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<()> {
    use libc::{syscall, timespec, SYS_futex, EAGAIN, EINTR, ETIMEDOUT, FUTEX_WAIT};

    let ts = timeout.map(|timeout| timespec {
        tv_sec: libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |ts| ts as *const timespec);

    // Shared (non-private) futex: the word may live in a mapping used by other processes.
    let res = unsafe {
        syscall(
            SYS_futex,
            addr.as_ptr(),
            FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == EAGAIN || code == EINTR || code == ETIMEDOUT => Ok(()),
        _ => Err(crate::Error::Io(err)),
    }
}

/// Wakes every thread parked on `addr`.
#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicU32) -> Result<()> {
    use libc::{syscall, SYS_futex, FUTEX_WAKE};

    let res = unsafe {
        syscall(
            SYS_futex,
            addr.as_ptr(),
            FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<u32>(),
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res < 0 {
        return Err(crate::Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

// Without futexes the waiter degrades to short sleeps and re-checks its flag.
#[cfg(not(target_os = "linux"))]
const FALLBACK_PARK: Duration = Duration::from_millis(1);

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(_addr: &AtomicU32, _expected: u32, timeout: Option<Duration>) -> Result<()> {
    let park = timeout.map_or(FALLBACK_PARK, |timeout| timeout.min(FALLBACK_PARK));
    std::thread::sleep(park);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicU32) -> Result<()> {
    Ok(())
}
