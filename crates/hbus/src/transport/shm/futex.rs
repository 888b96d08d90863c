// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Linux futex wrapper for inter-process event signalling.
//!
//! Uses the SHARED futex operations (`FUTEX_WAIT`/`FUTEX_WAKE`), not the
//! `_PRIVATE` variants - the private ones only work within one process and
//! silently fail to wake waiters in other processes.

use std::ptr;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

#[cfg(target_os = "linux")]
const FUTEX_WAIT: i32 = 0;
#[cfg(target_os = "linux")]
const FUTEX_WAKE: i32 = 1;

/// Wait until the value at `addr` differs from `expected` or the timeout
/// expires.
///
/// Returns 0 on wake (including spurious wakes), -1 with `EAGAIN` when the
/// value already changed, -1 with `ETIMEDOUT` on expiry.
#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> i32 {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: addr is a live reference for the duration of the call; the
    // kernel treats the address as an opaque key. SHARED op, see module docs.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

/// Wake every waiter blocked on `addr`.
#[cfg(target_os = "linux")]
pub fn futex_wake_all(addr: &AtomicU32) -> i32 {
    // SAFETY: addr is a live reference; SHARED wake, see module docs.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            i32::MAX,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

// Non-Linux fallback: bounded sleep instead of a kernel wait. Correctness is
// preserved by the callers' double-check pattern.
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(_addr: &AtomicU32, _expected: u32, timeout: Option<Duration>) -> i32 {
    let nap = timeout
        .unwrap_or(Duration::from_millis(1))
        .min(Duration::from_millis(1));
    std::thread::sleep(nap);
    0
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake_all(_addr: &AtomicU32) -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn wait_times_out() {
        let cell = AtomicU32::new(0);
        let start = Instant::now();
        futex_wait(&cell, 0, Some(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn wait_returns_when_value_differs() {
        let cell = AtomicU32::new(5);
        // Expected 0 but value is 5: returns immediately with EAGAIN.
        let start = Instant::now();
        futex_wait(&cell, 0, Some(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wake_unblocks_waiter() {
        let cell = Arc::new(AtomicU32::new(0));
        let waiter_cell = Arc::clone(&cell);
        let waiter = std::thread::spawn(move || {
            let start = Instant::now();
            while waiter_cell.load(Ordering::Acquire) == 0 {
                futex_wait(&waiter_cell, 0, Some(Duration::from_millis(200)));
                if start.elapsed() > Duration::from_secs(5) {
                    break;
                }
            }
            waiter_cell.load(Ordering::Acquire)
        });

        std::thread::sleep(Duration::from_millis(30));
        cell.store(7, Ordering::Release);
        futex_wake_all(&cell);

        assert_eq!(waiter.join().expect("waiter"), 7);
    }
}
