//! Library-owned f32 buffers handed across the C ABI
//!
//! Every buffer given to the caller is recorded in a process-wide registry keyed
//! by its address. Releasing a buffer removes it from the registry first, so an
//! unknown or already released pointer is reported instead of freed.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use web_rwkv_ffi_core::{Error, Result};

/// Live allocations: address -> length
static LIVE: Mutex<BTreeMap<usize, usize>> = Mutex::new(BTreeMap::new());

/// Leak `data` to the caller. Empty data yields a null pointer.
pub fn export(data: Vec<f32>) -> (*mut f32, usize) {
    if data.is_empty() {
        return (std::ptr::null_mut(), 0);
    }
    let len = data.len();
    let ptr = Box::into_raw(data.into_boxed_slice()) as *mut f32;
    LIVE.lock().insert(ptr as usize, len);
    (ptr, len)
}

/// Take back a buffer produced by [`export`].
///
/// A null pointer is a no-op.
///
/// # Safety
/// `ptr` must be null or an address previously returned by [`export`]; addresses
/// that are not (or no longer) registered are rejected without being touched.
pub unsafe fn release(ptr: *mut f32, len: usize) -> Result<()> {
    if ptr.is_null() {
        return Ok(());
    }

    let registered = {
        let mut live = LIVE.lock();
        match live.get(&(ptr as usize)) {
            Some(&registered) if registered == len => live.remove(&(ptr as usize)),
            Some(&registered) => {
                return Err(Error::SizeMismatch { expected: registered, actual: len });
            }
            None => None,
        }
    };
    let Some(len) = registered else {
        return Err(Error::DoubleFree(ptr as usize));
    };

    // SAFETY: the registry proves the pointer came from `Box<[f32]>` of this length
    // and removing it guarantees it is reclaimed only once.
    drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)) });
    Ok(())
}

/// Number of buffers currently held by callers
pub fn live_buffers() -> usize {
    LIVE.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_export_release() {
        let before = live_buffers();
        let (ptr, len) = export(vec![1.0, 2.0, 3.0]);
        assert_eq!(len, 3);
        assert_eq!(live_buffers(), before + 1);
        assert_eq!(unsafe { std::slice::from_raw_parts(ptr, len) }, &[1.0, 2.0, 3.0]);

        assert!(matches!(unsafe { release(ptr, 2) }, Err(Error::SizeMismatch { .. })));
        unsafe { release(ptr, len) }.unwrap();
        assert_eq!(live_buffers(), before);
        assert!(matches!(unsafe { release(ptr, len) }, Err(Error::DoubleFree(_))));
    }

    #[test]
    #[serial]
    fn test_empty_is_null() {
        let (ptr, len) = export(vec![]);
        assert!(ptr.is_null());
        assert_eq!(len, 0);
        unsafe { release(ptr, len) }.unwrap();
    }
}
