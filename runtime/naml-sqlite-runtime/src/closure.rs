///
/// naml closures handed to the runtime.
///
/// A compiled naml closure is a triple: a function pointer whose first
/// argument is the captured data block, the data block itself (allocated
/// with 8-byte alignment) and the block's size. Registering a callback moves
/// the block into the runtime; it is freed when the adapter releases the
/// registration, or right away when registration fails.
///

use std::alloc::{Layout, dealloc};

pub struct HostClosure {
    func_ptr: i64,
    data_ptr: *mut u8,
    data_size: usize,
}

unsafe impl Send for HostClosure {}

impl HostClosure {
    /// `None` when `func_ptr` is zero, which callers use to clear a slot.
    /// The data block is still taken over and freed in that case.
    pub fn new(func_ptr: i64, data_ptr: i64, data_size: i64) -> Option<Self> {
        let closure = Self {
            func_ptr,
            data_ptr: data_ptr as *mut u8,
            data_size: if data_size < 0 { 0 } else { data_size as usize },
        };
        if func_ptr == 0 { None } else { Some(closure) }
    }

    pub fn func_ptr(&self) -> i64 {
        self.func_ptr
    }

    pub fn data(&self) -> *mut u8 {
        self.data_ptr
    }
}

impl Drop for HostClosure {
    fn drop(&mut self) {
        if !self.data_ptr.is_null() && self.data_size > 0 {
            unsafe {
                let layout = Layout::from_size_align_unchecked(self.data_size, 8);
                dealloc(self.data_ptr, layout);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::alloc::alloc;

    pub(crate) fn closure_data(value: i64) -> (i64, i64) {
        unsafe {
            let layout = Layout::from_size_align_unchecked(8, 8);
            let ptr = alloc(layout);
            *(ptr as *mut i64) = value;
            (ptr as i64, 8)
        }
    }

    #[test]
    fn test_zero_func_ptr_means_no_closure() {
        let (data, size) = closure_data(1);
        assert!(HostClosure::new(0, data, size).is_none());
    }

    #[test]
    fn test_closure_exposes_parts() {
        let (data, size) = closure_data(7);
        let closure = HostClosure::new(42, data, size).unwrap();
        assert_eq!(closure.func_ptr(), 42);
        assert_eq!(unsafe { *(closure.data() as *const i64) }, 7);
    }

    #[test]
    fn test_empty_data_block() {
        let closure = HostClosure::new(42, 0, 0).unwrap();
        assert!(closure.data().is_null());
        let closure = HostClosure::new(42, 0, -3).unwrap();
        assert!(closure.data().is_null());
    }
}
