use std::ptr::NonNull;

pub const OS_PAGE_SIZE: usize = 4096;

/// Reserve `size` bytes of zeroed, read-write anonymous memory.
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: anonymous private mapping with no file descriptor; the result
    // is checked against MAP_FAILED before use.
    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        None
    } else {
        NonNull::new(ptr.cast())
    }
}

/// Return a region obtained from [`map_memory`] to the OS.
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr/size must come from a map_memory reservation.
    unsafe {
        libc::munmap(ptr.as_ptr().cast(), size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_memory_is_zeroed_and_writable() {
        let size = 2 * OS_PAGE_SIZE;
        let ptr = map_memory(size).expect("map memory");
        // SAFETY: just mapped, in bounds.
        unsafe {
            let slice = core::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            assert!(slice.iter().all(|&b| b == 0));
            slice[0] = 0xAB;
            slice[size - 1] = 0xCD;
            assert_eq!(slice[0], 0xAB);
        }
        unmap_memory(ptr, size);
    }
}
