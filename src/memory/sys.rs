//! OS virtual memory primitives
//!
//! Mappings are always private, anonymous and read-write. Fresh
//! mappings are zero filled.

use super::address::{align_up, Address, Span};

/// Whether part of a mapping may be released independently of the
/// rest (enables merging of adjacent cached mappings)
#[cfg(unix)]
pub const SUPPORTS_PARTIAL_UNMAP: bool = true;
#[cfg(not(unix))]
pub const SUPPORTS_PARTIAL_UNMAP: bool = false;

#[cfg(unix)]
mod imp {
    use super::*;

    const MMAP_PROT: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;

    #[cfg(target_os = "macos")]
    const MAP_ANONYMOUS: libc::c_int = libc::MAP_ANON;
    #[cfg(not(target_os = "macos"))]
    const MAP_ANONYMOUS: libc::c_int = libc::MAP_ANONYMOUS;

    const MMAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | MAP_ANONYMOUS;

    /// Map `size` bytes aligned to `align`, preferring `hint` as the
    /// base address
    pub fn map_aligned(size: usize, align: usize, hint: Address) -> Option<Span> {
        if let Some(span) = map_at_hint(size, align, hint) {
            return Some(span);
        }

        // over-map and trim both ends to reach the alignment
        let request = size.checked_add(align)?;
        let raw = unsafe { map(Address::NULL, request)? };
        let aligned = raw.align_up(align);
        let leading = aligned.diff(raw);
        let trailing = request - leading - size;
        unsafe {
            if leading > 0 {
                unmap(Span::new(raw, leading));
            }
            if trailing > 0 {
                unmap(Span::new(aligned.offset(size), trailing));
            }
        }
        Some(Span::new(aligned, size))
    }

    fn map_at_hint(size: usize, align: usize, hint: Address) -> Option<Span> {
        if hint.is_null() {
            return None;
        }
        let addr = unsafe { map(hint, size)? };
        if addr.is_aligned_to(align) {
            Some(Span::new(addr, size))
        } else {
            unsafe { unmap(Span::new(addr, size)) };
            None
        }
    }

    unsafe fn map(hint: Address, size: usize) -> Option<Address> {
        let res = libc::mmap(
            hint.as_mut_ptr::<libc::c_void>(),
            size as libc::size_t,
            MMAP_PROT,
            MMAP_FLAGS,
            -1 as libc::c_int,
            0,
        );
        if res == libc::MAP_FAILED || res.is_null() {
            None
        } else {
            Some(Address::from_ptr(res))
        }
    }

    /// Release a mapping (or part of one) back to the OS
    ///
    /// # Safety
    ///
    /// Nothing may reference the span afterwards.
    pub unsafe fn unmap(span: Span) {
        libc::munmap(
            span.begin().as_mut_ptr::<libc::c_void>(),
            span.len() as libc::size_t,
        );
    }

    /// Return the physical pages of a span to the OS, keeping the
    /// address range reserved. The range reads as zero afterwards.
    ///
    /// # Safety
    ///
    /// The span contents are lost.
    pub unsafe fn discard(span: Span) {
        libc::madvise(
            span.begin().as_mut_ptr::<libc::c_void>(),
            span.len() as libc::size_t,
            libc::MADV_DONTNEED,
        );
    }

    /// Toggle write access to a span
    pub fn protect(span: Span, read_only: bool) -> bool {
        let prot = if read_only {
            libc::PROT_READ
        } else {
            MMAP_PROT
        };
        unsafe {
            libc::mprotect(
                span.begin().as_mut_ptr::<libc::c_void>(),
                span.len() as libc::size_t,
                prot,
            ) == 0
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;
    use parking_lot::Mutex;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::collections::HashMap;
    use std::sync::OnceLock;

    fn layouts() -> &'static Mutex<HashMap<usize, Layout>> {
        static LAYOUTS: OnceLock<Mutex<HashMap<usize, Layout>>> = OnceLock::new();
        LAYOUTS.get_or_init(|| Mutex::new(HashMap::new()))
    }

    pub fn map_aligned(size: usize, align: usize, _hint: Address) -> Option<Span> {
        let layout = Layout::from_size_align(size, align).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        let base = Address::from_ptr(ptr);
        layouts().lock().insert(base.as_usize(), layout);
        Some(Span::new(base, size))
    }

    pub unsafe fn unmap(span: Span) {
        if let Some(layout) = layouts().lock().remove(&span.begin().as_usize()) {
            dealloc(span.begin().as_mut_ptr::<u8>(), layout);
        }
    }

    pub unsafe fn discard(span: Span) {
        span.begin().zero(span.len());
    }

    pub fn protect(_span: Span, _read_only: bool) -> bool {
        false
    }
}

pub use imp::{discard, map_aligned, protect, unmap};

/// Size actually mapped for a request of `size` bytes
pub fn mapping_size(size: usize, region_size: usize) -> usize {
    align_up(size, region_size)
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_map_aligned_region() {
        let span = map_aligned(0x4_0000, 0x4_0000, Address::NULL).unwrap();
        assert!(span.begin().is_aligned_to(0x4_0000));
        assert_eq!(span.len(), 0x4_0000);
        unsafe {
            assert_eq!(span.begin().load_word(), 0);
            span.begin().store_word(42);
            assert_eq!(span.begin().load_word(), 42);
            unmap(span);
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    pub fn test_discard_zeroes() {
        let span = map_aligned(0x4_0000, 0x4_0000, Address::NULL).unwrap();
        unsafe {
            span.at(0x100).store_word(7);
            discard(span);
            assert_eq!(span.at(0x100).load_word(), 0);
            unmap(span);
        }
    }
}
