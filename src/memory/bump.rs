//! Bump pointer allocation within one span
//!

use super::address::{Address, Span, OBJECT_ALIGNMENT};

/// Cursor over `[top, end)` of the active span
///
/// Requests must already be aligned by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BumpAllocator {
    /// Start of the span being allocated
    begin: Address,
    /// Next free byte
    top: Address,
    /// Limit of the span
    end: Address,
}

impl BumpAllocator {
    pub fn new(span: Span) -> Self {
        BumpAllocator {
            begin: span.begin(),
            top: span.begin(),
            end: span.end(),
        }
    }

    /// Continue allocating a span part of which is already used
    pub fn resume(span: Span, top: Address) -> Self {
        debug_assert!(top >= span.begin() && top <= span.end());
        BumpAllocator {
            begin: span.begin(),
            top,
            end: span.end(),
        }
    }

    /// Switch to a new span
    pub fn reset(&mut self, span: Span) {
        *self = BumpAllocator::new(span);
    }

    pub fn clear(&mut self) {
        *self = BumpAllocator::default();
    }

    /// Allocate `size` bytes or fail if the span is exhausted
    #[inline]
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        debug_assert!(size % OBJECT_ALIGNMENT == 0);
        if self.available() < size {
            return None;
        }
        let result = self.top;
        self.top = self.top.offset(size);
        Some(result)
    }

    pub fn begin(&self) -> Address {
        self.begin
    }

    pub fn top(&self) -> Address {
        self.top
    }

    pub fn end(&self) -> Address {
        self.end
    }

    pub fn available(&self) -> usize {
        self.end.diff(self.top)
    }

    pub fn allocated(&self) -> usize {
        self.top.diff(self.begin)
    }

    /// Unused remainder of the span
    pub fn remainder(&self) -> Span {
        Span::between(self.top, self.end)
    }

    /// Give up the remainder, returning it
    pub fn take_remainder(&mut self) -> Span {
        let rest = self.remainder();
        self.end = self.top;
        rest
    }
}
