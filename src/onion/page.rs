//! Splitting a logical byte range into per-page pieces.

/// The part of one page covered by a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    /// Logical page number.
    pub page: u64,
    /// Offset of the first covered byte within the page.
    pub start: usize,
    /// Covered bytes, at most `page_size - start`.
    pub len: usize,
}

impl PageSpan {
    pub fn is_whole(&self, page_size: u64) -> bool {
        self.start == 0 && self.len as u64 == page_size
    }
}

/// Iterator returned by [`page_spans`].
#[derive(Debug, Clone)]
pub struct PageSpans {
    offset: u64,
    remaining: u64,
    page_size: u64,
}

/// Pieces of `[offset, offset + len)`, one per touched page, in order.
///
/// `page_size` must be a power of two.
pub fn page_spans(offset: u64, len: usize, page_size: u64) -> PageSpans {
    debug_assert!(page_size.is_power_of_two());
    PageSpans {
        offset,
        remaining: len as u64,
        page_size,
    }
}

impl Iterator for PageSpans {
    type Item = PageSpan;

    fn next(&mut self) -> Option<PageSpan> {
        if self.remaining == 0 {
            return None;
        }
        let start = self.offset & (self.page_size - 1);
        let len = (self.page_size - start).min(self.remaining);
        let span = PageSpan {
            page: self.offset / self.page_size,
            start: start as usize,
            len: len as usize,
        };
        self.offset += len;
        self.remaining -= len;
        Some(span)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.remaining == 0 {
            return (0, Some(0));
        }
        let head = self.offset & (self.page_size - 1);
        let n = (head + self.remaining).div_ceil(self.page_size) as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for PageSpans {}
