//! Stack-frame boundary tracking.
//!
//! Every level of the "true" recursion records the address of one of its own
//! locals. Because the stack grows downwards, the span between a level's mark
//! and the mark of its caller holds the rest of that level's frame, including
//! the return address the level is about to use. Flushing that span right
//! before returning makes the return target slow to resolve architecturally,
//! which widens the speculation window of the mispredicted return.

pub const CACHE_LINE_SIZE: usize = 64;

/// Evicts the single cache line holding its argument.
pub type LineFlush = fn(*const u8);

/// Ordered stack of frame boundary addresses, innermost last.
#[derive(Debug, Default)]
pub struct FrameMarks {
    marks: Vec<usize>,
}

impl FrameMarks {
    /// Reserve room for `depth` nested marks plus the sentinel, so pushing
    /// never reallocates in the middle of the recursion.
    pub fn with_depth(depth: usize) -> Self
    {
        FrameMarks { marks: Vec::with_capacity(depth + 2) }
    }

    pub fn mark(&mut self, local: *const u8)
    {
        self.marks.push(local as usize);
    }

    pub fn unmark(&mut self) -> Option<usize>
    {
        self.marks.pop()
    }

    pub fn peek(&self) -> Option<usize>
    {
        self.marks.last().copied()
    }

    pub fn len(&self) -> usize
    {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.marks.is_empty()
    }
}

/// Cache-line aligned address range covering one call frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSpan {
    /// First byte of the lowest line.
    pub start: usize,
    /// Last byte of the highest line.
    pub end: usize,
}

impl FlushSpan {
    /// Span covering every line that overlaps `[from, to]`. The bounds may
    /// come in either order.
    pub fn between(from: usize, to: usize) -> Self
    {
        let (lo, hi) = if from <= to { (from, to) } else { (to, from) };
        let start = lo & !(CACHE_LINE_SIZE - 1);
        let end = (hi | (CACHE_LINE_SIZE - 1)).max(start + CACHE_LINE_SIZE - 1);
        FlushSpan { start, end }
    }

    pub fn byte_len(&self) -> usize
    {
        self.end - self.start + 1
    }

    /// Start address of every line in the span, lowest first.
    pub fn lines(&self) -> impl Iterator<Item = usize>
    {
        (self.start..=self.end).step_by(CACHE_LINE_SIZE)
    }

    /// Hand every line of the span to `flush_line`, one cache-line stride at
    /// a time.
    pub fn flush_with(&self, flush_line: LineFlush)
    {
        for line in self.lines() {
            flush_line(line as *const u8);
        }
    }
}
