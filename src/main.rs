// Ret2spec on a single call stack.
//
// returns_true nests itself RET2SPEC_DEPTH times and at the bottom calls
// returns_false, which nests just as deep. All returns of returns_false are
// predicted correctly, but the return stack buffer now only holds return
// addresses into returns_false, so every return of returns_true is
// mispredicted into the unreachable branch after a returns_false call site.
// That branch touches the oracle line of the secret byte.
//
use std::io;
use std::process::ExitCode;

use rust_ret2spec::{init_tracing, leak_all, CacheSideChannel, Config, Engine, Poisoning, PRIVATE_DATA};

fn run() -> rust_ret2spec::Result<()>
{
    let config = Config::from_env()?;
    let engine = Engine::new(config.recursion_depth, Poisoning::SameStack, PRIVATE_DATA);
    let mut stdout = io::stdout().lock();
    leak_all(&engine, CacheSideChannel::new, config.attempt_cap, &mut stdout)?;
    Ok(())
}

fn main() -> ExitCode
{
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\n{}", e);
            ExitCode::FAILURE
        }
    }
}
