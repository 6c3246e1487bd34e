//! End-to-end leak runs driven by synthetic oracles.
//!
//! The real recursion engine runs on every attempt; only the timing
//! measurement is replaced, so these pass on any x86_64 machine regardless
//! of whether its predictor is actually vulnerable.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_ret2spec::sidechannel::ORACLE_STRIDE;
use rust_ret2spec::{leak_all, leak_byte, Engine, LeakResult, Oracle, OracleHandle, Poisoning, Ret2SpecError};

fn dead_code() -> !
{
    panic!("Dead code. Must not be printed.");
}

/// Reports `answer` with confidence on the `nth` sample (1-based), or never.
struct Deterministic {
    surface: Vec<u8>,
    answer: u8,
    nth: Option<usize>,
    samples: usize,
}

impl Deterministic {
    fn new(answer: u8, nth: Option<usize>) -> Self
    {
        Deterministic { surface: vec![0; 256 * ORACLE_STRIDE], answer, nth, samples: 0 }
    }
}

impl Oracle for Deterministic {
    fn reset(&mut self)
    {
    }

    fn sample(&mut self) -> LeakResult
    {
        self.samples += 1;
        LeakResult { confident: Some(self.samples) == self.nth, byte: self.answer }
    }

    fn handle(&self) -> OracleHandle
    {
        unsafe { OracleHandle::new(self.surface.as_ptr(), ORACLE_STRIDE) }
    }
}

/// Confident with probability `p` per sample, always on the right byte.
struct Noisy {
    surface: Vec<u8>,
    answer: u8,
    p: f64,
    rng: StdRng,
    samples: usize,
}

impl Oracle for Noisy {
    fn reset(&mut self)
    {
    }

    fn sample(&mut self) -> LeakResult
    {
        self.samples += 1;
        LeakResult { confident: self.rng.gen_bool(self.p), byte: self.answer }
    }

    fn handle(&self) -> OracleHandle
    {
        unsafe { OracleHandle::new(self.surface.as_ptr(), ORACLE_STRIDE) }
    }
}

#[test]
fn leaks_ab_and_prints_completion_marker()
{
    let secret = b"AB";
    let engine = Engine::new(64, Poisoning::SameStack, secret).with_trap_handler(dead_code);
    let mut offset = 0;
    let mut out = Vec::new();
    let leaked = leak_all(
        &engine,
        || {
            let oracle = Deterministic::new(secret[offset], Some(1));
            offset += 1;
            oracle
        },
        100_000,
        &mut out,
    )
    .unwrap();

    assert_eq!(leaked, b"AB");
    assert_eq!(String::from_utf8(out).unwrap(), "Leaking the string: AB\nDone!\n");
}

#[test]
fn every_offset_matches_direct_inspection()
{
    let secret = b"It's a s3kr3t!!!";
    let engine = Engine::new(64, Poisoning::SameStack, secret).with_trap_handler(dead_code);
    for (offset, &expected) in secret.iter().enumerate() {
        let mut oracle = Deterministic::new(expected, Some(1 + offset % 4));
        assert_eq!(leak_byte(&engine, &mut oracle, offset, 100).unwrap(), expected);
        assert_eq!(engine.offset(), offset);
    }
}

#[test]
fn never_confident_oracle_is_fatal_after_cap_plus_one()
{
    let engine = Engine::new(64, Poisoning::SameStack, b"AB").with_trap_handler(dead_code);
    let cap = 2_000;
    let mut out = Vec::new();
    let err = leak_all(&engine, || Deterministic::new(b'?', None), cap, &mut out).unwrap_err();

    match &err {
        Ret2SpecError::NonConvergence { offset, attempts, best_guess } => {
            assert_eq!(*offset, 0);
            assert_eq!(*attempts, cap + 1);
            assert_eq!(*best_guess, b'?');
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(err.to_string().starts_with("Does not converge"));
    // nothing after the banner, the run stops at the first offset
    assert_eq!(String::from_utf8(out).unwrap(), "Leaking the string: ");

    let mut oracle = Deterministic::new(b'?', None);
    assert!(leak_byte(&engine, &mut oracle, 1, cap).is_err());
    assert_eq!(oracle.samples, cap + 1);
}

#[test]
fn low_hit_rate_oracle_converges_well_within_cap()
{
    let engine = Engine::new(64, Poisoning::SameStack, b"s").with_trap_handler(dead_code);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut worst = 0;
    for _ in 0..200 {
        let mut oracle = Noisy {
            surface: vec![0; 256 * ORACLE_STRIDE],
            answer: b's',
            p: 0.1,
            rng: StdRng::seed_from_u64(rng.gen()),
            samples: 0,
        };
        assert_eq!(leak_byte(&engine, &mut oracle, 0, 100_000).unwrap(), b's');
        worst = worst.max(oracle.samples);
    }
    // P(more than 1000 misses in a row at p = 0.1) is below 1e-45
    assert!(worst <= 1_000, "worst run took {worst} samples");
}

#[test]
fn cross_process_engine_runs_without_an_attacker()
{
    // without a co-scheduled attacker the bottom of the recursion only
    // yields, so the oracle never sees a hit and the trap stays cold
    let engine = Engine::new(64, Poisoning::CoScheduled, b"z").with_trap_handler(dead_code);
    let mut oracle = Deterministic::new(b'z', Some(3));
    assert_eq!(leak_byte(&engine, &mut oracle, 0, 10).unwrap(), b'z');
    assert_eq!(oracle.samples, 3);
}
