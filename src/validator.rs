// ===============================
// src/validator.rs
// ===============================
//
// Sequence / epoch ordering checks. Pure: the listener owns the baseline and
// only moves it forward after an Accept.
//
// - snapshot      -> always Accept (new baseline)
// - update        -> Accept only if sequence > baseline.sequence
// - epoch differs -> RejectEpoch; a higher epoch means "go fetch a snapshot",
//                    a lower one is just stale traffic
//

/// Last accepted (sequence, epoch) of a fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Baseline {
    pub sequence: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    RejectSequence,
    RejectEpoch,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "accept",
            Verdict::RejectSequence => "reject_sequence",
            Verdict::RejectEpoch => "reject_epoch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub verdict: Verdict,
    /// Incoming epoch is ahead of the baseline.
    pub epoch_changed: bool,
    /// Number of sequences skipped by an accepted update.
    pub gap: Option<u64>,
    pub explanation: String,
}

impl Validation {
    fn accept(epoch_changed: bool, gap: Option<u64>, explanation: String) -> Self {
        Self { verdict: Verdict::Accept, epoch_changed, gap, explanation }
    }

    fn reject(verdict: Verdict, epoch_changed: bool, explanation: String) -> Self {
        Self { verdict, epoch_changed, gap: None, explanation }
    }

    pub fn is_accept(&self) -> bool {
        self.verdict == Verdict::Accept
    }
}

pub fn validate(last: Option<Baseline>, sequence: u64, epoch: u64, is_snapshot: bool) -> Validation {
    if is_snapshot {
        let epoch_changed = last.map_or(false, |b| b.epoch != epoch);
        return Validation::accept(
            epoch_changed,
            None,
            format!("snapshot resets baseline to sequence={sequence} epoch={epoch}"),
        );
    }

    let Some(last) = last else {
        return Validation::reject(
            Verdict::RejectSequence,
            false,
            format!("update sequence={sequence} arrived before any snapshot"),
        );
    };

    if epoch != last.epoch {
        let ahead = epoch > last.epoch;
        let explanation = if ahead {
            format!("epoch changed {} -> {epoch}, snapshot required", last.epoch)
        } else {
            format!("stale epoch {epoch}, current epoch is {}", last.epoch)
        };
        return Validation::reject(Verdict::RejectEpoch, ahead, explanation);
    }

    if sequence <= last.sequence {
        return Validation::reject(
            Verdict::RejectSequence,
            false,
            format!("sequence {sequence} not after last accepted {}", last.sequence),
        );
    }

    let expected = last.sequence + 1;
    let gap = (sequence > expected).then(|| sequence - expected);
    Validation::accept(false, gap, format!("sequence {sequence} accepted"))
}
