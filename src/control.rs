use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why a run is being wound down. Ordered by strength: a stronger reason
/// replaces a weaker one, never the other way round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Halt {
    Pause = 1,
    Stop = 2,
    Abort = 3,
}

impl Halt {
    fn from_u8(raw: u8) -> Option<Halt> {
        match raw {
            1 => Some(Halt::Pause),
            2 => Some(Halt::Stop),
            3 => Some(Halt::Abort),
            _ => None,
        }
    }
}

/// Cooperative cancellation handle for one run of a job.
///
/// Cloned into every worker of the run. The token is a child of the job's
/// lifetime token, so dropping the job cancels it too.
#[derive(Debug, Clone)]
pub struct RunControl {
    token: CancellationToken,
    reason: Arc<AtomicU8>,
}

impl RunControl {
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            reason: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Records `halt` unless a stronger reason is already set, then cancels.
    pub fn signal(&self, halt: Halt) {
        self.reason.fetch_max(halt as u8, Ordering::AcqRel);
        self.token.cancel();
    }

    /// The effective halt reason. A token cancelled from its parent without a
    /// recorded reason reads as a stop.
    pub fn halt(&self) -> Option<Halt> {
        match Halt::from_u8(self.reason.load(Ordering::Acquire)) {
            Some(halt) => Some(halt),
            None if self.token.is_cancelled() => Some(Halt::Stop),
            None => None,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stronger_reason_wins() {
        let parent = CancellationToken::new();
        let control = RunControl::new(&parent);
        assert_eq!(control.halt(), None);

        control.signal(Halt::Pause);
        assert_eq!(control.halt(), Some(Halt::Pause));
        control.signal(Halt::Stop);
        assert_eq!(control.halt(), Some(Halt::Stop));
        control.signal(Halt::Pause);
        assert_eq!(control.halt(), Some(Halt::Stop));
        control.signal(Halt::Abort);
        assert_eq!(control.halt(), Some(Halt::Abort));
    }

    #[test]
    fn parent_cancellation_reads_as_stop() {
        let parent = CancellationToken::new();
        let control = RunControl::new(&parent);
        parent.cancel();
        assert!(control.is_halted());
        assert_eq!(control.halt(), Some(Halt::Stop));
    }

    #[test]
    fn runs_are_isolated() {
        let parent = CancellationToken::new();
        let first = RunControl::new(&parent);
        let second = RunControl::new(&parent);
        first.signal(Halt::Abort);
        assert!(!second.is_halted());
    }
}
