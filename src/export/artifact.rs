//! Waiting for the printed file to be complete.

use crate::pacing::Clock;
use std::path::Path;
use std::time::Duration;

/// Completion poll: the file must exist, be non-empty, and keep the same size across two reads
/// `confirm` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityPoll {
    pub timeout: Duration,
    pub interval: Duration,
    pub confirm: Duration,
}

impl Default for StabilityPoll {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(1),
            confirm: Duration::from_secs(2),
        }
    }
}

fn size_of(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

impl StabilityPoll {
    /// Final size of the stable artifact, or None once the timeout has elapsed.
    pub fn wait(&self, path: &Path, clock: &dyn Clock) -> Option<u64> {
        let start = clock.now();
        while clock.now().duration_since(start) < self.timeout {
            if let Some(size) = size_of(path).filter(|s| *s > 0) {
                clock.sleep(self.confirm);
                if size_of(path) == Some(size) {
                    tracing::debug!(path = %path.display(), size, "Artifact stable");
                    return Some(size);
                }
                tracing::debug!(path = %path.display(), "Artifact still being written");
            }
            clock.sleep(self.interval);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::ManualClock;
    use std::cell::Cell;
    use std::path::PathBuf;
    use std::time::Instant;

    #[test]
    fn complete_file_is_confirmed() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.pdf");
        std::fs::write(&path, b"%PDF-1.4 done")?;
        let clock = ManualClock::new();
        assert_eq!(StabilityPoll::default().wait(&path, &clock), Some(13));
        assert_eq!(clock.slept(), Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn missing_file_times_out() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let clock = ManualClock::new();
        assert_eq!(StabilityPoll::default().wait(&dir.path().join("never.pdf"), &clock), None);
        assert_eq!(clock.slept(), Duration::from_secs(60));
        Ok(())
    }

    #[test]
    fn empty_file_is_not_complete() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("empty.pdf");
        std::fs::write(&path, b"")?;
        let poll = StabilityPoll {
            timeout: Duration::from_secs(5),
            ..StabilityPoll::default()
        };
        assert_eq!(poll.wait(&path, &ManualClock::new()), None);
        Ok(())
    }

    /// Appends to the file during the first few sleeps, like a printer still writing.
    struct WritingClock {
        inner: ManualClock,
        path: PathBuf,
        writes_left: Cell<u32>,
    }

    impl Clock for WritingClock {
        fn now(&self) -> Instant {
            self.inner.now()
        }

        fn sleep(&self, d: Duration) {
            if self.writes_left.get() > 0 {
                self.writes_left.set(self.writes_left.get() - 1);
                let mut bytes = std::fs::read(&self.path).unwrap_or_default();
                bytes.extend_from_slice(b"more");
                std::fs::write(&self.path, bytes).unwrap();
            }
            self.inner.sleep(d);
        }
    }

    #[test]
    fn growing_file_waits_for_size_to_settle() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("growing.pdf");
        std::fs::write(&path, b"%PDF")?;
        let clock = WritingClock {
            inner: ManualClock::new(),
            path: path.clone(),
            writes_left: Cell::new(2),
        };
        assert_eq!(StabilityPoll::default().wait(&path, &clock), Some(12));
        Ok(())
    }
}
