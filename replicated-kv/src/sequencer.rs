use std::sync::atomic::{AtomicU64, Ordering};

/// Leader-scoped source of operation sequence numbers.
///
/// Numbers start at 1, are never reused and never go backwards. 0 is left
/// free to mean "nothing applied yet" in SYNC requests and checkpoints.
#[derive(Debug, Default)]
pub struct Sequencer {
    last: AtomicU64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh sequence number.
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently assigned number, or 0 if none was assigned yet.
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn starts_at_one() {
        let sequencer = Sequencer::new();
        assert_eq!(sequencer.current(), 0);
        assert_eq!(sequencer.next(), 1);
        assert_eq!(sequencer.next(), 2);
        assert_eq!(sequencer.current(), 2);
    }

    #[test]
    fn concurrent_callers_get_distinct_gap_free_numbers() {
        let sequencer = Arc::new(Sequencer::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let sequencer = Arc::clone(&sequencer);
                thread::spawn(move || (0..500).map(|_| sequencer.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = BTreeSet::new();
        for worker in workers {
            for n in worker.join().unwrap() {
                assert!(seen.insert(n), "sequence {n} handed out twice");
            }
        }
        assert_eq!(seen.len(), 4000);
        assert_eq!(seen.first(), Some(&1));
        assert_eq!(seen.last(), Some(&4000));
    }
}
