use super::CliffSearch;

/// An iterator that narrows a bracket around the largest compliant worker count by binary
/// search.
///
/// Each value yielded is a worker count to probe. If the probe complies, it becomes the new lower
/// bound; if it is [`overloaded`](BinarySearcher::overloaded), it becomes the new upper bound.
/// The search ends once the bracket is at most `threshold` wide.
///
/// Before asking for the next probe, the caller may report the throughput the pool achieved at
/// the previous probe through [`observe_throughput`](BinarySearcher::observe_throughput). If that
/// figure lies comfortably inside the bracket it is used as the next probe instead of the
/// midpoint, which tends to converge faster for closed-loop workloads.
///
/// ```rust
/// use slocliff::BinarySearcher;
///
/// let mut search = BinarySearcher::new(20..40, 5);
/// assert_eq!(search.next(), Some(30));
/// search.overloaded();
/// assert_eq!(search.next(), Some(25));
/// // 25 was fine, and the bracket 25..30 is narrow enough.
/// assert_eq!(search.next(), None);
/// assert_eq!(search.estimate(), 25..30);
/// ```
///
/// See the [crate-level documentation](..) for details.
#[derive(Debug, Clone)]
pub struct BinarySearcher {
    max_in: core::ops::Range<usize>,
    last: Option<usize>,
    fidelity: usize,
    throughput: Option<f64>,
    overloaded: bool,
    done: bool,
}

impl BinarySearcher {
    /// Search within `bracket`, ending when the bracket is at most `threshold` wide.
    ///
    /// A threshold of zero is treated as one, since a bracket of width one can never be split.
    pub fn new(bracket: core::ops::Range<usize>, threshold: usize) -> Self {
        Self {
            max_in: bracket,
            last: None,
            fidelity: threshold.max(1),
            throughput: None,
            overloaded: false,
            done: false,
        }
    }

    /// Indicate that the system did not comply at the worker count last yielded by
    /// [`Iterator::next`].
    ///
    /// This provides [`CliffSearch::overloaded`] without having to `use` the trait.
    pub fn overloaded(&mut self) {
        self.overloaded = true;
    }

    /// Give the current bracket for the largest compliant worker count.
    ///
    /// This provides [`CliffSearch::estimate`] without having to `use` the trait.
    pub fn estimate(&self) -> core::ops::Range<usize> {
        self.max_in.clone()
    }

    /// Offer the throughput measured at the previous probe as a guess for the next one.
    ///
    /// The guess is used only by the next call to [`Iterator::next`], and only if it lies
    /// strictly between `start + threshold` and `end - threshold`.
    ///
    /// This provides [`CliffSearch::observe_throughput`] without having to `use` the trait.
    pub fn observe_throughput(&mut self, ops_per_sec: f64) {
        self.throughput = Some(ops_per_sec);
    }
}

impl CliffSearch for BinarySearcher {
    fn overloaded(&mut self) {
        BinarySearcher::overloaded(self)
    }

    fn estimate(&self) -> core::ops::Range<usize> {
        BinarySearcher::estimate(self)
    }

    fn observe_throughput(&mut self, ops_per_sec: f64) {
        BinarySearcher::observe_throughput(self, ops_per_sec)
    }
}

impl Iterator for BinarySearcher {
    type Item = usize;
    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if let Some(last) = self.last.take() {
            if self.overloaded {
                // the last thing we tried failed, so it sets an upper limit
                self.max_in.end = last;
                self.overloaded = false;
            } else {
                // the last thing succeeded, so that increases the lower limit
                self.max_in.start = last;
            }
        }

        // we only care about the max down to `fidelity`
        if self.max_in.end.saturating_sub(self.max_in.start) <= self.fidelity {
            self.done = true;
            self.throughput = None;
            return None;
        }

        let low = (self.max_in.start + self.fidelity) as f64;
        let high = (self.max_in.end - self.fidelity) as f64;
        let next = match self.throughput.take() {
            Some(ops) if ops > low && ops < high => ops as usize,
            // bisect the range
            _ => self.max_in.start + (self.max_in.end - self.max_in.start) / 2,
        };

        self.last = Some(next);
        Some(next)
    }
}

#[cfg(test)]
fn run_step_function(search: &mut BinarySearcher, cliff: usize) -> Vec<usize> {
    let mut probes = Vec::new();
    while let Some(workers) = search.next() {
        probes.push(workers);
        if workers > cliff {
            search.overloaded();
        }
    }
    probes
}

#[test]
fn bisect() {
    let mut search = BinarySearcher::new(1000..2000, 100);
    assert_eq!(search.next(), Some(1500));
    assert_eq!(search.next(), Some(1750));
    search.overloaded();
    assert_eq!(search.next(), Some(1625));
    search.overloaded();
    assert_eq!(search.next(), Some(1562));
    assert_eq!(search.next(), None);
    assert_eq!(search.estimate(), 1562..1625);

    // check that it continues to be terminated
    assert_eq!(search.next(), None);
    // even after another "overloaded"
    search.overloaded();
    assert_eq!(search.next(), None);
    // and the estimate is still the same
    assert_eq!(search.estimate(), 1562..1625);
}

#[test]
fn already_narrow() {
    let mut search = BinarySearcher::new(40..45, 5);
    assert_eq!(search.next(), None);
    assert_eq!(search.estimate(), 40..45);

    let mut search = BinarySearcher::new(1..1, 5);
    assert_eq!(search.next(), None);
    assert_eq!(search.estimate(), 1..1);
}

#[test]
fn throughput_hint_inside_bracket() {
    let mut search = BinarySearcher::new(100..200, 10);
    search.observe_throughput(131.7);
    assert_eq!(search.next(), Some(131));
    // without a fresh hint, we go back to bisecting
    assert_eq!(search.next(), Some(165));
}

#[test]
fn throughput_hint_outside_bracket() {
    let mut search = BinarySearcher::new(100..200, 10);
    // too close to the lower bound
    search.observe_throughput(110.0);
    assert_eq!(search.next(), Some(150));
    search.overloaded();
    // too close to the upper bound
    search.observe_throughput(140.0);
    assert_eq!(search.next(), Some(125));
    // way out
    search.observe_throughput(10_000.0);
    assert_eq!(search.next(), Some(137));
}

#[test]
fn zero_threshold_still_terminates() {
    let mut search = BinarySearcher::new(10..11, 0);
    assert_eq!(search.next(), None);

    let mut search = BinarySearcher::new(10..20, 0);
    let probes = run_step_function(&mut search, 13);
    assert!(!probes.is_empty());
    assert_eq!(search.estimate(), 13..14);
}

#[test]
fn step_function() {
    let mut search = BinarySearcher::new(40..80, 2);
    let probes = run_step_function(&mut search, 50);
    assert_eq!(probes, vec![60, 50, 55, 52]);
    assert_eq!(search.estimate(), 50..52);
}

#[test]
fn through_trait() {
    let mut search = BinarySearcher::new(1000..2000, 100);
    let search: &mut dyn CliffSearch = &mut search;
    search.observe_throughput(1200.0);
    assert_eq!(search.next(), Some(1200));
    search.overloaded();
    assert_eq!(search.next(), Some(1100));
    assert_eq!(search.next(), None);
    assert_eq!(search.estimate(), 1100..1200);
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn converges_on_step_function(
            start in 1usize..500,
            width in 0usize..5000,
            threshold in 1usize..64,
            offset in 0usize..5000,
            hints in proptest::collection::vec(0.0f64..6000.0, 0..64),
        ) {
            let end = start + width;
            // the cliff must lie inside the bracket: start complies, end does not
            let cliff = start + offset % (width.max(1));

            let mut search = BinarySearcher::new(start..end, threshold);
            let mut hints = hints.into_iter();
            loop {
                if let Some(hint) = hints.next() {
                    search.observe_throughput(hint);
                }
                let Some(workers) = search.next() else { break };
                prop_assert!(workers > search.estimate().start || width <= threshold);
                if workers > cliff {
                    search.overloaded();
                }
            }

            let bracket = search.estimate();
            prop_assert!(bracket.end - bracket.start <= threshold);
            if width > 0 {
                prop_assert!(bracket.start <= cliff);
                prop_assert!(cliff < bracket.end);
            }
        }
    }
}
