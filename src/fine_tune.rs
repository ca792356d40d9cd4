use super::CliffSearch;

/// An iterator that refines a worker count to the exact largest compliant value.
///
/// The first value yielded is the starting worker count. While the system is overloaded, the
/// count walks down by twice the initial step until it complies (but never below one worker).
/// From there it climbs: the step is halved, and the count moves up by the step for as long as
/// the system keeps up. When a climb overshoots, the count falls back to the last compliant value
/// and the step is halved again. Once an overshoot happens with a step of one, the last compliant
/// value is the answer.
///
/// ```rust
/// use slocliff::FineTuner;
///
/// let mut tune = FineTuner::new(50, 2);
/// // The starting point is probed first, and it complies.
/// assert_eq!(tune.next(), Some(50));
/// // Climb with half of the doubled step.
/// assert_eq!(tune.next(), Some(52));
/// tune.overloaded();
/// // Fall back to 50 and climb with a step of one.
/// assert_eq!(tune.next(), Some(51));
/// tune.overloaded();
/// // A step of one overshot, so we are done.
/// assert_eq!(tune.next(), None);
/// assert_eq!(tune.estimate(), 50..51);
/// ```
///
/// See also the [crate-level documentation](..) for details.
#[derive(Debug, Clone)]
pub struct FineTuner {
    start: usize,
    step: usize,
    ceiling: usize,
    good: Option<usize>,
    bad: usize,
    last: Option<usize>,
    descending: bool,
    overloaded: bool,
    done: bool,
}

impl FineTuner {
    /// Refine from `start` workers, walking down in steps of `2 * initial_step`.
    pub fn new(start: usize, initial_step: usize) -> Self {
        Self {
            start: start.max(1),
            step: 2 * initial_step.max(1),
            ceiling: usize::max_value(),
            good: None,
            bad: usize::max_value(),
            last: None,
            descending: true,
            overloaded: false,
            done: false,
        }
    }

    /// Never yield more than `ceiling` workers.
    pub fn up_to(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling.max(1);
        self.start = self.start.min(self.ceiling);
        self
    }

    // NOTE: we provide inherent methods for CliffSearch so that callers do not need to think
    // about the trait at all.

    /// Indicate that the system did not comply at the worker count last yielded by
    /// [`Iterator::next`].
    ///
    /// This provides [`CliffSearch::overloaded`] without having to `use` the trait.
    pub fn overloaded(&mut self) {
        self.overloaded = true;
    }

    /// Give the current estimate of the largest compliant worker count.
    ///
    /// The start is the highest count known to comply (one if none has), the end is the lowest
    /// count above it known to be overloaded. Once the iterator is exhausted, `start` is the
    /// answer.
    ///
    /// This provides [`CliffSearch::estimate`] without having to `use` the trait.
    pub fn estimate(&self) -> core::ops::Range<usize> {
        let start = self.good.unwrap_or(1);
        let end = self.bad.min(self.ceiling.saturating_add(1)).max(start);
        start..end
    }

    fn climb(&mut self, mut halve: bool) -> Option<usize> {
        let good = self.good?;
        loop {
            if halve {
                if self.step <= 1 {
                    self.done = true;
                    return None;
                }
                self.step /= 2;
            }

            let next = good.saturating_add(self.step);
            if next > self.ceiling {
                // treat anything above the ceiling as overloaded without trying it
                halve = true;
                continue;
            }

            self.last = Some(next);
            return Some(next);
        }
    }
}

impl CliffSearch for FineTuner {
    fn overloaded(&mut self) {
        FineTuner::overloaded(self)
    }

    fn estimate(&self) -> core::ops::Range<usize> {
        FineTuner::estimate(self)
    }
}

impl Iterator for FineTuner {
    type Item = usize;
    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let last = match self.last {
            Some(last) => last,
            None => {
                self.last = Some(self.start);
                return self.last;
            }
        };

        let failed = core::mem::replace(&mut self.overloaded, false);
        if failed {
            self.bad = self.bad.min(last);
        } else {
            self.good = Some(last);
            if self.bad <= last {
                // a noisy signal contradicted an earlier overload; trust the newer sample
                self.bad = usize::max_value();
            }
        }

        if self.descending {
            if failed {
                if last <= 1 {
                    // cannot go any lower
                    self.done = true;
                    return None;
                }
                let next = last.saturating_sub(self.step).max(1);
                self.last = Some(next);
                return Some(next);
            }
            self.descending = false;
            return self.climb(true);
        }

        // keep the step while climbing succeeds, halve it after an overshoot
        self.climb(failed)
    }
}

#[cfg(test)]
fn run_step_function(tune: &mut FineTuner, cliff: usize) -> Vec<usize> {
    let mut probes = Vec::new();
    while let Some(workers) = tune.next() {
        probes.push(workers);
        if workers > cliff {
            tune.overloaded();
        }
    }
    probes
}

#[test]
fn walk_down_then_up() {
    let mut tune = FineTuner::new(60, 2);
    let probes = run_step_function(&mut tune, 50);
    assert_eq!(probes, vec![60, 56, 52, 48, 50, 52, 51]);
    assert_eq!(tune.estimate(), 50..51);

    // check that it continues to be terminated
    assert_eq!(tune.next(), None);
    // even after another "overloaded"
    tune.overloaded();
    assert_eq!(tune.next(), None);
    // and the estimate is still the same
    assert_eq!(tune.estimate(), 50..51);
}

#[test]
fn climb_from_below() {
    let mut tune = FineTuner::new(10, 4);
    let probes = run_step_function(&mut tune, 25);
    assert_eq!(probes, vec![10, 14, 18, 22, 26, 24, 26, 25, 26]);
    assert_eq!(tune.estimate(), 25..26);
}

#[test]
fn exact_start() {
    let mut tune = FineTuner::new(50, 2);
    let probes = run_step_function(&mut tune, 50);
    assert_eq!(probes, vec![50, 52, 51]);
    assert_eq!(tune.estimate(), 50..51);
}

#[test]
fn floor() {
    // nothing complies
    let mut tune = FineTuner::new(5, 2);
    let probes = run_step_function(&mut tune, 0);
    assert_eq!(probes, vec![5, 1]);
    assert_eq!(tune.estimate(), 1..1);
}

#[test]
fn ceiling() {
    let mut tune = FineTuner::new(45, 2).up_to(47);
    let probes = run_step_function(&mut tune, 1000);
    assert_eq!(probes, vec![45, 47]);
    assert_eq!(tune.estimate(), 47..48);
}

#[test]
fn converges_exactly() {
    for cliff in 1..100 {
        for start in 1..(2 * cliff + 10) {
            for step in 1..9 {
                let mut tune = FineTuner::new(start, step);
                run_step_function(&mut tune, cliff);
                assert_eq!(
                    tune.estimate().start,
                    cliff,
                    "start={} step={}",
                    start,
                    step
                );
            }
        }
    }
}

#[test]
fn through_trait() {
    let mut tune = FineTuner::new(50, 2);
    let tune: &mut dyn CliffSearch = &mut tune;
    assert_eq!(tune.next(), Some(50));
    assert_eq!(tune.next(), Some(52));
    tune.overloaded();
    assert_eq!(tune.next(), Some(51));
    assert_eq!(tune.next(), Some(52));
    tune.overloaded();
    assert_eq!(tune.next(), None);
    assert_eq!(tune.estimate(), 51..52);
}
