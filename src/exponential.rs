use super::CliffSearch;

/// An iterator that brackets the largest compliant worker count by exponential growth.
///
/// The first value yielded is the starting worker count. As long as the system keeps up, every
/// following value is the previous one multiplied by a constant factor. The first overloaded
/// value ends the ramp, and [`estimate`](ExponentialRamp::estimate) then holds the bracket
/// `last compliant..first overloaded`.
///
/// ```rust
/// use slocliff::ExponentialRamp;
///
/// let mut ramp = ExponentialRamp::new(10, 2);
/// assert_eq!(ramp.next(), Some(10));
/// assert_eq!(ramp.next(), Some(20));
/// assert_eq!(ramp.next(), Some(40));
/// // 40 workers was too many.
/// ramp.overloaded();
/// assert_eq!(ramp.next(), None);
/// assert_eq!(ramp.estimate(), 20..40);
/// ```
///
/// See the [crate-level documentation](..) for details.
#[derive(Debug, Clone)]
pub struct ExponentialRamp {
    max_in: core::ops::Range<usize>,
    start: usize,
    multiplier: usize,
    ceiling: usize,
    last: Option<usize>,
    overloaded: bool,
    done: bool,
}

impl ExponentialRamp {
    /// Ramp up from `start` workers, multiplying by `multiplier` after every compliant probe.
    ///
    /// Both values are raised to sensible minimums (one worker, doubling) so that the ramp always
    /// makes progress.
    pub fn new(start: usize, multiplier: usize) -> Self {
        let start = start.max(1);
        Self {
            max_in: 1..usize::max_value(),
            start,
            multiplier: multiplier.max(2),
            ceiling: usize::max_value(),
            last: None,
            overloaded: false,
            done: false,
        }
    }

    /// Never yield more than `ceiling` workers.
    ///
    /// If the system still keeps up at the ceiling, the ramp ends with the bracket
    /// `ceiling..ceiling`.
    pub fn up_to(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling.max(1);
        self.start = self.start.min(self.ceiling);
        self.max_in.end = self.ceiling;
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

    /// The bracket known to contain the largest compliant worker count.
    ///
    /// The start is the last compliant count (one if nothing complied), the end is the first
    /// overloaded count.
    ///
    /// This provides [`CliffSearch::estimate`] without having to `use` the trait.
    pub fn estimate(&self) -> core::ops::Range<usize> {
        self.max_in.clone()
    }
}

impl CliffSearch for ExponentialRamp {
    fn overloaded(&mut self) {
        ExponentialRamp::overloaded(self)
    }

    fn estimate(&self) -> core::ops::Range<usize> {
        ExponentialRamp::estimate(self)
    }
}

impl Iterator for ExponentialRamp {
    type Item = usize;
    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if let Some(ref mut last) = self.last {
            if self.overloaded {
                // the first overloaded count closes the bracket
                self.max_in.end = *last;
                self.overloaded = false;
                self.done = true;
                return None;
            }

            self.max_in.start = *last;
            if *last >= self.ceiling {
                // still keeping up, but we are not allowed to go any higher
                self.max_in.end = self.ceiling;
                self.done = true;
                return None;
            }

            let next = last.saturating_mul(self.multiplier).min(self.ceiling);
            *last = next;
            Some(next)
        } else {
            self.last = Some(self.start);
            self.last
        }
    }
}

#[test]
fn ramp_until_overloaded() {
    let mut ramp = ExponentialRamp::new(500, 2);
    assert_eq!(ramp.next(), Some(500));
    assert_eq!(ramp.next(), Some(1000));
    assert_eq!(ramp.next(), Some(2000));
    assert_eq!(ramp.next(), Some(4000));
    ramp.overloaded();
    assert_eq!(ramp.next(), None);
    assert_eq!(ramp.estimate(), 2000..4000);

    // check that it continues to be terminated
    assert_eq!(ramp.next(), None);
    // even after another "overloaded"
    ramp.overloaded();
    assert_eq!(ramp.next(), None);
    // and the estimate is still the same
    assert_eq!(ramp.estimate(), 2000..4000);
}

#[test]
fn other_multiplier() {
    let mut ramp = ExponentialRamp::new(3, 4);
    assert_eq!(ramp.next(), Some(3));
    assert_eq!(ramp.next(), Some(12));
    assert_eq!(ramp.next(), Some(48));
    ramp.overloaded();
    assert_eq!(ramp.next(), None);
    assert_eq!(ramp.estimate(), 12..48);
}

#[test]
fn immediate() {
    // nothing complied, so the bracket floors at one worker
    let mut ramp = ExponentialRamp::new(500, 2);
    assert_eq!(ramp.next(), Some(500));
    ramp.overloaded();
    assert_eq!(ramp.next(), None);
    assert_eq!(ramp.estimate(), 1..500);
}

#[test]
fn immediate_from_one() {
    let mut ramp = ExponentialRamp::new(1, 2);
    assert_eq!(ramp.next(), Some(1));
    ramp.overloaded();
    assert_eq!(ramp.next(), None);
    assert_eq!(ramp.estimate(), 1..1);
}

#[test]
fn ceiling() {
    let mut ramp = ExponentialRamp::new(10, 2).up_to(50);
    assert_eq!(ramp.next(), Some(10));
    assert_eq!(ramp.next(), Some(20));
    assert_eq!(ramp.next(), Some(40));
    assert_eq!(ramp.next(), Some(50));
    assert_eq!(ramp.next(), None);
    assert_eq!(ramp.estimate(), 50..50);
}

#[test]
fn ceiling_then_overloaded() {
    let mut ramp = ExponentialRamp::new(10, 2).up_to(50);
    assert_eq!(ramp.next(), Some(10));
    assert_eq!(ramp.next(), Some(20));
    assert_eq!(ramp.next(), Some(40));
    assert_eq!(ramp.next(), Some(50));
    ramp.overloaded();
    assert_eq!(ramp.next(), None);
    assert_eq!(ramp.estimate(), 40..50);
}

#[test]
fn degenerate_arguments() {
    let mut ramp = ExponentialRamp::new(0, 0);
    assert_eq!(ramp.next(), Some(1));
    assert_eq!(ramp.next(), Some(2));
    assert_eq!(ramp.next(), Some(4));
}

#[test]
fn through_trait() {
    let mut ramp = ExponentialRamp::new(500, 2);
    let ramp: &mut dyn CliffSearch = &mut ramp;
    assert_eq!(ramp.next(), Some(500));
    assert_eq!(ramp.next(), Some(1000));
    ramp.overloaded();
    assert_eq!(ramp.next(), None);
    assert_eq!(ramp.estimate(), 500..1000);
}
