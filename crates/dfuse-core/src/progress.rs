//! Progress reporting for UI decoupling.
//!
//! The engine pushes coarse progress (one tick per erased page or
//! transferred block) through a narrow sink interface; a fan-out list
//! forwards to every registered subscriber so a CLI bar and a log
//! writer can watch the same session.

/// Observer for programming progress.
///
/// Implement this in your UI layer. All methods take `&self`; the core
/// is single-threaded and calls sinks in registration order.
pub trait ProgressSink {
    /// Start a fresh operation; forget previous totals.
    fn reset(&self);
    /// Human-readable label of the current operation.
    fn set_status(&self, text: &str);
    /// Total number of ticks the operation will take.
    fn set_max(&self, n: u64);
    /// Size of one tick (e.g. bytes per block).
    fn set_increment(&self, n: u64);
    /// One unit of work happened.
    fn increment(&self);
}

/// Fan-out list of progress sinks.
#[derive(Default)]
pub struct ProgressList {
    sinks: Vec<Box<dyn ProgressSink>>,
}

impl ProgressList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sink: Box<dyn ProgressSink>) {
        self.sinks.push(sink);
    }

    pub fn reset(&self) {
        for sink in &self.sinks {
            sink.reset();
        }
    }

    pub fn set_status(&self, text: &str) {
        for sink in &self.sinks {
            sink.set_status(text);
        }
    }

    pub fn set_max(&self, n: u64) {
        for sink in &self.sinks {
            sink.set_max(n);
        }
    }

    pub fn set_increment(&self, n: u64) {
        for sink in &self.sinks {
            sink.set_increment(n);
        }
    }

    pub fn increment(&self) {
        for sink in &self.sinks {
            sink.increment();
        }
    }
}

/// Sink that logs status changes through tracing. Ticks are traced at
/// debug level to keep headless output readable.
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn reset(&self) {}

    fn set_status(&self, text: &str) {
        tracing::info!(status = %text, "Progress");
    }

    fn set_max(&self, n: u64) {
        tracing::debug!(total = n, "Progress total");
    }

    fn set_increment(&self, n: u64) {
        tracing::debug!(step = n, "Progress step size");
    }

    fn increment(&self) {
        tracing::trace!("Progress tick");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingSink {
        ticks: Rc<Cell<u64>>,
    }

    impl ProgressSink for CountingSink {
        fn reset(&self) {
            self.ticks.set(0);
        }
        fn set_status(&self, _text: &str) {}
        fn set_max(&self, _n: u64) {}
        fn set_increment(&self, _n: u64) {}
        fn increment(&self) {
            self.ticks.set(self.ticks.get() + 1);
        }
    }

    #[test]
    fn test_fan_out() {
        let a = Rc::new(Cell::new(0));
        let b = Rc::new(Cell::new(0));
        let mut list = ProgressList::new();
        list.add(Box::new(CountingSink { ticks: a.clone() }));
        list.add(Box::new(CountingSink { ticks: b.clone() }));

        list.increment();
        list.increment();
        assert_eq!(a.get(), 2);
        assert_eq!(b.get(), 2);

        list.reset();
        assert_eq!(a.get(), 0);
    }

    #[test]
    fn test_empty_list_is_silent() {
        let list = ProgressList::new();
        list.reset();
        list.set_status("Writing");
        list.set_max(10);
        list.increment();
    }
}
