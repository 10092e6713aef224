use std::fmt;
use std::time::{Duration, Instant};

/// One timing bucket: accumulated elapsed time and a sample count.
///
/// Per-item buckets report the average per sample, the others the total.
#[derive(Debug)]
pub(crate) struct Timer {
    name: &'static str,
    elapsed: Duration,
    count: u64,
    per_item: bool,
}

impl Timer {
    pub fn new(name: &'static str, per_item: bool) -> Self {
        Timer {
            name,
            elapsed: Duration::ZERO,
            count: 0,
            per_item,
        }
    }

    pub fn record_since(&mut self, start: Instant) {
        self.count += 1;
        self.elapsed += start.elapsed();
    }

    /// Buckets that never saw meaningful time are left out of summaries.
    pub fn is_idle(&self) -> bool {
        self.count == 0 || self.elapsed < Duration::from_millis(1)
    }
}

fn fmt_duration(f: &mut fmt::Formatter<'_>, d: Duration) -> fmt::Result {
    let secs = d.as_secs_f64();
    let hours = (secs / 3600.0) as u64;
    let minutes = ((secs % 3600.0) / 60.0) as u64;
    let seconds = secs % 60.0;
    if hours >= 1 {
        write!(f, "{hours}h ")?;
    }
    if minutes >= 1 || hours >= 1 {
        write!(f, "{minutes}m ")?;
    }
    write!(f, "{seconds:.2}s")
}

impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.name)?;
        if self.per_item {
            let avg = self.elapsed.div_f64(self.count.max(1) as f64);
            fmt_duration(f, avg)?;
            write!(f, " * {}", self.count)
        } else {
            fmt_duration(f, self.elapsed)
        }
    }
}

/// The timing buckets of a single worker: init, per-task, dispose and the
/// waits on either side of the transform. Purely observational.
#[derive(Debug)]
pub(crate) struct WorkerTimers {
    pub init: Timer,
    pub per_task: Timer,
    pub dispose: Timer,
    pub input_wait: Timer,
    pub output_wait: Timer,
}

impl WorkerTimers {
    pub fn new() -> Self {
        WorkerTimers {
            init: Timer::new("init", false),
            per_task: Timer::new("per_task", true),
            dispose: Timer::new("dispose", false),
            input_wait: Timer::new("avg_in_wait", true),
            output_wait: Timer::new("avg_out_wait", true),
        }
    }

    /// Space-separated rendering of the buckets that saw meaningful time.
    pub fn summary(&self) -> String {
        [
            &self.init,
            &self.per_task,
            &self.dispose,
            &self.input_wait,
            &self.output_wait,
        ]
        .into_iter()
        .filter(|timer| !timer.is_idle())
        .map(Timer::to_string)
        .collect::<Vec<_>>()
        .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(name: &'static str, per_item: bool, elapsed: Duration, count: u64) -> Timer {
        let mut timer = Timer::new(name, per_item);
        timer.elapsed = elapsed;
        timer.count = count;
        timer
    }

    #[test]
    fn totals_format_as_seconds() {
        let timer = loaded("init", false, Duration::from_millis(1500), 1);
        assert_eq!(timer.to_string(), "init: 1.50s");
    }

    #[test]
    fn per_item_reports_the_average() {
        let timer = loaded("per_task", true, Duration::from_secs(10), 4);
        assert_eq!(timer.to_string(), "per_task: 2.50s * 4");
    }

    #[test]
    fn long_totals_include_minutes_and_hours() {
        let timer = loaded("dispose", false, Duration::from_secs(3600 + 125), 1);
        assert_eq!(timer.to_string(), "dispose: 1h 2m 5.00s");
    }

    #[test]
    fn summary_skips_idle_buckets() {
        let mut timers = WorkerTimers::new();
        timers.per_task.elapsed = Duration::from_secs(1);
        timers.per_task.count = 2;
        assert_eq!(timers.summary(), "per_task: 0.50s * 2");
    }
}
