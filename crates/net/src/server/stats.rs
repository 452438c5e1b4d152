use std::collections::VecDeque;
use std::time::Duration;

/// Ticks of history kept for the averages; one second at the nominal rate.
pub const TICK_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    tps: f32,
    usage: f32,
}

/// Rolling window of ticks-per-second and tick budget usage.
#[derive(Debug, Clone, Default)]
pub struct TickStats {
    window: VecDeque<Sample>,
    current: Sample,
}

impl TickStats {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(TICK_WINDOW),
            current: Sample::default(),
        }
    }

    /// `interval` is the time since the previous tick started, `busy` the time
    /// this tick took, `period` the tick budget.
    pub fn record(&mut self, interval: Duration, busy: Duration, period: Duration) {
        let period = period.as_secs_f32().max(0.001);
        let max_tps = 1.0 / period;
        self.current = Sample {
            tps: (1.0 / interval.as_secs_f32().max(0.001)).min(max_tps),
            usage: (busy.as_secs_f32() / period).min(1.0),
        };

        if self.window.len() == TICK_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(self.current);
    }

    pub fn current_tps(&self) -> f32 {
        self.current.tps
    }

    pub fn current_usage(&self) -> f32 {
        self.current.usage
    }

    pub fn average_tps(&self) -> f32 {
        self.average(|s| s.tps)
    }

    pub fn average_usage(&self) -> f32 {
        self.average(|s| s.usage)
    }

    fn average(&self, field: impl Fn(&Sample) -> f32) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().map(field).sum::<f32>() / self.window.len() as f32
    }
}
