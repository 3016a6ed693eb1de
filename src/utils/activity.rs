use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

struct MeterState {
    samples: VecDeque<f32>,
    sample_start: Instant,
    /// Busy time of finished zones inside the open sample.
    busy: Duration,
    active_since: Option<Instant>,
}

/// Busy-fraction meter for role workers.
///
/// Wall-clock time is cut into fixed `period` slices. A worker marks the
/// parts of its loop that do useful work with [`enter_active`](Self::enter_active)
/// / [`exit_active`](Self::exit_active) (or the [`active`](Self::active) guard);
/// the rate is the mean busy fraction of the last `window` closed slices.
/// Readable from any thread while the worker runs.
pub struct ActivityMeter {
    state: Mutex<MeterState>,
    window: usize,
    period: Duration,
}

impl ActivityMeter {
    pub fn new(window: usize, period: Duration) -> Self {
        Self {
            state: Mutex::new(MeterState {
                samples: VecDeque::with_capacity(window.max(1)),
                sample_start: Instant::now(),
                busy: Duration::ZERO,
                active_since: None,
            }),
            window: window.max(1),
            period: period.max(Duration::from_millis(1)),
        }
    }

    #[inline]
    pub fn window(&self) -> usize {
        self.window
    }

    #[inline]
    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn enter_active(&self) {
        let now = Instant::now();
        let mut st = self.state.lock();
        self.roll(&mut st, now);
        if st.active_since.is_none() {
            st.active_since = Some(now);
        }
    }

    pub fn exit_active(&self) {
        let now = Instant::now();
        let mut st = self.state.lock();
        self.roll(&mut st, now);
        if let Some(since) = st.active_since.take() {
            let from = since.max(st.sample_start);
            st.busy += now.saturating_duration_since(from);
        }
    }

    /// Marks the scope as active until the guard drops.
    pub fn active(&self) -> ActiveZone<'_> {
        self.enter_active();
        ActiveZone { meter: self }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active_since.is_some()
    }

    /// Mean busy fraction over the closed samples, 0.0 before the first one.
    pub fn rate(&self) -> f32 {
        let mut st = self.state.lock();
        self.roll(&mut st, Instant::now());
        if st.samples.is_empty() {
            return 0.0;
        }
        st.samples.iter().sum::<f32>() / st.samples.len() as f32
    }

    fn push_sample(&self, st: &mut MeterState, ratio: f32) {
        if st.samples.len() == self.window {
            st.samples.pop_front();
        }
        st.samples.push_back(ratio.clamp(0.0, 1.0));
    }

    fn roll(&self, st: &mut MeterState, now: Instant) {
        let elapsed = now.saturating_duration_since(st.sample_start);
        let periods = (elapsed.as_nanos() / self.period.as_nanos()) as u64;
        if periods == 0 {
            return;
        }

        // A gap longer than the whole window: every slice in it is uniform.
        if periods > self.window as u64 + 1 {
            let fill = if st.active_since.is_some() { 1.0 } else { 0.0 };
            for _ in 0..self.window {
                self.push_sample(st, fill);
            }
            let rem = elapsed.as_nanos() % self.period.as_nanos();
            st.sample_start = now - Duration::from_nanos(rem as u64);
            st.busy = Duration::ZERO;
            return;
        }

        for _ in 0..periods {
            let end = st.sample_start + self.period;
            let mut busy = st.busy;
            if let Some(since) = st.active_since {
                busy += end.saturating_duration_since(since.max(st.sample_start));
            }
            let ratio = busy.as_secs_f32() / self.period.as_secs_f32();
            self.push_sample(st, ratio);
            st.sample_start = end;
            st.busy = Duration::ZERO;
        }
    }
}

impl fmt::Debug for ActivityMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityMeter")
            .field("window", &self.window)
            .field("period", &self.period)
            .field("rate", &self.rate())
            .finish()
    }
}

pub struct ActiveZone<'a> {
    meter: &'a ActivityMeter,
}

impl Drop for ActiveZone<'_> {
    fn drop(&mut self) {
        self.meter.exit_active();
    }
}

/// Stopwatch for the running time of one worker activation.
#[derive(Debug, Default)]
pub struct RuntimeWatch {
    inner: Mutex<(Option<Instant>, Duration)>,
}

impl RuntimeWatch {
    pub fn start(&self) {
        let mut g = self.inner.lock();
        if g.0.is_none() {
            g.0 = Some(Instant::now());
        }
    }

    pub fn stop(&self) {
        let mut g = self.inner.lock();
        if let Some(started) = g.0.take() {
            g.1 += started.elapsed();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().0.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        let g = self.inner.lock();
        g.1 + g.0.map(|s| s.elapsed()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn idle_meter_reads_zero() {
        let m = ActivityMeter::new(4, Duration::from_millis(5));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(m.rate(), 0.0);
    }

    #[test]
    fn always_active_meter_reads_one() {
        let m = ActivityMeter::new(4, Duration::from_millis(5));
        m.enter_active();
        thread::sleep(Duration::from_millis(40));
        assert!(m.rate() > 0.9);
        m.exit_active();
        assert!(!m.is_active());
    }

    #[test]
    fn long_gap_fills_window() {
        let m = ActivityMeter::new(3, Duration::from_millis(2));
        {
            let _zone = m.active();
            thread::sleep(Duration::from_millis(30));
        }
        assert!(m.rate() > 0.9);
        thread::sleep(Duration::from_millis(30));
        assert!(m.rate() < 0.1);
    }

    #[test]
    fn runtime_watch_accumulates() {
        let w = RuntimeWatch::default();
        w.start();
        thread::sleep(Duration::from_millis(10));
        w.stop();
        let first = w.elapsed();
        assert!(first >= Duration::from_millis(10));
        assert!(!w.is_running());
        thread::sleep(Duration::from_millis(5));
        assert_eq!(w.elapsed(), first);
    }
}
