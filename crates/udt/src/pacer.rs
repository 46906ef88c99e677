use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Time left to sleep in a cycle that took `elapsed` out of `interval`.
///
/// Never negative: a cycle that overran its interval gets no sleep and the
/// next one starts immediately, without trying to catch up on missed cycles.
#[inline]
pub fn sleep_budget(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

#[derive(Debug, Clone)]
pub struct PacerStopHandle {
    stopped: Arc<AtomicBool>,
}

impl PacerStopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Drives periodic control emission for every connection on one socket.
///
/// The pacer only keeps time: each cycle it calls the supplied closure, yields,
/// then sleeps for whatever is left of `interval`. Stopping is cooperative and
/// observed once per cycle, so a cycle already in progress always completes.
#[derive(Debug)]
pub struct ControlPacer {
    interval: Duration,
    stopped: Arc<AtomicBool>,
    last_cycle_start: Option<Instant>,
    last_cycle_end: Option<Instant>,
    cycles: u64,
}

impl ControlPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stopped: Arc::new(AtomicBool::new(false)),
            last_cycle_start: None,
            last_cycle_end: None,
            cycles: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stop_handle(&self) -> PacerStopHandle {
        PacerStopHandle {
            stopped: Arc::clone(&self.stopped),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn last_cycle(&self) -> Option<(Instant, Instant)> {
        self.last_cycle_start.zip(self.last_cycle_end)
    }

    pub fn run<F: FnMut()>(&mut self, mut cycle: F) {
        log::debug!("control pacer running every {:?}", self.interval);

        while !self.is_stopped() {
            let start = self.begin_cycle();
            cycle();
            thread::yield_now();

            let sleep = self.end_cycle(start);
            if !sleep.is_zero() {
                thread::sleep(sleep);
            }
        }

        log::debug!("control pacer stopped after {} cycles", self.cycles);
    }

    pub async fn run_async<F: FnMut()>(&mut self, mut cycle: F) {
        log::debug!("control pacer task running every {:?}", self.interval);

        while !self.is_stopped() {
            let start = self.begin_cycle();
            cycle();
            tokio::task::yield_now().await;

            let sleep = self.end_cycle(start);
            if !sleep.is_zero() {
                tokio::time::sleep(sleep).await;
            }
        }

        log::debug!("control pacer task stopped after {} cycles", self.cycles);
    }

    fn begin_cycle(&mut self) -> Instant {
        let start = Instant::now();
        self.last_cycle_start = Some(start);
        start
    }

    fn end_cycle(&mut self, start: Instant) -> Duration {
        let end = Instant::now();
        self.last_cycle_end = Some(end);
        self.cycles += 1;
        sleep_budget(self.interval, end.duration_since(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mean_spacing(starts: &[Instant]) -> Duration {
        let total = starts[starts.len() - 1].duration_since(starts[0]);
        total / (starts.len() as u32 - 1)
    }

    #[test]
    fn test_sleep_budget() {
        let interval = Duration::from_millis(10);
        assert_eq!(
            sleep_budget(interval, Duration::from_millis(3)),
            Duration::from_millis(7)
        );
        assert_eq!(sleep_budget(interval, interval), Duration::ZERO);
        assert_eq!(
            sleep_budget(interval, Duration::from_millis(25)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_stopped_pacer_never_cycles() {
        let mut pacer = ControlPacer::new(Duration::from_millis(5));
        pacer.stop();

        let mut calls = 0;
        pacer.run(|| calls += 1);

        assert_eq!(calls, 0);
        assert_eq!(pacer.cycles(), 0);
        assert!(pacer.last_cycle().is_none());
    }

    #[test]
    fn test_cadence_converges_to_interval() {
        let interval = Duration::from_millis(10);
        let mut pacer = ControlPacer::new(interval);
        let stop = pacer.stop_handle();

        let mut starts = Vec::new();
        pacer.run(|| {
            starts.push(Instant::now());
            thread::sleep(Duration::from_millis(2));
            if starts.len() == 20 {
                stop.stop();
            }
        });

        assert_eq!(pacer.cycles(), 20);
        let spacing = mean_spacing(&starts);
        assert!(spacing >= Duration::from_millis(9), "spacing {spacing:?}");
        assert!(spacing < Duration::from_millis(16), "spacing {spacing:?}");
    }

    #[test]
    fn test_overrun_cycles_do_not_sleep() {
        let mut pacer = ControlPacer::new(Duration::from_millis(2));
        let stop = pacer.stop_handle();

        let mut starts = Vec::new();
        pacer.run(|| {
            starts.push(Instant::now());
            thread::sleep(Duration::from_millis(6));
            if starts.len() == 5 {
                stop.stop();
            }
        });

        let (start, end) = pacer.last_cycle().unwrap();
        let elapsed = end.duration_since(start);
        assert!(elapsed >= Duration::from_millis(6));
        assert_eq!(sleep_budget(pacer.interval(), elapsed), Duration::ZERO);
        assert!(mean_spacing(&starts) >= Duration::from_millis(6));
    }

    #[test]
    fn test_stop_from_another_thread() {
        let mut pacer = ControlPacer::new(Duration::from_millis(1));
        let stop = pacer.stop_handle();

        let worker = thread::spawn(move || {
            let mut calls = 0u64;
            pacer.run(|| calls += 1);
            (calls, pacer.cycles())
        });

        thread::sleep(Duration::from_millis(30));
        stop.stop();
        let (calls, cycles) = worker.join().unwrap();

        assert!(stop.is_stopped());
        assert!(calls > 0);
        assert_eq!(calls, cycles);
    }

    #[tokio::test]
    async fn test_async_pacer_stops() {
        let mut pacer = ControlPacer::new(Duration::from_millis(2));
        let stop = pacer.stop_handle();

        let mut calls = 0;
        pacer
            .run_async(|| {
                calls += 1;
                if calls == 5 {
                    stop.stop();
                }
            })
            .await;

        assert_eq!(calls, 5);
        assert_eq!(pacer.cycles(), 5);
    }
}
