//! Leading and trailing edge debouncing, one actor task per lane.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub type RunFn = Arc<dyn Fn() -> BoxFuture + Send + Sync>;

/// Handle to a debounce lane.
///
/// The first trigger after a quiet period runs immediately. Triggers that
/// arrive while a run is in progress, or within `interval` of the previous
/// trigger, collapse into one more run once `interval` has passed since the
/// last of them. Runs of one lane never overlap.
///
/// Dropping every handle closes the lane: a run in progress completes, a
/// pending trailing run is discarded, then the actor exits.
#[derive(Clone)]
pub struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    pub fn spawn(interval: Duration, run: RunFn) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(lane(rx, interval, run));
        (Debouncer { tx }, handle)
    }

    /// Returns false when the lane has already stopped.
    pub fn trigger(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

async fn lane(mut rx: mpsc::UnboundedReceiver<()>, interval: Duration, run: RunFn) {
    while rx.recv().await.is_some() {
        let mut last_trigger = Instant::now();
        run().await;

        let mut pending = false;
        loop {
            tokio::select! {
                biased;

                msg = rx.recv() => match msg {
                    Some(()) => {
                        last_trigger = Instant::now();
                        pending = true;
                    }
                    None => return,
                },
                _ = sleep_until(last_trigger + interval) => {
                    if !pending {
                        break;
                    }
                    run().await;
                    pending = false;
                    last_trigger = Instant::now();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    const INTERVAL: Duration = Duration::from_secs(2);

    fn counting(runs: Arc<AtomicUsize>, work: Duration) -> RunFn {
        Arc::new(move || -> BoxFuture {
            let runs = runs.clone();
            Box::pin(async move {
                sleep(work).await;
                runs.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_runs_leading_and_trailing_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (debouncer, _handle) =
            Debouncer::spawn(INTERVAL, counting(runs.clone(), Duration::ZERO));

        for _ in 0..10 {
            assert!(debouncer.trigger());
            sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_periods_run_each_trigger() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (debouncer, _handle) =
            Debouncer::spawn(INTERVAL, counting(runs.clone(), Duration::ZERO));

        for expected in 1..=3 {
            debouncer.trigger();
            sleep(Duration::from_secs(3)).await;
            assert_eq!(runs.load(Ordering::SeqCst), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_during_run_is_queued_not_overlapped() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let run: RunFn = {
            let (active, max_active, runs) = (active.clone(), max_active.clone(), runs.clone());
            Arc::new(move || -> BoxFuture {
                let (active, max_active, runs) = (active.clone(), max_active.clone(), runs.clone());
                Box::pin(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_secs(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                })
            })
        };
        let (debouncer, _handle) = Debouncer::spawn(INTERVAL, run);

        debouncer.trigger();
        sleep(Duration::from_secs(1)).await;
        debouncer.trigger();
        debouncer.trigger();

        sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_finishes_in_flight_and_discards_pending_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (debouncer, handle) =
            Debouncer::spawn(INTERVAL, counting(runs.clone(), Duration::from_secs(1)));

        debouncer.trigger();
        tokio::task::yield_now().await;
        debouncer.trigger();
        drop(debouncer);

        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_trigger_after_stop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (debouncer, handle) = Debouncer::spawn(INTERVAL, counting(runs, Duration::ZERO));
        handle.abort();
        let _ = handle.await;
        assert!(!debouncer.trigger());
    }
}
