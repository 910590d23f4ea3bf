//! Integration tests for the recurring-job scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use fleetwatch::Error;
use fleetwatch::scheduler::{RecurringJob, Scheduler, handler_fn};
use tokio::time::sleep;

/// Tracks how many bodies are running at once.
#[derive(Default)]
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

fn slow_job(name: &str, interval: Duration, body: Duration, tracker: Arc<Concurrency>) -> RecurringJob {
    RecurringJob::new(
        name,
        interval,
        handler_fn(move |_ctx| {
            let tracker = tracker.clone();
            async move {
                tracker.enter();
                sleep(body).await;
                tracker.exit();
                Ok(())
            }
        }),
    )
}

mod overlap_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_long_run_skips_firings_instead_of_overlapping() {
        let scheduler = Scheduler::new();
        let tracker = Arc::new(Concurrency::default());
        scheduler
            .register(slow_job(
                "slow",
                Duration::from_secs(10),
                Duration::from_secs(25),
                tracker.clone(),
            ))
            .unwrap();

        scheduler.start().unwrap();
        // Ticks at 0..=60 land on 0, 30 and 60 free; 10, 20, 40, 50 are skipped.
        sleep(Duration::from_secs(65)).await;

        let snapshot = scheduler.job("slow").expect("job registered");
        assert_eq!(snapshot.runs, 3);
        assert_eq!(snapshot.skipped, 4);
        assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);

        scheduler.stop().await;
        assert_eq!(tracker.completed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_run_independently() {
        let scheduler = Scheduler::new();
        let fast = Arc::new(AtomicUsize::new(0));
        let blocker = Arc::new(Concurrency::default());

        let counter = fast.clone();
        scheduler
            .register(RecurringJob::new(
                "fast",
                Duration::from_secs(5),
                handler_fn(move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            ))
            .unwrap();
        scheduler
            .register(slow_job(
                "blocker",
                Duration::from_secs(100),
                Duration::from_secs(90),
                blocker.clone(),
            ))
            .unwrap();

        scheduler.start().unwrap();
        sleep(Duration::from_secs(22)).await;

        // 0, 5, 10, 15, 20 while the blocker is still mid-run.
        assert_eq!(fast.load(Ordering::SeqCst), 5);
        assert!(scheduler.job("blocker").unwrap().running);
        scheduler.stop().await;
    }
}

mod failure_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_errors_and_panics_do_not_stop_the_job() {
        let scheduler = Scheduler::new();
        let erroring = Arc::new(AtomicUsize::new(0));
        let panicking = Arc::new(AtomicUsize::new(0));

        let counter = erroring.clone();
        scheduler
            .register(RecurringJob::new(
                "erroring",
                Duration::from_secs(10),
                handler_fn(move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(Error::Other("upstream unavailable".to_string()))
                    }
                }),
            ))
            .unwrap();

        let counter = panicking.clone();
        scheduler
            .register(RecurringJob::new(
                "panicking",
                Duration::from_secs(10),
                handler_fn(move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                            panic!("boom");
                        }
                        Ok(())
                    }
                }),
            ))
            .unwrap();

        scheduler.start().unwrap();
        sleep(Duration::from_secs(35)).await;

        assert_eq!(erroring.load(Ordering::SeqCst), 4);
        assert_eq!(panicking.load(Ordering::SeqCst), 4);

        let erroring_state = scheduler.job("erroring").unwrap();
        assert_eq!(erroring_state.runs, 4);
        assert_eq!(erroring_state.failures, 4);
        assert!(
            erroring_state
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("upstream unavailable"))
        );

        let panicking_state = scheduler.job("panicking").unwrap();
        assert_eq!(panicking_state.runs, 4);
        assert_eq!(panicking_state.failures, 2);
        // The last run (index 3) succeeded and cleared the error.
        assert!(panicking_state.last_error.is_none());
        assert!(!panicking_state.running);

        scheduler.stop().await;
    }
}

mod shutdown_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_run() {
        let scheduler = Scheduler::new();
        let tracker = Arc::new(Concurrency::default());
        scheduler
            .register(slow_job(
                "long",
                Duration::from_secs(60),
                Duration::from_secs(30),
                tracker.clone(),
            ))
            .unwrap();

        scheduler.start().unwrap();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(tracker.current.load(Ordering::SeqCst), 1);

        let before = tokio::time::Instant::now();
        scheduler.stop().await;

        assert!(before.elapsed() >= Duration::from_secs(25));
        assert_eq!(tracker.completed.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_running());
        assert!(!scheduler.job("long").unwrap().running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aware_body_returns_promptly() {
        let scheduler = Scheduler::new();
        let observed_cancel = Arc::new(AtomicUsize::new(0));

        let flag = observed_cancel.clone();
        scheduler
            .register(RecurringJob::new(
                "cooperative",
                Duration::from_secs(60),
                handler_fn(move |ctx| {
                    let flag = flag.clone();
                    async move {
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => {
                                flag.fetch_add(1, Ordering::SeqCst);
                            }
                            _ = sleep(Duration::from_secs(3600)) => {}
                        }
                        Ok(())
                    }
                }),
            ))
            .unwrap();

        scheduler.start().unwrap();
        sleep(Duration::from_secs(1)).await;

        let before = tokio::time::Instant::now();
        scheduler.stop().await;

        assert!(before.elapsed() < Duration::from_secs(1));
        assert_eq!(observed_cancel.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_new_runs_after_stop() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        scheduler
            .register(RecurringJob::new(
                "tick",
                Duration::from_secs(1),
                handler_fn(move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            ))
            .unwrap();

        scheduler.start().unwrap();
        sleep(Duration::from_millis(2500)).await;
        scheduler.stop().await;
        let stopped_at = runs.load(Ordering::SeqCst);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(stopped_at, 3);
        assert_eq!(runs.load(Ordering::SeqCst), stopped_at);
    }
}

mod registration_tests {
    use super::*;

    fn noop(name: &str, interval: Duration) -> RecurringJob {
        RecurringJob::new(name, interval, handler_fn(|_ctx| async { Ok(()) }))
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let scheduler = Scheduler::new();
        scheduler.register(noop("a", Duration::from_secs(1))).unwrap();
        assert!(scheduler.register(noop("a", Duration::from_secs(2))).is_err());
        assert_eq!(scheduler.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let scheduler = Scheduler::new();
        let err = scheduler.register(noop("zero", Duration::ZERO)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_after_start_rejected() {
        let scheduler = Scheduler::new();
        scheduler.register(noop("a", Duration::from_secs(1))).unwrap();
        scheduler.start().unwrap();

        assert!(scheduler.is_running());
        assert!(scheduler.register(noop("b", Duration::from_secs(1))).is_err());
        assert!(scheduler.start().is_err());

        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }
}
