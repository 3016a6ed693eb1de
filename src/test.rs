#[cfg(test)]
mod tests {
    use crate::config::PoolConfig;
    use crate::error::PoolError;
    use crate::pool::{IdleRole, RoleWorker, ThreadPool, ThreadRole, WorkerCtx};
    use crate::utils::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn small_pool(threads: usize) -> ThreadPool {
        let cfg = PoolConfig {
            sample_period_ms: 20,
            ..PoolConfig::with_threads(threads, 10)
        };
        ThreadPool::new(cfg).unwrap()
    }

    // ---- roles used by the scenarios

    /// Records every activation as `(thread index, role name)`.
    #[derive(Debug)]
    struct RecordingRole {
        name: &'static str,
        log: Arc<Mutex<Vec<(usize, &'static str)>>>,
    }

    struct ParkedWorker;

    impl RoleWorker for ParkedWorker {
        fn run(&self, cancel: &CancelToken) -> anyhow::Result<()> {
            while cancel.sleep_cancellable(Duration::from_secs(1)) {}
            Ok(())
        }

        fn activity_rate(&self) -> f32 {
            0.0
        }
    }

    impl ThreadRole for RecordingRole {
        fn name(&self) -> &str {
            self.name
        }

        fn create_worker(&self, ctx: &WorkerCtx) -> anyhow::Result<Arc<dyn RoleWorker>> {
            self.log.lock().push((ctx.index, self.name));
            Ok(Arc::new(ParkedWorker))
        }
    }

    /// Busy for `duty` of every sampling period.
    #[derive(Debug)]
    struct DutyRole {
        duty: f32,
    }

    struct DutyWorker {
        meter: ActivityMeter,
        duty: f32,
    }

    impl ThreadRole for DutyRole {
        fn name(&self) -> &str {
            "duty"
        }

        fn create_worker(&self, ctx: &WorkerCtx) -> anyhow::Result<Arc<dyn RoleWorker>> {
            Ok(Arc::new(DutyWorker {
                meter: ctx.meter(),
                duty: self.duty,
            }))
        }
    }

    impl RoleWorker for DutyWorker {
        fn run(&self, cancel: &CancelToken) -> anyhow::Result<()> {
            let period = self.meter.period();
            let busy = period.mul_f32(self.duty);
            while !cancel.is_cancelled() {
                {
                    let _zone = self.meter.active();
                    thread::sleep(busy);
                }
                thread::sleep(period - busy);
            }
            Ok(())
        }

        fn activity_rate(&self) -> f32 {
            self.meter.rate()
        }
    }

    /// First activation fails (error or panic), later ones park.
    #[derive(Debug)]
    struct FlakyRole {
        panic: bool,
        activations: AtomicUsize,
    }

    struct FailingWorker {
        panic: bool,
    }

    impl RoleWorker for FailingWorker {
        fn run(&self, _cancel: &CancelToken) -> anyhow::Result<()> {
            thread::sleep(Duration::from_millis(20));
            if self.panic {
                panic!("worker blew up");
            }
            anyhow::bail!("worker gave up")
        }

        fn activity_rate(&self) -> f32 {
            1.0
        }
    }

    impl ThreadRole for FlakyRole {
        fn name(&self) -> &str {
            "flaky"
        }

        fn create_worker(&self, _ctx: &WorkerCtx) -> anyhow::Result<Arc<dyn RoleWorker>> {
            if self.activations.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Arc::new(FailingWorker { panic: self.panic }))
            } else {
                Ok(Arc::new(ParkedWorker))
            }
        }
    }

    // ---- scenarios

    #[test]
    fn pool_starts_idle() {
        let pool = small_pool(3);
        assert_eq!(pool.thread_count(), 3);
        assert_eq!(pool.roles().count(), 1);
        assert!(pool.find_role::<IdleRole>().is_some());

        for (i, t) in pool.threads().enumerate() {
            assert_eq!(t.index(), i);
            assert_eq!(t.role().name(), "idle");
            assert_eq!(t.name(), format!("relay-pool-{i}"));
        }
        assert!(wait_until(Duration::from_secs(2), || pool.threads().all(|t| t.has_worker())));
    }

    #[test]
    fn roles_are_found_by_type() {
        let pool = small_pool(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        pool.add_role(Arc::new(RecordingRole { name: "a", log: log.clone() })).unwrap();
        pool.add_role(Arc::new(RecordingRole { name: "b", log })).unwrap();

        assert_eq!(pool.find_role::<RecordingRole>().unwrap().name, "a");
        assert_eq!(pool.find_role_by::<RecordingRole>(|r| r.name == "b").unwrap().name, "b");
        assert!(pool.find_role::<DutyRole>().is_none());

        let names: Vec<String> = pool.roles().map(|r| r.name().to_string()).collect();
        assert_eq!(names, ["idle", "a", "b"]);
    }

    #[test]
    fn sequential_switches_each_take_effect() {
        let pool = small_pool(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let a: Arc<dyn ThreadRole> = Arc::new(RecordingRole { name: "a", log: log.clone() });
        let b: Arc<dyn ThreadRole> = Arc::new(RecordingRole { name: "b", log: log.clone() });

        let t = pool.thread(0).unwrap();
        for i in 0..10 {
            let role = if i % 2 == 0 { a.clone() } else { b.clone() };
            t.set_role(role).unwrap();
        }
        // setting the current role again is a no-op
        t.set_role(b.clone()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || log.lock().len() == 10));
        let seen: Vec<&str> = log.lock().iter().map(|(_, n)| *n).collect();
        let expected: Vec<&str> = (0..10).map(|i| if i % 2 == 0 { "a" } else { "b" }).collect();
        assert_eq!(seen, expected);
        assert_eq!(t.role().name(), "b");
    }

    #[test]
    fn concurrent_switches_are_serialized() {
        let pool = Arc::new(small_pool(1));
        let log = Arc::new(Mutex::new(Vec::new()));
        let a: Arc<dyn ThreadRole> = Arc::new(RecordingRole { name: "a", log: log.clone() });
        let b: Arc<dyn ThreadRole> = Arc::new(RecordingRole { name: "b", log: log.clone() });

        let switchers: Vec<_> = (0..6)
            .map(|s| {
                let (pool, a, b) = (pool.clone(), a.clone(), b.clone());
                thread::spawn(move || {
                    let t = pool.thread(0).unwrap();
                    for i in 0..20 {
                        let role = if (i + s) % 2 == 0 { a.clone() } else { b.clone() };
                        t.set_role(role).unwrap();
                    }
                })
            })
            .collect();
        for h in switchers {
            h.join().unwrap();
        }

        let t = pool.thread(0).unwrap();
        assert!(t.is_alive());
        // the thread still answers switches, so no token was lost
        let idle: Arc<dyn ThreadRole> = pool.idle_role();
        t.set_role(idle).unwrap();
        assert!(wait_until(Duration::from_secs(2), || t.has_worker() && t.role().name() == "idle"));

        // no role ever got two activations in a row: every switch waited
        // for the previous worker before landing
        let seen = log.lock().clone();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0].1 != w[1].1));
    }

    #[test]
    fn crash_respawns_same_index_and_role() {
        for panic in [false, true] {
            let pool = small_pool(2);
            let flaky = Arc::new(FlakyRole {
                panic,
                activations: AtomicUsize::new(0),
            });
            pool.add_role(flaky.clone()).unwrap();

            let before = pool.thread(1).unwrap();
            before.set_role(flaky.clone()).unwrap();

            assert!(wait_until(Duration::from_secs(3), || {
                pool.thread(1).is_some_and(|t| !Arc::ptr_eq(&t, &before))
            }));
            assert!(!before.is_alive());
            assert!(matches!(
                before.set_role(pool.idle_role()),
                Err(PoolError::ThreadDead(1))
            ));

            let after = pool.thread(1).unwrap();
            assert_eq!(pool.thread_count(), 2);
            assert_eq!(after.index(), 1);
            assert_eq!(after.role().name(), "flaky");
            assert!(wait_until(Duration::from_secs(2), || flaky.activations.load(Ordering::SeqCst) >= 2));
            assert!(after.is_alive());

            // the untouched slot is still the original thread
            assert_eq!(pool.thread(0).unwrap().role().name(), "idle");
        }
    }

    #[test]
    fn activity_rate_tracks_duty_cycle() {
        let pool = small_pool(4);
        let busy = Arc::new(DutyRole { duty: 0.5 });
        pool.add_role(busy.clone()).unwrap();
        pool.thread(0).unwrap().set_role(busy).unwrap();

        // ten 20 ms periods fill the window
        thread::sleep(Duration::from_millis(600));

        let rate = pool.thread(0).unwrap().activity_rate();
        assert!((0.3..=0.7).contains(&rate), "busy thread rate {rate}");
        for i in 1..4 {
            let rate = pool.thread(i).unwrap().activity_rate();
            assert!(rate < 0.05, "idle thread {i} rate {rate}");
        }

        let total = pool.activity_rate();
        assert!((0.05..=0.2).contains(&total), "pool rate {total}");

        let stats = pool.stats();
        assert_eq!(stats.thread_count, 4);
        assert_eq!(stats.threads[0].role, "duty");
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["roles"][1], "duty");
    }

    #[test]
    fn dispose_is_idempotent_and_joins() {
        let pool = Arc::new(small_pool(3));
        let threads: Vec<_> = pool.threads().collect();
        assert!(wait_until(Duration::from_secs(2), || threads.iter().all(|t| t.has_worker())));

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || pool.dispose())
            })
            .collect();
        for h in callers {
            h.join().unwrap();
        }
        pool.dispose();

        assert!(pool.is_disposed());
        assert!(pool.token().is_cancelled());
        assert_eq!(pool.roles().count(), 0);
        assert!(threads.iter().all(|t| !t.is_alive()));
        assert!(matches!(
            pool.add_role(Arc::new(IdleRole)),
            Err(PoolError::Disposed)
        ));
        assert!(matches!(
            threads[0].set_role(Arc::new(IdleRole)),
            Err(PoolError::ThreadDead(0))
        ));
    }

    #[test]
    fn dispose_from_a_pool_thread() {
        #[derive(Debug)]
        struct SelfDestructRole {
            pool: Arc<Mutex<Option<Arc<ThreadPool>>>>,
            done: Arc<AtomicUsize>,
        }

        struct SelfDestructWorker {
            pool: Arc<Mutex<Option<Arc<ThreadPool>>>>,
            done: Arc<AtomicUsize>,
        }

        impl ThreadRole for SelfDestructRole {
            fn name(&self) -> &str {
                "self-destruct"
            }

            fn create_worker(&self, _ctx: &WorkerCtx) -> anyhow::Result<Arc<dyn RoleWorker>> {
                Ok(Arc::new(SelfDestructWorker {
                    pool: self.pool.clone(),
                    done: self.done.clone(),
                }))
            }
        }

        impl RoleWorker for SelfDestructWorker {
            fn run(&self, cancel: &CancelToken) -> anyhow::Result<()> {
                if let Some(pool) = self.pool.lock().take() {
                    pool.dispose();
                    self.done.fetch_add(1, Ordering::SeqCst);
                }
                while cancel.sleep_cancellable(Duration::from_millis(100)) {}
                Ok(())
            }

            fn activity_rate(&self) -> f32 {
                0.0
            }
        }

        let pool = Arc::new(small_pool(2));
        let slot = Arc::new(Mutex::new(Some(pool.clone())));
        let done = Arc::new(AtomicUsize::new(0));
        let role = Arc::new(SelfDestructRole {
            pool: slot,
            done: done.clone(),
        });
        pool.add_role(role.clone()).unwrap();
        pool.thread(1).unwrap().set_role(role).unwrap();

        assert!(wait_until(Duration::from_secs(3), || done.load(Ordering::SeqCst) == 1));
        assert!(pool.is_disposed());
        assert!(wait_until(Duration::from_secs(2), || pool.threads().all(|t| !t.is_alive())));
    }
}
