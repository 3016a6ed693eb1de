use criterion::{Criterion, criterion_group, criterion_main};
use relaycore::config::PoolConfig;
use relaycore::pool::{RoleWorker, ThreadPool, ThreadRole, WorkerCtx};
use relaycore::utils::{ActivityMeter, CancelToken};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

/// Spins in short active zones so a switch has to interrupt real work.
#[derive(Debug)]
struct SpinRole(&'static str);

struct SpinWorker {
    meter: ActivityMeter,
}

impl ThreadRole for SpinRole {
    fn name(&self) -> &str {
        self.0
    }

    fn create_worker(&self, ctx: &WorkerCtx) -> anyhow::Result<Arc<dyn RoleWorker>> {
        Ok(Arc::new(SpinWorker { meter: ctx.meter() }))
    }
}

impl RoleWorker for SpinWorker {
    fn run(&self, cancel: &CancelToken) -> anyhow::Result<()> {
        while !cancel.is_cancelled() {
            let _zone = self.meter.active();
            for i in 0..256u64 {
                black_box(i);
            }
        }
        Ok(())
    }

    fn activity_rate(&self) -> f32 {
        self.meter.rate()
    }
}

fn bench_role_switch(c: &mut Criterion) {
    let pool = ThreadPool::new(PoolConfig::with_threads(1, 10)).expect("pool");
    let a: Arc<dyn ThreadRole> = Arc::new(SpinRole("spin-a"));
    let b: Arc<dyn ThreadRole> = Arc::new(SpinRole("spin-b"));
    pool.add_role(a.clone()).expect("role a");
    pool.add_role(b.clone()).expect("role b");
    let thread = pool.thread(0).expect("thread 0");

    let mut group = c.benchmark_group("role_switch");
    group.measurement_time(Duration::from_secs(5));
    group.bench_function("spin_a_to_b_and_back", |bch| {
        bch.iter(|| {
            thread.set_role(a.clone()).expect("switch to a");
            thread.set_role(b.clone()).expect("switch to b");
        })
    });
    group.bench_function("idle_to_spin_and_back", |bch| {
        let idle: Arc<dyn ThreadRole> = pool.idle_role();
        bch.iter(|| {
            thread.set_role(idle.clone()).expect("switch to idle");
            thread.set_role(a.clone()).expect("switch to a");
        })
    });
    group.finish();

    pool.dispose();
}

criterion_group!(benches, bench_role_switch);
criterion_main!(benches);
