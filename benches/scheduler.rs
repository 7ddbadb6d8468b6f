use std::time::{Duration, Instant};

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use peercore::{
    sched::window::BandwidthWindow, wire::encode_sub_message, PendingMessage, Scheduler,
    SchedulerLimits,
};

const BPM: u32 = 2 * 1024 * 1024;

fn loaded_scheduler(now: Instant, entries: usize, size: usize) -> Scheduler {
    let limits = SchedulerLimits {
        max_entries: entries,
        ..SchedulerLimits::default()
    };
    let mut scheduler = Scheduler::new(limits);
    let payload = vec![0xabu8; size];
    for i in 0..entries {
        let encoded = encode_sub_message(7, &payload).unwrap_or_else(|_| Bytes::new());
        let deadline = now + Duration::from_millis(10 * (i as u64 % 50));
        scheduler.submit(PendingMessage::new(encoded, 7, (i % 13) as u32, deadline, None));
    }
    scheduler
}

fn bench_select(c: &mut Criterion) {
    let now = Instant::now();

    c.bench_function("select_16_small", |b| {
        b.iter_batched(
            || (loaded_scheduler(now, 16, 64), BandwidthWindow::with_credit(now, 5, BPM as u64)),
            |(mut scheduler, mut window)| black_box(scheduler.select(&mut window, BPM, now)),
            BatchSize::SmallInput,
        )
    });

    // Starved window forces the exclusion/backtracking path.
    c.bench_function("select_64_backtracking", |b| {
        b.iter_batched(
            || (loaded_scheduler(now, 64, 4096), BandwidthWindow::new(now, 5)),
            |(mut scheduler, mut window)| black_box(scheduler.select(&mut window, 64 * 1024, now)),
            BatchSize::SmallInput,
        )
    });

    c.bench_function("select_and_take_batch", |b| {
        b.iter_batched(
            || (loaded_scheduler(now, 16, 1024), BandwidthWindow::with_credit(now, 5, BPM as u64)),
            |(mut scheduler, mut window)| {
                scheduler.select(&mut window, BPM, now);
                black_box(scheduler.take_batch())
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_select);
criterion_main!(benches);
