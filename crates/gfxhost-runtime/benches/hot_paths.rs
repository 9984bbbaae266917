use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gfxhost_core::counter::reserved;
use gfxhost_core::traits::MemoryManager;
use gfxhost_core::{CounterId, MemHandle};
use gfxhost_hw::SimBackend;
use gfxhost_runtime::clock::HostClock;
use gfxhost_runtime::syncpt::Counters;
use gfxhost_runtime::waitlist::{WaitAction, WaitList};
use gfxhost_runtime::{new_semaphore, PinSet, Relocation, Segment};

fn criterion_config() -> Criterion {
    match std::env::var("GFXHOST_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30),
    }
}

/// Relocations in runs of `run` against the same target
fn relocs(sim: &SimBackend, count: usize, run: usize) -> (Vec<Relocation>, MemHandle) {
    let cmdbuf = sim.mem.alloc_words(&vec![0; count]).unwrap();
    let mut out = Vec::with_capacity(count);
    let mut target = sim.mem.alloc_words(&[0; 4]).unwrap();
    for i in 0..count {
        if i % run == 0 {
            target = sim.mem.alloc_words(&[0; 4]).unwrap();
        }
        out.push(Relocation::new(cmdbuf, (i * 4) as u32, target, 0));
    }
    (out, cmdbuf)
}

fn bench_pinset(c: &mut Criterion) {
    let sim = SimBackend::new();
    let mem: Arc<dyn MemoryManager> = sim.mem.clone();
    let mut group = c.benchmark_group("pinset");

    for &(count, run) in &[(16usize, 4usize), (256, 8), (1024, 1)] {
        let (relocs, cmdbuf) = relocs(&sim, count, run);
        let segments = [Segment::new(cmdbuf, 0, count as u32)];
        let mut set = PinSet::new();
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(
            BenchmarkId::new("process_relocs", format!("{}x{}", count, run)),
            &relocs,
            |b, relocs| b.iter(|| black_box(set.process_relocs(black_box(relocs)))),
        );

        group.bench_with_input(
            BenchmarkId::new("pin_all", format!("{}x{}", count, run)),
            &relocs,
            |b, relocs| {
                b.iter(|| {
                    set.process_relocs(relocs);
                    set.add_cmdbufs(&segments);
                    let guard = set.pin_all(&mem).unwrap();
                    black_box(set.reloc_phys(0));
                    drop(guard);
                })
            },
        );
    }
    group.finish();
}

fn bench_waitlist(c: &mut Criterion) {
    let sim = SimBackend::new();
    let clock = Arc::new(HostClock::new(sim.power.clone()));
    let counters = Arc::new(Counters::new(sim.host.clone(), reserved::MASK, 0));
    let wl = WaitList::new(sim.host.clone(), clock, counters, new_semaphore(), true);
    let sem = new_semaphore();
    let id = CounterId::new(20);
    let mut group = c.benchmark_group("waitlist");

    for &nodes in &[8u32, 64, 512] {
        group.throughput(Throughput::Elements(nodes as u64));
        group.bench_with_input(BenchmarkId::new("insert_fire", nodes), &nodes, |b, &nodes| {
            b.iter(|| {
                // interleave thresholds so inserts walk the list
                for i in 0..nodes {
                    let thresh = if i % 2 == 0 { i } else { nodes - i };
                    wl.schedule(id, thresh, WaitAction::Signal(sem.clone())).unwrap();
                }
                black_box(wl.flush_all());
                while sem.try_wait() {}
            })
        });
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_pinset, bench_waitlist
}
criterion_main!(benches);
