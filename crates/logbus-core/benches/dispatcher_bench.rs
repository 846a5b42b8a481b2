use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use logbus_core::{ClaimResult, Dispatcher, DispatcherConfig};

const PAYLOAD_LEN: usize = 64;

fn dispatcher() -> Dispatcher {
    Dispatcher::new(
        DispatcherConfig::builder()
            .name("bench")
            .partition_size(1 << 20)
            .partition_count(3)
            .build(),
    )
    .expect("bench dispatcher")
}

/// Publishes one frame, draining the subscription whenever the window
/// fills so the writer never spins on backpressure.
fn publish_one(d: &Dispatcher, sub: &logbus_core::Subscription, payload: &[u8]) -> i64 {
    loop {
        let pos = d.offer(black_box(payload));
        if pos > 0 {
            return pos;
        }
        sub.poll(|_| true, 4096).expect("bench poll");
        d.update_publisher_limit();
    }
}

fn bench_offer(c: &mut Criterion) {
    let d = dispatcher();
    let sub = d.open_subscription("drain").expect("subscription");
    let payload = [0u8; PAYLOAD_LEN];

    let mut group = c.benchmark_group("dispatcher");
    group.throughput(Throughput::Bytes(PAYLOAD_LEN as u64));
    group.bench_function("offer", |b| {
        b.iter(|| publish_one(&d, &sub, &payload));
    });
    group.finish();
}

fn bench_claim_commit(c: &mut Criterion) {
    let d = dispatcher();
    let sub = d.open_subscription("drain").expect("subscription");
    let payload = [0u8; PAYLOAD_LEN];

    let mut group = c.benchmark_group("dispatcher");
    group.throughput(Throughput::Bytes(PAYLOAD_LEN as u64));
    group.bench_function("claim_commit", |b| {
        b.iter(|| loop {
            match d.claim(PAYLOAD_LEN, 0) {
                ClaimResult::Granted(mut claim) => {
                    claim.payload_mut().copy_from_slice(black_box(&payload));
                    claim.commit();
                    break;
                }
                ClaimResult::Backpressured => {
                    sub.poll(|_| true, 4096).expect("bench poll");
                    d.update_publisher_limit();
                }
                ClaimResult::PartitionFilled => {}
            }
        });
    });
    group.finish();
}

fn bench_offer_poll_round_trip(c: &mut Criterion) {
    let d = dispatcher();
    let sub = d.open_subscription("reader").expect("subscription");
    let payload = [0u8; PAYLOAD_LEN];

    let mut group = c.benchmark_group("dispatcher");
    group.throughput(Throughput::Bytes(PAYLOAD_LEN as u64));
    group.bench_function("offer_poll_round_trip", |b| {
        b.iter(|| {
            publish_one(&d, &sub, &payload);
            let mut bytes = 0usize;
            sub.poll(
                |frag| {
                    bytes += frag.payload().len();
                    true
                },
                16,
            )
            .expect("bench poll");
            black_box(bytes)
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_offer,
    bench_claim_commit,
    bench_offer_poll_round_trip
);
criterion_main!(benches);
