use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use offerdesk_core::{OwnerId, QuotaPeriod, Tenant, TenantId};
use offerdesk_infra::jobs::{InMemoryJobStore, JobStore, NewJob, PdfJob, RenderPayload, RetryPolicy};
use offerdesk_infra::quota::{InMemoryQuotaLedger, QuotaLedger};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

fn runtime() -> Runtime {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn new_job(tenant: Tenant) -> PdfJob {
    PdfJob::new(
        NewJob {
            tenant,
            owner_id: OwnerId::new(),
            payload: RenderPayload::html("<h1>bench</h1>"),
            callback_url: None,
            max_retries: 3,
            quota_period: None,
        },
        Utc::now(),
    )
}

fn bench_retry_delay(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_delay");
    let policy = RetryPolicy::exponential(10, Duration::from_secs(60), Duration::from_secs(3600));

    group.bench_function("backoff_only", |b| {
        b.iter(|| {
            for n in 0..10 {
                black_box(policy.backoff(black_box(n)));
            }
        })
    });

    group.bench_function("with_random_jitter", |b| {
        b.iter(|| {
            for n in 0..10 {
                black_box(policy.delay(black_box(n)));
            }
        })
    });

    group.finish();
}

fn bench_admit_and_claim(c: &mut Criterion) {
    let mut group = c.benchmark_group("admit_and_claim");
    let rt = runtime();

    for queue_len in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*queue_len as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(queue_len),
            queue_len,
            |b, &queue_len| {
                b.iter(|| {
                    rt.block_on(async {
                        let store = InMemoryJobStore::new(RetryPolicy::default());
                        let ledger = InMemoryQuotaLedger::new();
                        let tenant_id = TenantId::new();
                        let period = QuotaPeriod::containing(Utc::now()).start();

                        for _ in 0..queue_len {
                            let decision = ledger
                                .check_and_increment(tenant_id, u32::MAX, period)
                                .await
                                .unwrap();
                            assert!(decision.allowed);
                            store.create(new_job(Tenant::Account(tenant_id))).await.unwrap();
                        }

                        let now = Utc::now();
                        loop {
                            let batch = store.list_claimable(now, 8).await.unwrap();
                            if batch.is_empty() {
                                break;
                            }
                            for job in batch {
                                let claimed = store.claim(job.id, now).await.unwrap();
                                black_box(claimed);
                            }
                        }
                    })
                })
            },
        );
    }

    group.finish();
}

fn bench_claim_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_contention");
    let rt = Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    group.bench_function("8_claimers_one_job", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryJobStore::arc(RetryPolicy::default());
                let job = store.create(new_job(Tenant::System)).await.unwrap();
                let now = Utc::now();

                let handles: Vec<_> = (0..8)
                    .map(|_| {
                        let store = store.clone();
                        tokio::spawn(async move { store.claim(job.id, now).await.unwrap().is_some() })
                    })
                    .collect();

                let mut winners = 0;
                for h in handles {
                    if h.await.unwrap() {
                        winners += 1;
                    }
                }
                assert_eq!(winners, 1);
            })
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_retry_delay,
    bench_admit_and_claim,
    bench_claim_contention
);
criterion_main!(benches);
