use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, Duration as Days, Utc, Weekday};
use ulid::Ulid;

use chatbook::conversation::Dispatcher;
use chatbook::directory::{BusinessDirectory, InMemoryDirectory};
use chatbook::engine::{AvailabilityEngine, BookingCommitter, BookingRequest, EngineError};
use chatbook::model::{BookingSource, BookingStatus, BusinessId};
use chatbook::outbox::OutboxHub;
use chatbook::store::BookingStore;
use chatbook::tenant::TenantManager;
use chatbook::time::{SystemClock, TimeOfDay};

const BUSINESSES: usize = 8;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

/// Open every day 00:00–23:59 so runs do not depend on the wall clock.
fn businesses_json() -> String {
    let entries: Vec<String> = (0..BUSINESSES)
        .map(|i| {
            format!(
                r#"{{
                    "id": "bench_{i}",
                    "hours": {{
                        "working_days": ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"],
                        "opening_time": "00:00",
                        "closing_time": "23:59",
                        "slot_gap_minutes": 15
                    }},
                    "services": [
                        {{"id": "cut", "name": {{"en": "Cut"}}, "price": "10", "duration": 30}},
                        {{"id": "long", "name": {{"en": "Long"}}, "price": "40", "duration": 90}}
                    ],
                    "slot_policy": "{policy}"
                }}"#,
                policy = if i % 2 == 0 { "grid" } else { "smart" },
            )
        })
        .collect();
    format!("[{}]", entries.join(","))
}

struct Bench {
    tenants: Arc<TenantManager>,
    directory: Arc<InMemoryDirectory>,
    dispatcher: Arc<Dispatcher>,
}

fn setup() -> Bench {
    let dir = std::env::temp_dir().join(format!("chatbook_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");
    let tenants = Arc::new(TenantManager::new(dir, 10_000));
    let directory =
        Arc::new(InMemoryDirectory::from_json_str(&businesses_json()).expect("bench config"));
    let dispatcher = Arc::new(Dispatcher::new(
        directory.clone(),
        tenants.clone(),
        tenants.clone(),
        Arc::new(OutboxHub::new()),
        Arc::new(SystemClock),
    ));
    Bench {
        tenants,
        directory,
        dispatcher,
    }
}

/// Next Wednesday, far enough from "now" that no slot has passed.
fn bench_date() -> chrono::NaiveDate {
    let mut d = Utc::now().date_naive() + Days::days(2);
    while d.weekday() != Weekday::Wed {
        d += Days::days(1);
    }
    d
}

async fn phase1_conversations(bench: &Bench, customers: usize) {
    let start = Instant::now();
    let mut handles = Vec::new();
    for c in 0..customers {
        let dispatcher = bench.dispatcher.clone();
        let business = BusinessId(format!("bench_{}", c % BUSINESSES));
        handles.push(tokio::spawn(async move {
            let phone = format!("+1{c:09}");
            let mut latencies = Vec::new();
            // Language, book, first service, third listed date, first range,
            // a time, a name, no note.
            let script = ["hi", "1", "1", "1", "3", "1", "2", "Bench Customer", "skip"];
            for text in script {
                let t = Instant::now();
                if let Err(e) = dispatcher
                    .handle_inbound_message(&business, &phone, text)
                    .await
                {
                    eprintln!("dispatch failed: {e}");
                }
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut latencies = Vec::new();
    for h in handles {
        if let Ok(l) = h.await {
            latencies.extend(l);
        }
    }
    let elapsed = start.elapsed();
    let msgs = latencies.len();
    println!(
        "  {msgs} messages in {:.2}s = {:.0} msgs/sec",
        elapsed.as_secs_f64(),
        msgs as f64 / elapsed.as_secs_f64()
    );
    print_latency("per message", &mut latencies);

    let mut booked = 0;
    for i in 0..BUSINESSES {
        let id = BusinessId(format!("bench_{i}"));
        for offset in 0..7 {
            let date = Utc::now().date_naive() + Days::days(offset);
            booked += bench
                .tenants
                .find(&id, date, &BookingStatus::ACTIVE)
                .await
                .map_or(0, |b| b.len());
        }
    }
    println!("  {booked} bookings committed by {customers} customers");
}

async fn phase2_slot_contention(bench: &Bench, contenders: usize) {
    let committer = Arc::new(BookingCommitter::new(
        bench.tenants.clone(),
        Arc::new(SystemClock),
    ));
    let Some(business) = bench.directory.business(&BusinessId::from("bench_0")).await else {
        eprintln!("bench_0 missing");
        return;
    };
    let date = bench_date();
    let Some(time) = TimeOfDay::from_hm(12, 0) else {
        return;
    };

    let start = Instant::now();
    let mut handles = Vec::new();
    for c in 0..contenders {
        let committer = committer.clone();
        let business = business.clone();
        handles.push(tokio::spawn(async move {
            let Some(service) = business.service("long") else {
                return Err(EngineError::Stale("long".into()));
            };
            let request = BookingRequest {
                id: Ulid::new(),
                phone: format!("+2{c:09}"),
                customer_name: "Contender".into(),
                notes: String::new(),
                service_id: service.id.clone(),
                snapshot: service.snapshot(),
                date,
                time,
                source: BookingSource::Whatsapp,
            };
            committer.commit(&business, request).await
        }));
    }

    let (mut won, mut lost) = (0, 0);
    for h in handles {
        match h.await {
            Ok(Ok(_)) => won += 1,
            Ok(Err(EngineError::Conflict { .. })) => lost += 1,
            Ok(Err(e)) => eprintln!("unexpected: {e}"),
            Err(e) => eprintln!("task failed: {e}"),
        }
    }
    println!(
        "  {contenders} commits for one slot in {:.2}ms: {won} won, {lost} conflicts",
        start.elapsed().as_secs_f64() * 1000.0
    );
}

async fn phase3_availability(bench: &Bench, rounds: usize) {
    let engine = AvailabilityEngine::default();
    let date = bench_date();
    let mut latencies = Vec::with_capacity(rounds);
    for i in 0..rounds {
        let id = BusinessId(format!("bench_{}", i % BUSINESSES));
        let Some(business) = bench.directory.business(&id).await else {
            continue;
        };
        let now = business.local_now(Utc::now());
        let t = Instant::now();
        let _ = engine
            .free_slots(bench.tenants.as_ref(), &business, 30, date, now)
            .await;
        latencies.push(t.elapsed());
    }
    print_latency("free_slots (grid and smart)", &mut latencies);
}

#[tokio::main]
async fn main() {
    let customers: usize = std::env::var("BENCH_CUSTOMERS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(400);

    println!("=== chatbook stress benchmark ===\n");

    let bench = setup();

    println!("[phase 1] concurrent booking conversations");
    phase1_conversations(&bench, customers).await;

    println!("\n[phase 2] contention on a single slot");
    phase2_slot_contention(&bench, 64).await;

    println!("\n[phase 3] availability latency");
    phase3_availability(&bench, 2_000).await;

    println!("\n=== done ===");
}
