use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, Utc};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

/// Nights are spread over this many days ahead of today.
const HORIZON: u64 = 700;

async fn connect(host: &str, port: u16, role: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("staylock")
        .user(format!("{role}:{}", Ulid::new()))
        .password(std::env::var("STAYLOCK_PASSWORD").unwrap_or_else(|_| "staylock".into()));

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn day(offset: u64) -> NaiveDate {
    Utc::now()
        .date_naive()
        .checked_add_days(Days::new(offset))
        .expect("date in range")
}

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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

#[derive(Default)]
struct Outcomes {
    booked: AtomicUsize,
    unavailable: AtomicUsize,
    retry_later: AtomicUsize,
    other: AtomicUsize,
}

impl Outcomes {
    fn record(&self, result: &Result<(), tokio_postgres::Error>) {
        let slot = match result {
            Ok(()) => &self.booked,
            Err(e) if e.code() == Some(&SqlState::EXCLUSION_VIOLATION) => &self.unavailable,
            Err(e) if e.code() == Some(&SqlState::T_R_SERIALIZATION_FAILURE) => &self.retry_later,
            Err(_) => &self.other,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    fn print(&self) {
        println!(
            "    booked={}, unavailable={}, contention={}, other errors={}",
            self.booked.load(Ordering::Relaxed),
            self.unavailable.load(Ordering::Relaxed),
            self.retry_later.load(Ordering::Relaxed),
            self.other.load(Ordering::Relaxed),
        );
    }
}

async fn book_night(client: &Client, room: Ulid, night: u64) -> Result<(), tokio_postgres::Error> {
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, room_id, check_in, check_out) VALUES ('{}', '{room}', '{}', '{}')",
            Ulid::new(),
            day(night),
            day(night + 1)
        ))
        .await
}

/// Rooms bookable a week from now, as served by the running catalog.
async fn discover_rooms(client: &Client) -> Vec<Ulid> {
    let messages = client
        .simple_query(&format!(
            "SELECT * FROM available_rooms WHERE check_in = '{}' AND check_out = '{}'",
            day(7),
            day(8)
        ))
        .await
        .expect("room discovery failed");
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get("id").and_then(|id| id.parse().ok()),
            _ => None,
        })
        .collect()
}

async fn phase1_sequential(host: &str, port: u16, room: Ulid) {
    let client = connect(host, port, "customer").await;
    let outcomes = Outcomes::default();

    let mut latencies = Vec::with_capacity(HORIZON as usize);
    let start = Instant::now();

    for night in 1..=HORIZON {
        let t = Instant::now();
        outcomes.record(&book_night(&client, room, night).await);
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = HORIZON as f64 / elapsed.as_secs_f64();
    println!("  {HORIZON} booking attempts in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    outcomes.print();
    print_latency("write latency", &mut latencies);
}

/// Every task fights for the same nights of one room; at most one booking per
/// night may win.
async fn phase2_contention(host: &str, port: u16, room: Ulid) {
    let n_tasks = 16;
    let nights = 100;

    let outcomes = Arc::new(Outcomes::default());
    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        let outcomes = outcomes.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, "customer").await;
            for night in 1..=nights {
                outcomes.record(&book_night(&client, room, night).await);
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * nights;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {nights} nights = {total} attempts in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    outcomes.print();
    let booked = outcomes.booked.load(Ordering::Relaxed);
    if booked > nights as usize {
        println!("  DOUBLE BOOKING: {booked} bookings won for {nights} nights");
    }
}

async fn phase3_read_under_load(host: &str, port: u16, write_rooms: Vec<Ulid>) {
    let stop = Arc::new(AtomicBool::new(false));
    let outcomes = Arc::new(Outcomes::default());
    let mut writer_handles = Vec::new();

    for room in write_rooms {
        let host = host.to_string();
        let stop = stop.clone();
        let outcomes = outcomes.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, "customer").await;
            let mut night = 1;
            while !stop.load(Ordering::Relaxed) && night <= HORIZON {
                outcomes.record(&book_night(&client, room, night).await);
                night += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, "customer").await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let from = 1 + ((r * reads_per_reader + i) as u64 % (HORIZON - 7));
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM available_rooms WHERE check_in = '{}' AND check_out = '{}'",
                        day(from),
                        day(from + 3)
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("available_rooms query", &mut all_latencies);
    println!("  background writers:");
    outcomes.print();
}

async fn phase4_connection_storm(host: &str, port: u16, room: Ulid) {
    let n_conns = 50;
    let ops_per_conn = 10u64;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, "customer").await;
            for i in 0..ops_per_conn {
                let night = 1 + (c * ops_per_conn + i) % HORIZON;
                // Conflicts are expected; the connection only has to survive.
                let _ = book_night(&client, room, night).await;
                client
                    .simple_query("SELECT * FROM bookings")
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("STAYLOCK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("STAYLOCK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid STAYLOCK_PORT");

    println!("=== staylock stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[setup]");
    let setup_client = connect(&host, port, "manager").await;
    let rooms = discover_rooms(&setup_client).await;
    drop(setup_client);
    println!("  discovered {} bookable rooms", rooms.len());
    if rooms.len() < 4 {
        eprintln!("need at least 4 rooms in the catalog (try STAYLOCK_CATALOG=demos/rooms.json)");
        return;
    }

    println!("\n[phase 1] sequential write throughput");
    phase1_sequential(&host, port, rooms[0]).await;

    println!("\n[phase 2] contended writes on one room");
    phase2_contention(&host, port, rooms[1]).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port, rooms[2..rooms.len().min(5)].to_vec()).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port, rooms[rooms.len() - 1]).await;

    println!("\n=== benchmark complete ===");
}
