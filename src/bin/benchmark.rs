//! Performance benchmarks for the FileVault server
//!
//! Measures latency and throughput of INSERT and SELECT, one connection per
//! request, from a single client and from many concurrent clients.

use filevault::Client;
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

#[derive(Debug)]
struct BenchmarkResults {
    operation: String,
    total_operations: usize,
    duration: Duration,
    ops_per_second: f64,
    avg_latency_ms: f64,
    p95_latency_ms: f64,
    p99_latency_ms: f64,
}

impl BenchmarkResults {
    fn new(operation: String, total_operations: usize, duration: Duration, latencies: &mut [Duration]) -> Self {
        latencies.sort();

        let ops_per_second = total_operations as f64 / duration.as_secs_f64();
        let avg_latency_ms = latencies.iter().map(|d| d.as_secs_f64() * 1000.0).sum::<f64>()
            / latencies.len().max(1) as f64;

        let p95_index = (latencies.len() as f64 * 0.95) as usize;
        let p99_index = (latencies.len() as f64 * 0.99) as usize;

        let p95_latency_ms = latencies.get(p95_index).unwrap_or(&Duration::ZERO).as_secs_f64() * 1000.0;
        let p99_latency_ms = latencies.get(p99_index).unwrap_or(&Duration::ZERO).as_secs_f64() * 1000.0;

        Self {
            operation,
            total_operations,
            duration,
            ops_per_second,
            avg_latency_ms,
            p95_latency_ms,
            p99_latency_ms,
        }
    }

    fn print(&self) {
        println!("=== {} Benchmark Results ===", self.operation);
        println!("Total operations: {}", self.total_operations);
        println!("Duration: {:.2}s", self.duration.as_secs_f64());
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
        println!("Average latency: {:.2}ms", self.avg_latency_ms);
        println!("P95 latency: {:.2}ms", self.p95_latency_ms);
        println!("P99 latency: {:.2}ms", self.p99_latency_ms);
        println!();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server_addr = env::args().nth(1).unwrap_or_else(|| "127.0.0.1:3490".to_string());
    let client = Client::new(server_addr.clone());

    println!("FileVault Performance Benchmarks");
    println!("================================");
    println!("Server: {}", server_addr);
    println!();

    println!("Waiting for server to be ready...");
    while client.select("bench_probe").await.is_err() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    println!("Server is ready!");
    println!();

    benchmark_inserts(&client, 2000).await?.print();
    benchmark_selects(&client, 2000).await?.print();

    for num_clients in [10, 50, 100] {
        benchmark_concurrent_inserts(&server_addr, num_clients, 100)
            .await?
            .print();
    }

    Ok(())
}

async fn benchmark_inserts(client: &Client, num_operations: usize) -> Result<BenchmarkResults, Box<dyn std::error::Error>> {
    let mut latencies = Vec::with_capacity(num_operations);
    let start = Instant::now();

    for i in 0..num_operations {
        let key = format!("bench{}", i);
        let payload = format!("bench record {}", i);

        let op_start = Instant::now();
        client.insert(&key, payload.as_bytes()).await?;
        latencies.push(op_start.elapsed());
    }

    Ok(BenchmarkResults::new(
        "INSERT".to_string(),
        num_operations,
        start.elapsed(),
        &mut latencies,
    ))
}

async fn benchmark_selects(client: &Client, num_operations: usize) -> Result<BenchmarkResults, Box<dyn std::error::Error>> {
    let mut latencies = Vec::with_capacity(num_operations);
    let start = Instant::now();

    // Keys written by the INSERT run, so every SELECT hits a file
    for i in 0..num_operations {
        let key = format!("bench{}", i);

        let op_start = Instant::now();
        let _content = client.select(&key).await?;
        latencies.push(op_start.elapsed());
    }

    Ok(BenchmarkResults::new(
        "SELECT".to_string(),
        num_operations,
        start.elapsed(),
        &mut latencies,
    ))
}

async fn benchmark_concurrent_inserts(
    server_addr: &str,
    num_clients: usize,
    ops_per_client: usize,
) -> Result<BenchmarkResults, Box<dyn std::error::Error>> {
    let semaphore = Arc::new(Semaphore::new(num_clients));
    let mut handles = Vec::new();
    let mut all_latencies = Vec::new();

    let start = Instant::now();

    for client_id in 0..num_clients {
        let semaphore = Arc::clone(&semaphore);
        let client = Client::new(server_addr);

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.map_err(|e| e.to_string())?;
            let mut latencies = Vec::with_capacity(ops_per_client);

            for i in 0..ops_per_client {
                // Half the clients fight over shared keys
                let key = if client_id % 2 == 0 {
                    format!("hot{}", i % 10)
                } else {
                    format!("c{}k{}", client_id, i)
                };
                let payload = format!("client {} op {}", client_id, i);

                let op_start = Instant::now();
                client
                    .insert(&key, payload.as_bytes())
                    .await
                    .map_err(|e| format!("Insert error: {}", e))?;
                latencies.push(op_start.elapsed());
            }

            Ok::<Vec<Duration>, String>(latencies)
        }));
    }

    for handle in handles {
        let latencies = handle.await.map_err(|e| format!("Join error: {}", e))??;
        all_latencies.extend(latencies);
    }

    Ok(BenchmarkResults::new(
        format!("Concurrent INSERT ({} clients)", num_clients),
        num_clients * ops_per_client,
        start.elapsed(),
        &mut all_latencies,
    ))
}
