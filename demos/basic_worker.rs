// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic replica-sync worker example.
//!
//! Demonstrates, fully in memory:
//! 1. Wiring a worker with two replicas, one of them down
//! 2. Failover to the healthy replica and a bulk upsert into the primary
//! 3. Cache-aside reads with hit/miss tracking
//! 4. Cache invalidation after a sync run
//! 5. Displaying metrics (OTEL-compatible)
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_worker
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

use replica_sync::cache::{track, InMemoryKeyValueStore};
use replica_sync::jobs::SyncMode;
use replica_sync::replica::{Endpoint, QueryError, ReplicaBackend};
use replica_sync::scheduler::{JobDefinition, JobState};
use replica_sync::sql_value::SqlQuery;
use replica_sync::upsert::{InMemoryTables, TableSpec, UpsertRow};
use replica_sync::{ReplicaSyncConfig, SyncWorker};

/// Replicas that serve a fixed result set, except the ones marked down.
struct DemoReplicas {
    down: HashSet<String>,
    rows: Vec<UpsertRow>,
}

#[async_trait]
impl ReplicaBackend for DemoReplicas {
    type Connection = String;
    type Row = UpsertRow;

    async fn connect(&self, endpoint: &Endpoint) -> Result<String, QueryError> {
        if self.down.contains(&endpoint.key) {
            return Err(QueryError::Connect(format!("{} refused connection", endpoint.key)));
        }
        Ok(endpoint.key.clone())
    }

    async fn fetch(&self, _conn: &mut String, _query: &SqlQuery) -> Result<Vec<UpsertRow>, QueryError> {
        Ok(self.rows.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures all metrics for OTEL export)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           replica-sync: Basic Worker Example                  ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Wire the worker
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring worker...");

    let config = ReplicaSyncConfig {
        scheduler_name: "drep-worker".into(),
        // Keep failover quick for the demo
        max_retries: 1,
        ..Default::default()
    };

    let endpoints = vec![
        Endpoint::new("replica-a", 1, "postgres://sync@replica-a/gov"),
        Endpoint::new("replica-b", 2, "postgres://sync@replica-b/gov"),
    ];
    let replicas = Arc::new(DemoReplicas {
        down: HashSet::from(["replica-a".to_string()]),
        rows: (1..=5)
            .map(|i| {
                UpsertRow::new()
                    .with("drep_id", format!("drep1{i:03}"))
                    .with("voting_power", 1_000_i64 * i)
                    .with("metadata", json!({ "name": format!("DRep {i}") }))
            })
            .collect(),
    });
    let tables = Arc::new(InMemoryTables::new());
    let worker = SyncWorker::new(
        config,
        endpoints,
        replicas,
        tables.clone(),
        Arc::new(InMemoryKeyValueStore::new()),
    );

    worker.register_sync_with(
        JobDefinition::new("drep-list", "0 0 2 * * ?"),
        SqlQuery::new("SELECT drep_id, voting_power, metadata FROM drep_list"),
        Arc::new(|row: &UpsertRow| -> Result<UpsertRow, QueryError> { Ok(row.clone()) }),
        TableSpec::new("drep", &["drep_id"]).with_json_columns(&["metadata"]),
        SyncMode::Upsert,
        &["drep:count"],
    )?;
    worker.start()?;
    println!("   ✅ Worker started with jobs {:?}", worker.coordinator().job_names());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Read through the cache before any sync
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Reading drep:count through the cache...");
    let (count, lookups) = track(count_dreps(&worker, &tables)).await;
    println!("   └─ count = {count} ({})", lookups[0].outcome);
    let (count, lookups) = track(count_dreps(&worker, &tables)).await;
    println!("   └─ count = {count} ({})", lookups[0].outcome);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Run the sync job now instead of waiting for 02:00 UTC
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🚀 Triggering drep-list...");
    worker.coordinator().trigger("drep-list")?;
    while worker.coordinator().state("drep-list") == Some(JobState::Running) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    worker.cache().flush().await;
    if let Some(run) = worker.coordinator().last_run("drep-list") {
        println!("   └─ run {} via {}: {:?}", run.run_id, run.trigger, run.outcome);
    }
    println!("   └─ primary rows: {}", tables.row_count("drep"));

    // ─────────────────────────────────────────────────────────────────────────
    // 4. The sync invalidated the cached count
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Reading drep:count again...");
    let (count, lookups) = track(count_dreps(&worker, &tables)).await;
    println!("   └─ count = {count} ({})", lookups[0].outcome);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics (OTEL export format):");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    worker.shutdown().await;
    println!("   ✅ Shutdown complete! Cache writer: {:?}", worker.cache().writer_stats());

    Ok(())
}

async fn count_dreps(worker: &SyncWorker<DemoReplicas>, tables: &InMemoryTables) -> usize {
    worker
        .cache()
        .get_or_set("drep:count", Some(Duration::from_secs(60)), || async {
            Ok::<_, std::convert::Infallible>(tables.row_count("drep"))
        })
        .await
        .unwrap_or_default()
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => v.into_inner().to_string(),
                DebugValue::Histogram(samples) => {
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    format!("count={} sum={:.6}", samples.len(), sum)
                }
            };
            format!("{}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();
    for line in &lines {
        println!("   └─ {line}");
    }
}
