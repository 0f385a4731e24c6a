// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic offline-sync usage example.
//!
//! Demonstrates, against the in-process remote (no server needed):
//! 1. Starting the engine
//! 2. Watching a table and receiving a realtime insert
//! 3. Deleting while offline, then syncing on reconnect
//! 4. An optimistic update that the server rejects (rollback)
//! 5. A chunked bulk upsert with progress
//! 6. Displaying metrics and shutting down
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use chrono::Utc;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use offline_sync::remote::{ChangeEvent, ChangeKind, ClientError, Filter, MemoryRemote};
use offline_sync::storage::{LocalStore, MemoryLocalStore};
use offline_sync::{ConsistencyEngine, EngineConfig, EntityRef, UpdateOutcome};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           offline-sync: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    let remote = MemoryRemote::new();
    let local = Arc::new(MemoryLocalStore::new());
    let config = EngineConfig {
        conflict_notify_recipients: vec!["moderator-1".into()],
        ..EngineConfig::immediate()
    };

    let engine = ConsistencyEngine::connect(
        config,
        Arc::new(remote.clone()),
        Arc::clone(&local) as Arc<dyn LocalStore>,
    )
    .await?;
    println!("   State: {}", engine.state());
    engine.start()?;
    println!("   ✅ Engine running! State: {}", engine.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Realtime: watch posts and receive an insert
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📡 Watching 'posts'...");
    let subscription = engine.watch("posts", &Filter::all()).await?;
    let again = engine.watch("posts", &Filter::all()).await?;
    println!("   └─ channel {} (second watch reused it: {})", subscription.channel_id, again.reused);

    remote
        .emit(ChangeEvent {
            kind: ChangeKind::Insert,
            table: "posts".into(),
            record: json!({"id": 42, "title": "Hello from the server"}),
            old_record: None,
            commit_timestamp: Utc::now(),
        })
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let post: EntityRef = "post/42".parse()?;
    println!("   └─ cached post/42: {}", local.get(&post).map(|c| c.payload).unwrap_or(Value::Null));

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Delete offline, sync on reconnect
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n✈️  Going offline and deleting post/42...");
    remote.set_offline(true);
    engine.delete(&post, Some("user-1".into())).await?;
    println!("   └─ local row gone: {}", !local.contains(&post));
    match engine.sync().await {
        Ok(report) => println!("   └─ unexpected sync success: {:?}", report),
        Err(e) => println!("   └─ sync while offline failed as expected: {}", e),
    }

    println!("\n📶 Back online, syncing...");
    remote.set_offline(false);
    let report = engine.sync().await?;
    println!("   └─ pushed={} pulled={} applied={}", report.pushed, report.pulled, report.applied);
    println!("   └─ remote tombstones: {}", remote.rows("deleted_records").len());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Optimistic update rejected by the server
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n✏️  Optimistic edit of post/7 (server will refuse)...");
    let posts = engine.optimistic::<Value>();
    let pending = posts
        .perform_update(
            "post/7",
            json!({"title": "edited"}),
            json!({"title": "original"}),
            || async { Err::<Value, _>(ClientError::http(403, "not your post")) },
        )
        .await?;
    println!("   └─ shown immediately: {:?}", posts.current_value("post/7").await?);
    match pending.outcome().await {
        UpdateOutcome::RolledBack { kind, restored, .. } => {
            println!("   └─ rolled back ({}): {} → {}", kind, kind.user_message(), restored)
        }
        other => println!("   └─ outcome: {:?}", other),
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Bulk upsert in chunks
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📦 Upserting 1200 comments in chunks of {}...", engine.batch_runner().chunk_size());
    let rows: Vec<Value> = (0..1200).map(|i| json!({"id": i, "body": format!("comment {}", i)})).collect();
    let (tx, mut rx) = mpsc::channel::<offline_sync::BatchProgress>(8);
    let progress = tokio::spawn(async move {
        while let Some(p) = rx.recv().await {
            println!(
                "   └─ batch {}/{} ({:.0}%)",
                p.completed_batches,
                p.total_batches,
                p.fraction() * 100.0
            );
        }
    });
    let result = engine
        .batch_runner()
        .upsert_all(engine.remote().as_ref(), "comments", rows, "id", Some(tx))
        .await;
    progress.await?;
    println!("   └─ succeeded={} failed={}", result.success_count, result.failed_count);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Status, metrics, shutdown
    // ─────────────────────────────────────────────────────────────────────────
    let status = engine.status().await?;
    println!("\n📊 Engine Status:");
    println!("   └─ {:?}", status);

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", engine.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, label_str, count, sum));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, labels, count, sum) in &histograms {
            println!("   │  └─ {}{} count={} sum={:.4}", name, labels, count, sum);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
