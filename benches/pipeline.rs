use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;
use uuid::Uuid;

use vrswatch::monitor::project;
use vrswatch::transport::InMemoryServer;
use vrswatch::{
    ChangeKind, ColumnNames, ConnectionManager, DatabaseSchema, Row, RowClassifier, RowTarget, TableUpdates,
    WatchConfig,
};

const PORTS: &str = "Nuage_Port_Table";

/// An `update` payload touching 256 ports; the target is the last one.
fn update_payload() -> serde_json::Value {
    let mut rows = serde_json::Map::new();
    for i in 0..256u32 {
        rows.insert(
            Uuid::new_v4().to_string(),
            json!({
                "old": {"ip_addr": ""},
                "new": {
                    "name": format!("port-{i}"),
                    "ip_addr": format!("10.0.{}.{}", i / 250, i % 250 + 2),
                    "gateway": "10.0.0.1",
                    "subnet_mask": ["set", ["255.255.0.0"]]
                }
            }),
        );
    }
    json!({ PORTS: rows })
}

fn bench_decode_classify_project(c: &mut Criterion) {
    let payload = update_payload();
    let classifier = RowClassifier::new("name");
    let columns = ColumnNames::default();
    let target = RowTarget::named("port-255");

    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Elements(256));

    group.bench_function("decode_256_rows", |b| {
        b.iter(|| TableUpdates::from_json(&payload).unwrap());
    });

    let batch = TableUpdates::from_json(&payload).unwrap();
    group.bench_function("classify_project_256_rows", |b| {
        b.iter(|| {
            let hit = classifier.classify(&batch, ChangeKind::Update, Some(&target)).unwrap();
            project(hit.row, &columns).unwrap()
        });
    });
    group.finish();
}

fn bench_update_to_resolution(c: &mut Criterion) {
    c.bench_function("pipeline/update_to_resolution", |b| {
        // Fresh server per sample; only the update-to-record path is timed.
        b.iter_custom(|iters| {
            let server = InMemoryServer::new([DatabaseSchema::new("Open_vSwitch")
                .with_table(PORTS, &["name", "ip_addr", "gateway", "subnet_mask"])]);
            let manager = ConnectionManager::connect(Arc::new(server.connector()), WatchConfig::default()).unwrap();

            let mut total = Duration::ZERO;
            for i in 0..iters {
                let id = Uuid::new_v4();
                let name = format!("port-{i}");
                server
                    .insert_row(PORTS, id, Row::new().with("name", name.as_str()).with("ip_addr", ""))
                    .unwrap();
                let watch = manager.wait_for_row_resolution(&name).unwrap();

                let start = Instant::now();
                server
                    .update_row(
                        PORTS,
                        id,
                        Row::new()
                            .with("ip_addr", "10.0.0.2")
                            .with("gateway", "10.0.0.1")
                            .with("subnet_mask", "255.255.255.0"),
                    )
                    .unwrap();
                watch.recv_timeout(Duration::from_secs(5)).unwrap();
                total += start.elapsed();
            }
            total
        });
    });
}

criterion_group!(pipeline, bench_decode_classify_project, bench_update_to_resolution);
criterion_main!(pipeline);
