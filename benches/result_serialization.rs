//! Criterion timings for the two per-query hot paths outside the database: rendering
//! result rows to JSON and rewriting `:name` placeholders.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use dbqueue::json::rows_to_json;
use dbqueue::params::{convert_named_to_positional, parse_typed_parameters};
use dbqueue::types::{CellValue, EngineType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Deterministic mixed-type rows so every run serialises the same bytes.
fn sample_rows(count: usize) -> (Vec<String>, Vec<Vec<CellValue>>) {
    let columns = ["id", "name", "score", "active", "note"]
        .iter()
        .map(|c| (*c).to_string())
        .collect();
    let mut rng = StdRng::seed_from_u64(1_234_567_890);
    let rows = (0..count)
        .map(|i| {
            vec![
                CellValue::Int(i64::try_from(i).unwrap_or(i64::MAX)),
                CellValue::Text(format!("name \"{i}\"\twith escapes")),
                CellValue::Float(rng.gen_range(0.0..1000.0)),
                CellValue::Bool(rng.gen_bool(0.5)),
                if rng.gen_bool(0.2) {
                    CellValue::Null
                } else {
                    CellValue::Text("12.50".into())
                },
            ]
        })
        .collect();
    (columns, rows)
}

fn bench_rows_to_json(c: &mut Criterion) {
    let mut group = c.benchmark_group("rows_to_json");
    for count in [10usize, 1_000, 10_000] {
        let (columns, rows) = sample_rows(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &rows, |b, rows| {
            b.iter(|| rows_to_json(black_box(&columns), black_box(rows)).expect("json"));
        });
    }
    group.finish();
}

fn bench_placeholders(c: &mut Criterion) {
    let template = "SELECT u.id, u.name FROM users u \
                    WHERE u.id = :userId AND u.name <> ':notAParam' \
                    AND u.created_at > :since AND u.id IN (:userId, :otherId) -- :comment\n\
                    AND u.data::text LIKE :pattern";
    let params = parse_typed_parameters(
        r#"{"INTEGER":{"userId":1,"otherId":2},"STRING":{"pattern":"%a%"},"DATETIME":{"since":"2024-01-02T03:04:05"}}"#,
    )
    .expect("parameters");

    let mut group = c.benchmark_group("convert_named_to_positional");
    for engine in [EngineType::Postgresql, EngineType::Sqlite] {
        group.bench_with_input(BenchmarkId::from_parameter(engine.as_str()), &engine, |b, engine| {
            b.iter(|| {
                convert_named_to_positional(black_box(template), black_box(&params), *engine)
                    .expect("convert")
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_rows_to_json, bench_placeholders);
criterion_main!(benches);
