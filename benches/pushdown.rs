//! Benchmarks for constraint and ORDER BY pushdown.
//!
//! `best_index` runs for every candidate plan SQLite considers, often several
//! times per statement, so compilation sits on the query-planning hot path.
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use remote_vtab::db::FieldType;
use remote_vtab::vtab::{
    compile, ConstraintOp, ConstraintSpec, OrderTerm, ScanRequest, TableDescriptor,
};

fn table(columns: usize) -> TableDescriptor {
    TableDescriptor {
        connection_string: "host=bench".to_string(),
        remote_table_name: "events".to_string(),
        column_names: (0..columns).map(|i| format!("col_{i}")).collect(),
        column_types: (0..columns)
            .map(|i| match i % 3 {
                0 => FieldType::Int64,
                1 => FieldType::Float64,
                _ => FieldType::String,
            })
            .collect(),
        initial_row_count: 1_000_000,
    }
}

fn constraint(column: i32, op: ConstraintOp, usable: bool) -> ConstraintSpec {
    ConstraintSpec { column, op, usable }
}

fn requests() -> Vec<(&'static str, ScanRequest)> {
    vec![
        ("full_scan", ScanRequest::default()),
        (
            "single_eq",
            ScanRequest {
                constraints: vec![constraint(0, ConstraintOp::Eq, true)],
                order_by: vec![],
            },
        ),
        (
            "range_and_order",
            ScanRequest {
                constraints: vec![
                    constraint(0, ConstraintOp::Ge, true),
                    constraint(0, ConstraintOp::Lt, true),
                    constraint(2, ConstraintOp::Like, true),
                ],
                order_by: vec![
                    OrderTerm { column: 1, desc: true },
                    OrderTerm { column: 0, desc: false },
                ],
            },
        ),
        (
            "mixed_usability",
            ScanRequest {
                constraints: (0..16)
                    .map(|i| {
                        let op = if i % 4 == 3 { ConstraintOp::Other } else { ConstraintOp::Eq };
                        constraint(i % 20, op, i % 2 == 0)
                    })
                    .collect(),
                order_by: vec![OrderTerm { column: -1, desc: false }],
            },
        ),
    ]
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let table = table(20);

    for (name, request) in requests() {
        group.bench_with_input(BenchmarkId::new("plan", name), &request, |b, request| {
            b.iter(|| compile(black_box(&table), black_box(request)))
        });
    }
    group.finish();
}

fn bench_wide_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("wide_table");

    for columns in [10, 100, 1000] {
        let table = table(columns);
        let request = ScanRequest {
            constraints: (0..columns as i32)
                .map(|i| constraint(i, ConstraintOp::Eq, true))
                .collect(),
            order_by: vec![OrderTerm { column: 0, desc: true }],
        };
        group.bench_with_input(BenchmarkId::new("all_columns", columns), &request, |b, request| {
            b.iter(|| compile(black_box(&table), black_box(request)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compile, bench_wide_table);
criterion_main!(benches);
