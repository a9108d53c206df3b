use chrono::{Duration, Local, NaiveDateTime};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use supplycheck::matcher::MatchIndex;
use supplycheck::prelude::*;

const REFERENCE_COLUMNS: [&str; 6] = [
    "①薬剤区分",
    "③成分名",
    "④規格単位",
    "⑤YJコード",
    "⑥品名",
    "⑳当該品目の情報を更新した日",
];

// Synthetic MHLW table: `rows` drugs, updates spread over the last 60 days
fn reference_table(rows: usize, now: NaiveDateTime) -> ReferenceTable {
    let data: Vec<Vec<CellValue>> = (0..rows)
        .map(|i| {
            vec![
                CellValue::from("内用薬"),
                CellValue::from(format!("成分{}", i / 3)),
                CellValue::from(format!("{}mg1錠", 5 * (i % 3 + 1))),
                CellValue::from(format!("{:07}F{:04}", i, i % 10_000)),
                CellValue::from(format!("ｻﾝﾌﾟﾙ錠{}mg", i)),
                CellValue::from(now - Duration::days((i % 60) as i64)),
            ]
        })
        .collect();
    let table = Table::from_rows(&REFERENCE_COLUMNS, data);
    ReferenceTable::from_table(table, &ColumnPatterns::default())
}

// Pharmacy list: half by code, a quarter by name only, the rest unknown
fn pharmacy_table(rows: usize, reference_rows: usize) -> Table {
    let data: Vec<Vec<CellValue>> = (0..rows)
        .map(|i| {
            let r = (i * 7) % reference_rows;
            match i % 4 {
                0 | 1 => vec![
                    CellValue::from(format!("{:07}F{:04}", r, r % 10_000)),
                    CellValue::from(format!("サンプル錠{}mg", r)),
                ],
                2 => vec![CellValue::Empty, CellValue::from(format!("サンプル錠{}mg", r))],
                _ => vec![CellValue::from(format!("UNKNOWN{}", i)), CellValue::from("未収載品")],
            }
        })
        .collect();
    Table::from_rows(&["YJコード", "医薬品名"], data)
}

fn benchmark_normalize(c: &mut Criterion) {
    c.bench_function("normalize_text_fullwidth", |b| {
        b.iter(|| normalize_text(black_box("  ﾛｷｿﾆﾝ錠６０ｍｇ　ＹＪ１１４９０１９Ｆ１５６０  ")))
    });
}

fn benchmark_column_resolution(c: &mut Criterion) {
    let schema: Vec<String> = (0..40)
        .map(|i| format!("列{}", i))
        .chain(REFERENCE_COLUMNS.iter().map(|s| s.to_string()))
        .collect();
    let patterns = ColumnPatterns::default();

    c.bench_function("resolve_reference_columns", |b| {
        b.iter(|| patterns.resolve(black_box(&schema)))
    });
}

fn benchmark_match_index(c: &mut Criterion) {
    let now = Local::now().naive_local();
    let mut group = c.benchmark_group("match_index_build");
    for size in [1_000usize, 10_000, 20_000] {
        let reference = reference_table(size, now);
        group.bench_with_input(BenchmarkId::from_parameter(size), &reference, |b, reference| {
            b.iter(|| MatchIndex::build(black_box(reference)))
        });
    }
    group.finish();
}

fn benchmark_match_and_filter(c: &mut Criterion) {
    let now = Local::now().naive_local();
    let reference = Arc::new(reference_table(20_000, now));
    let matcher = SupplyMatcher::new(Some(reference), ColumnPatterns::default());

    let mut group = c.benchmark_group("match_and_filter");
    group.sample_size(20);
    for size in [100usize, 1_000, 5_000] {
        let pharmacy = pharmacy_table(size, 20_000);
        group.bench_with_input(BenchmarkId::from_parameter(size), &pharmacy, |b, pharmacy| {
            b.iter(|| matcher.match_and_filter_at(black_box(pharmacy), 10, now))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_normalize,
    benchmark_column_resolution,
    benchmark_match_index,
    benchmark_match_and_filter
);
criterion_main!(benches);
