use chunkwise::extract::{extract, extract_with_strategy};
use chunkwise::ledger::ProgressLedger;
use chunkwise::record::Record;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn synthetic_records(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            Record::new(format!("record-{i:05}"))
                .with_field("name", format!("Record number {i}"))
                .with_field("flavor", "A long line of text that the oracle is asked to rewrite.")
        })
        .collect()
}

fn wrapped_reply(records: &[Record]) -> String {
    let body = serde_json::to_string_pretty(records).expect("serialize records");
    format!("Here is the transformed data:\n\n```json\n{body}\n```\n\nLet me know if you need more.")
}

fn bench_extract(c: &mut Criterion) {
    let records = synthetic_records(40);
    let clean = wrapped_reply(&records);
    c.bench_function("extract_bracket_slice_40", |b| {
        b.iter(|| black_box(extract(black_box(&clean))));
    });

    // Stray quote inside a value and a trailing comma force the repair strategy.
    let broken = clean
        .replacen("Record number 7", "Record \"number\" 7", 1)
        .replacen("}\n]", "},\n]", 1);
    c.bench_function("extract_repair_quotes_40", |b| {
        b.iter(|| black_box(extract_with_strategy(black_box(&broken))));
    });
}

fn bench_ledger_merge(c: &mut Criterion) {
    let temp = tempfile::tempdir().expect("tempdir");
    let input = synthetic_records(2_000);
    let path = temp.path().join("out.json");

    c.bench_function("ledger_merge_2000_in_batches_of_40", |b| {
        b.iter(|| {
            let mut ledger = ProgressLedger::new(&path, &input);
            for chunk in input.chunks(40) {
                ledger.merge(chunk.to_vec()).expect("merge");
            }
            black_box(ledger.len());
        });
    });
}

criterion_group!(extract_core, bench_extract, bench_ledger_merge);
criterion_main!(extract_core);
