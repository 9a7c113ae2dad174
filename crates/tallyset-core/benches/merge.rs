use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tallyset_core::merge::{CrossSourceMerger, IdentityConfig, SecondaryFieldMap};
use tallyset_core::model::{AnswerTriple, RawSubmission, SourceTag};

const FIELD_MAP: &str = r#"
[fields]
student-id = { kind = "direct", key = "QID1" }
Q1 = { kind = "matrix_cell", parent = "QID5", child = "1" }
Q2 = { kind = "matrix_cell", parent = "QID5", child = "2" }
Q3 = { kind = "text_companion", base = "QID7" }
"#;

fn make_submissions(test_takers: usize, per_taker: usize) -> Vec<RawSubmission> {
    let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let mut out = Vec::with_capacity(test_takers * per_taker * 2);
    for t in 0..test_takers {
        for s in 0..per_taker {
            let at = base + Duration::minutes((t * per_taker + s) as i64);
            out.push(RawSubmission {
                id: format!("J{t}_{s}"),
                created_at: at,
                source: SourceTag::Primary,
                answers: (0..40)
                    .map(|q| AnswerTriple::named(&q.to_string(), &format!("F{q}"), "1"))
                    .chain(std::iter::once(AnswerTriple::named(
                        "3",
                        "student-id",
                        &format!("C{t}"),
                    )))
                    .collect(),
            });
            out.push(RawSubmission {
                id: format!("R{t}_{s}"),
                created_at: at + Duration::seconds(30),
                source: SourceTag::Secondary,
                answers: vec![
                    AnswerTriple::encoded("QID1", &t.to_string()),
                    AnswerTriple::encoded("QID5#1", "a"),
                    AnswerTriple::encoded("QID5#2", "b"),
                    AnswerTriple::encoded("QID7_TEXT", "free text"),
                ],
            });
        }
    }
    out
}

fn bench_group(c: &mut Criterion) {
    let field_map = SecondaryFieldMap::from_toml_str(FIELD_MAP).unwrap();
    let merger = CrossSourceMerger::new(&field_map, IdentityConfig::default());
    let mut group = c.benchmark_group("group");

    for takers in [100, 1000] {
        let submissions = make_submissions(takers, 3);
        group.bench_function(format!("takers={takers}"), |b| {
            b.iter(|| merger.group(black_box(&submissions)))
        });
    }

    group.finish();
}

fn bench_merge_one(c: &mut Criterion) {
    let field_map = SecondaryFieldMap::from_toml_str(FIELD_MAP).unwrap();
    let merger = CrossSourceMerger::new(&field_map, IdentityConfig::default());
    let mut group = c.benchmark_group("merge_one");

    for per_taker in [2, 10] {
        let submissions = make_submissions(1, per_taker);
        group.bench_function(format!("submissions={}", submissions.len()), |b| {
            b.iter(|| merger.merge(black_box(&submissions)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_group, bench_merge_one);
criterion_main!(benches);
