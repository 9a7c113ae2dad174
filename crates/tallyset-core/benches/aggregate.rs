use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tallyset_core::aggregate::{AggregatorConfig, SetAggregator};
use tallyset_core::catalogue::parse_catalogue_str;
use tallyset_core::engine::CatalogueRuleEngine;
use tallyset_core::merge::{Grouping, ResolvedSubmission};
use tallyset_core::model::{Gender, SourceTag, TestTaker, TestTakerId};
use tallyset_core::progress::{CancellationFlag, NoopObserver};

fn catalogue_toml() -> String {
    let mut toml = String::new();
    for set in 1..=4 {
        toml.push_str(&format!(
            "[[sets]]\nid = \"set{set}\"\nname = \"Set {set}\"\ninstruments = [\"I{set}a\", \"I{set}b\"]\n\n"
        ));
    }
    for set in 1..=4 {
        for suffix in ["a", "b"] {
            toml.push_str(&format!("[[instruments]]\nid = \"I{set}{suffix}\"\nquestions = ["));
            for q in 1..=20 {
                toml.push_str(&format!("{{ id = \"I{set}{suffix}_Q{q}\", correct = \"1\" }}, "));
            }
            toml.push_str("]\ntermination = { type = \"consecutive_incorrect\", threshold = 5 }\n\n");
        }
    }
    toml
}

fn bench_aggregate(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let catalogue = Arc::new(parse_catalogue_str(&catalogue_toml(), Path::new("bench.toml")).unwrap());
    let aggregator = SetAggregator::new(
        Arc::new(CatalogueRuleEngine::new(Arc::clone(&catalogue))),
        Arc::clone(&catalogue),
        AggregatorConfig::default(),
    );

    let mut group = c.benchmark_group("aggregate");
    for count in [100, 1000] {
        let mut grouping = Grouping::default();
        let mut takers = Vec::with_capacity(count);
        for t in 0..count {
            let id = TestTakerId::normalize(&format!("C{t}"), "C").unwrap();
            let fields = catalogue
                .instruments
                .iter()
                .flat_map(|i| i.questions.iter().take(12))
                .map(|q| (q.id.clone(), if t % 3 == 0 { "0" } else { "1" }.to_string()))
                .collect();
            grouping.groups.insert(
                id.clone(),
                vec![ResolvedSubmission {
                    id: format!("J{t}"),
                    created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
                    source: SourceTag::Primary,
                    fields,
                }],
            );
            takers.push(TestTaker {
                id,
                name: String::new(),
                gender: Some(Gender::Female),
                class_id: None,
                school_id: None,
            });
        }

        group.bench_function(format!("takers={count}"), |b| {
            b.iter(|| {
                rt.block_on(aggregator.aggregate(
                    black_box(&takers),
                    black_box(&grouping),
                    Arc::new(NoopObserver),
                    &CancellationFlag::new(),
                ))
                .unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_aggregate);
criterion_main!(benches);
