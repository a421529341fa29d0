use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::HarvestError;
use crate::normalize::{COORDS_JSON, FEATURE_ID};
use crate::token::{compute_token, matches_token};
use crate::wikidata::{Candidate, QueryClient};

pub type Row = Map<String, Value>;

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub business_key: String,
    pub resolved_field: String,
    pub batch_size: usize,
    pub min_batch_interval: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub rows: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub ambiguous: usize,
}

pub struct Reconciler<Q> {
    client: Q,
    options: ReconcileOptions,
}

impl<Q: QueryClient> Reconciler<Q> {
    pub fn new(client: Q, options: ReconcileOptions) -> Self {
        Self { client, options }
    }

    /// Resolves the external identifier for every row, adding exactly one
    /// field (`options.resolved_field`, empty when undetermined) per row.
    pub fn reconcile(&self, rows: &mut [Row]) -> Result<ReconcileSummary, HarvestError> {
        let candidates = self.lookup_candidates(rows)?;

        let mut summary = ReconcileSummary {
            rows: rows.len(),
            ..ReconcileSummary::default()
        };

        for row in rows.iter_mut() {
            let code = cell_text(row, &self.options.business_key);
            let hits = candidates.get(&code).map(Vec::as_slice).unwrap_or(&[]);

            let resolved = match hits {
                [] => {
                    summary.unresolved += 1;
                    String::new()
                }
                [single] => single.entity.clone(),
                many => {
                    // Several entities share the key: the description tag
                    // decides, and only a single exact match counts.
                    let token = compute_token(
                        &cell_text(row, FEATURE_ID),
                        &cell_text(row, COORDS_JSON),
                    );
                    let tagged: Vec<&Candidate> = many
                        .iter()
                        .filter(|candidate| matches_token(&candidate.description, &token))
                        .collect();
                    if let [winner] = tagged.as_slice() {
                        winner.entity.clone()
                    } else {
                        summary.ambiguous += 1;
                        String::new()
                    }
                }
            };

            if !resolved.is_empty() {
                summary.resolved += 1;
            }
            row.insert(
                self.options.resolved_field.clone(),
                Value::String(resolved),
            );
        }

        tracing::info!(
            "reconcile summary: rows={} resolved={} unresolved={} ambiguous={}",
            summary.rows,
            summary.resolved,
            summary.unresolved,
            summary.ambiguous,
        );
        Ok(summary)
    }

    fn lookup_candidates(
        &self,
        rows: &[Row],
    ) -> Result<HashMap<String, Vec<Candidate>>, HarvestError> {
        let mut codes: Vec<String> = rows
            .iter()
            .map(|row| cell_text(row, &self.options.business_key))
            .filter(|code| !code.is_empty())
            .collect();
        codes.sort();
        codes.dedup();
        tracing::info!("distinct business keys to resolve: {}", codes.len());

        let mut candidates: HashMap<String, Vec<Candidate>> = HashMap::new();
        let mut total = 0usize;
        let mut previous_batch_start: Option<Instant> = None;

        for batch in codes.chunks(self.options.batch_size.max(1)) {
            // Etiquette floor: consecutive batch requests must start at
            // least min_batch_interval apart, however fast the last one was.
            if let Some(started) = previous_batch_start {
                let elapsed = started.elapsed();
                if elapsed < self.options.min_batch_interval {
                    thread::sleep(self.options.min_batch_interval - elapsed);
                }
            }
            previous_batch_start = Some(Instant::now());

            let bindings = self.client.lookup_codes(batch)?;
            for (code, candidate) in bindings {
                candidates.entry(code).or_default().push(candidate);
                total += 1;
            }
            tracing::info!("batch of {} keys -> {total} candidates total", batch.len());
        }

        Ok(candidates)
    }
}

fn cell_text(row: &Row, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(text)) => text.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::token::ext_tag;

    struct CannedQuery {
        by_code: HashMap<String, Vec<Candidate>>,
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl CannedQuery {
        fn new(entries: Vec<(&str, Vec<Candidate>)>) -> Self {
            Self {
                by_code: entries
                    .into_iter()
                    .map(|(code, candidates)| (code.to_string(), candidates))
                    .collect(),
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    impl QueryClient for CannedQuery {
        fn lookup_codes(
            &self,
            codes: &[String],
        ) -> Result<Vec<(String, Candidate)>, HarvestError> {
            self.batches.lock().unwrap().push(codes.to_vec());
            let mut pairs = Vec::new();
            for code in codes {
                for candidate in self.by_code.get(code).cloned().unwrap_or_default() {
                    pairs.push((code.clone(), candidate));
                }
            }
            Ok(pairs)
        }
    }

    fn candidate(entity: &str, description: &str) -> Candidate {
        Candidate {
            entity: entity.to_string(),
            description: description.to_string(),
        }
    }

    fn row(code: &str, feature_id: &str, coords: &str) -> Row {
        let mut row = Row::new();
        row.insert("_feature_id".to_string(), Value::String(feature_id.to_string()));
        row.insert("Codigo".to_string(), Value::String(code.to_string()));
        row.insert("_geometry_type".to_string(), Value::String("MultiLineString".to_string()));
        row.insert("_coords_json".to_string(), Value::String(coords.to_string()));
        row
    }

    fn options(batch_size: usize, interval: Duration) -> ReconcileOptions {
        ReconcileOptions {
            business_key: "Codigo".to_string(),
            resolved_field: "wikidata".to_string(),
            batch_size,
            min_batch_interval: interval,
        }
    }

    #[test]
    fn single_candidate_resolves_directly() {
        let client = CannedQuery::new(vec![("CAR-SAD500", vec![candidate("Q1", "")])]);
        let reconciler = Reconciler::new(client, options(50, Duration::ZERO));

        let mut rows = vec![row("CAR-SAD500", "1", "[[[1,2]]]")];
        let summary = reconciler.reconcile(&mut rows).unwrap();

        assert_eq!(rows[0]["wikidata"], Value::String("Q1".to_string()));
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.unresolved, 0);
        assert_eq!(summary.ambiguous, 0);
    }

    #[test]
    fn no_candidates_counts_unresolved() {
        let client = CannedQuery::new(vec![]);
        let reconciler = Reconciler::new(client, options(50, Duration::ZERO));

        let mut rows = vec![row("UNKNOWN", "1", "[[[1,2]]]")];
        let summary = reconciler.reconcile(&mut rows).unwrap();

        assert_eq!(rows[0]["wikidata"], Value::String(String::new()));
        assert_eq!(summary.resolved, 0);
        assert_eq!(summary.unresolved, 1);
    }

    #[test]
    fn tag_match_breaks_ties() {
        let coords = "[[[1.0,2.0],[3.0,4.0]]]";
        let token = compute_token("42", coords);
        let client = CannedQuery::new(vec![(
            "X",
            vec![
                candidate("Q1", &format!("foo {}", ext_tag(&token))),
                candidate("Q2", "bar [EXT:def456def456]"),
            ],
        )]);
        let reconciler = Reconciler::new(client, options(50, Duration::ZERO));

        let mut rows = vec![row("X", "42", coords)];
        let summary = reconciler.reconcile(&mut rows).unwrap();

        assert_eq!(rows[0]["wikidata"], Value::String("Q1".to_string()));
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.ambiguous, 0);
    }

    #[test]
    fn unmatched_tags_count_ambiguous() {
        let client = CannedQuery::new(vec![(
            "X",
            vec![
                candidate("Q1", "foo [EXT:aaaaaaaaaaaa]"),
                candidate("Q2", "bar [EXT:bbbbbbbbbbbb]"),
            ],
        )]);
        let reconciler = Reconciler::new(client, options(50, Duration::ZERO));

        let mut rows = vec![row("X", "42", "[[[9.0,9.0]]]")];
        let summary = reconciler.reconcile(&mut rows).unwrap();

        assert_eq!(rows[0]["wikidata"], Value::String(String::new()));
        assert_eq!(summary.resolved, 0);
        assert_eq!(summary.ambiguous, 1);
    }

    #[test]
    fn batches_are_sorted_and_bounded() {
        let client = CannedQuery::new(vec![]);
        let reconciler = Reconciler::new(&client, options(2, Duration::ZERO));

        let mut rows = vec![
            row("C", "1", "[]"),
            row("A", "2", "[]"),
            row("B", "3", "[]"),
            row("A", "4", "[]"),
            row("", "5", "[]"),
        ];
        reconciler.reconcile(&mut rows).unwrap();

        let batches = client.batches.lock().unwrap();
        assert_eq!(*batches, vec![
            vec!["A".to_string(), "B".to_string()],
            vec!["C".to_string()],
        ]);
    }

    #[test]
    fn batch_starts_respect_minimum_interval() {
        let client = CannedQuery::new(vec![]);
        let reconciler = Reconciler::new(&client, options(1, Duration::from_millis(40)));

        let mut rows = vec![row("A", "1", "[]"), row("B", "2", "[]"), row("C", "3", "[]")];
        let started = Instant::now();
        reconciler.reconcile(&mut rows).unwrap();

        // Three batches, two enforced gaps.
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn reconcile_twice_is_idempotent() {
        let coords = "[[[1.0,2.0],[3.0,4.0]]]";
        let token = compute_token("42", coords);
        let client = CannedQuery::new(vec![
            ("X", vec![
                candidate("Q1", &format!("foo {}", ext_tag(&token))),
                candidate("Q2", "bar"),
            ]),
            ("Y", vec![candidate("Q7", "")]),
        ]);
        let reconciler = Reconciler::new(&client, options(50, Duration::ZERO));

        let mut first = vec![row("X", "42", coords), row("Y", "9", "[]")];
        let mut second = first.clone();
        let summary_first = reconciler.reconcile(&mut first).unwrap();
        let summary_second = reconciler.reconcile(&mut second).unwrap();

        assert_eq!(summary_first, summary_second);
        assert_eq!(first, second);
    }
}
