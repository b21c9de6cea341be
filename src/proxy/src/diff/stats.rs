use crate::diff::config::DiffConfig;
use crate::diff::qps::DiffQps;

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Aggregate per canonical statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanonicalStats {
    pub count: i64,
    pub total_duration: Duration,
}

/// One retained fastest/slowest statement, kept for the summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedResult {
    /// Deviation from main in permille; always positive, the side of the
    /// list says which direction.
    pub permille: i64,
    pub sql: String,
    pub id: u64,
    pub explained_by: Vec<u64>,
}

/// Bounded multimap keyed by permille; the smallest entries are trimmed
/// first so the extremes survive.
#[derive(Debug, Clone, Default)]
pub struct ResultsByPermille {
    entries: Vec<RetainedResult>,
}

impl ResultsByPermille {
    pub fn insert(&mut self, result: RetainedResult, cap: usize) {
        if cap == 0 {
            return;
        }
        if self.entries.len() >= cap {
            if result.permille < self.entries[0].permille {
                return;
            }
            self.entries.remove(0);
        }
        let at = self
            .entries
            .partition_point(|e| e.permille <= result.permille);
        self.entries.insert(at, result);
    }

    pub fn merge(&mut self, other: &ResultsByPermille, cap: usize) {
        for entry in &other.entries {
            self.insert(entry.clone(), cap);
        }
    }

    pub fn entries(&self) -> &[RetainedResult] {
        &self.entries
    }

    fn to_json(&self) -> Value {
        // largest deviation first
        Value::Array(
            self.entries
                .iter()
                .rev()
                .map(|e| {
                    json!({
                        "percent": e.permille as f64 / 10.0,
                        "sql": e.sql,
                        "id": e.id,
                        "explained_by": e.explained_by,
                    })
                })
                .collect(),
        )
    }
}

/// Counters shared by the main and the other backends.
#[derive(Debug, Clone, Default)]
pub struct DiffStats {
    total_duration: Duration,
    request_packets: i64,
    requests: i64,
    requests_responding: i64,
    requests_explainable: i64,
    responses: i64,
    explain_duration: Duration,
    explain_requests: i64,
    explain_responses: i64,
    canonicals: BTreeMap<String, CanonicalStats>,
}

impl DiffStats {
    pub fn inc_request_packets(&mut self) {
        self.request_packets += 1;
    }

    pub fn dec_request_packets(&mut self) {
        self.request_packets -= 1;
    }

    pub fn inc_requests(&mut self) {
        self.requests += 1;
    }

    pub fn dec_requests(&mut self) {
        self.requests -= 1;
    }

    pub fn inc_requests_responding(&mut self) {
        self.requests_responding += 1;
    }

    pub fn dec_requests_responding(&mut self) {
        self.requests_responding -= 1;
    }

    pub fn inc_requests_explainable(&mut self) {
        self.requests_explainable += 1;
    }

    pub fn dec_requests_explainable(&mut self) {
        self.requests_explainable -= 1;
    }

    pub fn inc_responses(&mut self) {
        self.responses += 1;
    }

    pub fn responses(&self) -> i64 {
        self.responses
    }

    pub fn inc_explain_requests(&mut self) {
        self.explain_requests += 1;
    }

    pub fn inc_explain_responses(&mut self) {
        self.explain_responses += 1;
    }

    pub fn add_explain_duration(&mut self, duration: Duration) {
        self.explain_duration += duration;
    }

    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    pub fn add_canonical_result(&mut self, canonical: Option<&str>, duration: Duration) {
        self.total_duration += duration;
        if let Some(canonical) = canonical {
            let entry = self.canonicals.entry(canonical.to_string()).or_default();
            entry.count += 1;
            entry.total_duration += duration;
        }
    }

    pub fn add(&mut self, rhs: &DiffStats) {
        self.total_duration += rhs.total_duration;
        self.request_packets += rhs.request_packets;
        self.requests += rhs.requests;
        self.requests_responding += rhs.requests_responding;
        self.requests_explainable += rhs.requests_explainable;
        self.responses += rhs.responses;
        self.explain_duration += rhs.explain_duration;
        self.explain_requests += rhs.explain_requests;
        self.explain_responses += rhs.explain_responses;
        for (canonical, stats) in &rhs.canonicals {
            let entry = self.canonicals.entry(canonical.clone()).or_default();
            entry.count += stats.count;
            entry.total_duration += stats.total_duration;
        }
    }

    fn data_json(&self) -> Value {
        json!({
            "total_duration": self.total_duration.as_millis() as u64,
            "request_packets": self.request_packets,
            "requests": self.requests,
            "requests_explainable": self.requests_explainable,
            "requests_responding": self.requests_responding,
            "responses": self.responses,
            "explain": {
                "duration": self.explain_duration.as_millis() as u64,
                "requests": self.explain_requests,
                "responses": self.explain_responses,
            },
        })
    }

    pub fn canonicals_json(&self) -> Value {
        Value::Array(
            self.canonicals
                .iter()
                .map(|(canonical, stats)| {
                    json!({
                        "canonical": canonical,
                        "count": stats.count,
                        "total_duration": stats.total_duration.as_millis() as u64,
                    })
                })
                .collect(),
        )
    }

    pub fn to_json(&self) -> Value {
        json!({ "data": self.data_json() })
    }
}

/// Stats of a comparison target, with the lag-shedding counter and the
/// retained fastest/slowest statements.
#[derive(Debug, Clone, Default)]
pub struct DiffOtherStats {
    base: DiffStats,
    requests_skipped: i64,
    faster: i64,
    slower: i64,
    faster_requests: ResultsByPermille,
    slower_requests: ResultsByPermille,
}

impl std::ops::Deref for DiffOtherStats {
    type Target = DiffStats;
    fn deref(&self) -> &DiffStats {
        &self.base
    }
}

impl std::ops::DerefMut for DiffOtherStats {
    fn deref_mut(&mut self) -> &mut DiffStats {
        &mut self.base
    }
}

impl DiffOtherStats {
    pub fn inc_requests_skipped(&mut self) {
        self.requests_skipped += 1;
    }

    pub fn requests_skipped(&self) -> i64 {
        self.requests_skipped
    }

    pub fn faster(&self) -> i64 {
        self.faster
    }

    pub fn slower(&self) -> i64 {
        self.slower
    }

    /// Record one finished comparison against the main's duration.
    pub fn add_result(
        &mut self,
        other_duration: Duration,
        main_duration: Duration,
        retained: RetainedResult,
        config: &DiffConfig,
    ) {
        if main_duration.is_zero() {
            return;
        }
        let permille = (other_duration.as_nanos() as i64 - main_duration.as_nanos() as i64) * 1000
            / main_duration.as_nanos() as i64;

        if permille > 0 {
            self.slower += 1;
            self.slower_requests.insert(
                RetainedResult {
                    permille,
                    ..retained
                },
                config.retain_slower_statements,
            );
        } else if permille < 0 {
            self.faster += 1;
            self.faster_requests.insert(
                RetainedResult {
                    permille: -permille,
                    ..retained
                },
                config.retain_faster_statements,
            );
        }
    }

    pub fn add(&mut self, rhs: &DiffOtherStats, config: &DiffConfig) {
        self.base.add(&rhs.base);
        self.requests_skipped += rhs.requests_skipped;
        self.faster += rhs.faster;
        self.slower += rhs.slower;
        self.faster_requests
            .merge(&rhs.faster_requests, config.retain_faster_statements);
        self.slower_requests
            .merge(&rhs.slower_requests, config.retain_slower_statements);
    }

    pub fn to_json(&self) -> Value {
        let mut data = self.base.data_json();
        data["requests_skipped"] = json!(self.requests_skipped);
        json!({
            "data": data,
            "verdict": {
                "faster": self.faster,
                "slower": self.slower,
                "fastest": self.faster_requests.to_json(),
                "slowest": self.slower_requests.to_json(),
            },
        })
    }
}

/// What one router session hands over when it closes.
#[derive(Debug, Clone)]
pub struct DiffRouterSessionStats {
    pub main_name: String,
    pub main_stats: DiffStats,
    pub main_qps: DiffQps,
    pub others: BTreeMap<String, (DiffOtherStats, DiffQps)>,
}

/// Router-wide aggregation of session stats.
#[derive(Debug, Clone)]
pub struct DiffRouterStats {
    main_name: String,
    main_stats: DiffStats,
    main_qps: DiffQps,
    others: BTreeMap<String, (DiffOtherStats, DiffQps)>,
}

impl DiffRouterStats {
    pub fn new(main_name: impl Into<String>, qps_window: Duration) -> Self {
        DiffRouterStats {
            main_name: main_name.into(),
            main_stats: DiffStats::default(),
            main_qps: DiffQps::new(qps_window.as_secs() as usize),
            others: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, rhs: &DiffRouterSessionStats, config: &DiffConfig) {
        self.main_stats.add(&rhs.main_stats);
        self.main_qps.merge(&rhs.main_qps);
        for (name, (stats, qps)) in &rhs.others {
            match self.others.get_mut(name) {
                Some((agg_stats, agg_qps)) => {
                    agg_stats.add(stats, config);
                    agg_qps.merge(qps);
                }
                None => {
                    self.others.insert(name.clone(), (stats.clone(), qps.clone()));
                }
            }
        }
    }

    pub fn to_json(&self) -> Value {
        let others: serde_json::Map<String, Value> = self
            .others
            .iter()
            .map(|(name, (stats, _))| (name.clone(), stats.to_json()))
            .collect();
        let mut main = serde_json::Map::new();
        main.insert(self.main_name.clone(), self.main_stats.to_json());
        json!({
            "summary": {
                "main": main,
                "others": others,
            },
        })
    }

    /// One JSON document per target, with the per-canonical data, for the
    /// per-target summary files.
    pub fn data_by_target(&self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        out.push((
            self.main_name.clone(),
            json!({ "canonicals": self.main_stats.canonicals_json() }),
        ));
        for (name, (stats, _)) in &self.others {
            out.push((
                name.clone(),
                json!({ "canonicals": stats.canonicals_json() }),
            ));
        }
        out
    }
}
