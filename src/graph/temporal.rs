//! Temporal model: recency decay, query decomposition, and event-time overlap.
//!
//! Time is a helper, not a jailer — event-time fields are nullable and a
//! missing endpoint scores zero overlap rather than guessing. Anchor
//! categories are exempt from recency decay entirely.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::config::TemporalConfig;
use crate::graph::types::Node;

/// Ordering intent detected in a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalDirection {
    /// "before", "first", "earlier" — prefer older notes.
    Earliest,
    /// "after", "last", "most recent" — prefer newer notes.
    Latest,
    /// "in what order", "chronological".
    Order,
    /// Temporal intent without an ordering preference ("when did ...").
    When,
}

impl TemporalDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
            Self::Order => "order",
            Self::When => "when",
        }
    }
}

/// Result of temporal query decomposition.
#[derive(Debug, Clone)]
pub struct DecomposedQuery {
    /// Query text with temporal signal words stripped, for embedding and BM25.
    pub content: String,
    pub direction: Option<TemporalDirection>,
    pub has_signal: bool,
}

fn signal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?ix)
            \bwhen\s+(did|was|is|will)\b
            | \bhow\s+long\s+(ago|since)\b
            | \b(before|after|during)\b
            | \b(first|last)\b
            | \bmost\s+recent\b
            | \b(earlier|later|previously|recently|latest|earliest)\b
            | \bwhat\s+happened\s+(before|after|first|next|last)\b
            | \bin\s+what\s+order\b
            | \bchronolog
            | \bwhich\s+came\s+(first|last)\b
            | \b\d{4}-\d{1,2}-\d{1,2}\b
            | \bin\s+(january|february|march|april|may|june|july|august|september|october|november|december)\b
            ",
        )
        .expect("valid signal regex")
    })
}

fn strip_regexes() -> &'static Vec<(Regex, &'static str)> {
    static RES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            (r"(?i)\bwhat\s+happened\s+(before|after|first|next|last)\b", "happened"),
            (r"(?i)\bwhen\s+(did|was|is|will)\b", ""),
            (r"(?i)\bhow\s+long\s+(ago|since)\b", ""),
            (r"(?i)\bwhich\s+came\s+(first|last)\b", ""),
            (r"(?i)\bin\s+what\s+order\b", ""),
            (r"(?i)\b(first|last)\s+time\b", ""),
            (
                r"(?i)\b(before|after|earliest|latest|most\s+recent|chronological(?:ly)?|previously)\b",
                "",
            ),
        ]
        .into_iter()
        .map(|(pat, rep)| (Regex::new(pat).expect("valid strip regex"), rep))
        .collect()
    })
}

fn direction_of(query_lower: &str) -> TemporalDirection {
    static ORDER: OnceLock<Regex> = OnceLock::new();
    static EARLIEST: OnceLock<Regex> = OnceLock::new();
    static LATEST: OnceLock<Regex> = OnceLock::new();

    let order = ORDER
        .get_or_init(|| Regex::new(r"\b(order|chronolog|sequence)").expect("valid regex"));
    let earliest = EARLIEST.get_or_init(|| {
        Regex::new(r"\b(before|first|earliest|oldest|earlier|previously)\b").expect("valid regex")
    });
    let latest = LATEST.get_or_init(|| {
        Regex::new(r"\b(after|last|latest|later|next|then|newest)\b|\bmost\s+recent\b")
            .expect("valid regex")
    });

    if order.is_match(query_lower) {
        TemporalDirection::Order
    } else if earliest.is_match(query_lower) {
        TemporalDirection::Earliest
    } else if latest.is_match(query_lower) {
        TemporalDirection::Latest
    } else {
        TemporalDirection::When
    }
}

/// Detect temporal intent and strip the signal words from the query so the
/// semantic and keyword signals see clean content.
pub fn decompose_query(query: &str) -> DecomposedQuery {
    let lower = query.to_lowercase();
    if !signal_regex().is_match(&lower) {
        return DecomposedQuery {
            content: query.to_string(),
            direction: None,
            has_signal: false,
        };
    }

    let direction = direction_of(&lower);

    let mut content = query.to_string();
    for (re, replacement) in strip_regexes().iter() {
        content = re.replace_all(&content, *replacement).into_owned();
    }
    let content = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let content = content
        .trim_matches(|c: char| c.is_whitespace() || matches!(c, ',' | '?' | '!' | '.'))
        .to_string();

    // If stripping removed too much, fall back to the original text
    let content = if content.len() < 5 {
        query.to_string()
    } else {
        content
    };

    DecomposedQuery {
        content,
        direction: Some(direction),
        has_signal: true,
    }
}

/// Parse a stored timestamp. Accepts RFC 3339, naive datetimes, and plain
/// dates (midnight UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// Fraction of the query's event range covered by the note's event range.
///
/// Returns 0.0 when ranges are disjoint or either endpoint is missing or
/// unparseable — never guess an open-ended range.
pub fn temporal_overlap(
    query_start: &str,
    query_end: &str,
    note_start: Option<&str>,
    note_end: Option<&str>,
) -> f64 {
    let (Some(ns), Some(ne)) = (note_start, note_end) else {
        return 0.0;
    };
    let (Some(qs), Some(qe), Some(ns), Some(ne)) = (
        parse_timestamp(query_start),
        parse_timestamp(query_end),
        parse_timestamp(ns),
        parse_timestamp(ne),
    ) else {
        return 0.0;
    };

    let overlap_start = qs.max(ns);
    let overlap_end = qe.min(ne);
    if overlap_start >= overlap_end {
        return 0.0;
    }

    let overlap = (overlap_end - overlap_start).num_seconds() as f64;
    let query_span = ((qe - qs).num_seconds() as f64).max(1.0);
    (overlap / query_span).min(1.0)
}

/// Score a note's position in the candidate timeline for directional queries.
///
/// `Earliest` prefers older notes, `Latest` newer ones; `When`/`Order` carry
/// no ordering preference and score a flat 0.5.
pub fn temporal_order_score(
    timestamp: &str,
    direction: TemporalDirection,
    all_timestamps: &[DateTime<Utc>],
) -> f64 {
    let Some(ts) = parse_timestamp(timestamp) else {
        return 0.0;
    };
    if all_timestamps.is_empty() {
        return 0.5;
    }
    let min = all_timestamps.iter().min().copied().unwrap_or(ts);
    let max = all_timestamps.iter().max().copied().unwrap_or(ts);
    let range = (max - min).num_seconds() as f64;
    if range <= 0.0 {
        return 0.5;
    }

    let position = (ts - min).num_seconds() as f64 / range;
    match direction {
        TemporalDirection::Earliest => 1.0 - position,
        TemporalDirection::Latest => position,
        TemporalDirection::When | TemporalDirection::Order => 0.5,
    }
}

/// Recency decay and anchor policy.
pub struct TemporalModel {
    half_life_days: f64,
    anchors: HashSet<String>,
    category_multipliers: HashMap<String, f64>,
}

impl TemporalModel {
    pub fn new(config: &TemporalConfig) -> Self {
        Self {
            half_life_days: config.half_life_days,
            anchors: config.anchor_categories.iter().cloned().collect(),
            category_multipliers: config.category_multipliers.clone(),
        }
    }

    /// Whether a category is identity-defining and exempt from decay.
    pub fn is_anchor(&self, category: &str) -> bool {
        self.anchors.contains(category)
    }

    /// The anchor categories, materialized for SQL IN lists.
    pub fn anchor_category_list(&self) -> Vec<String> {
        let mut list: Vec<String> = self.anchors.iter().cloned().collect();
        list.sort();
        list
    }

    /// Decay-exponent multiplier for a category. Values below 1.0 stretch the
    /// effective half-life; unlisted categories get 1.0.
    pub fn category_multiplier(&self, category: &str) -> f64 {
        self.category_multipliers
            .get(category)
            .copied()
            .unwrap_or(1.0)
    }

    /// Recency factor in [0, 1]: exactly 1.0 for anchor categories, otherwise
    /// `0.5 ^ ((age_days / half_life) * category_multiplier)`.
    pub fn recency_factor(&self, node: &Node) -> f64 {
        self.recency_factor_at(&node.category, &node.created_at, Utc::now())
    }

    pub fn recency_factor_at(
        &self,
        category: &str,
        created_at: &str,
        now: DateTime<Utc>,
    ) -> f64 {
        if self.is_anchor(category) {
            return 1.0;
        }
        let Some(created) = parse_timestamp(created_at) else {
            return 0.5;
        };
        let age_days = (now - created).num_seconds() as f64 / 86_400.0;
        if age_days <= 0.0 {
            return 1.0;
        }
        let exponent = (age_days / self.half_life_days) * self.category_multiplier(category);
        0.5f64.powf(exponent).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn model() -> TemporalModel {
        TemporalModel::new(&TemporalConfig::default())
    }

    fn model_with_multiplier(category: &str, mult: f64) -> TemporalModel {
        let mut config = TemporalConfig::default();
        config.category_multipliers.insert(category.into(), mult);
        TemporalModel::new(&config)
    }

    // ── Decomposition ────────────────────────────────────────────────────────

    #[test]
    fn plain_query_has_no_signal() {
        let d = decompose_query("debugging tools in Python");
        assert!(!d.has_signal);
        assert!(d.direction.is_none());
        assert_eq!(d.content, "debugging tools in Python");
    }

    #[test]
    fn what_happened_first_decomposes() {
        let d = decompose_query("what happened first in this project?");
        assert!(d.has_signal);
        assert_eq!(d.direction, Some(TemporalDirection::Earliest));
        assert_eq!(d.content, "happened in this project");
    }

    #[test]
    fn when_did_is_stripped() {
        let d = decompose_query("when did the server migration finish");
        assert!(d.has_signal);
        assert_eq!(d.content, "the server migration finish");
    }

    #[test]
    fn before_maps_to_earliest_after_to_latest() {
        assert_eq!(
            decompose_query("notes before the launch").direction,
            Some(TemporalDirection::Earliest)
        );
        assert_eq!(
            decompose_query("notes after the launch").direction,
            Some(TemporalDirection::Latest)
        );
    }

    #[test]
    fn order_queries_detected() {
        let d = decompose_query("in what order did the releases ship");
        assert_eq!(d.direction, Some(TemporalDirection::Order));
    }

    #[test]
    fn explicit_date_is_a_signal() {
        let d = decompose_query("meeting notes 2026-01-05");
        assert!(d.has_signal);
    }

    #[test]
    fn over_stripping_falls_back_to_original() {
        let d = decompose_query("before");
        assert!(d.has_signal);
        assert_eq!(d.content, "before");
    }

    // ── Overlap ──────────────────────────────────────────────────────────────

    #[test]
    fn full_overlap_scores_one() {
        let score = temporal_overlap(
            "2026-01-01",
            "2026-01-31",
            Some("2025-12-01"),
            Some("2026-03-01"),
        );
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn partial_overlap_is_fractional() {
        // note covers half of January
        let score = temporal_overlap(
            "2026-01-01",
            "2026-01-31",
            Some("2026-01-16"),
            Some("2026-02-15"),
        );
        assert!(score > 0.4 && score < 0.6, "score {score}");
    }

    #[test]
    fn disjoint_ranges_score_zero() {
        let score = temporal_overlap(
            "2026-01-01",
            "2026-01-31",
            Some("2026-03-01"),
            Some("2026-03-31"),
        );
        assert_eq!(score, 0.0);
    }

    #[test]
    fn missing_endpoint_scores_zero() {
        assert_eq!(
            temporal_overlap("2026-01-01", "2026-01-31", None, Some("2026-01-10")),
            0.0
        );
        assert_eq!(
            temporal_overlap("2026-01-01", "2026-01-31", Some("garbage"), Some("2026-01-10")),
            0.0
        );
    }

    // ── Order score ──────────────────────────────────────────────────────────

    #[test]
    fn earliest_prefers_older_notes() {
        let all = vec![
            parse_timestamp("2026-01-05").unwrap(),
            parse_timestamp("2026-02-10").unwrap(),
        ];
        let early = temporal_order_score("2026-01-05", TemporalDirection::Earliest, &all);
        let late = temporal_order_score("2026-02-10", TemporalDirection::Earliest, &all);
        assert!(early > late);
        assert_eq!(early, 1.0);
        assert_eq!(late, 0.0);
    }

    #[test]
    fn latest_prefers_newer_notes() {
        let all = vec![
            parse_timestamp("2026-01-05").unwrap(),
            parse_timestamp("2026-02-10").unwrap(),
        ];
        let late = temporal_order_score("2026-02-10", TemporalDirection::Latest, &all);
        assert_eq!(late, 1.0);
    }

    // ── Recency ──────────────────────────────────────────────────────────────

    #[test]
    fn anchor_recency_is_exactly_one_regardless_of_age() {
        let m = model();
        let old = (Utc::now() - Duration::days(200)).to_rfc3339();
        assert_eq!(m.recency_factor_at("milestone", &old, Utc::now()), 1.0);
        assert_eq!(m.recency_factor_at("security", &old, Utc::now()), 1.0);
    }

    #[test]
    fn recency_halves_at_half_life() {
        let m = model();
        let now = Utc::now();
        let created = (now - Duration::days(30)).to_rfc3339();
        let factor = m.recency_factor_at("general", &created, now);
        assert!((factor - 0.5).abs() < 0.01, "factor {factor}");
    }

    #[test]
    fn fresh_note_scores_one() {
        let m = model();
        let now = Utc::now();
        assert_eq!(m.recency_factor_at("general", &now.to_rfc3339(), now), 1.0);
    }

    #[test]
    fn category_multiplier_stretches_half_life() {
        let m = model_with_multiplier("project", 0.1);
        let now = Utc::now();
        let created = (now - Duration::days(30)).to_rfc3339();
        // exponent 30/30 * 0.1 = 0.1 → 0.5^0.1 ≈ 0.933
        let factor = m.recency_factor_at("project", &created, now);
        assert!((factor - 0.933).abs() < 0.01, "factor {factor}");
    }

    #[test]
    fn unparseable_timestamp_falls_back() {
        let m = model();
        assert_eq!(m.recency_factor_at("general", "not-a-date", Utc::now()), 0.5);
    }
}
