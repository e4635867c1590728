//! Fuzzy bank reconciliation scorer.
//!
//! Multi-signal scoring of a bank statement line against candidate ledger
//! entries: reference similarity, amount proximity, partner name, and a
//! learned-rule overlay from prior manual matches. Pure and deterministic;
//! persistence and ERP access live in the reconciliation automation.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::text;

pub const AMOUNT_TOLERANCE_ABS: f64 = 0.50;
pub const AMOUNT_TOLERANCE_PCT: f64 = 0.02;
pub const FUZZY_REF_THRESHOLD: u32 = 70;
pub const PARTNER_FULL_THRESHOLD: u32 = 85;
pub const PARTNER_HALF_THRESHOLD: u32 = 65;
pub const RULE_PATTERN_THRESHOLD: u32 = 80;
pub const SUGGESTION_FLOOR: f64 = 0.30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankLine {
    pub id: i64,
    pub payment_ref: String,
    pub amount: f64,
    pub partner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEntry {
    pub id: i64,
    pub reference: String,
    pub amount_residual: f64,
    pub partner: String,
}

/// Pattern derived from a manual match; biases future scoring toward
/// similar pairs. All four patterns must match at ≥ 80 to apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedRule {
    pub bank_ref_pattern: String,
    pub bank_partner_pattern: String,
    pub entry_ref_pattern: String,
    pub entry_partner_pattern: String,
    pub created_at: DateTime<Utc>,
}

pub fn learned_rule_from_match(
    bank_ref: &str,
    bank_partner: &str,
    entry_ref: &str,
    entry_partner: &str,
) -> LearnedRule {
    LearnedRule {
        bank_ref_pattern: bank_ref.trim().to_lowercase(),
        bank_partner_pattern: bank_partner.trim().to_lowercase(),
        entry_ref_pattern: entry_ref.trim().to_lowercase(),
        entry_partner_pattern: entry_partner.trim().to_lowercase(),
        created_at: Utc::now(),
    }
}

pub fn rule_applies(
    rule: &LearnedRule,
    line_ref: &str,
    line_partner: &str,
    cand_ref: &str,
    cand_partner: &str,
) -> bool {
    let pattern_matches = |pattern: &str, value: &str| {
        pattern.is_empty()
            || text::token_sort_ratio(pattern, &value.to_lowercase()) >= RULE_PATTERN_THRESHOLD
    };
    pattern_matches(&rule.bank_ref_pattern, line_ref)
        && pattern_matches(&rule.bank_partner_pattern, line_partner)
        && pattern_matches(&rule.entry_ref_pattern, cand_ref)
        && pattern_matches(&rule.entry_partner_pattern, cand_partner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Learned,
    Fuzzy,
    Partial,
    None,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Learned => "learned",
            MatchType::Fuzzy => "fuzzy",
            MatchType::Partial => "partial",
            MatchType::None => "none",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub reference: f64,
    pub amount: f64,
    pub partner: f64,
    pub learned: f64,
    pub total: f64,
    pub match_type: MatchType,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSuggestion {
    pub bank_line_id: i64,
    pub bank_ref: String,
    pub bank_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_entry_id: Option<i64>,
    #[serde(default)]
    pub matched_entry_ref: String,
    #[serde(default)]
    pub matched_amount: f64,
    pub confidence: f64,
    pub match_type: MatchType,
    pub reasoning: String,
}

/// Score one candidate against one bank line.
///
/// Signal weights: reference 0.40, amount 0.35, partner 0.15, learned rule
/// 0.10. A candidate matching exactly on reference, amount, and partner is a
/// perfect match and scores 1.0 outright.
pub fn score_candidate(
    line: &BankLine,
    candidate: &CandidateEntry,
    learned_rules: &[LearnedRule],
) -> ScoreBreakdown {
    let line_ref = line.payment_ref.trim();
    let cand_ref = candidate.reference.trim();
    let abs_line = line.amount.abs();
    let cand_amount = candidate.amount_residual.abs();

    let mut reasons: Vec<String> = Vec::new();

    // Reference similarity (0-0.40)
    let mut ref_score = 0.0;
    let mut ref_exact = false;
    if !line_ref.is_empty() && !cand_ref.is_empty() {
        let token_ratio = text::token_sort_ratio(line_ref, cand_ref);
        if token_ratio == 100 {
            ref_score = 0.40;
            ref_exact = true;
            reasons.push(format!("Exact reference match: '{cand_ref}'"));
        } else if token_ratio >= FUZZY_REF_THRESHOLD {
            ref_score = 0.25
                + 0.15 * ((token_ratio - FUZZY_REF_THRESHOLD) as f64
                    / (100 - FUZZY_REF_THRESHOLD) as f64);
            reasons.push(format!("Fuzzy reference match ({token_ratio}%): '{cand_ref}'"));
        }
        if text::contained(line_ref, cand_ref) && ref_score < 0.35 {
            ref_score = 0.35;
            reasons.push(format!("Reference substring match: '{cand_ref}'"));
        }
    }

    // Amount proximity (0-0.35)
    let mut amount_score = 0.0;
    let mut amount_exact = false;
    if abs_line > 0.0 && cand_amount > 0.0 {
        let diff = (abs_line - cand_amount).abs();
        let pct_diff = diff / abs_line.max(cand_amount);
        if diff < 0.01 {
            amount_score = 0.35;
            amount_exact = true;
            reasons.push(format!("Exact amount match: {cand_amount:.2}"));
        } else if diff <= AMOUNT_TOLERANCE_ABS {
            amount_score = 0.30;
            reasons.push(format!("Amount within rounding tolerance (diff {diff:.2})"));
        } else if pct_diff <= AMOUNT_TOLERANCE_PCT {
            amount_score = 0.28;
            reasons.push(format!("Amount within {:.1}% tolerance", pct_diff * 100.0));
        } else if pct_diff <= 0.10 {
            amount_score = 0.15 * (1.0 - pct_diff / 0.10);
            reasons.push(format!(
                "Partial amount match ({:.1}% difference)",
                pct_diff * 100.0
            ));
        }
    }

    // Partner match (0-0.15)
    let mut partner_score = 0.0;
    let mut partner_full = false;
    if !line.partner.is_empty() && !candidate.partner.is_empty() {
        let p_ratio = text::token_sort_ratio(&line.partner, &candidate.partner);
        if p_ratio >= PARTNER_FULL_THRESHOLD {
            partner_score = 0.15;
            partner_full = true;
            reasons.push(format!("Partner match: '{}'", candidate.partner));
        } else if p_ratio >= PARTNER_HALF_THRESHOLD {
            partner_score = 0.08;
            reasons.push(format!(
                "Partial partner match ({p_ratio}%): '{}'",
                candidate.partner
            ));
        }
    }

    // Learned rule bonus (0-0.10)
    let mut learned_bonus = 0.0;
    for rule in learned_rules {
        if rule_applies(rule, line_ref, &line.partner, cand_ref, &candidate.partner) {
            learned_bonus = 0.10;
            reasons.push("Matches a previously learned rule".to_string());
            break;
        }
    }

    let mut total = ref_score + amount_score + partner_score + learned_bonus;
    if ref_exact && amount_exact && partner_full {
        total = 1.0;
    }
    total = total.min(1.0);

    let match_type = if total >= 0.90 {
        MatchType::Exact
    } else if learned_bonus > 0.0 && total >= 0.50 {
        MatchType::Learned
    } else if ref_score >= 0.25 || amount_score >= 0.28 {
        MatchType::Fuzzy
    } else if total >= SUGGESTION_FLOOR {
        MatchType::Partial
    } else {
        MatchType::None
    };

    let reasoning = if reasons.is_empty() {
        "Low overall match score".to_string()
    } else {
        reasons.join("; ")
    };

    ScoreBreakdown {
        reference: ref_score,
        amount: amount_score,
        partner: partner_score,
        learned: learned_bonus,
        total,
        match_type,
        reasoning,
    }
}

/// Greedy allocation: lines are processed in input order and a candidate
/// consumed by an earlier line is skipped for later ones.
pub fn generate_suggestions(
    lines: &[BankLine],
    candidates: &[CandidateEntry],
    learned_rules: &[LearnedRule],
) -> Vec<MatchSuggestion> {
    let mut used: std::collections::HashSet<i64> = std::collections::HashSet::new();
    let mut suggestions = Vec::with_capacity(lines.len());

    for line in lines {
        let mut best: Option<(&CandidateEntry, ScoreBreakdown)> = None;
        for candidate in candidates {
            if used.contains(&candidate.id) {
                continue;
            }
            let score = score_candidate(line, candidate, learned_rules);
            let better = match &best {
                Some((_, current)) => score.total > current.total,
                None => true,
            };
            if better {
                best = Some((candidate, score));
            }
        }

        match best {
            Some((candidate, score)) if score.total >= SUGGESTION_FLOOR => {
                used.insert(candidate.id);
                suggestions.push(MatchSuggestion {
                    bank_line_id: line.id,
                    bank_ref: line.payment_ref.clone(),
                    bank_amount: line.amount,
                    matched_entry_id: Some(candidate.id),
                    matched_entry_ref: candidate.reference.clone(),
                    matched_amount: candidate.amount_residual,
                    confidence: (score.total * 1000.0).round() / 1000.0,
                    match_type: score.match_type,
                    reasoning: score.reasoning,
                });
            }
            _ => suggestions.push(MatchSuggestion {
                bank_line_id: line.id,
                bank_ref: line.payment_ref.clone(),
                bank_amount: line.amount,
                matched_entry_id: None,
                matched_entry_ref: String::new(),
                matched_amount: 0.0,
                confidence: 0.0,
                match_type: MatchType::None,
                reasoning: "No matching entry found".to_string(),
            }),
        }
    }

    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(id: i64, payment_ref: &str, amount: f64, partner: &str) -> BankLine {
        BankLine {
            id,
            payment_ref: payment_ref.to_string(),
            amount,
            partner: partner.to_string(),
            date: None,
        }
    }

    fn entry(id: i64, reference: &str, amount_residual: f64, partner: &str) -> CandidateEntry {
        CandidateEntry {
            id,
            reference: reference.to_string(),
            amount_residual,
            partner: partner.to_string(),
        }
    }

    #[test]
    fn perfect_match_scores_one_and_classifies_exact() {
        let l = line(1, "INV/2026/0042", 1500.0, "Acme Corp");
        let candidates = vec![
            entry(41, "INV/2026/0041", 900.0, "Other Co"),
            entry(42, "INV/2026/0042", 1500.0, "Acme Corp"),
        ];
        let suggestions = generate_suggestions(&[l], &candidates, &[]);
        let s = &suggestions[0];
        assert_eq!(s.matched_entry_id, Some(42));
        assert_eq!(s.confidence, 1.0);
        assert_eq!(s.match_type, MatchType::Exact);
    }

    #[test]
    fn classification_boundary_at_0_90() {
        // ref exact (0.40) + amount exact (0.35) + partner full (0.15) = 0.90
        // but with partner only half (0.08) the total drops to 0.83 → fuzzy.
        let l = line(1, "INV/1", 100.0, "Acme Corporation Holdings BV");
        let c = entry(9, "INV/1", 100.0, "Acme Corporation Holdings");
        let s = score_candidate(&l, &c, &[]);
        if s.total >= 0.90 {
            assert_eq!(s.match_type, MatchType::Exact);
        } else {
            assert_eq!(s.match_type, MatchType::Fuzzy);
        }

        let c2 = entry(9, "INV/1", 100.0, "Completely Different Partner");
        let s2 = score_candidate(&l, &c2, &[]);
        assert!(s2.total < 0.90);
        assert_eq!(s2.match_type, MatchType::Fuzzy);
    }

    #[test]
    fn amount_tolerance_bands() {
        let l = line(1, "", 100.0, "");
        assert_eq!(score_candidate(&l, &entry(1, "", 100.0, ""), &[]).amount, 0.35);
        assert_eq!(score_candidate(&l, &entry(1, "", 100.40, ""), &[]).amount, 0.30);
        assert_eq!(score_candidate(&l, &entry(1, "", 101.5, ""), &[]).amount, 0.28);
        let partial = score_candidate(&l, &entry(1, "", 108.0, ""), &[]).amount;
        assert!(partial > 0.0 && partial < 0.15);
        assert_eq!(score_candidate(&l, &entry(1, "", 150.0, ""), &[]).amount, 0.0);
    }

    #[test]
    fn learned_rule_adds_bonus_and_classifies_learned() {
        let rule = learned_rule_from_match("WIRE ACME", "Acme Corp", "INV/77", "Acme Corp");
        let l = line(1, "WIRE ACME", 500.0, "Acme Corp");
        // amount inside the rounding tolerance (0.30) + full partner (0.15)
        // + rule bonus (0.10) = 0.55: the learned band
        let c = entry(77, "INV/77", 500.30, "Acme Corp");
        let with_rule = score_candidate(&l, &c, &[rule]);
        let without_rule = score_candidate(&l, &c, &[]);
        assert!(with_rule.total > without_rule.total);
        assert_eq!(with_rule.learned, 0.10);
        assert!(with_rule.total >= 0.50);
        assert!(with_rule.total < 0.90);
        assert_eq!(with_rule.match_type, MatchType::Learned);
    }

    #[test]
    fn greedy_consumption_skips_used_candidates() {
        let lines = vec![
            line(1, "INV/100", 100.0, "Acme Corp"),
            line(2, "INV/100", 100.0, "Acme Corp"),
        ];
        let candidates = vec![entry(10, "INV/100", 100.0, "Acme Corp")];
        let suggestions = generate_suggestions(&lines, &candidates, &[]);
        assert_eq!(suggestions[0].matched_entry_id, Some(10));
        assert_eq!(suggestions[1].matched_entry_id, None);
        assert_eq!(suggestions[1].match_type, MatchType::None);
    }

    #[test]
    fn partner_scoring_is_symmetric() {
        let a = "ACME Corporation Ltd";
        let b = "Acme Corp";
        let l1 = line(1, "", 0.0, a);
        let c1 = entry(1, "", 0.0, b);
        let l2 = line(2, "", 0.0, b);
        let c2 = entry(2, "", 0.0, a);
        assert_eq!(
            score_candidate(&l1, &c1, &[]).partner,
            score_candidate(&l2, &c2, &[]).partner
        );
    }

    #[test]
    fn below_floor_yields_no_suggestion() {
        let l = line(1, "XYZ", 100.0, "Nobody");
        let candidates = vec![entry(1, "ABC", 5000.0, "Someone Else")];
        let suggestions = generate_suggestions(&[l], &candidates, &[]);
        assert_eq!(suggestions[0].matched_entry_id, None);
    }

    #[test]
    fn rule_with_empty_patterns_applies() {
        let rule = LearnedRule {
            bank_ref_pattern: String::new(),
            bank_partner_pattern: "acme corp".to_string(),
            entry_ref_pattern: String::new(),
            entry_partner_pattern: "acme corp".to_string(),
            created_at: Utc::now(),
        };
        assert!(rule_applies(&rule, "anything", "Acme Corp", "whatever", "ACME CORP"));
        assert!(!rule_applies(&rule, "anything", "Globex", "whatever", "ACME CORP"));
    }
}
