//! Cross-entity deduplication engine.
//!
//! Pairwise similarity over configured match fields, a strong-signal
//! override for identifier fields, and union-find clustering. The output is
//! deterministic for a given record snapshot: pairs are visited in id order
//! and master selection breaks ties by lowest id, so re-running a scan on
//! the same data yields the same groups.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::text;

pub const NAME_SIMILARITY_THRESHOLD: f64 = 0.70;
pub const EMAIL_SIMILARITY_THRESHOLD: f64 = 0.90;
pub const STRONG_SIGNAL_THRESHOLD: f64 = 0.95;
pub const OVERALL_DUPLICATE_THRESHOLD: f64 = 0.65;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Generic text compared by token-sort ratio.
    Name,
    /// Email: exact, same-domain-partial, or plain ratio.
    Email,
    /// Phone: digit-normalized with country-code and last-7 handling.
    Phone,
    /// VAT / product code / barcode: exact or nothing.
    ExactCode,
}

impl FieldKind {
    /// Identifier fields can trigger the strong-signal override on their own.
    pub fn is_identifier(self) -> bool {
        matches!(self, FieldKind::Email | FieldKind::Phone | FieldKind::ExactCode)
    }

    fn threshold(self) -> f64 {
        match self {
            FieldKind::Email => EMAIL_SIMILARITY_THRESHOLD,
            _ => NAME_SIMILARITY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchFieldSpec {
    pub field: String,
    pub weight: f64,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    pub model: String,
    pub label: String,
    pub match_fields: Vec<MatchFieldSpec>,
    pub fetch_fields: Vec<String>,
}

impl EntityConfig {
    fn spec(field: &str, weight: f64, kind: FieldKind) -> MatchFieldSpec {
        MatchFieldSpec {
            field: field.to_string(),
            weight,
            kind,
        }
    }
}

/// Built-in configurations for the three scanned entity types. Weights per
/// entity sum to 1.0.
pub fn builtin_configs() -> Vec<EntityConfig> {
    vec![
        EntityConfig {
            model: "res.partner".to_string(),
            label: "contacts".to_string(),
            match_fields: vec![
                EntityConfig::spec("name", 0.35, FieldKind::Name),
                EntityConfig::spec("email", 0.30, FieldKind::Email),
                EntityConfig::spec("phone", 0.20, FieldKind::Phone),
                EntityConfig::spec("vat", 0.15, FieldKind::ExactCode),
            ],
            fetch_fields: [
                "name", "email", "phone", "mobile", "vat", "street", "city", "is_company",
                "customer_rank", "supplier_rank",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        },
        EntityConfig {
            model: "crm.lead".to_string(),
            label: "leads".to_string(),
            match_fields: vec![
                EntityConfig::spec("contact_name", 0.30, FieldKind::Name),
                EntityConfig::spec("email_from", 0.35, FieldKind::Email),
                EntityConfig::spec("phone", 0.20, FieldKind::Phone),
                EntityConfig::spec("partner_name", 0.15, FieldKind::Name),
            ],
            fetch_fields: [
                "contact_name", "email_from", "phone", "partner_name", "name", "stage_id",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        },
        EntityConfig {
            model: "product.template".to_string(),
            label: "products".to_string(),
            match_fields: vec![
                EntityConfig::spec("name", 0.40, FieldKind::Name),
                EntityConfig::spec("default_code", 0.35, FieldKind::ExactCode),
                EntityConfig::spec("barcode", 0.25, FieldKind::ExactCode),
            ],
            fetch_fields: ["name", "default_code", "barcode", "categ_id", "list_price"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        },
    ]
}

pub fn config_for(scan_type: &str) -> Option<EntityConfig> {
    builtin_configs()
        .into_iter()
        .find(|c| c.model == scan_type || c.label == scan_type)
}

/// Normalize an ERP field value to comparable text. The ERP encodes empty
/// fields as `false` and many-to-one fields as `[id, display_name]` pairs.
pub fn normalize_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => String::new(),
        Some(Value::Array(pair)) if pair.len() >= 2 => {
            pair[1].as_str().unwrap_or_default().trim().to_string()
        }
        Some(Value::Array(pair)) if pair.len() == 1 => pair[0].to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string(),
    }
}

pub fn email_similarity(a: &str, b: &str) -> f64 {
    let a_clean = a.to_lowercase().trim().to_string();
    let b_clean = b.to_lowercase().trim().to_string();
    if a_clean == b_clean {
        return 1.0;
    }
    if let (Some((a_local, a_domain)), Some((b_local, b_domain))) =
        (a_clean.split_once('@'), b_clean.split_once('@'))
    {
        if a_domain == b_domain {
            let local_sim = text::ratio(a_local, b_local) as f64 / 100.0;
            return 0.5 + 0.5 * local_sim;
        }
    }
    text::ratio(&a_clean, &b_clean) as f64 / 100.0
}

pub fn phone_similarity(a: &str, b: &str) -> f64 {
    let a_digits: String = a.chars().filter(|c| c.is_ascii_digit()).collect();
    let b_digits: String = b.chars().filter(|c| c.is_ascii_digit()).collect();
    if a_digits.is_empty() || b_digits.is_empty() {
        return 0.0;
    }
    if a_digits == b_digits {
        return 1.0;
    }
    if a_digits.ends_with(&b_digits) || b_digits.ends_with(&a_digits) {
        return 0.95;
    }
    if a_digits.len() >= 7 && b_digits.len() >= 7 && a_digits[a_digits.len() - 7..] == b_digits[b_digits.len() - 7..] {
        return 0.90;
    }
    0.0
}

pub fn field_similarity(kind: FieldKind, a: &str, b: &str) -> f64 {
    match kind {
        FieldKind::Name => text::token_sort_ratio(a, b) as f64 / 100.0,
        FieldKind::Email => email_similarity(a, b),
        FieldKind::Phone => phone_similarity(a, b),
        FieldKind::ExactCode => {
            if a.eq_ignore_ascii_case(b) {
                1.0
            } else {
                0.0
            }
        }
    }
}

/// Compute pair similarity: a single identifier field at or above the strong
/// signal threshold decides the pair outright (score 1.0); otherwise the
/// composite is weight-normalized over the fields that cleared their
/// per-field threshold.
///
/// Open question carried from the source system: two identifier fields each
/// below 0.95 do NOT trigger the override, even when both agree; they only
/// feed the composite.
pub fn compute_similarity(
    a: &Map<String, Value>,
    b: &Map<String, Value>,
    config: &EntityConfig,
) -> (f64, Vec<String>) {
    let mut matched_weight = 0.0;
    let mut matched_score = 0.0;
    let mut matched_fields: Vec<String> = Vec::new();
    let mut comparable = false;

    for spec in &config.match_fields {
        let val_a = normalize_value(a.get(&spec.field));
        let val_b = normalize_value(b.get(&spec.field));
        if val_a.is_empty() || val_b.is_empty() {
            continue;
        }
        comparable = true;

        let sim = field_similarity(spec.kind, &val_a, &val_b);

        if spec.kind.is_identifier() && sim >= STRONG_SIGNAL_THRESHOLD {
            return (1.0, vec![spec.field.clone()]);
        }

        if sim >= spec.kind.threshold() {
            matched_score += spec.weight * sim;
            matched_weight += spec.weight;
            matched_fields.push(spec.field.clone());
        }
    }

    if !comparable || matched_weight == 0.0 {
        return (0.0, Vec::new());
    }

    (matched_score / matched_weight, matched_fields)
}

/// Union-find with path halving.
pub struct UnionFind {
    parent: HashMap<i64, i64>,
}

impl UnionFind {
    pub fn new(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            parent: ids.into_iter().map(|id| (id, id)).collect(),
        }
    }

    pub fn find(&mut self, mut x: i64) -> i64 {
        while self.parent[&x] != x {
            let grandparent = self.parent[&self.parent[&x]];
            self.parent.insert(x, grandparent);
            x = grandparent;
        }
        x
    }

    pub fn union(&mut self, a: i64, b: i64) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Anchor on the smaller root so cluster roots are deterministic.
            let (keep, fold) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(fold, keep);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateCluster {
    pub model: String,
    pub record_ids: Vec<i64>,
    pub master_record_id: i64,
    pub similarity_score: f64,
    pub match_fields: Vec<String>,
}

fn record_id(record: &Map<String, Value>) -> Option<i64> {
    record.get("id").and_then(Value::as_i64)
}

/// Most filled fields wins; lowest id breaks ties.
pub fn heuristic_master(records: &[&Map<String, Value>]) -> i64 {
    let mut best_id = i64::MAX;
    let mut best_fill = -1i64;
    let mut ordered: Vec<&&Map<String, Value>> = records.iter().collect();
    ordered.sort_by_key(|r| record_id(r).unwrap_or(i64::MAX));

    for record in ordered {
        let fill = record
            .values()
            .filter(|v| !matches!(v, Value::Null | Value::Bool(false)) && !normalize_value(Some(v)).is_empty())
            .count() as i64;
        if fill > best_fill {
            best_fill = fill;
            best_id = record_id(record).unwrap_or(i64::MAX);
        }
    }
    best_id
}

/// Cluster a record snapshot into duplicate groups of size ≥ 2.
pub fn find_duplicate_groups(
    records: &[Map<String, Value>],
    config: &EntityConfig,
) -> Vec<DuplicateCluster> {
    let mut ordered: Vec<&Map<String, Value>> = records.iter().collect();
    ordered.sort_by_key(|r| record_id(r).unwrap_or(i64::MAX));
    ordered.retain(|r| record_id(r).is_some());

    let ids: Vec<i64> = ordered.iter().filter_map(|r| record_id(r)).collect();
    let mut uf = UnionFind::new(ids.iter().copied());
    let mut pair_scores: HashMap<(i64, i64), (f64, Vec<String>)> = HashMap::new();

    for i in 0..ordered.len() {
        for j in (i + 1)..ordered.len() {
            let (score, fields) = compute_similarity(ordered[i], ordered[j], config);
            if score >= OVERALL_DUPLICATE_THRESHOLD {
                let a = record_id(ordered[i]).unwrap_or_default();
                let b = record_id(ordered[j]).unwrap_or_default();
                uf.union(a, b);
                pair_scores.insert((a.min(b), a.max(b)), (score, fields));
            }
        }
    }

    let mut clusters: HashMap<i64, Vec<&Map<String, Value>>> = HashMap::new();
    for record in &ordered {
        let id = record_id(record).unwrap_or_default();
        let root = uf.find(id);
        clusters.entry(root).or_default().push(record);
    }

    let mut roots: Vec<i64> = clusters.keys().copied().collect();
    roots.sort();

    let mut groups = Vec::new();
    for root in roots {
        let members = &clusters[&root];
        if members.len() < 2 {
            continue;
        }

        let mut record_ids: Vec<i64> = members.iter().filter_map(|r| record_id(r)).collect();
        record_ids.sort();

        let mut best_score = 0.0f64;
        let mut all_fields: Vec<String> = Vec::new();
        for i in 0..record_ids.len() {
            for j in (i + 1)..record_ids.len() {
                let key = (record_ids[i], record_ids[j]);
                if let Some((score, fields)) = pair_scores.get(&key) {
                    best_score = best_score.max(*score);
                    for f in fields {
                        if !all_fields.contains(f) {
                            all_fields.push(f.clone());
                        }
                    }
                }
            }
        }
        all_fields.sort();

        groups.push(DuplicateCluster {
            model: config.model.clone(),
            master_record_id: heuristic_master(members),
            record_ids,
            similarity_score: (best_score * 10_000.0).round() / 10_000.0,
            match_fields: all_fields,
        });
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn partner(id: i64, name: &str, email: &str, phone: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("id".to_string(), json!(id));
        m.insert("name".to_string(), json!(name));
        if !email.is_empty() {
            m.insert("email".to_string(), json!(email));
        }
        if !phone.is_empty() {
            m.insert("phone".to_string(), json!(phone));
        }
        m
    }

    fn contacts_config() -> EntityConfig {
        config_for("res.partner").unwrap()
    }

    #[test]
    fn identical_email_is_a_strong_signal() {
        let a = partner(1, "Acme Corp", "info@acme.com", "");
        let b = partner(2, "ACME Corporation Ltd", "info@acme.com", "");
        let (score, fields) = compute_similarity(&a, &b, &contacts_config());
        assert_eq!(score, 1.0);
        assert_eq!(fields, vec!["email".to_string()]);
    }

    #[test]
    fn strong_signal_groups_despite_different_names() {
        let records = vec![
            partner(1, "Acme Corp", "info@acme.com", ""),
            partner(2, "ACME Corporation Ltd", "info@acme.com", ""),
            partner(3, "Globex", "ceo@globex.com", ""),
        ];
        let groups = find_duplicate_groups(&records, &contacts_config());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].record_ids, vec![1, 2]);
        assert_eq!(groups[0].similarity_score, 1.0);
        assert!(groups[0].match_fields.contains(&"email".to_string()));
    }

    #[test]
    fn clustering_is_idempotent() {
        let records = vec![
            partner(5, "Acme Corp", "info@acme.com", "+1 555 0100"),
            partner(3, "ACME Corporation", "info@acme.com", ""),
            partner(9, "Initech", "it@initech.example", ""),
            partner(7, "Initech LLC", "it@initech.example", ""),
        ];
        let config = contacts_config();
        let first = find_duplicate_groups(&records, &config);
        let second = find_duplicate_groups(&records, &config);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
        // and input order does not matter
        let mut shuffled = records.clone();
        shuffled.reverse();
        let third = find_duplicate_groups(&shuffled, &config);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&third).unwrap()
        );
    }

    #[test]
    fn email_same_domain_partial_local() {
        let sim = email_similarity("j.doe@acme.com", "jdoe@acme.com");
        assert!(sim > 0.5 && sim < 1.0);
        assert_eq!(email_similarity("a@x.com", "a@x.com"), 1.0);
    }

    #[test]
    fn phone_country_code_and_last_seven() {
        assert_eq!(phone_similarity("+1 555 010 0199", "5550100199"), 0.95);
        assert_eq!(phone_similarity("555-0100", "555 0100"), 1.0);
        assert_eq!(phone_similarity("212 555 0100", "917 555 0100"), 0.90);
        assert_eq!(phone_similarity("123", "987"), 0.0);
    }

    #[test]
    fn two_weak_identifiers_do_not_override() {
        // phones share last-7 (0.90) and emails share domain only — neither
        // reaches 0.95, so no strong-signal shortcut fires.
        let a = partner(1, "Alpha Trading", "sales@corp.com", "212 555 0100");
        let b = partner(2, "Beta Logistics", "ops@corp.com", "917 555 0100");
        let (score, _) = compute_similarity(&a, &b, &contacts_config());
        assert!(score < 1.0);
    }

    #[test]
    fn master_prefers_most_filled_then_lowest_id() {
        let full = partner(8, "Acme Corp", "info@acme.com", "+1 555 0100");
        let sparse = partner(2, "Acme", "", "");
        let members: Vec<&Map<String, Value>> = vec![&sparse, &full];
        assert_eq!(heuristic_master(&members), 8);

        let a = partner(4, "Acme Corp", "info@acme.com", "");
        let b = partner(6, "Acme Corp", "info@acme.com", "");
        let tied: Vec<&Map<String, Value>> = vec![&b, &a];
        assert_eq!(heuristic_master(&tied), 4);
    }

    #[test]
    fn odoo_false_values_are_empty() {
        assert_eq!(normalize_value(Some(&json!(false))), "");
        assert_eq!(normalize_value(Some(&json!([3, "Category"]))), "Category");
        assert_eq!(normalize_value(None), "");
    }

    #[test]
    fn union_find_path_halving() {
        let mut uf = UnionFind::new([1, 2, 3, 4]);
        uf.union(1, 2);
        uf.union(2, 3);
        assert_eq!(uf.find(3), uf.find(1));
        assert_ne!(uf.find(4), uf.find(1));
    }
}
