//! Merge policy for an incoming company document over an existing one.
//! One explicit rule per field instead of a blanket shallow merge:
//! scalars prefer the incoming value when it is non-empty, lists are
//! unioned and deduplicated, attempt counters take the larger value, and
//! diagnostic trails append.

use std::collections::BTreeMap;

use crate::models::{CompanyDoc, StageStatus};

fn union_strings(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut out: Vec<String> = existing.to_vec();
    for item in incoming {
        if !out.iter().any(|e| e.eq_ignore_ascii_case(item)) {
            out.push(item.clone());
        }
    }
    out
}

fn prefer_incoming(existing: &mut Option<String>, incoming: Option<String>) {
    if let Some(value) = incoming {
        if !value.trim().is_empty() {
            *existing = Some(value);
        }
    }
}

fn max_counters(existing: &mut BTreeMap<String, u32>, incoming: &BTreeMap<String, u32>) {
    for (key, value) in incoming {
        let slot = existing.entry(key.clone()).or_insert(0);
        if *value > *slot {
            *slot = *value;
        }
    }
}

/// Merge `incoming` into `existing` in place. `existing` keeps identity
/// fields; enrichment payloads follow the per-field policy.
pub fn merge_company(existing: &mut CompanyDoc, incoming: CompanyDoc) {
    prefer_incoming(&mut existing.website_url, incoming.website_url);
    prefer_incoming(&mut existing.normalized_domain, incoming.normalized_domain);
    if !incoming.company_name.trim().is_empty() {
        existing.company_name = incoming.company_name;
    }

    // Lists: union-and-dedupe.
    existing.industries = union_strings(&existing.industries, &incoming.industries);
    existing.product_keywords =
        union_strings(&existing.product_keywords, &incoming.product_keywords);

    // Scalars: prefer incoming when present.
    prefer_incoming(&mut existing.tagline, incoming.tagline);
    if incoming.headquarters_location.is_some() {
        existing.headquarters_location = incoming.headquarters_location;
    }
    if !incoming.manufacturing_locations.is_empty() {
        for loc in incoming.manufacturing_locations {
            if !existing.manufacturing_locations.iter().any(|l| l.raw == loc.raw) {
                existing.manufacturing_locations.push(loc);
            }
        }
    }

    // Reviews: union by source URL; cursor prefers whichever is exhausted.
    for review in incoming.reviews {
        if !existing.reviews.iter().any(|r| r.source_url == review.source_url) {
            existing.reviews.push(review);
        }
    }
    match (&existing.review_cursor, incoming.review_cursor) {
        (Some(cur), Some(inc)) if !cur.exhausted && inc.exhausted => {
            existing.review_cursor = Some(inc);
        }
        (None, Some(inc)) => existing.review_cursor = Some(inc),
        _ => {}
    }
    // Stage statuses never regress: a stale incomplete copy must not
    // demote a stage another writer already completed.
    if existing.reviews_stage_status != StageStatus::Complete
        && incoming.reviews_stage_status != StageStatus::Pending
    {
        existing.reviews_stage_status = incoming.reviews_stage_status;
    }

    prefer_incoming(&mut existing.logo_url, incoming.logo_url);
    prefer_incoming(&mut existing.logo_source_url, incoming.logo_source_url);
    if existing.logo_stage_status != StageStatus::Complete
        && incoming.logo_stage_status != StageStatus::Pending
    {
        existing.logo_stage_status = incoming.logo_stage_status;
    }

    // Unknown flags: true wins only when the value is still absent.
    existing.industries_unknown =
        (existing.industries_unknown || incoming.industries_unknown) && existing.industries.is_empty();
    existing.product_keywords_unknown = (existing.product_keywords_unknown
        || incoming.product_keywords_unknown)
        && existing.product_keywords.is_empty();
    existing.tagline_unknown =
        (existing.tagline_unknown || incoming.tagline_unknown) && existing.tagline.is_none();
    existing.headquarters_location_unknown = (existing.headquarters_location_unknown
        || incoming.headquarters_location_unknown)
        && existing.headquarters_location.is_none();
    existing.manufacturing_locations_unknown = (existing.manufacturing_locations_unknown
        || incoming.manufacturing_locations_unknown)
        && existing.manufacturing_locations.is_empty();

    // Bookkeeping: counters take max, reasons keep terminal variants,
    // trails append.
    max_counters(&mut existing.import_attempts, &incoming.import_attempts);
    for (key, reason) in incoming.import_missing_reason {
        match existing.import_missing_reason.get(&key) {
            Some(current) if current.is_terminal() => {}
            _ => {
                existing.import_missing_reason.insert(key, reason);
            }
        }
    }
    for (key, meta) in incoming.import_attempts_meta {
        existing.import_attempts_meta.entry(key).or_insert(meta);
    }
    for (key, detail) in incoming.import_attempts_detail {
        existing.import_attempts_detail.entry(key).or_insert(detail);
    }
    for warning in incoming.import_warnings {
        if !existing.import_warnings.contains(&warning) {
            existing.import_warnings.push(warning);
        }
    }
    for prov in incoming.location_sources {
        if !existing
            .location_sources
            .iter()
            .any(|p| p.field == prov.field && p.source_url == prov.source_url)
        {
            existing.location_sources.push(prov);
        }
    }

    existing.red_flag = existing.red_flag || incoming.red_flag;
    if existing.red_flag_reason.is_none() {
        existing.red_flag_reason = incoming.red_flag_reason;
    }
    existing.updated_at = chrono::Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EnrichField, MissingReason};

    fn doc(id: &str) -> CompanyDoc {
        CompanyDoc::seed(
            "sess-1",
            id.to_string(),
            "Acme".to_string(),
            None,
            Some("acme.example".to_string()),
        )
    }

    #[test]
    fn lists_union_and_dedupe() {
        let mut a = doc("a");
        a.industries = vec!["Skincare".to_string()];
        let mut b = doc("a");
        b.industries = vec!["skincare".to_string(), "Soap".to_string()];

        merge_company(&mut a, b);
        assert_eq!(a.industries, vec!["Skincare".to_string(), "Soap".to_string()]);
    }

    #[test]
    fn scalars_prefer_incoming_but_not_empty() {
        let mut a = doc("a");
        a.tagline = Some("Old tagline".to_string());
        let mut b = doc("a");
        b.tagline = Some("New tagline".to_string());
        merge_company(&mut a, b);
        assert_eq!(a.tagline.as_deref(), Some("New tagline"));

        let mut c = doc("a");
        c.tagline = None;
        let kept = a.tagline.clone();
        merge_company(&mut a, c);
        assert_eq!(a.tagline, kept);
    }

    #[test]
    fn terminal_reasons_survive_merge() {
        let mut a = doc("a");
        a.import_missing_reason
            .insert("tagline".to_string(), MissingReason::NotFoundTerminal);
        let mut b = doc("a");
        b.import_missing_reason
            .insert("tagline".to_string(), MissingReason::NotFound);

        merge_company(&mut a, b);
        assert_eq!(
            a.missing_reason(EnrichField::Tagline),
            Some(MissingReason::NotFoundTerminal)
        );
    }

    #[test]
    fn attempt_counters_take_max() {
        let mut a = doc("a");
        a.import_attempts.insert("logo".to_string(), 2);
        let mut b = doc("a");
        b.import_attempts.insert("logo".to_string(), 1);
        b.import_attempts.insert("tagline".to_string(), 3);

        merge_company(&mut a, b);
        assert_eq!(a.import_attempts["logo"], 2);
        assert_eq!(a.import_attempts["tagline"], 3);
    }

    #[test]
    fn stale_incomplete_never_demotes_a_completed_stage() {
        let mut a = doc("a");
        a.reviews_stage_status = StageStatus::Complete;
        a.logo_stage_status = StageStatus::Complete;
        let mut b = doc("a");
        b.reviews_stage_status = StageStatus::Incomplete;
        b.logo_stage_status = StageStatus::Incomplete;

        merge_company(&mut a, b);
        assert_eq!(a.reviews_stage_status, StageStatus::Complete);
        assert_eq!(a.logo_stage_status, StageStatus::Complete);

        // Pending still upgrades to whichever state arrives.
        let mut c = doc("a");
        c.reviews_stage_status = StageStatus::Pending;
        let mut d = doc("a");
        d.reviews_stage_status = StageStatus::Incomplete;
        merge_company(&mut c, d);
        assert_eq!(c.reviews_stage_status, StageStatus::Incomplete);
    }

    #[test]
    fn concurrent_field_write_survives_logo_outcome_merge() {
        // Current store copy: another cycle already wrote the tagline.
        let mut current = doc("a");
        current.tagline = Some("We make widgets".to_string());
        current.import_attempts.insert("tagline".to_string(), 1);

        // Detached logo task carries a copy read before that write.
        let mut stale = doc("a");
        stale.logo_url = Some("https://cdn.example/a.png".to_string());
        stale.logo_source_url = Some("https://acme.example/logo.png".to_string());
        stale.logo_stage_status = StageStatus::Complete;

        merge_company(&mut current, stale);
        assert_eq!(current.tagline.as_deref(), Some("We make widgets"));
        assert_eq!(current.import_attempts["tagline"], 1);
        assert_eq!(current.logo_url.as_deref(), Some("https://cdn.example/a.png"));
        assert_eq!(current.logo_stage_status, StageStatus::Complete);
    }

    #[test]
    fn unknown_flag_clears_once_value_exists() {
        let mut a = doc("a");
        a.tagline_unknown = true;
        let mut b = doc("a");
        b.tagline = Some("We make widgets".to_string());
        merge_company(&mut a, b);
        assert!(!a.tagline_unknown);
        assert!(a.tagline.is_some());
    }
}
