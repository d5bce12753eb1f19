pub mod merge;
pub mod quality;

use chrono::Utc;
use tracing::debug;

use crate::models::{
    CompanyDoc, EnrichField, IncompleteReason, MissingReason, Provenance, ReviewCursor,
    StageStatus,
};

/// Count one attempt for a field, at most once per upstream request id.
/// Returns whether the counter actually moved, so a re-invoked worker
/// carrying the same request id cannot double-count.
pub fn bump_field_attempt(doc: &mut CompanyDoc, field: EnrichField, request_id: &str) -> bool {
    let key = field.as_str().to_string();
    let now = Utc::now();

    if doc.import_attempts_meta.get(&key).map(String::as_str) == Some(request_id) {
        let detail = doc.import_attempts_detail.entry(key).or_default();
        if detail.last_attempt_at.is_none() {
            detail.last_attempt_at = Some(now);
        }
        if detail.last_request_id.is_none() {
            detail.last_request_id = Some(request_id.to_string());
        }
        return false;
    }

    *doc.import_attempts.entry(key.clone()).or_insert(0) += 1;
    doc.import_attempts_meta
        .insert(key.clone(), request_id.to_string());
    let detail = doc.import_attempts_detail.entry(key).or_default();
    detail.last_attempt_at = Some(now);
    detail.last_request_id = Some(request_id.to_string());
    true
}

pub fn mark_field_success(doc: &mut CompanyDoc, field: EnrichField) {
    let detail = doc
        .import_attempts_detail
        .entry(field.as_str().to_string())
        .or_default();
    detail.last_success_at = Some(Utc::now());
    detail.last_error = None;
}

pub fn mark_field_error(doc: &mut CompanyDoc, field: EnrichField, error: &str) {
    let detail = doc
        .import_attempts_detail
        .entry(field.as_str().to_string())
        .or_default();
    detail.last_error = Some(error.to_string());
}

/// Apply a missing-classification to a field. Terminal monotonicity holds:
/// an already terminal field is never reverted or re-reasoned. Returns the
/// reason actually recorded.
pub fn record_missing(
    doc: &mut CompanyDoc,
    field: EnrichField,
    reason: MissingReason,
    max_attempts: u32,
) -> MissingReason {
    if let Some(existing) = doc.missing_reason(field) {
        if existing.is_terminal() {
            return existing;
        }
    }

    let attempts = doc.attempts(field);
    let effective = if reason == MissingReason::NotDisclosed {
        MissingReason::NotDisclosed
    } else if attempts >= max_attempts {
        reason.terminalize()
    } else {
        reason
    };

    if effective.is_terminal() {
        terminalize_field(doc, field, effective);
    } else {
        // Stage statuses stay pending while a retry is still possible.
        if !matches!(field, EnrichField::Reviews | EnrichField::Logo) {
            doc.set_field_unknown(field, true);
        }
        doc.import_missing_reason
            .insert(field.as_str().to_string(), effective);
    }
    debug!(
        company_id = %doc.id,
        field = field.as_str(),
        reason = effective.as_str(),
        attempts,
        "field marked missing"
    );
    effective
}

/// Make a field terminal with the given reason. The "Not disclosed"
/// sentinel is written only here and only for the location fields, which
/// are the fields the sentinel was designed for.
pub fn terminalize_field(doc: &mut CompanyDoc, field: EnrichField, reason: MissingReason) {
    let reason = reason.terminalize();

    if field == EnrichField::Reviews {
        terminalize_reviews(doc);
        return;
    }

    doc.set_field_unknown(field, true);
    doc.import_missing_reason
        .insert(field.as_str().to_string(), reason);

    if reason == MissingReason::NotDisclosed {
        match field {
            EnrichField::HeadquartersLocation => {
                doc.headquarters_location =
                    Some(crate::models::Address::raw_only("Not disclosed"));
            }
            EnrichField::ManufacturingLocations => {
                doc.manufacturing_locations =
                    vec![crate::models::Address::raw_only("Not disclosed")];
            }
            _ => {}
        }
    }
}

/// Terminal completion of the reviews stage. The cursor's `exhausted` flag
/// is the terminality marker; the user-facing stage becomes `incomplete`,
/// never `pending` and never `exhausted`. `incomplete_reason` keeps
/// genuine absence distinguishable from repeated unreachability.
pub fn terminalize_reviews(doc: &mut CompanyDoc) {
    let mut cursor = doc.review_cursor.take().unwrap_or_default();

    if cursor.incomplete_reason.is_none() {
        let unreachable = cursor
            .last_error
            .as_deref()
            .map(|e| {
                let e = e.to_lowercase();
                e.contains("timeout") || e.contains("unreachable") || e.contains("connect")
            })
            .unwrap_or(false);
        cursor.incomplete_reason = Some(if unreachable {
            IncompleteReason::SourceUnreachable
        } else {
            IncompleteReason::NoReviewsFound
        });
    }
    cursor.exhausted = true;
    cursor.exhausted_at = Some(Utc::now());

    doc.review_cursor = Some(cursor);
    doc.reviews_stage_status = StageStatus::Incomplete;
    doc.import_missing_reason
        .insert(EnrichField::Reviews.as_str().to_string(), MissingReason::Exhausted);
}

/// Cycle-cap handling: anything still retryable is terminalized as
/// exhausted, because no further cycle will run for this session.
pub fn force_terminalize_remaining(doc: &mut CompanyDoc) {
    for field in doc.retryable_fields() {
        let reason = doc
            .missing_reason(field)
            .unwrap_or(MissingReason::Missing)
            .terminalize();
        terminalize_field(doc, field, reason);
    }
}

/// Flag the document as incompletely enriched without clobbering a more
/// specific reason already recorded.
pub fn mark_enrichment_incomplete(doc: &mut CompanyDoc, reason: &str, field: Option<EnrichField>) {
    doc.red_flag = true;
    let next = match field {
        Some(f) => format!("Enrichment incomplete: {reason} ({})", f.as_str()),
        None => format!("Enrichment incomplete: {reason}"),
    };
    let keep_existing = doc
        .red_flag_reason
        .as_deref()
        .map(|r| {
            let r = r.to_lowercase();
            !r.is_empty() && !r.contains("enrichment complete") && !r.contains("enrichment pending")
        })
        .unwrap_or(false);
    if !keep_existing {
        doc.red_flag_reason = Some(next);
    }
}

/// Hygiene pass: no canonical field may hold a bare placeholder string.
/// Anything found is cleared and re-expressed as unknown + reason.
pub fn scrub_placeholders(doc: &mut CompanyDoc) -> bool {
    let mut changed = false;

    if doc.industries.len() == 1 && quality::is_placeholder(&doc.industries[0]) {
        doc.industries.clear();
        record_missing(doc, EnrichField::Industries, MissingReason::NotFound, u32::MAX);
        changed = true;
    }
    if doc.product_keywords.len() == 1 && quality::is_placeholder(&doc.product_keywords[0]) {
        doc.product_keywords.clear();
        record_missing(doc, EnrichField::ProductKeywords, MissingReason::NotFound, u32::MAX);
        changed = true;
    }
    if let Some(tagline) = doc.tagline.clone() {
        if quality::is_placeholder(&tagline) {
            doc.tagline = None;
            record_missing(doc, EnrichField::Tagline, MissingReason::NotFound, u32::MAX);
            changed = true;
        }
    }
    if let Some(hq) = doc.headquarters_location.clone() {
        if quality::is_placeholder(&hq.raw) {
            doc.headquarters_location = None;
            record_missing(
                doc,
                EnrichField::HeadquartersLocation,
                MissingReason::NotFound,
                u32::MAX,
            );
            changed = true;
        }
    }
    changed
}

/// Append a provenance record for a successful extraction, deduplicated by
/// (field, source URL). Disallowed hosts are silently dropped.
pub fn add_provenance(
    doc: &mut CompanyDoc,
    field: EnrichField,
    source_url: &str,
    method: &str,
) -> bool {
    if !quality::provenance_url_allowed(source_url) {
        return false;
    }
    let exists = doc
        .location_sources
        .iter()
        .any(|p| p.field == field && p.source_url == source_url);
    if exists {
        return false;
    }
    let source_kind = quality::classify_source(source_url, doc.normalized_domain.as_deref());
    doc.location_sources.push(Provenance {
        field,
        source_url: source_url.to_string(),
        method: method.to_string(),
        source_kind,
        recorded_at: Utc::now(),
    });
    true
}

/// Record a reviews attempt on the cursor without terminalizing it.
pub fn note_review_attempt(doc: &mut CompanyDoc, attempted_url: &str, error: Option<&str>) {
    let cursor = doc.review_cursor.get_or_insert_with(ReviewCursor::default);
    if !attempted_url.is_empty() && !cursor.attempted_urls.iter().any(|u| u == attempted_url) {
        cursor.attempted_urls.push(attempted_url.to_string());
    }
    if let Some(err) = error {
        cursor.last_error = Some(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> CompanyDoc {
        CompanyDoc::seed(
            "sess-1",
            "acme-example-com".to_string(),
            "Acme".to_string(),
            Some("https://acme.example".to_string()),
            Some("acme.example".to_string()),
        )
    }

    #[test]
    fn attempt_counting_is_idempotent_per_request_id() {
        let mut d = doc();
        assert!(bump_field_attempt(&mut d, EnrichField::Tagline, "req-1"));
        assert!(!bump_field_attempt(&mut d, EnrichField::Tagline, "req-1"));
        assert_eq!(d.attempts(EnrichField::Tagline), 1);

        assert!(bump_field_attempt(&mut d, EnrichField::Tagline, "req-2"));
        assert_eq!(d.attempts(EnrichField::Tagline), 2);
    }

    #[test]
    fn not_disclosed_terminalizes_immediately_with_sentinel() {
        let mut d = doc();
        bump_field_attempt(&mut d, EnrichField::HeadquartersLocation, "req-1");
        let recorded = record_missing(
            &mut d,
            EnrichField::HeadquartersLocation,
            MissingReason::NotDisclosed,
            3,
        );
        assert_eq!(recorded, MissingReason::NotDisclosed);
        assert!(d.field_terminal(EnrichField::HeadquartersLocation));
        assert_eq!(
            d.headquarters_location.as_ref().unwrap().raw,
            "Not disclosed"
        );
        assert!(d.headquarters_location_unknown);
    }

    #[test]
    fn retryable_reason_terminalizes_at_cap_with_terminal_variant() {
        let mut d = doc();
        for i in 0..3 {
            bump_field_attempt(&mut d, EnrichField::Tagline, &format!("req-{i}"));
            record_missing(&mut d, EnrichField::Tagline, MissingReason::NotFound, 3);
        }
        assert_eq!(
            d.missing_reason(EnrichField::Tagline),
            Some(MissingReason::NotFoundTerminal)
        );
        assert!(d.field_terminal(EnrichField::Tagline));
    }

    #[test]
    fn terminal_fields_are_monotonic() {
        let mut d = doc();
        terminalize_field(&mut d, EnrichField::Tagline, MissingReason::LowQuality);
        assert_eq!(
            d.missing_reason(EnrichField::Tagline),
            Some(MissingReason::LowQualityTerminal)
        );

        let recorded = record_missing(&mut d, EnrichField::Tagline, MissingReason::NotFound, 3);
        assert_eq!(recorded, MissingReason::LowQualityTerminal);
        assert_eq!(
            d.missing_reason(EnrichField::Tagline),
            Some(MissingReason::LowQualityTerminal)
        );
    }

    #[test]
    fn reviews_terminalization_sets_incomplete_never_pending() {
        let mut d = doc();
        for i in 0..3 {
            bump_field_attempt(&mut d, EnrichField::Reviews, &format!("req-{i}"));
            note_review_attempt(&mut d, &format!("https://r.example/{i}"), None);
            record_missing(&mut d, EnrichField::Reviews, MissingReason::NotFound, 3);
        }
        let cursor = d.review_cursor.as_ref().unwrap();
        assert!(cursor.exhausted);
        assert_eq!(d.reviews_stage_status, StageStatus::Incomplete);
        assert_eq!(
            cursor.incomplete_reason,
            Some(IncompleteReason::NoReviewsFound)
        );
        assert_eq!(cursor.attempted_urls.len(), 3);
    }

    #[test]
    fn reviews_unreachability_is_preserved_in_incomplete_reason() {
        let mut d = doc();
        note_review_attempt(&mut d, "https://r.example/1", Some("connect timeout"));
        terminalize_reviews(&mut d);
        assert_eq!(
            d.review_cursor.as_ref().unwrap().incomplete_reason,
            Some(IncompleteReason::SourceUnreachable)
        );
    }

    #[test]
    fn force_terminalize_clears_all_retryables() {
        let mut d = doc();
        d.import_missing_reason
            .insert("tagline".to_string(), MissingReason::LowQuality);
        d.tagline = None;
        force_terminalize_remaining(&mut d);
        assert!(d.retryable_fields().is_empty());
        assert_eq!(
            d.missing_reason(EnrichField::Tagline),
            Some(MissingReason::LowQualityTerminal)
        );
        assert!(d.review_cursor.as_ref().unwrap().exhausted);
    }

    #[test]
    fn placeholder_scrub_re_expresses_as_unknown() {
        let mut d = doc();
        d.industries = vec!["Unknown".to_string()];
        d.tagline = Some("N/A".to_string());
        assert!(scrub_placeholders(&mut d));
        assert!(d.industries.is_empty());
        assert!(d.industries_unknown);
        assert!(d.tagline.is_none());
        assert!(d.tagline_unknown);
        assert!(d.missing_reason(EnrichField::Industries).is_some());
    }

    #[test]
    fn provenance_dedupes_and_filters_hosts() {
        let mut d = doc();
        assert!(add_provenance(
            &mut d,
            EnrichField::HeadquartersLocation,
            "https://acme.example/contact",
            "homepage_scan",
        ));
        assert!(!add_provenance(
            &mut d,
            EnrichField::HeadquartersLocation,
            "https://acme.example/contact",
            "homepage_scan",
        ));
        assert!(!add_provenance(
            &mut d,
            EnrichField::HeadquartersLocation,
            "https://www.fiverr.com/acme",
            "search",
        ));
        assert_eq!(d.location_sources.len(), 1);
        assert_eq!(
            d.location_sources[0].source_kind,
            crate::models::SourceKind::OfficialSite
        );
    }

    #[test]
    fn red_flag_reason_is_not_clobbered() {
        let mut d = doc();
        mark_enrichment_incomplete(&mut d, "upstream unreachable", Some(EnrichField::Reviews));
        let first = d.red_flag_reason.clone();
        mark_enrichment_incomplete(&mut d, "cycle cap reached", None);
        assert_eq!(d.red_flag_reason, first);
        assert!(d.red_flag);
    }
}
