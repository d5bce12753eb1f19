use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The enrichable fields of a company document, in enrichment order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EnrichField {
    Industries,
    ProductKeywords,
    Tagline,
    HeadquartersLocation,
    ManufacturingLocations,
    Reviews,
    Logo,
}

impl EnrichField {
    pub const ALL: [EnrichField; 7] = [
        EnrichField::Industries,
        EnrichField::ProductKeywords,
        EnrichField::Tagline,
        EnrichField::HeadquartersLocation,
        EnrichField::ManufacturingLocations,
        EnrichField::Reviews,
        EnrichField::Logo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EnrichField::Industries => "industries",
            EnrichField::ProductKeywords => "product_keywords",
            EnrichField::Tagline => "tagline",
            EnrichField::HeadquartersLocation => "headquarters_location",
            EnrichField::ManufacturingLocations => "manufacturing_locations",
            EnrichField::Reviews => "reviews",
            EnrichField::Logo => "logo",
        }
    }

}

/// Why a field has no value. The `*Terminal` variants and `NotDisclosed`
/// and `Exhausted` are never retried again within a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissingReason {
    Missing,
    NotFound,
    LowQuality,
    NotDisclosed,
    /// Upstream hinted at withholding but the signal was ambiguous; treated
    /// as retryable until confirmed or the attempt cap is reached.
    NotDisclosedPending,
    Exhausted,
    NotFoundTerminal,
    LowQualityTerminal,
}

impl MissingReason {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MissingReason::NotDisclosed
                | MissingReason::Exhausted
                | MissingReason::NotFoundTerminal
                | MissingReason::LowQualityTerminal
        )
    }

    /// The variant recorded when the attempt cap is reached, so the field
    /// is never retried even if classification logic changes later.
    pub fn terminalize(self) -> MissingReason {
        match self {
            MissingReason::NotFound => MissingReason::NotFoundTerminal,
            MissingReason::LowQuality => MissingReason::LowQualityTerminal,
            MissingReason::NotDisclosedPending => MissingReason::NotDisclosed,
            MissingReason::Missing => MissingReason::Exhausted,
            terminal => terminal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MissingReason::Missing => "missing",
            MissingReason::NotFound => "not_found",
            MissingReason::LowQuality => "low_quality",
            MissingReason::NotDisclosed => "not_disclosed",
            MissingReason::NotDisclosedPending => "not_disclosed_pending",
            MissingReason::Exhausted => "exhausted",
            MissingReason::NotFoundTerminal => "not_found_terminal",
            MissingReason::LowQualityTerminal => "low_quality_terminal",
        }
    }
}

/// Normalized location. Raw text always present; coordinates only when the
/// geocoder resolved them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Address {
    pub raw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Address {
    pub fn raw_only(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            lat: None,
            lng: None,
            source: None,
        }
    }
}

/// Where a value came from, classified so downstream consumers can weigh it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    OfficialSite,
    Social,
    Marketplace,
    Government,
    News,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub field: EnrichField,
    pub source_url: String,
    pub method: String,
    pub source_kind: SourceKind,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Review {
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
}

/// Why the reviews stage ended incomplete. Genuine absence and repeated
/// unreachability are distinct signals and must stay distinguishable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteReason {
    NoReviewsFound,
    SourceUnreachable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewCursor {
    #[serde(default)]
    pub exhausted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete_reason: Option<IncompleteReason>,
    #[serde(default)]
    pub attempted_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exhausted_at: Option<DateTime<Utc>>,
}

/// User-facing reviews stage status. Never reverts to `Pending` once the
/// cursor is exhausted, and the cursor's own flag never leaks here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Complete,
    Incomplete,
}

impl Default for StageStatus {
    fn default() -> Self {
        StageStatus::Pending
    }
}

/// Per-field bookkeeping beyond the bare attempt counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request_id: Option<String>,
}

/// The enrichment target. Seeded by the primary worker, patched field by
/// field by the resume worker, never deleted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyDoc {
    pub id: String,
    pub partition_key: String,
    pub session_id: String,
    pub company_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_domain: Option<String>,

    #[serde(default)]
    pub industries: Vec<String>,
    #[serde(default)]
    pub industries_unknown: bool,

    #[serde(default)]
    pub product_keywords: Vec<String>,
    #[serde(default)]
    pub product_keywords_unknown: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tagline: Option<String>,
    #[serde(default)]
    pub tagline_unknown: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headquarters_location: Option<Address>,
    #[serde(default)]
    pub headquarters_location_unknown: bool,

    #[serde(default)]
    pub manufacturing_locations: Vec<Address>,
    #[serde(default)]
    pub manufacturing_locations_unknown: bool,

    #[serde(default)]
    pub reviews: Vec<Review>,
    #[serde(default)]
    pub reviews_stage_status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_cursor: Option<ReviewCursor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_source_url: Option<String>,
    #[serde(default)]
    pub logo_stage_status: StageStatus,

    #[serde(default)]
    pub import_missing_reason: BTreeMap<String, MissingReason>,
    #[serde(default)]
    pub import_attempts: BTreeMap<String, u32>,
    #[serde(default)]
    pub import_attempts_meta: BTreeMap<String, String>,
    #[serde(default)]
    pub import_attempts_detail: BTreeMap<String, AttemptDetail>,
    #[serde(default)]
    pub import_warnings: Vec<String>,
    #[serde(default)]
    pub location_sources: Vec<Provenance>,

    #[serde(default)]
    pub red_flag: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub red_flag_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CompanyDoc {
    /// Seed stub created by the primary worker from one parsed candidate.
    pub fn seed(
        session_id: &str,
        id: String,
        company_name: String,
        website_url: Option<String>,
        normalized_domain: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let partition_key = normalized_domain
            .clone()
            .unwrap_or_else(|| session_id.to_string());
        Self {
            id,
            partition_key,
            session_id: session_id.to_string(),
            company_name,
            website_url,
            normalized_domain,
            industries: Vec::new(),
            industries_unknown: false,
            product_keywords: Vec::new(),
            product_keywords_unknown: false,
            tagline: None,
            tagline_unknown: false,
            headquarters_location: None,
            headquarters_location_unknown: false,
            manufacturing_locations: Vec::new(),
            manufacturing_locations_unknown: false,
            reviews: Vec::new(),
            reviews_stage_status: StageStatus::Pending,
            review_cursor: None,
            logo_url: None,
            logo_source_url: None,
            logo_stage_status: StageStatus::Pending,
            import_missing_reason: BTreeMap::new(),
            import_attempts: BTreeMap::new(),
            import_attempts_meta: BTreeMap::new(),
            import_attempts_detail: BTreeMap::new(),
            import_warnings: Vec::new(),
            location_sources: Vec::new(),
            red_flag: false,
            red_flag_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attempts(&self, field: EnrichField) -> u32 {
        self.import_attempts
            .get(field.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn missing_reason(&self, field: EnrichField) -> Option<MissingReason> {
        self.import_missing_reason.get(field.as_str()).copied()
    }

    /// A field is terminal once its recorded reason is terminal, or once
    /// it already has a real value.
    pub fn field_terminal(&self, field: EnrichField) -> bool {
        if self.field_has_value(field) {
            return true;
        }
        self.missing_reason(field)
            .map(MissingReason::is_terminal)
            .unwrap_or(false)
    }

    pub fn field_has_value(&self, field: EnrichField) -> bool {
        match field {
            EnrichField::Industries => !self.industries.is_empty(),
            EnrichField::ProductKeywords => !self.product_keywords.is_empty(),
            EnrichField::Tagline => self.tagline.is_some(),
            EnrichField::HeadquartersLocation => self.headquarters_location.is_some(),
            EnrichField::ManufacturingLocations => !self.manufacturing_locations.is_empty(),
            EnrichField::Reviews => !self.reviews.is_empty(),
            EnrichField::Logo => self.logo_url.is_some(),
        }
    }

    pub fn set_field_unknown(&mut self, field: EnrichField, unknown: bool) {
        match field {
            EnrichField::Industries => self.industries_unknown = unknown,
            EnrichField::ProductKeywords => self.product_keywords_unknown = unknown,
            EnrichField::Tagline => self.tagline_unknown = unknown,
            EnrichField::HeadquartersLocation => self.headquarters_location_unknown = unknown,
            EnrichField::ManufacturingLocations => {
                self.manufacturing_locations_unknown = unknown
            }
            EnrichField::Reviews => {
                if unknown {
                    self.reviews_stage_status = StageStatus::Incomplete;
                }
            }
            EnrichField::Logo => {
                if unknown {
                    self.logo_stage_status = StageStatus::Incomplete;
                }
            }
        }
    }

    /// Fields still worth attempting in a future cycle.
    pub fn retryable_fields(&self) -> Vec<EnrichField> {
        EnrichField::ALL
            .into_iter()
            .filter(|f| !self.field_terminal(*f))
            .collect()
    }
}
