//! Field-specific quality gates. A value that fails its gate is treated
//! as `low_quality`, which is retryable until the attempt cap.

use crate::models::{Address, SourceKind};
use crate::services::logo::extract::url_host;

const PLACEHOLDER_STRINGS: [&str; 8] = [
    "unknown",
    "n/a",
    "na",
    "none",
    "not found",
    "not_found",
    "notfound",
    "-",
];

const SENTINEL_STRINGS: [&str; 2] = ["not disclosed", "not_disclosed"];

/// Marketplace buckets too generic to be a real industry label.
const INDUSTRY_MARKETPLACE_BUCKETS: [&str; 7] = [
    "home goods",
    "home",
    "food",
    "electronics",
    "shopping",
    "retail",
    "marketplace",
];

/// Navigation crumbs scraped off storefronts by over-eager upstreams.
const INDUSTRY_NAV_TERMS: [&str; 12] = [
    "shop",
    "bestsellers",
    "best sellers",
    "featured",
    "new arrivals",
    "collections",
    "collection",
    "categories",
    "category",
    "bundles",
    "gift cards",
    "sale",
];

/// Short controlled vocabulary industries are mapped into when a token
/// matches; unmatched plausible labels pass through title-cased.
const INDUSTRY_CANONICAL_MAP: [(&[&str], &str); 14] = [
    (&["supplement", "vitamin", "nutrition", "wellness"], "Supplements"),
    (&["oral care", "dental", "tooth", "teeth"], "Oral Care"),
    (&["skin", "skincare", "cosmetic", "beauty"], "Skincare"),
    (&["personal care", "hygiene", "groom"], "Personal Care"),
    (&["soap"], "Soap"),
    (&["bath", "body wash", "shampoo", "conditioner"], "Bath & Body"),
    (&["fragrance", "candle", "diffuser", "essential oil"], "Home Fragrance"),
    (&["household", "laundry", "detergent", "disinfect"], "Household Cleaning"),
    (&["pet", "veterinary", "dog", "cat"], "Pet Care"),
    (&["medical", "healthcare", "pharma", "clinic"], "Healthcare"),
    (&["apparel", "clothing", "fashion"], "Apparel"),
    (&["technology", "software", "saas", "cloud"], "Technology"),
    (&["food", "beverage", "snack"], "Food & Beverage"),
    (&["automotive", "vehicle", "car"], "Automotive"),
];

const KEYWORD_DISALLOW_TERMS: [&str; 20] = [
    "unknown", "privacy", "terms", "policy", "cookie", "shop", "collections", "new arrivals",
    "best sellers", "featured", "sale", "gift", "subscription", "login", "cart", "checkout",
    "instagram", "facebook", "blog", "sitemap",
];

fn normalize_key(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Placeholder detection backs the hygiene invariant: these strings are
/// never stored as canonical values.
pub fn is_placeholder(value: &str) -> bool {
    let key = normalize_key(value);
    PLACEHOLDER_STRINGS.contains(&key.as_str())
}

/// The single allowed sentinel, written only at `not_disclosed` terminality.
pub fn is_not_disclosed_sentinel(value: &str) -> bool {
    let key = normalize_key(value);
    SENTINEL_STRINGS.contains(&key.as_str())
}

fn to_title_case(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sanitize an industries list: drop placeholders, marketplace buckets and
/// navigation crumbs, map to the canonical vocabulary, dedupe. An empty
/// result means the field failed its quality gate.
pub fn sanitize_industries(raw: &[String]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    let mut out: Vec<String> = Vec::new();

    for item in raw {
        let key = normalize_key(item);
        if key.is_empty() || is_placeholder(item) || is_not_disclosed_sentinel(item) {
            continue;
        }
        if key == "baby" || key == "babies" {
            continue;
        }
        if INDUSTRY_MARKETPLACE_BUCKETS.contains(&key.as_str()) {
            continue;
        }
        if INDUSTRY_NAV_TERMS.iter().any(|t| key.contains(t)) {
            continue;
        }
        if key.contains("http://") || key.contains("https://") {
            continue;
        }
        let word_count = key.split_whitespace().count();
        if word_count == 0 || word_count > 5 || key.len() < 3 || key.len() > 50 {
            continue;
        }
        if !key.chars().any(|c| c.is_ascii_alphabetic()) {
            continue;
        }

        let canonical = INDUSTRY_CANONICAL_MAP
            .iter()
            .find(|(tokens, _)| tokens.iter().any(|t| key.contains(t)))
            .map(|(_, c)| c.to_string())
            .unwrap_or_else(|| to_title_case(item.trim()));

        let canonical_key = normalize_key(&canonical);
        if !seen.contains(&canonical_key) {
            seen.push(canonical_key);
            out.push(canonical);
        }
    }
    out
}

fn is_keyword_junk(keyword: &str) -> bool {
    let raw = keyword.trim();
    let key = normalize_key(raw);
    if key.len() < 3 || is_placeholder(raw) {
        return true;
    }
    if key.contains("http://") || key.contains("https://") {
        return true;
    }
    if !key.chars().any(|c| c.is_ascii_alphabetic()) {
        return true;
    }
    if KEYWORD_DISALLOW_TERMS.iter().any(|t| key.contains(t)) {
        return true;
    }
    // ALL-CAPS nav labels ("SHOP ALL") are rarely product names; SKUs with
    // digits survive.
    let has_digits = raw.chars().any(|c| c.is_ascii_digit());
    let is_all_caps =
        raw.chars().any(|c| c.is_ascii_uppercase()) && !raw.chars().any(|c| c.is_ascii_lowercase());
    if is_all_caps && !has_digits && raw.len() <= 30 {
        return true;
    }
    false
}

pub fn sanitize_keywords(raw: &[String]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    let mut out: Vec<String> = Vec::new();
    for k in raw {
        let k = k.trim();
        if k.is_empty() || is_keyword_junk(k) {
            continue;
        }
        let key = normalize_key(k);
        if !seen.contains(&key) {
            seen.push(key);
            out.push(k.to_string());
        }
    }
    out
}

/// Taglines must be real sentences, not placeholders or essays.
pub fn tagline_passes(tagline: &str) -> bool {
    let t = tagline.trim();
    if t.len() < 8 || t.len() > 240 {
        return false;
    }
    if is_placeholder(t) || is_not_disclosed_sentinel(t) {
        return false;
    }
    if t.contains("http://") || t.contains("https://") {
        return false;
    }
    t.chars().any(|c| c.is_ascii_alphabetic())
}

pub fn address_passes(address: &Address) -> bool {
    let raw = address.raw.trim();
    !raw.is_empty() && !is_placeholder(raw) && !is_not_disclosed_sentinel(raw) && raw.len() >= 3
}

/// Hosts never accepted as location provenance: gig marketplaces host
/// seller pages whose addresses are unrelated to the company.
const DISALLOWED_PROVENANCE_HOSTS: [&str; 2] = ["fiverr.com", "upwork.com"];

pub fn provenance_url_allowed(url: &str) -> bool {
    match url_host(url) {
        Some(host) => {
            let host = host.strip_prefix("www.").unwrap_or(&host);
            !DISALLOWED_PROVENANCE_HOSTS.contains(&host)
        }
        None => false,
    }
}

/// Classify where a value came from, for provenance records.
pub fn classify_source(url: &str, normalized_domain: Option<&str>) -> SourceKind {
    let Some(host) = url_host(url) else {
        return SourceKind::Other;
    };
    if let Some(domain) = normalized_domain {
        if !domain.is_empty() && (host == domain || host.ends_with(&format!(".{domain}"))) {
            return SourceKind::OfficialSite;
        }
    }
    let social = [
        "instagram.com",
        "facebook.com",
        "tiktok.com",
        "pinterest.com",
        "youtube.com",
        "twitter.com",
        "x.com",
    ];
    if social.iter().any(|s| host == *s || host.ends_with(&format!(".{s}"))) {
        return SourceKind::Social;
    }
    if host.contains("amazon.")
        || host.contains("etsy.com")
        || host.contains("ebay.com")
        || host.contains("walmart.com")
    {
        return SourceKind::Marketplace;
    }
    if host.ends_with(".gov") || host.contains(".gov.") {
        return SourceKind::Government;
    }
    if host.contains("news") || host.contains("press") || host.contains("magazine") {
        return SourceKind::News;
    }
    SourceKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_detected() {
        assert!(is_placeholder("Unknown"));
        assert!(is_placeholder("  n/a "));
        assert!(is_placeholder("NOT FOUND"));
        assert!(!is_placeholder("Acme Corp"));
    }

    #[test]
    fn sentinel_is_separate_from_placeholders() {
        assert!(is_not_disclosed_sentinel("Not disclosed"));
        assert!(is_not_disclosed_sentinel("not_disclosed"));
        assert!(!is_placeholder("Not disclosed"));
    }

    #[test]
    fn industries_map_to_canonical_vocabulary() {
        let raw = vec![
            "organic skincare".to_string(),
            "Shopping".to_string(),
            "Shop By Category".to_string(),
            "Unknown".to_string(),
            "Dental hygiene".to_string(),
        ];
        let out = sanitize_industries(&raw);
        assert_eq!(out, vec!["Skincare".to_string(), "Oral Care".to_string()]);
    }

    #[test]
    fn unmapped_plausible_industries_are_title_cased() {
        let out = sanitize_industries(&["precision optics".to_string()]);
        assert_eq!(out, vec!["Precision Optics".to_string()]);
    }

    #[test]
    fn keywords_drop_nav_and_caps_junk() {
        let raw = vec![
            "SHOP ALL".to_string(),
            "lavender soap bar".to_string(),
            "privacy policy".to_string(),
            "lavender soap bar".to_string(),
            "USB-C 100W charger".to_string(),
        ];
        let out = sanitize_keywords(&raw);
        assert_eq!(
            out,
            vec![
                "lavender soap bar".to_string(),
                "USB-C 100W charger".to_string()
            ]
        );
    }

    #[test]
    fn tagline_gate_rejects_placeholders_and_extremes() {
        assert!(tagline_passes("Handmade soap from the Rockies"));
        assert!(!tagline_passes("Unknown"));
        assert!(!tagline_passes("ok"));
        assert!(!tagline_passes(&"x".repeat(300)));
    }

    #[test]
    fn gig_marketplaces_are_not_provenance() {
        assert!(!provenance_url_allowed("https://www.fiverr.com/seller/x"));
        assert!(!provenance_url_allowed("https://upwork.com/profile"));
        assert!(provenance_url_allowed("https://acme.example/about"));
        assert!(!provenance_url_allowed("not a url"));
    }

    #[test]
    fn source_classification() {
        assert_eq!(
            classify_source("https://acme.example/about", Some("acme.example")),
            SourceKind::OfficialSite
        );
        assert_eq!(
            classify_source("https://www.instagram.com/acme", None),
            SourceKind::Social
        );
        assert_eq!(
            classify_source("https://amazon.com/shop/acme", None),
            SourceKind::Marketplace
        );
        assert_eq!(
            classify_source("https://somedirectory.example/acme", None),
            SourceKind::Other
        );
        assert_eq!(classify_source("https://ftc.gov/filing", None), SourceKind::Government);
    }
}
