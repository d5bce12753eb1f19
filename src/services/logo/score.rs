use std::collections::HashMap;

use super::extract::{url_host, LogoCandidate, LogoSource};

const LOGO_TOKENS: [&str; 4] = ["logo", "brand", "wordmark", "emblem"];
const HERO_TOKENS: [&str; 6] = ["hero", "banner", "slide", "carousel", "background", "cover"];

/// Off-site hosts allowed to serve a company's logo. Anything else
/// off-domain is dropped unless the candidate carries a strong signal.
const KNOWN_ASSET_CDNS: [&str; 10] = [
    "cdn.shopify.com",
    "assets.shopify.com",
    "images.ctfassets.net",
    "cloudfront.net",
    "cloudinary.com",
    "imgix.net",
    "akamaized.net",
    "twimg.com",
    "wixstatic.com",
    "squarespace-cdn.com",
];

/// How many candidates per source tier get fetched and validated. Network
/// validation is the expensive part; extraction is free by comparison.
pub const TIER_VALIDATION_CAP: usize = 3;

fn extension_score(url: &str) -> i32 {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    if path.ends_with(".svg") {
        60
    } else if path.ends_with(".png") {
        50
    } else if path.ends_with(".webp") {
        40
    } else if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        30
    } else if path.ends_with(".gif") {
        15
    } else if path.ends_with(".ico") {
        5
    } else {
        20
    }
}

fn source_score(source: LogoSource) -> i32 {
    match source {
        LogoSource::Provided => 100,
        LogoSource::Jsonld => 80,
        LogoSource::OgLogo => 70,
        LogoSource::Header => 55,
        LogoSource::HomepageLink => 45,
        LogoSource::OgImage => 30,
        LogoSource::TwitterImage => 25,
        LogoSource::Icon => 15,
        LogoSource::Footer => 10,
    }
}

/// Score one candidate. Cheap string heuristics only; byte-level checks
/// happen during validation.
pub fn score_candidate(candidate: &LogoCandidate, page_host: Option<&str>) -> i32 {
    let url_lower = candidate.url.to_lowercase();
    let mut score = source_score(candidate.source) + extension_score(&candidate.url);

    for token in LOGO_TOKENS {
        if url_lower.contains(token) {
            score += 25;
            break;
        }
    }
    for token in HERO_TOKENS {
        if url_lower.contains(token) {
            score -= 40;
            break;
        }
    }
    if url_lower.contains("favicon") {
        score -= 30;
    }
    if candidate.strong_signal {
        score += 30;
    }

    // Earlier in the document reads as closer to the masthead.
    if candidate.position < 5_000 {
        score += 12;
    } else if candidate.position < 15_000 {
        score += 6;
    }

    if let (Some(page), Some(host)) = (page_host, url_host(&candidate.url)) {
        let on_site = host == page || host.ends_with(&format!(".{page}"));
        if !on_site && !is_known_asset_cdn(&host) && !candidate.strong_signal {
            score -= 200;
        }
    }

    score
}

pub fn is_known_asset_cdn(host: &str) -> bool {
    KNOWN_ASSET_CDNS
        .iter()
        .any(|cdn| host == *cdn || host.ends_with(&format!(".{cdn}")))
}

fn normalize_for_dedupe(url: &str) -> String {
    let mut u = url.trim().to_lowercase();
    if let Some(idx) = u.find('#') {
        u.truncate(idx);
    }
    u.trim_end_matches('/').to_string()
}

/// Score, deduplicate by normalized URL (best score wins), drop rejected
/// off-site candidates, and cap each source tier. Output is validation
/// order: best first.
pub fn rank_candidates(
    mut candidates: Vec<LogoCandidate>,
    page_url: &str,
) -> Vec<LogoCandidate> {
    let page_host = url_host(page_url);
    for c in &mut candidates {
        c.score = score_candidate(c, page_host.as_deref());
    }
    candidates.retain(|c| c.score > 0);

    let mut best: HashMap<String, LogoCandidate> = HashMap::new();
    for c in candidates {
        let key = normalize_for_dedupe(&c.url);
        match best.get(&key) {
            Some(existing) if existing.score >= c.score => {}
            _ => {
                best.insert(key, c);
            }
        }
    }

    let mut ranked: Vec<LogoCandidate> = best.into_values().collect();
    ranked.sort_by(|a, b| {
        a.source
            .cmp(&b.source)
            .then_with(|| b.score.cmp(&a.score))
    });

    let mut per_tier: HashMap<LogoSource, usize> = HashMap::new();
    ranked.retain(|c| {
        let count = per_tier.entry(c.source).or_insert(0);
        *count += 1;
        *count <= TIER_VALIDATION_CAP
    });
    ranked
}

/// Shopify-style CDN URLs often arrive pre-shrunk to thumbnail size.
/// Strip the resize parameters so the full-resolution asset is fetched,
/// preserving unrelated params (cache-busting `v=` and the like). On any
/// host, `fm=` is stripped from SVG URLs: a format override on a vector
/// asset only ever degrades it.
pub fn strip_cdn_resize_params(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let host = match url_host(url) {
        Some(h) => h,
        None => return url.to_string(),
    };

    let is_shopify = host == "shopify.com" || host.ends_with(".shopify.com");
    let path_is_svg = base.to_lowercase().ends_with(".svg");

    if !is_shopify && !path_is_svg {
        return url.to_string();
    }

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or("").to_lowercase();
            let resize_param = matches!(
                key.as_str(),
                "width" | "height" | "crop" | "w" | "h" | "fit"
            );
            let svg_format_param = key == "fm";
            !(is_shopify && resize_param || path_is_svg && svg_format_param)
        })
        .collect();

    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", kept.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(url: &str, source: LogoSource, strong: bool, position: usize) -> LogoCandidate {
        LogoCandidate {
            url: url.to_string(),
            source,
            score: 0,
            strong_signal: strong,
            position,
        }
    }

    #[test]
    fn svg_outranks_raster_formats() {
        let svg = candidate("https://a.example/logo.svg", LogoSource::Header, false, 100);
        let png = candidate("https://a.example/logo.png", LogoSource::Header, false, 100);
        let ico = candidate("https://a.example/logo.ico", LogoSource::Header, false, 100);
        let host = Some("a.example");
        let s_svg = score_candidate(&svg, host);
        let s_png = score_candidate(&png, host);
        let s_ico = score_candidate(&ico, host);
        assert!(s_svg > s_png);
        assert!(s_png > s_ico);
    }

    #[test]
    fn hero_tokens_are_penalized() {
        let logo = candidate("https://a.example/img/logo.png", LogoSource::Header, false, 100);
        let hero = candidate("https://a.example/img/hero.png", LogoSource::Header, false, 100);
        assert!(score_candidate(&logo, Some("a.example")) > score_candidate(&hero, Some("a.example")));
    }

    #[test]
    fn offsite_urls_need_cdn_or_strong_signal() {
        let offsite = candidate("https://random.example/pic.png", LogoSource::Header, false, 100);
        assert!(score_candidate(&offsite, Some("a.example")) < 0);

        let cdn = candidate(
            "https://cdn.shopify.com/s/files/logo.png",
            LogoSource::Header,
            false,
            100,
        );
        assert!(score_candidate(&cdn, Some("a.example")) > 0);

        let strong = candidate("https://random.example/pic.png", LogoSource::Header, true, 100);
        assert!(score_candidate(&strong, Some("a.example")) > 0);
    }

    #[test]
    fn dedupe_keeps_best_score() {
        let ranked = rank_candidates(
            vec![
                candidate("https://a.example/logo.png", LogoSource::Footer, false, 90_000),
                candidate("https://a.example/logo.png", LogoSource::Header, true, 100),
            ],
            "https://a.example",
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].source, LogoSource::Header);
    }

    #[test]
    fn tier_cap_limits_validated_candidates() {
        let many: Vec<LogoCandidate> = (0..10)
            .map(|i| {
                candidate(
                    &format!("https://a.example/logo-{i}.png"),
                    LogoSource::Header,
                    true,
                    100 + i,
                )
            })
            .collect();
        let ranked = rank_candidates(many, "https://a.example");
        assert_eq!(ranked.len(), TIER_VALIDATION_CAP);
    }

    #[test]
    fn strips_shopify_resize_params() {
        let url = "https://cdn.shopify.com/s/files/1/0123/files/blue_nofill.png?crop=center&height=32&width=32";
        let result = strip_cdn_resize_params(url);
        assert!(!result.contains("width="));
        assert!(!result.contains("height="));
        assert!(!result.contains("crop="));
        assert!(result.contains("/blue_nofill.png"));
        assert!(result.starts_with("https://cdn.shopify.com/"));
    }

    #[test]
    fn strips_shorthand_resize_params() {
        let result =
            strip_cdn_resize_params("https://cdn.shopify.com/s/files/logo.png?w=100&h=100&fit=cover");
        assert!(!result.contains("w="));
        assert!(!result.contains("fit="));
    }

    #[test]
    fn preserves_unrelated_params_on_shopify() {
        let result =
            strip_cdn_resize_params("https://cdn.shopify.com/s/files/logo.png?v=1234567890&width=32");
        assert!(result.contains("v=1234567890"));
        assert!(!result.contains("width="));
    }

    #[test]
    fn handles_shopify_subdomain_variants() {
        let result =
            strip_cdn_resize_params("https://assets.shopify.com/path/image.png?height=64&width=64");
        assert!(!result.contains("height="));
        assert!(!result.contains("width="));
    }

    #[test]
    fn leaves_non_cdn_urls_alone() {
        let url = "https://example.com/logo.png?width=200&height=100";
        assert_eq!(strip_cdn_resize_params(url), url);

        let bare = "https://cdn.shopify.com/s/files/logo.png";
        assert_eq!(strip_cdn_resize_params(bare), bare);
    }

    #[test]
    fn strips_fm_from_svg_on_any_host() {
        let result = strip_cdn_resize_params("https://images.ctfassets.net/brand/logo.svg?fm=webp");
        assert!(!result.contains("fm="));
        assert!(result.contains("/logo.svg"));

        let png = "https://example.com/logo.png?fm=webp";
        assert_eq!(strip_cdn_resize_params(png), png);
    }

    #[test]
    fn tolerates_invalid_urls() {
        assert_eq!(strip_cdn_resize_params("not-a-url"), "not-a-url");
        assert_eq!(strip_cdn_resize_params(""), "");
    }
}
