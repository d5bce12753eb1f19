use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Which structural signal produced a candidate. Ordering is the tier
/// priority used when deciding how many candidates to actually validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogoSource {
    Provided,
    Jsonld,
    OgLogo,
    OgImage,
    TwitterImage,
    Header,
    HomepageLink,
    Icon,
    Footer,
}

impl LogoSource {
    pub fn as_str(self) -> &'static str {
        match self {
            LogoSource::Provided => "provided",
            LogoSource::Jsonld => "jsonld",
            LogoSource::OgLogo => "og_logo",
            LogoSource::OgImage => "og_image",
            LogoSource::TwitterImage => "twitter_image",
            LogoSource::Header => "header",
            LogoSource::HomepageLink => "homepage_link",
            LogoSource::Icon => "icon",
            LogoSource::Footer => "footer",
        }
    }
}

/// One discovered image URL with its scoring inputs. Ephemeral; only the
/// winning URL ever leaves the engine.
#[derive(Debug, Clone)]
pub struct LogoCandidate {
    pub url: String,
    pub source: LogoSource,
    pub score: i32,
    /// A logo token appeared in id/class/alt or the markup names it a logo
    /// outright. Strong-signal candidates survive the off-site CDN filter.
    pub strong_signal: bool,
    pub position: usize,
}

pub fn normalize_domain(domain: &str) -> String {
    let raw = domain.trim().to_lowercase();
    raw.trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("www.")
        .trim_end_matches('/')
        .to_string()
}

/// Resolve a candidate URL against the page it was found on. `data:` URIs
/// are dropped outright.
pub fn absolutize_url(candidate: &str, base_url: &str) -> Option<String> {
    let raw = candidate.trim();
    if raw.is_empty() || raw.starts_with("data:") {
        return None;
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Some(raw.to_string());
    }
    let base = base_url.trim_end_matches('/');
    if let Some(rest) = raw.strip_prefix("//") {
        let scheme = if base.starts_with("http://") {
            "http"
        } else {
            "https"
        };
        return Some(format!("{scheme}://{rest}"));
    }
    let origin = origin_of(base)?;
    if raw.starts_with('/') {
        return Some(format!("{origin}{raw}"));
    }
    Some(format!("{base}/{raw}"))
}

fn origin_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .map(|r| ("https", r))
        .or_else(|| url.strip_prefix("http://").map(|r| ("http", r)))?;
    let host = rest.1.split('/').next()?;
    if host.is_empty() {
        return None;
    }
    Some(format!("{}://{}", rest.0, host))
}

pub fn url_host(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.split('@').next_back()?.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

static JSONLD_SCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<script\b[^>]*type=["']application/ld\+json["'][^>]*>(.*?)</script>"#)
        .unwrap()
});

static META_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<meta\b[^>]*>").unwrap());

static IMG_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<img\b[^>]*>").unwrap());

static LINK_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<link\b[^>]*>").unwrap());

static LINKED_IMG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<a\b[^>]*>\s*(<img\b[^>]*>)").unwrap());

static HEADER_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(header|nav)\b[^>]*>(.*?)</(?:header|nav)>").unwrap()
});

static FOOTER_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<footer\b[^>]*>(.*?)</footer>").unwrap());

static ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([\w:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());

/// Pull lowercase attribute key/value pairs out of a single tag.
pub fn tag_attrs(tag: &str) -> Vec<(String, String)> {
    ATTR.captures_iter(tag)
        .map(|c| {
            let value = c.get(2).or_else(|| c.get(3)).map_or("", |m| m.as_str());
            (c[1].to_lowercase(), value.to_string())
        })
        .collect()
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Structured-data organization logo: `application/ld+json` scripts whose
/// object graph contains an Organization with a `logo` or `image`.
pub fn extract_jsonld_org(html: &str, base_url: &str) -> Vec<LogoCandidate> {
    let mut out = Vec::new();
    for caps in JSONLD_SCRIPT.captures_iter(html) {
        let position = caps.get(0).map(|m| m.start()).unwrap_or(0);
        let Ok(parsed) = serde_json::from_str::<Value>(caps[1].trim()) else {
            continue;
        };
        walk_org_logos(&parsed, base_url, position, &mut out);
    }
    out
}

fn walk_org_logos(value: &Value, base_url: &str, position: usize, out: &mut Vec<LogoCandidate>) {
    match value {
        Value::Array(items) => {
            for item in items {
                walk_org_logos(item, base_url, position, out);
            }
        }
        Value::Object(map) => {
            let is_org = match map.get("@type") {
                Some(Value::String(t)) => t.eq_ignore_ascii_case("organization"),
                Some(Value::Array(ts)) => ts.iter().any(|t| {
                    t.as_str()
                        .map(|s| s.eq_ignore_ascii_case("organization"))
                        .unwrap_or(false)
                }),
                _ => false,
            };
            if is_org {
                let logo = map.get("logo").or_else(|| map.get("image"));
                let raw = match logo {
                    Some(Value::String(s)) => Some(s.as_str()),
                    Some(Value::Object(obj)) => obj
                        .get("url")
                        .or_else(|| obj.get("contentUrl"))
                        .or_else(|| obj.get("@id"))
                        .and_then(Value::as_str),
                    _ => None,
                };
                if let Some(url) = raw.and_then(|r| absolutize_url(r, base_url)) {
                    out.push(LogoCandidate {
                        url,
                        source: LogoSource::Jsonld,
                        score: 0,
                        strong_signal: true,
                        position,
                    });
                }
            }
            for v in map.values() {
                walk_org_logos(v, base_url, position, out);
            }
        }
        _ => {}
    }
}

/// `og:image` / `og:logo` / `twitter:image` meta tags, either attribute order.
pub fn extract_meta_images(html: &str, base_url: &str) -> Vec<LogoCandidate> {
    let mut out = Vec::new();
    for m in META_TAG.find_iter(html) {
        let attrs = tag_attrs(m.as_str());
        let key = attr(&attrs, "property")
            .or_else(|| attr(&attrs, "name"))
            .unwrap_or("")
            .to_lowercase();
        let source = match key.as_str() {
            "og:logo" => LogoSource::OgLogo,
            "og:image" | "og:image:url" | "og:image:secure_url" => LogoSource::OgImage,
            "twitter:image" | "twitter:image:src" => LogoSource::TwitterImage,
            _ => continue,
        };
        let Some(url) = attr(&attrs, "content").and_then(|c| absolutize_url(c, base_url)) else {
            continue;
        };
        out.push(LogoCandidate {
            url,
            source,
            score: 0,
            strong_signal: source == LogoSource::OgLogo,
            position: m.start(),
        });
    }
    out
}

fn img_candidates_in(
    block: &str,
    block_offset: usize,
    base_url: &str,
    source: LogoSource,
    out: &mut Vec<LogoCandidate>,
) {
    for m in IMG_TAG.find_iter(block) {
        let attrs = tag_attrs(m.as_str());
        let src = attr(&attrs, "src").or_else(|| attr(&attrs, "data-src"));
        let Some(url) = src.and_then(|s| absolutize_url(s, base_url)) else {
            continue;
        };
        let hay = format!(
            "{} {} {}",
            attr(&attrs, "id").unwrap_or(""),
            attr(&attrs, "class").unwrap_or(""),
            attr(&attrs, "alt").unwrap_or("")
        )
        .to_lowercase();
        out.push(LogoCandidate {
            url,
            source,
            score: 0,
            strong_signal: hay.contains("logo"),
            position: block_offset + m.start(),
        });
    }
}

/// Images inside `<header>`/`<nav>` blocks.
pub fn extract_header_images(html: &str, base_url: &str) -> Vec<LogoCandidate> {
    let mut out = Vec::new();
    for caps in HEADER_BLOCK.captures_iter(html) {
        let block = caps.get(2).unwrap();
        img_candidates_in(
            block.as_str(),
            block.start(),
            base_url,
            LogoSource::Header,
            &mut out,
        );
    }
    out
}

/// The "image wrapped in a link" pattern typical of masthead logos.
pub fn extract_linked_images(html: &str, base_url: &str) -> Vec<LogoCandidate> {
    let mut out = Vec::new();
    for caps in LINKED_IMG.captures_iter(html) {
        let img = caps.get(1).unwrap();
        img_candidates_in(
            img.as_str(),
            img.start(),
            base_url,
            LogoSource::HomepageLink,
            &mut out,
        );
    }
    out
}

/// `<link rel=...icon...>` tags, with `/favicon.ico` as the implicit fallback.
pub fn extract_icons(html: &str, base_url: &str) -> Vec<LogoCandidate> {
    let mut out = Vec::new();
    for m in LINK_TAG.find_iter(html) {
        let attrs = tag_attrs(m.as_str());
        let rel = attr(&attrs, "rel").unwrap_or("").to_lowercase();
        if !rel.contains("icon") {
            continue;
        }
        let Some(url) = attr(&attrs, "href").and_then(|h| absolutize_url(h, base_url)) else {
            continue;
        };
        // apple-touch-icons are usually the largest raster available.
        let strong = rel.contains("apple-touch-icon");
        out.push(LogoCandidate {
            url,
            source: LogoSource::Icon,
            score: 0,
            strong_signal: strong,
            position: m.start(),
        });
    }
    if out.is_empty() {
        if let Some(origin) = origin_of(base_url) {
            out.push(LogoCandidate {
                url: format!("{origin}/favicon.ico"),
                source: LogoSource::Icon,
                score: 0,
                strong_signal: false,
                position: html.len(),
            });
        }
    }
    out
}

/// Images inside `<footer>` blocks. Footers repeat the logo often enough
/// to be worth a last-tier pass.
pub fn extract_footer_images(html: &str, base_url: &str) -> Vec<LogoCandidate> {
    let mut out = Vec::new();
    for caps in FOOTER_BLOCK.captures_iter(html) {
        let block = caps.get(1).unwrap();
        img_candidates_in(
            block.as_str(),
            block.start(),
            base_url,
            LogoSource::Footer,
            &mut out,
        );
    }
    out
}

/// Run every extractor over one page.
pub fn extract_all(html: &str, base_url: &str) -> Vec<LogoCandidate> {
    let mut out = extract_jsonld_org(html, base_url);
    out.extend(extract_meta_images(html, base_url));
    out.extend(extract_header_images(html, base_url));
    out.extend(extract_linked_images(html, base_url));
    out.extend(extract_icons(html, base_url));
    out.extend(extract_footer_images(html, base_url));
    out
}

/// Ordered home-page URLs to try for a domain: provided website first,
/// then bare domain, then the `www.` variant.
pub fn home_url_candidates(domain: &str, website_url: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |u: String| {
        if !u.is_empty() && !out.contains(&u) {
            out.push(u);
        }
    };

    if let Some(site) = website_url {
        let site = site.trim();
        if !site.is_empty() {
            let with_scheme = if site.starts_with("http") {
                site.to_string()
            } else {
                format!("https://{site}")
            };
            if let Some(origin) = origin_of(&with_scheme) {
                push(origin);
            }
        }
    }

    let d = normalize_domain(domain);
    if !d.is_empty() {
        push(format!("https://{d}"));
        push(format!("https://www.{d}"));
    }
    out
}
