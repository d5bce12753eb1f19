use std::io::Cursor;
use std::sync::LazyLock;
use std::time::Duration;

use image::ImageReader;
use regex::Regex;
use reqwest::{Client, StatusCode};
use tracing::debug;

pub const MAX_IMAGE_BYTES: usize = 8 * 1024 * 1024;
const MIN_LOGO_DIMENSION: u32 = 16;
const HERO_MIN_WIDTH: u32 = 1_000;
const HERO_ASPECT_RATIO: f64 = 3.5;

/// Exact dimensions that are almost always full-bleed marketing banners.
const HERO_DIMENSIONS: [(u32, u32); 4] = [(1920, 1080), (1920, 600), (1600, 900), (2560, 1440)];

#[derive(Debug, Clone)]
pub struct ValidatedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub final_url: String,
    pub is_svg: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("image fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("resource gone: status {0}")]
    Gone(StatusCode),

    #[error("fetch returned status {0}")]
    BadStatus(StatusCode),

    #[error("response was empty")]
    Empty,

    #[error("image exceeds {MAX_IMAGE_BYTES} bytes")]
    TooLarge,

    #[error("not an image: content-type {0}")]
    NotAnImage(String),

    #[error("svg failed safety scan: {0}")]
    UnsafeSvg(&'static str),

    #[error("dimensions unreadable")]
    NoDimensions,

    #[error("rejected as hero/banner imagery ({width}x{height})")]
    HeroImagery { width: u32, height: u32 },

    #[error("image too small ({width}x{height})")]
    TooSmall { width: u32, height: u32 },
}

/// HEAD first. A definite 404/410 kills the candidate without a download;
/// ambiguous statuses (405, 403, 501) say nothing because many hosts block
/// HEAD, so the GET proceeds regardless.
pub async fn head_probe(http: &Client, url: &str, timeout: Duration) -> Result<(), ValidateError> {
    let response = match http.head(url).timeout(timeout).send().await {
        Ok(r) => r,
        Err(err) => {
            debug!(url, error = %err, "HEAD probe failed, continuing to GET");
            return Ok(());
        }
    };
    match response.status() {
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(ValidateError::Gone(response.status())),
        _ => Ok(()),
    }
}

/// Size-capped GET. The cap is enforced on the received body, not trusted
/// from content-length.
pub async fn fetch_image(
    http: &Client,
    url: &str,
    timeout: Duration,
) -> Result<(Vec<u8>, String, String), ValidateError> {
    let response = http
        .get(url)
        .timeout(timeout)
        .header(
            reqwest::header::ACCEPT,
            "image/svg+xml,image/png,image/jpeg,image/webp,*/*",
        )
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(ValidateError::BadStatus(status));
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let final_url = response.url().to_string();

    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Err(ValidateError::Empty);
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ValidateError::TooLarge);
    }
    Ok((bytes.to_vec(), content_type, final_url))
}

/// SVG by content-type, extension, or a `<svg` tag in the first bytes.
pub fn sniff_is_svg(content_type: &str, url: &str, bytes: &[u8]) -> bool {
    if content_type.to_lowercase().contains("image/svg+xml") {
        return true;
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.to_lowercase().ends_with(".svg") {
        return true;
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_lowercase();
    head.contains("<svg")
}

static SVG_SCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b").unwrap());
static SVG_EVENT_HANDLER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)\bon[a-z]+\s*="#).unwrap());
static SVG_JS_HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)href\s*=\s*["']\s*javascript:"#).unwrap());
static SVG_FOREIGN_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<foreignObject\b").unwrap());

/// Reject SVGs carrying executable payloads. These bytes get re-served
/// from our own origin, so anything scriptable is a hard no.
pub fn scan_svg_safety(bytes: &[u8]) -> Result<(), ValidateError> {
    let text = String::from_utf8_lossy(bytes);
    if SVG_SCRIPT.is_match(&text) {
        return Err(ValidateError::UnsafeSvg("script element"));
    }
    if SVG_EVENT_HANDLER.is_match(&text) {
        return Err(ValidateError::UnsafeSvg("event handler attribute"));
    }
    if SVG_JS_HREF.is_match(&text) {
        return Err(ValidateError::UnsafeSvg("javascript href"));
    }
    if SVG_FOREIGN_OBJECT.is_match(&text) {
        return Err(ValidateError::UnsafeSvg("foreignObject element"));
    }
    Ok(())
}

static SVG_VIEWBOX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)viewBox\s*=\s*["']\s*[\d.+-]+[\s,]+[\d.+-]+[\s,]+([\d.]+)[\s,]+([\d.]+)"#)
        .unwrap()
});
static SVG_WIDTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)<svg\b[^>]*\bwidth\s*=\s*["']?([\d.]+)"#).unwrap());
static SVG_HEIGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)<svg\b[^>]*\bheight\s*=\s*["']?([\d.]+)"#).unwrap());

/// Raster dimensions via the image decoder; SVG dimensions from explicit
/// width/height attributes with the viewBox as fallback.
pub fn read_dimensions(bytes: &[u8], is_svg: bool) -> Option<(u32, u32)> {
    if is_svg {
        let text = String::from_utf8_lossy(bytes);
        let w = SVG_WIDTH
            .captures(&text)
            .and_then(|c| c[1].parse::<f64>().ok());
        let h = SVG_HEIGHT
            .captures(&text)
            .and_then(|c| c[1].parse::<f64>().ok());
        if let (Some(w), Some(h)) = (w, h) {
            return Some((w.round() as u32, h.round() as u32));
        }
        if let Some(c) = SVG_VIEWBOX.captures(&text) {
            let w = c[1].parse::<f64>().ok()?;
            let h = c[2].parse::<f64>().ok()?;
            return Some((w.round() as u32, h.round() as u32));
        }
        return None;
    }

    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// Heuristics against marketing photography: extreme landscape aspect at
/// banner scale, or exact full-bleed dimensions.
pub fn check_hero_heuristics(
    width: u32,
    height: u32,
    strong_signal: bool,
) -> Result<(), ValidateError> {
    if width < MIN_LOGO_DIMENSION || height < MIN_LOGO_DIMENSION {
        return Err(ValidateError::TooSmall { width, height });
    }
    if strong_signal {
        return Ok(());
    }
    if HERO_DIMENSIONS.contains(&(width, height)) {
        return Err(ValidateError::HeroImagery { width, height });
    }
    let aspect = f64::from(width) / f64::from(height.max(1));
    if width >= HERO_MIN_WIDTH && aspect > HERO_ASPECT_RATIO {
        return Err(ValidateError::HeroImagery { width, height });
    }
    Ok(())
}

/// Full validation of one candidate URL: probe, capped fetch, sniff,
/// safety scan, dimensions, hero heuristics.
pub async fn validate_candidate(
    http: &Client,
    url: &str,
    strong_signal: bool,
    timeout: Duration,
) -> Result<ValidatedImage, ValidateError> {
    head_probe(http, url, timeout).await?;
    let (bytes, content_type, final_url) = fetch_image(http, url, timeout).await?;

    let ct_lower = content_type.to_lowercase();
    let is_svg = sniff_is_svg(&content_type, &final_url, &bytes);
    if !is_svg && !ct_lower.starts_with("image/") && !ct_lower.is_empty() {
        return Err(ValidateError::NotAnImage(content_type));
    }
    if is_svg {
        scan_svg_safety(&bytes)?;
    }

    let dims = read_dimensions(&bytes, is_svg);
    if let Some((width, height)) = dims {
        check_hero_heuristics(width, height, strong_signal)?;
    } else if !is_svg {
        // Undecodable raster bytes are not worth serving.
        return Err(ValidateError::NoDimensions);
    }

    Ok(ValidatedImage {
        bytes,
        content_type,
        final_url,
        is_svg,
        width: dims.map(|d| d.0),
        height: dims.map(|d| d.1),
    })
}
