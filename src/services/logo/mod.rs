pub mod extract;
pub mod score;
pub mod validate;

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::imageops::FilterType;
use image::ImageFormat;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::services::budget::{Budget, StageLimits};
use crate::services::storage::LogoStorage;

use extract::{extract_all, home_url_candidates, normalize_domain, LogoCandidate, LogoSource};
use score::{rank_candidates, strip_cdn_resize_params};
use validate::{validate_candidate, ValidateError, ValidatedImage};

const MAX_RASTER_DIMENSION: u32 = 500;
const PAGE_FETCH_DESIRED_MS: u64 = 8_000;
const IMAGE_FETCH_DESIRED_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct LogoRequest {
    pub company_id: String,
    pub domain: String,
    pub website_url: Option<String>,
    /// Skip discovery entirely when the caller already knows the asset URL.
    pub provided_source_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogoImportStatus {
    Imported,
    Missing,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogoOutcome {
    pub status: LogoImportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_source_url: Option<String>,
    pub strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogoOutcome {
    fn missing(strategy: &str, error: Option<String>) -> Self {
        Self {
            status: LogoImportStatus::Missing,
            logo_url: None,
            logo_source_url: None,
            strategy: strategy.to_string(),
            error,
        }
    }

    fn failed(strategy: &str, source: Option<String>, error: String) -> Self {
        Self {
            status: LogoImportStatus::Failed,
            logo_url: None,
            logo_source_url: source,
            strategy: strategy.to_string(),
            error: Some(error),
        }
    }
}

/// Discovery, scoring, validation and storage of one company logo. Every
/// network step takes its timeout from the invocation's budget; when the
/// budget runs out, the result is "missing", never a hang.
pub struct LogoEngine {
    http: Client,
    storage: Arc<LogoStorage>,
}

impl LogoEngine {
    pub fn new(storage: Arc<LogoStorage>) -> Self {
        let http = Client::builder()
            .user_agent("Mozilla/5.0 (compatible; EnrichBot/1.0)")
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_default();
        Self { http, storage }
    }

    pub async fn import_logo(&self, budget: &Budget, request: &LogoRequest) -> LogoOutcome {
        let candidates = match &request.provided_source_url {
            Some(url) if !url.trim().is_empty() => vec![LogoCandidate {
                url: url.trim().to_string(),
                source: LogoSource::Provided,
                score: i32::MAX,
                strong_signal: true,
                position: 0,
            }],
            _ => match self.discover(budget, request).await {
                Ok(found) => found,
                Err(reason) => return LogoOutcome::missing("discovery", Some(reason)),
            },
        };

        if candidates.is_empty() {
            return LogoOutcome::missing("discovery", Some("no logo candidates found".into()));
        }

        let mut last_error: Option<(String, String)> = None;
        for candidate in &candidates {
            if budget.should_defer_stage(2_000) {
                break;
            }
            let fetch_url = strip_cdn_resize_params(&candidate.url);
            let timeout = budget.clamp_stage_timeout(StageLimits {
                desired_ms: IMAGE_FETCH_DESIRED_MS,
                ..StageLimits::default()
            });
            match validate_candidate(&self.http, &fetch_url, candidate.strong_signal, timeout).await
            {
                Ok(image) => {
                    return self
                        .store_winner(request, candidate.source, image)
                        .await;
                }
                Err(err) => {
                    debug!(
                        url = %fetch_url,
                        source = candidate.source.as_str(),
                        error = %err,
                        "logo candidate rejected"
                    );
                    last_error = Some((candidate.source.as_str().to_string(), err.to_string()));
                    // A dead URL is cheap to skip; anything else already
                    // cost a fetch, so keep going down the ranking.
                    if matches!(err, ValidateError::Gone(_)) {
                        continue;
                    }
                }
            }
        }

        let error = last_error.map(|(_, e)| e);
        LogoOutcome::missing("validation", error)
    }

    async fn discover(
        &self,
        budget: &Budget,
        request: &LogoRequest,
    ) -> Result<Vec<LogoCandidate>, String> {
        let homes = home_url_candidates(&request.domain, request.website_url.as_deref());
        if homes.is_empty() {
            return Err("missing domain".to_string());
        }

        let mut last_error = String::new();
        for home in &homes {
            if budget.should_defer_stage(3_000) {
                return Err("budget exhausted before page fetch".to_string());
            }
            let timeout = budget.clamp_stage_timeout(StageLimits {
                desired_ms: PAGE_FETCH_DESIRED_MS,
                ..StageLimits::default()
            });
            match self.fetch_page(home, timeout).await {
                Ok((final_url, html)) => {
                    let candidates = rank_candidates(extract_all(&html, &final_url), &final_url);
                    if !candidates.is_empty() {
                        info!(
                            page = %final_url,
                            count = candidates.len(),
                            "logo candidates discovered"
                        );
                        return Ok(candidates);
                    }
                    last_error = "no logo candidates found".to_string();
                }
                Err(err) => {
                    warn!(home = %home, error = %err, "homepage fetch failed");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    async fn fetch_page(&self, url: &str, timeout: Duration) -> Result<(String, String), String> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml",
            )
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("homepage fetch failed status={status}"));
        }
        let final_url = response.url().to_string();
        let html = response.text().await.map_err(|e| e.to_string())?;
        Ok((final_url, html))
    }

    async fn store_winner(
        &self,
        request: &LogoRequest,
        source: LogoSource,
        image: ValidatedImage,
    ) -> LogoOutcome {
        let strategy = source.as_str().to_string();
        let (bytes, content_type, extension) = if image.is_svg {
            (image.bytes.clone(), "image/svg+xml", "svg")
        } else {
            match rasterize_to_png(&image.bytes) {
                Ok(png) => (png, "image/png", "png"),
                Err(err) => {
                    return LogoOutcome::failed(
                        &strategy,
                        Some(image.final_url),
                        format!("image processing failed: {err}"),
                    )
                }
            }
        };

        let key = format!("{}/{}.{extension}", request.company_id, Uuid::new_v4());
        match self.storage.upload_logo(&key, &bytes, content_type).await {
            Ok(url) => {
                info!(
                    company_id = %request.company_id,
                    strategy = %strategy,
                    logo_url = %url,
                    "logo imported"
                );
                LogoOutcome {
                    status: LogoImportStatus::Imported,
                    logo_url: Some(url),
                    logo_source_url: Some(image.final_url),
                    strategy,
                    error: None,
                }
            }
            Err(err) => LogoOutcome::failed(&strategy, Some(image.final_url), err.to_string()),
        }
    }
}

/// Decode, shrink to fit the bounding box without enlargement, re-encode
/// as PNG.
pub fn rasterize_to_png(bytes: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let decoded = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()?;
    let resized = if decoded.width() > MAX_RASTER_DIMENSION || decoded.height() > MAX_RASTER_DIMENSION
    {
        decoded.resize(
            MAX_RASTER_DIMENSION,
            MAX_RASTER_DIMENSION,
            FilterType::Lanczos3,
        )
    } else {
        decoded
    };
    let mut out = Vec::new();
    resized.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rasterize_shrinks_oversized_images() {
        let big = image::DynamicImage::new_rgba8(1200, 600);
        let mut bytes = Vec::new();
        big.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();

        let png = rasterize_to_png(&bytes).unwrap();
        let out = image::load_from_memory(&png).unwrap();
        assert!(out.width() <= MAX_RASTER_DIMENSION);
        assert!(out.height() <= MAX_RASTER_DIMENSION);
        // Aspect ratio preserved by fit-inside resize.
        assert_eq!(out.width(), 500);
        assert_eq!(out.height(), 250);
    }

    #[test]
    fn rasterize_keeps_small_images_at_size() {
        let small = image::DynamicImage::new_rgba8(64, 64);
        let mut bytes = Vec::new();
        small
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();

        let png = rasterize_to_png(&bytes).unwrap();
        let out = image::load_from_memory(&png).unwrap();
        assert_eq!((out.width(), out.height()), (64, 64));
    }
}
