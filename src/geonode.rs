use std::thread;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use crate::config::PortalConfig;
use crate::domain::{FetchSource, LayerId, RawFeature};
use crate::error::HarvestError;
use crate::http::{CheckedResponse, ResilientClient};

#[derive(Debug, Clone)]
pub struct FetchedLayer {
    pub features: Vec<RawFeature>,
    pub source: FetchSource,
}

pub trait LayerFetcher: Send + Sync {
    fn fetch_layer(&self, layer: &LayerId) -> Result<FetchedLayer, HarvestError>;

    /// Informational total from the remote side, when the service can report
    /// one. Never fatal.
    fn number_matched(&self, _layer: &LayerId) -> Option<u64> {
        None
    }
}

/// One retrieval method. Strategies are tried in priority order; an error or
/// an empty result hands over to the next one.
pub trait FetchStrategy: Send + Sync {
    fn source(&self) -> FetchSource;
    fn try_fetch(&self, layer: &LayerId) -> Result<Vec<RawFeature>, HarvestError>;
}

pub struct FetchPipeline {
    strategies: Vec<Box<dyn FetchStrategy>>,
}

impl FetchPipeline {
    pub fn new(strategies: Vec<Box<dyn FetchStrategy>>) -> Self {
        Self { strategies }
    }
}

impl LayerFetcher for FetchPipeline {
    fn fetch_layer(&self, layer: &LayerId) -> Result<FetchedLayer, HarvestError> {
        for strategy in &self.strategies {
            match strategy.try_fetch(layer) {
                Ok(features) if !features.is_empty() => {
                    tracing::info!("layer {layer}: source used: {}", strategy.source());
                    return Ok(FetchedLayer {
                        features,
                        source: strategy.source(),
                    });
                }
                Ok(_) => {
                    tracing::warn!(
                        "layer {layer}: {} returned no features, falling back",
                        strategy.source()
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        "layer {layer}: {} failed: {err}, falling back",
                        strategy.source()
                    );
                }
            }
        }
        Err(HarvestError::LayerExhausted(layer.as_str().to_string()))
    }
}

/// Production fetcher for a GeoNode portal: WFS 2.0.0 paginated, then
/// WFS 1.0.0 one-shot, then the per-layer GeoJSON export.
pub struct GeonodeClient {
    pipeline: FetchPipeline,
    http: ResilientClient,
    wfs_url: String,
    hits_pattern: Option<Regex>,
}

impl GeonodeClient {
    pub fn new(portal: PortalConfig, http: ResilientClient) -> Self {
        let strategies: Vec<Box<dyn FetchStrategy>> = vec![
            Box::new(WfsPaginated {
                http: http.clone(),
                wfs_url: portal.wfs_url.clone(),
                srs: portal.srs.clone(),
                page_size: portal.page_size,
                page_cap: portal.page_cap,
                page_delay: portal.page_delay,
            }),
            Box::new(WfsSingleShot {
                http: http.clone(),
                wfs_url: portal.wfs_url.clone(),
                srs: portal.srs.clone(),
                max_features: portal.single_shot_cap,
            }),
            Box::new(LayerExport {
                http: http.clone(),
                pages_base: portal.pages_base.clone(),
            }),
        ];
        Self {
            pipeline: FetchPipeline::new(strategies),
            http,
            wfs_url: portal.wfs_url,
            hits_pattern: Regex::new(r#"numberMatched="(\d+)""#).ok(),
        }
    }
}

impl LayerFetcher for GeonodeClient {
    fn fetch_layer(&self, layer: &LayerId) -> Result<FetchedLayer, HarvestError> {
        self.pipeline.fetch_layer(layer)
    }

    fn number_matched(&self, layer: &LayerId) -> Option<u64> {
        let params = [
            ("service", "WFS".to_string()),
            ("version", "2.0.0".to_string()),
            ("request", "GetFeature".to_string()),
            ("typeNames", layer.as_str().to_string()),
            ("resultType", "hits".to_string()),
        ];
        let response = self.http.get(&self.wfs_url, &params).ok()?;
        self.hits_pattern
            .as_ref()?
            .captures(&response.body)?
            .get(1)?
            .as_str()
            .parse()
            .ok()
    }
}

struct WfsPaginated {
    http: ResilientClient,
    wfs_url: String,
    srs: String,
    page_size: u64,
    page_cap: u32,
    page_delay: Duration,
}

impl FetchStrategy for WfsPaginated {
    fn source(&self) -> FetchSource {
        FetchSource::WfsPaginated
    }

    fn try_fetch(&self, layer: &LayerId) -> Result<Vec<RawFeature>, HarvestError> {
        collect_pages(
            layer,
            self.page_size,
            self.page_cap,
            self.page_delay,
            |start| {
                tracing::info!(
                    "layer {layer}: requesting features {start}..{} via WFS 2.0.0",
                    start + self.page_size
                );
                let params = [
                    ("service", "WFS".to_string()),
                    ("version", "2.0.0".to_string()),
                    ("request", "GetFeature".to_string()),
                    ("typeNames", layer.as_str().to_string()),
                    ("outputFormat", "application/json".to_string()),
                    ("srsName", self.srs.clone()),
                    ("count", self.page_size.to_string()),
                    ("startIndex", start.to_string()),
                ];
                let response = self.http.get(&self.wfs_url, &params)?;
                parse_feature_page(&self.wfs_url, &response)
            },
        )
    }
}

/// Pagination loop: a short page ends the scan, the page cap is a strategy
/// failure, and already-collected pages are discarded on any error.
fn collect_pages<F>(
    layer: &LayerId,
    page_size: u64,
    page_cap: u32,
    page_delay: Duration,
    mut fetch_page: F,
) -> Result<Vec<RawFeature>, HarvestError>
where
    F: FnMut(u64) -> Result<Vec<RawFeature>, HarvestError>,
{
    let mut features = Vec::new();
    let mut start = 0u64;
    let mut pages = 0u32;
    loop {
        let page = fetch_page(start)?;
        let count = page.len();
        tracing::info!("layer {layer}: retrieved {count} features this page");
        features.extend(page);
        if count < page_size as usize {
            return Ok(features);
        }
        start += page_size;
        pages += 1;
        if pages > page_cap {
            return Err(HarvestError::PageCapExceeded {
                layer: layer.as_str().to_string(),
                cap: page_cap,
            });
        }
        thread::sleep(page_delay);
    }
}

struct WfsSingleShot {
    http: ResilientClient,
    wfs_url: String,
    srs: String,
    max_features: u64,
}

impl FetchStrategy for WfsSingleShot {
    fn source(&self) -> FetchSource {
        FetchSource::WfsSingleShot
    }

    fn try_fetch(&self, layer: &LayerId) -> Result<Vec<RawFeature>, HarvestError> {
        let params = [
            ("service", "WFS".to_string()),
            ("version", "1.0.0".to_string()),
            ("request", "GetFeature".to_string()),
            // WFS 1.0.0 spells the parameter differently.
            ("typeName", layer.as_str().to_string()),
            ("outputFormat", "application/json".to_string()),
            ("srsName", self.srs.clone()),
            ("maxFeatures", self.max_features.to_string()),
        ];
        let response = self.http.get(&self.wfs_url, &params)?;
        parse_feature_page(&self.wfs_url, &response)
    }
}

struct LayerExport {
    http: ResilientClient,
    pages_base: String,
}

impl FetchStrategy for LayerExport {
    fn source(&self) -> FetchSource {
        FetchSource::LayerExport
    }

    fn try_fetch(&self, layer: &LayerId) -> Result<Vec<RawFeature>, HarvestError> {
        let url = format!(
            "{}/{}/layer_export?format=GeoJSON",
            self.pages_base,
            layer.escaped()
        );
        tracing::info!("layer {layer}: GET {url}");
        let response = self.http.get(&url, &[])?;
        parse_feature_page(&url, &response)
    }
}

fn parse_feature_page(
    url: &str,
    response: &CheckedResponse,
) -> Result<Vec<RawFeature>, HarvestError> {
    if !response.is_json() {
        return Err(HarvestError::UnexpectedContentType {
            content_type: response.content_type.clone(),
            url: url.to_string(),
        });
    }
    let data: Value = response.json().map_err(|err| HarvestError::MalformedJson {
        url: url.to_string(),
        message: err.to_string(),
    })?;
    let features = match data.get("features") {
        None | Some(Value::Null) => Value::Array(Vec::new()),
        Some(value) => value.clone(),
    };
    serde_json::from_value(features).map_err(|err| HarvestError::MalformedJson {
        url: url.to_string(),
        message: err.to_string(),
    })
}
