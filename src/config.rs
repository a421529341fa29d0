use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::LayerId;
use crate::error::HarvestError;
use crate::http::RetryPolicy;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub layers: Vec<LayerEntry>,
    #[serde(default)]
    pub only: Option<Vec<String>>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub portal: PortalSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub table: TableSection,
    #[serde(default)]
    pub reconcile: ReconcileSection,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum LayerEntry {
    Shorthand(String),
    Detailed(LayerEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LayerEntryObject {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub page: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PortalSection {
    #[serde(default = "default_wfs_url")]
    pub wfs_url: String,
    #[serde(default = "default_pages_base")]
    pub pages_base: String,
    #[serde(default = "default_srs")]
    pub srs: String,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default = "default_page_cap")]
    pub page_cap: u32,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_single_shot_cap")]
    pub single_shot_cap: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_license_hint")]
    pub license_hint: String,
}

impl Default for PortalSection {
    fn default() -> Self {
        Self {
            wfs_url: default_wfs_url(),
            pages_base: default_pages_base(),
            srs: default_srs(),
            page_size: default_page_size(),
            page_cap: default_page_cap(),
            page_delay_ms: default_page_delay_ms(),
            single_shot_cap: default_single_shot_cap(),
            user_agent: default_user_agent(),
            license_hint: default_license_hint(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            backoff_base: default_backoff_base(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TableSection {
    #[serde(default)]
    pub layer: Option<String>,
    #[serde(default = "default_business_key")]
    pub business_key: String,
    #[serde(default = "default_decimal_comma_fields")]
    pub decimal_comma_fields: Vec<String>,
    #[serde(default)]
    pub code_filter: Option<Vec<String>>,
}

impl Default for TableSection {
    fn default() -> Self {
        Self {
            layer: None,
            business_key: default_business_key(),
            decimal_comma_fields: default_decimal_comma_fields(),
            code_filter: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReconcileSection {
    #[serde(default = "default_sparql_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_min_batch_interval_secs")]
    pub min_batch_interval_secs: f64,
    #[serde(default = "default_query_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_resolved_field")]
    pub resolved_field: String,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            endpoint: default_sparql_endpoint(),
            batch_size: default_batch_size(),
            min_batch_interval_secs: default_min_batch_interval_secs(),
            max_retries: default_query_max_retries(),
            backoff_base: default_backoff_base(),
            language: default_language(),
            resolved_field: default_resolved_field(),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayerSpec {
    pub id: LayerId,
    pub title: String,
    pub page: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub wfs_url: String,
    pub pages_base: String,
    pub srs: String,
    pub page_size: u64,
    pub page_cap: u32,
    pub page_delay: Duration,
    pub single_shot_cap: u64,
    pub user_agent: String,
    pub license_hint: String,
}

#[derive(Debug, Clone)]
pub struct TableConfig {
    pub layer: Option<LayerId>,
    pub business_key: String,
    pub decimal_comma_fields: Vec<String>,
    pub code_filter: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub endpoint: String,
    pub batch_size: usize,
    pub min_batch_interval: Duration,
    pub retry: RetryPolicy,
    pub language: String,
    pub resolved_field: String,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub layers: Vec<LayerSpec>,
    pub only: Option<Vec<LayerId>>,
    pub output_dir: Utf8PathBuf,
    pub portal: PortalConfig,
    pub portal_retry: RetryPolicy,
    pub table: TableConfig,
    pub reconcile: ReconcileConfig,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("geoharvest.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(HarvestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let layers = config
            .layers
            .into_iter()
            .map(|entry| match entry {
                LayerEntry::Shorthand(value) => {
                    let id: LayerId = value.parse()?;
                    Ok(LayerSpec {
                        title: id.as_str().to_string(),
                        page: None,
                        id,
                    })
                }
                LayerEntry::Detailed(obj) => {
                    let id: LayerId = obj.id.parse()?;
                    Ok(LayerSpec {
                        title: obj.title.unwrap_or_else(|| id.as_str().to_string()),
                        page: obj.page,
                        id,
                    })
                }
            })
            .collect::<Result<Vec<_>, HarvestError>>()?;

        let only = config
            .only
            .map(|values| {
                values
                    .into_iter()
                    .map(|value| value.parse::<LayerId>())
                    .collect::<Result<Vec<_>, HarvestError>>()
            })
            .transpose()?;

        let portal = PortalConfig {
            wfs_url: config.portal.wfs_url,
            pages_base: config.portal.pages_base,
            srs: config.portal.srs,
            page_size: config.portal.page_size,
            page_cap: config.portal.page_cap,
            page_delay: Duration::from_millis(config.portal.page_delay_ms),
            single_shot_cap: config.portal.single_shot_cap,
            user_agent: config.portal.user_agent,
            license_hint: config.portal.license_hint,
        };

        let portal_retry = RetryPolicy {
            max_retries: config.retry.max_retries,
            backoff_base: config.retry.backoff_base,
            connect_timeout: Duration::from_secs(config.retry.connect_timeout_secs),
            read_timeout: Duration::from_secs(config.retry.read_timeout_secs),
        };

        let table = TableConfig {
            layer: config
                .table
                .layer
                .map(|value| value.parse::<LayerId>())
                .transpose()?,
            business_key: config.table.business_key,
            decimal_comma_fields: config.table.decimal_comma_fields,
            code_filter: config.table.code_filter,
        };

        let reconcile = ReconcileConfig {
            user_agent: config
                .reconcile
                .user_agent
                .unwrap_or_else(|| portal.user_agent.clone()),
            endpoint: config.reconcile.endpoint,
            batch_size: config.reconcile.batch_size,
            min_batch_interval: Duration::from_secs_f64(config.reconcile.min_batch_interval_secs),
            retry: RetryPolicy {
                max_retries: config.reconcile.max_retries,
                backoff_base: config.reconcile.backoff_base,
                connect_timeout: portal_retry.connect_timeout,
                read_timeout: portal_retry.read_timeout,
            },
            language: config.reconcile.language,
            resolved_field: config.reconcile.resolved_field,
        };

        Ok(ResolvedConfig {
            layers,
            only,
            output_dir: Utf8PathBuf::from(
                config.output_dir.unwrap_or_else(|| "harvest_output".to_string()),
            ),
            portal,
            portal_retry,
            table,
            reconcile,
        })
    }
}

fn default_wfs_url() -> String {
    "https://geoportal.mhe.gob.bo/geoserver/ows".to_string()
}

fn default_pages_base() -> String {
    "https://geoportal.mhe.gob.bo/layers".to_string()
}

fn default_srs() -> String {
    "EPSG:4326".to_string()
}

fn default_page_size() -> u64 {
    10_000
}

fn default_page_cap() -> u32 {
    200
}

fn default_page_delay_ms() -> u64 {
    250
}

fn default_single_shot_cap() -> u64 {
    200_000
}

fn default_user_agent() -> String {
    format!("geoharvest/{}", env!("CARGO_PKG_VERSION"))
}

fn default_license_hint() -> String {
    "Check layer page for license; attribute the publishing ministry".to_string()
}

fn default_max_retries() -> u32 {
    6
}

fn default_connect_timeout_secs() -> u64 {
    8
}

fn default_read_timeout_secs() -> u64 {
    90
}

fn default_backoff_base() -> f64 {
    1.6
}

fn default_business_key() -> String {
    "Codigo".to_string()
}

fn default_decimal_comma_fields() -> Vec<String> {
    vec!["Pn".to_string(), "Sn".to_string()]
}

fn default_sparql_endpoint() -> String {
    "https://query.wikidata.org/sparql".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_min_batch_interval_secs() -> f64 {
    2.8
}

fn default_query_max_retries() -> u32 {
    5
}

fn default_language() -> String {
    "es".to_string()
}

fn default_resolved_field() -> String {
    "wikidata".to_string()
}
