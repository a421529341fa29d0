use serde::Serialize;
use serde_json::Value;

use crate::config::{LayerSpec, ResolvedConfig};
use crate::domain::{FetchSource, LayerId, RawFeature};
use crate::error::HarvestError;
use crate::export;
use crate::fs_util;
use crate::geonode::LayerFetcher;
use crate::normalize;
use crate::reconcile::{ReconcileOptions, Reconciler, Row};
use crate::wikidata::QueryClient;

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub only: Option<Vec<LayerId>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub fetched_at: String,
    pub layers_ok: usize,
    pub layers_failed: usize,
    pub merged_path: String,
    pub items: Vec<LayerResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerResult {
    pub layer: String,
    pub title: String,
    pub source: Option<FetchSource>,
    pub features: usize,
    pub geojson_path: Option<String>,
    pub csv_path: Option<String>,
    pub csv_rows: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileResult {
    pub rows: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub ambiguous: usize,
    pub skipped_geometries: usize,
    pub csv_path: String,
    pub geojson_path: String,
}

pub struct App<F: LayerFetcher, Q: QueryClient> {
    config: ResolvedConfig,
    fetcher: F,
    query: Q,
}

impl<F: LayerFetcher, Q: QueryClient> App<F, Q> {
    pub fn new(config: ResolvedConfig, fetcher: F, query: Q) -> Self {
        Self {
            config,
            fetcher,
            query,
        }
    }

    /// Fetches every selected layer, writes the per-layer and merged
    /// outputs, and keeps going past layer-level failures.
    pub fn fetch(&self, options: FetchOptions) -> Result<FetchResult, HarvestError> {
        fs_util::ensure_dir(&self.config.output_dir)?;
        tracing::info!("output directory: {}", self.config.output_dir);

        let selected = self.selected_layers(options.only);
        let total = selected.len();

        let mut merged: Vec<RawFeature> = Vec::new();
        let mut items = Vec::new();
        let mut layers_ok = 0usize;
        let mut layers_failed = 0usize;

        for (index, spec) in selected.iter().enumerate() {
            tracing::info!("[{}/{total}] processing {}", index + 1, spec.id);
            match self.fetch_one(spec) {
                Ok((item, features)) => {
                    layers_ok += 1;
                    merged.extend(features);
                    items.push(item);
                }
                Err(err) => {
                    layers_failed += 1;
                    tracing::error!("layer {}: {err}", spec.id);
                    items.push(LayerResult {
                        layer: spec.id.as_str().to_string(),
                        title: spec.title.clone(),
                        source: None,
                        features: 0,
                        geojson_path: None,
                        csv_path: None,
                        csv_rows: None,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        let merged_path = self.config.output_dir.join("layers_merged.geojson");
        tracing::info!("writing merged GeoJSON ({} features) -> {merged_path}", merged.len());
        export::write_geojson(&merged_path, &export::feature_collection(&merged))?;
        tracing::info!("layers ok: {layers_ok} | failed: {layers_failed}");

        Ok(FetchResult {
            fetched_at: chrono::Utc::now().to_rfc3339(),
            layers_ok,
            layers_failed,
            merged_path: merged_path.to_string(),
            items,
        })
    }

    /// Resolves external identifiers for the table layer's CSV written by a
    /// previous fetch, producing the reconciled CSV and rebuilt GeoJSON.
    pub fn reconcile(&self) -> Result<ReconcileResult, HarvestError> {
        let Some(layer) = &self.config.table.layer else {
            return Err(HarvestError::NoTableLayer);
        };
        let input_path = self
            .config
            .output_dir
            .join(format!("{}.csv", layer.file_stem()));
        if !input_path.as_std_path().is_file() {
            return Err(HarvestError::MissingInput(input_path.to_string()));
        }

        let table = export::read_table_csv(&input_path)?;
        for required in [
            self.config.table.business_key.as_str(),
            normalize::FEATURE_ID,
            normalize::COORDS_JSON,
            normalize::GEOMETRY_TYPE,
        ] {
            if !table.columns.iter().any(|column| column == required) {
                return Err(HarvestError::MissingColumn(required.to_string()));
            }
        }

        let mut rows = table.rows;
        let reconciler = Reconciler::new(
            &self.query,
            ReconcileOptions {
                business_key: self.config.table.business_key.clone(),
                resolved_field: self.config.reconcile.resolved_field.clone(),
                batch_size: self.config.reconcile.batch_size,
                min_batch_interval: self.config.reconcile.min_batch_interval,
            },
        );
        let summary = reconciler.reconcile(&mut rows)?;

        let columns = export::resolved_columns(
            &table.columns,
            &self.config.table.business_key,
            &self.config.reconcile.resolved_field,
        )?;
        let csv_path = self
            .config
            .output_dir
            .join(format!("{}_with_qid.csv", layer.file_stem()));
        export::write_reconciled_csv(&csv_path, &columns, &rows)?;
        tracing::info!("reconciled CSV written -> {csv_path}");

        let (collection, skipped_geometries) = export::rebuild_feature_collection(&rows);
        tracing::info!(
            "GeoJSON features rebuilt: {} | skipped (bad/missing geometry): {skipped_geometries}",
            rows.len() - skipped_geometries
        );
        let geojson_path = self
            .config
            .output_dir
            .join(format!("{}_with_qid.geojson", layer.file_stem()));
        export::write_geojson(&geojson_path, &collection)?;
        tracing::info!("reconciled GeoJSON written -> {geojson_path}");

        Ok(ReconcileResult {
            rows: summary.rows,
            resolved: summary.resolved,
            unresolved: summary.unresolved,
            ambiguous: summary.ambiguous,
            skipped_geometries,
            csv_path: csv_path.to_string(),
            geojson_path: geojson_path.to_string(),
        })
    }

    fn selected_layers(&self, only: Option<Vec<LayerId>>) -> Vec<LayerSpec> {
        let only = only.or_else(|| self.config.only.clone());
        match only {
            Some(allowed) => {
                tracing::info!(
                    "limiting to layers: {}",
                    allowed
                        .iter()
                        .map(LayerId::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                self.config
                    .layers
                    .iter()
                    .filter(|spec| allowed.contains(&spec.id))
                    .cloned()
                    .collect()
            }
            None => self.config.layers.clone(),
        }
    }

    fn fetch_one(&self, spec: &LayerSpec) -> Result<(LayerResult, Vec<RawFeature>), HarvestError> {
        match self.fetcher.number_matched(&spec.id) {
            Some(count) => tracing::info!("layer {}: numberMatched ~= {count}", spec.id),
            None => tracing::warn!("layer {}: could not determine numberMatched", spec.id),
        }

        let fetched = self.fetcher.fetch_layer(&spec.id)?;
        let mut features = fetched.features;

        let default_page = format!("{}/{}", self.config.portal.pages_base, spec.id.escaped());
        normalize::attach_provenance(
            &mut features,
            spec,
            &default_page,
            &self.config.portal.license_hint,
        );

        let geojson_path = self
            .config
            .output_dir
            .join(format!("{}.geojson", spec.id.file_stem()));
        export::write_geojson(&geojson_path, &export::feature_collection(&features))?;
        tracing::info!("layer {}: {} features saved", spec.id, features.len());

        let mut csv_path = None;
        let mut csv_rows = None;
        if self.config.table.layer.as_ref() == Some(&spec.id) {
            let mut rows: Vec<Row> = features
                .iter()
                .enumerate()
                .map(|(index, feature)| {
                    normalize::normalize(
                        feature,
                        index + 1,
                        &self.config.table.decimal_comma_fields,
                    )
                })
                .collect();

            if let Some(filter) = &self.config.table.code_filter {
                rows.retain(|row| {
                    let code = match row.get(self.config.table.business_key.as_str()) {
                        Some(Value::String(text)) => text.clone(),
                        Some(Value::Null) | None => String::new(),
                        Some(other) => other.to_string(),
                    };
                    filter.contains(&code)
                });
            }

            let columns = export::table_columns(&rows);
            let path = self
                .config
                .output_dir
                .join(format!("{}.csv", spec.id.file_stem()));
            export::write_table_csv(&path, &columns, &rows)?;
            tracing::info!("layer {}: CSV export done ({} rows)", spec.id, rows.len());
            csv_rows = Some(rows.len());
            csv_path = Some(path.to_string());
        }

        Ok((
            LayerResult {
                layer: spec.id.as_str().to_string(),
                title: spec.title.clone(),
                source: Some(fetched.source),
                features: features.len(),
                geojson_path: Some(geojson_path.to_string()),
                csv_path,
                csv_rows,
                error: None,
            },
            features,
        ))
    }
}
