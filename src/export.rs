use std::fs;

use camino::Utf8Path;
use serde_json::{Map, Value};

use crate::domain::RawFeature;
use crate::error::HarvestError;
use crate::fs_util;
use crate::normalize::{COORDS_JSON, FEATURE_ID, GEOMETRY_TYPE, HELPER_COLUMNS, PROVENANCE_COLUMNS};
use crate::reconcile::Row;

const BOM: &str = "\u{feff}";

/// Feature rendered with a stable key order: type, id, properties, geometry.
pub fn feature_to_value(feature: &RawFeature) -> Value {
    let mut ordered = Map::new();
    ordered.insert("type".to_string(), Value::String("Feature".to_string()));
    if let Some(id) = &feature.id {
        ordered.insert("id".to_string(), id.clone());
    }
    ordered.insert(
        "properties".to_string(),
        Value::Object(feature.properties.clone().unwrap_or_default()),
    );
    let geometry = match &feature.geometry {
        Some(geometry) => {
            let mut object = Map::new();
            object.insert("type".to_string(), Value::String(geometry.kind.clone()));
            object.insert("coordinates".to_string(), geometry.coordinates.clone());
            Value::Object(object)
        }
        None => Value::Null,
    };
    ordered.insert("geometry".to_string(), geometry);
    Value::Object(ordered)
}

pub fn feature_collection(features: &[RawFeature]) -> Value {
    let mut collection = Map::new();
    collection.insert(
        "type".to_string(),
        Value::String("FeatureCollection".to_string()),
    );
    collection.insert(
        "features".to_string(),
        Value::Array(features.iter().map(feature_to_value).collect()),
    );
    Value::Object(collection)
}

pub fn write_geojson(path: &Utf8Path, collection: &Value) -> Result<(), HarvestError> {
    let mut pretty = serde_json::to_string_pretty(collection)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    pretty.push('\n');
    fs_util::write_bytes_atomic(path, pretty.as_bytes())
}

/// Column order for the flat table: helper columns first, then the domain
/// attributes in first-seen order, then provenance.
pub fn table_columns(rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = HELPER_COLUMNS.iter().map(|name| name.to_string()).collect();
    for row in rows {
        for key in row.keys() {
            if HELPER_COLUMNS.contains(&key.as_str())
                || PROVENANCE_COLUMNS.contains(&key.as_str())
                || columns.contains(key)
            {
                continue;
            }
            columns.push(key.clone());
        }
    }
    columns.extend(PROVENANCE_COLUMNS.iter().map(|name| name.to_string()));
    columns
}

pub fn write_table_csv(
    path: &Utf8Path,
    columns: &[String],
    rows: &[Row],
) -> Result<(), HarvestError> {
    write_csv(path, columns, rows, false)
}

/// Reconciled variant: `_coords_json` is made Excel-safe at serialization
/// time only; the in-memory rows keep the original value the token was
/// computed from.
pub fn write_reconciled_csv(
    path: &Utf8Path,
    columns: &[String],
    rows: &[Row],
) -> Result<(), HarvestError> {
    write_csv(path, columns, rows, true)
}

fn write_csv(
    path: &Utf8Path,
    columns: &[String],
    rows: &[Row],
    excel_safe_coords: bool,
) -> Result<(), HarvestError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(columns)
        .map_err(|err| HarvestError::Csv(err.to_string()))?;
    for row in rows {
        let record: Vec<String> = columns
            .iter()
            .map(|column| {
                let cell = cell_to_string(row.get(column.as_str()));
                if excel_safe_coords && column == COORDS_JSON {
                    excel_safe(&cell)
                } else {
                    cell
                }
            })
            .collect();
        writer
            .write_record(&record)
            .map_err(|err| HarvestError::Csv(err.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| HarvestError::Csv(err.to_string()))?;

    let mut content = Vec::with_capacity(BOM.len() + bytes.len());
    content.extend_from_slice(BOM.as_bytes());
    content.extend_from_slice(&bytes);
    fs_util::write_bytes_atomic(path, &content)
}

#[derive(Debug, Clone)]
pub struct TableFile {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

pub fn read_table_csv(path: &Utf8Path) -> Result<TableFile, HarvestError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    let content = content.strip_prefix(BOM).unwrap_or(&content);

    let mut reader = csv::Reader::from_reader(content.as_bytes());
    let columns: Vec<String> = reader
        .headers()
        .map_err(|err| HarvestError::Csv(err.to_string()))?
        .iter()
        .map(|name| name.to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| HarvestError::Csv(err.to_string()))?;
        let mut row = Row::new();
        for (column, field) in columns.iter().zip(record.iter()) {
            row.insert(column.clone(), Value::String(field.to_string()));
        }
        rows.push(row);
    }
    Ok(TableFile { columns, rows })
}

/// Inserts the resolved-identifier column immediately after the business-key
/// column, moving it there when already present.
pub fn resolved_columns(
    columns: &[String],
    business_key: &str,
    resolved_field: &str,
) -> Result<Vec<String>, HarvestError> {
    let mut columns: Vec<String> = columns
        .iter()
        .filter(|column| column.as_str() != resolved_field)
        .cloned()
        .collect();
    let position = columns
        .iter()
        .position(|column| column == business_key)
        .ok_or_else(|| HarvestError::MissingColumn(business_key.to_string()))?;
    columns.insert(position + 1, resolved_field.to_string());
    Ok(columns)
}

/// Spreadsheet-tolerant rendering of the coords column: literal `\n`, no
/// carriage returns, and U+201A in place of the comma.
pub fn excel_safe(text: &str) -> String {
    text.replace('\n', "\\n").replace('\r', "").replace(',', "\u{201a}")
}

/// Builds a fresh feature collection from reconciled rows, using the
/// geometry-kind column and the original compact coordinates. Returns the
/// collection and the number of rows skipped for missing or unparsable
/// geometry.
pub fn rebuild_feature_collection(rows: &[Row]) -> (Value, usize) {
    let mut features = Vec::new();
    let mut skipped = 0usize;

    for (index, row) in rows.iter().enumerate() {
        let kind = cell_to_string(row.get(GEOMETRY_TYPE)).trim().to_string();
        let coords_json = cell_to_string(row.get(COORDS_JSON));
        if kind.is_empty() || coords_json.is_empty() {
            skipped += 1;
            continue;
        }
        let Ok(coordinates) = serde_json::from_str::<Value>(&coords_json) else {
            skipped += 1;
            continue;
        };

        let id = match row.get(FEATURE_ID) {
            Some(Value::String(text)) if text.is_empty() => Value::from(index as u64 + 1),
            Some(value) if !value.is_null() => value.clone(),
            _ => Value::from(index as u64 + 1),
        };

        let mut geometry = Map::new();
        geometry.insert("type".to_string(), Value::String(kind));
        geometry.insert("coordinates".to_string(), coordinates);

        let mut feature = Map::new();
        feature.insert("type".to_string(), Value::String("Feature".to_string()));
        feature.insert("id".to_string(), id);
        feature.insert("properties".to_string(), Value::Object(row.clone()));
        feature.insert("geometry".to_string(), Value::Object(geometry));
        features.push(Value::Object(feature));
    }

    let mut collection = Map::new();
    collection.insert(
        "type".to_string(),
        Value::String("FeatureCollection".to_string()),
    );
    collection.insert("features".to_string(), Value::Array(features));
    (Value::Object(collection), skipped)
}

fn cell_to_string(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    fn row(entries: &[(&str, Value)]) -> Row {
        let mut row = Row::new();
        for (key, value) in entries {
            row.insert(key.to_string(), value.clone());
        }
        row
    }

    #[test]
    fn column_order_is_helpers_domain_provenance() {
        let rows = vec![row(&[
            ("Codigo", Value::String("X".to_string())),
            ("_feature_id", Value::from(1)),
            ("_geometry_type", Value::String("Point".to_string())),
            ("_coords_json", Value::String("[1,2]".to_string())),
            ("Un", Value::String("230".to_string())),
            ("_source_layer", Value::String("geonode:x".to_string())),
        ])];
        let columns = table_columns(&rows);
        assert_eq!(
            columns,
            vec![
                "_feature_id",
                "_geometry_type",
                "_coords_json",
                "Codigo",
                "Un",
                "_source_layer",
                "_layer_title",
                "_source_url",
                "_license_hint",
            ]
        );
    }

    #[test]
    fn csv_round_trip_keeps_bom_and_order() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("table.csv")).unwrap();

        let rows = vec![row(&[
            ("_feature_id", Value::from(1)),
            ("_geometry_type", Value::String("Point".to_string())),
            ("_coords_json", Value::String("[1,2]".to_string())),
            ("Codigo", Value::String("CAR-SAD500".to_string())),
        ])];
        let columns: Vec<String> = ["_feature_id", "_geometry_type", "_coords_json", "Codigo"]
            .iter()
            .map(|name| name.to_string())
            .collect();
        write_table_csv(&path, &columns, &rows).unwrap();

        let raw = fs::read(path.as_std_path()).unwrap();
        assert!(raw.starts_with(BOM.as_bytes()));

        let table = read_table_csv(&path).unwrap();
        assert_eq!(table.columns, columns);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(
            table.rows[0]["Codigo"],
            Value::String("CAR-SAD500".to_string())
        );
        assert_eq!(table.rows[0]["_feature_id"], Value::String("1".to_string()));
    }

    #[test]
    fn missing_cells_serialize_empty() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("table.csv")).unwrap();

        let rows = vec![row(&[("a", Value::String("1".to_string()))])];
        let columns = vec!["a".to_string(), "b".to_string()];
        write_table_csv(&path, &columns, &rows).unwrap();

        let table = read_table_csv(&path).unwrap();
        assert_eq!(table.rows[0]["b"], Value::String(String::new()));
    }

    #[test]
    fn excel_safe_substitutions() {
        assert_eq!(excel_safe("[[1,2],\n[3,4]]\r"), "[[1‚2]‚\\n[3‚4]]");
        assert_eq!(excel_safe(""), "");
    }

    #[test]
    fn reconciled_csv_escapes_coords_only_on_disk() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("with_qid.csv")).unwrap();

        let rows = vec![row(&[
            ("_coords_json", Value::String("[[1,2]]".to_string())),
            ("Codigo", Value::String("X,Y".to_string())),
        ])];
        let columns = vec!["_coords_json".to_string(), "Codigo".to_string()];
        write_reconciled_csv(&path, &columns, &rows).unwrap();

        let table = read_table_csv(&path).unwrap();
        assert_eq!(
            table.rows[0]["_coords_json"],
            Value::String("[[1‚2]]".to_string())
        );
        // Only the coords column is rewritten.
        assert_eq!(table.rows[0]["Codigo"], Value::String("X,Y".to_string()));
    }

    #[test]
    fn resolved_column_lands_after_business_key() {
        let columns: Vec<String> = ["_feature_id", "Codigo", "Un"]
            .iter()
            .map(|name| name.to_string())
            .collect();
        let reordered = resolved_columns(&columns, "Codigo", "wikidata").unwrap();
        assert_eq!(reordered, vec!["_feature_id", "Codigo", "wikidata", "Un"]);

        let missing = resolved_columns(&["a".to_string()], "Codigo", "wikidata").unwrap_err();
        assert!(matches!(missing, HarvestError::MissingColumn(_)));
    }

    #[test]
    fn rebuild_uses_original_coords_and_skips_bad_geometry() {
        let rows = vec![
            row(&[
                ("_feature_id", Value::String("7".to_string())),
                ("_geometry_type", Value::String("MultiLineString".to_string())),
                ("_coords_json", Value::String("[[[1.0,2.0]]]".to_string())),
                ("wikidata", Value::String("Q1".to_string())),
            ]),
            row(&[
                ("_feature_id", Value::String("8".to_string())),
                ("_geometry_type", Value::String("".to_string())),
                ("_coords_json", Value::String("[[[1.0,2.0]]]".to_string())),
            ]),
            row(&[
                ("_feature_id", Value::String("9".to_string())),
                ("_geometry_type", Value::String("Point".to_string())),
                ("_coords_json", Value::String("not json".to_string())),
            ]),
        ];
        let (collection, skipped) = rebuild_feature_collection(&rows);
        assert_eq!(skipped, 2);

        let features = collection["features"].as_array().unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0]["id"], Value::String("7".to_string()));
        assert_eq!(features[0]["geometry"]["type"], Value::String("MultiLineString".to_string()));
        assert_eq!(
            features[0]["geometry"]["coordinates"],
            serde_json::json!([[[1.0, 2.0]]])
        );
        assert_eq!(features[0]["properties"]["wikidata"], Value::String("Q1".to_string()));
    }

    #[test]
    fn feature_value_key_order() {
        let feature: RawFeature = serde_json::from_str(
            r#"{"id": "f.1", "properties": {"Codigo": "X"},
               "geometry": {"type": "Point", "coordinates": [1, 2]}}"#,
        )
        .unwrap();
        let value = feature_to_value(&feature);
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(|key| key.as_str()).collect();
        assert_eq!(keys, ["type", "id", "properties", "geometry"]);
    }
}
