use serde_json::{Map, Value};

use crate::config::LayerSpec;
use crate::domain::RawFeature;

pub const FEATURE_ID: &str = "_feature_id";
pub const GEOMETRY_TYPE: &str = "_geometry_type";
pub const COORDS_JSON: &str = "_coords_json";
pub const SOURCE_LAYER: &str = "_source_layer";
pub const LAYER_TITLE: &str = "_layer_title";
pub const SOURCE_URL: &str = "_source_url";
pub const LICENSE_HINT: &str = "_license_hint";

pub const HELPER_COLUMNS: [&str; 3] = [FEATURE_ID, GEOMETRY_TYPE, COORDS_JSON];
pub const PROVENANCE_COLUMNS: [&str; 4] = [SOURCE_LAYER, LAYER_TITLE, SOURCE_URL, LICENSE_HINT];

/// Flattens one feature into a row: all properties, plus the identity,
/// geometry-kind and compact-coordinates helper columns. `ordinal` is the
/// 1-based position in the batch and backs the identity when the feature
/// carries no usable id.
pub fn normalize(
    feature: &RawFeature,
    ordinal: usize,
    decimal_comma_fields: &[String],
) -> Map<String, Value> {
    let mut row = feature.properties.clone().unwrap_or_default();

    let feature_id = match &feature.id {
        Some(Value::Null) | None => Value::from(ordinal as u64),
        Some(Value::String(text)) if text.is_empty() => Value::from(ordinal as u64),
        Some(other) => other.clone(),
    };
    row.insert(FEATURE_ID.to_string(), feature_id);

    let kind = feature
        .geometry
        .as_ref()
        .map(|geometry| geometry.kind.clone())
        .unwrap_or_default();
    row.insert(GEOMETRY_TYPE.to_string(), Value::String(kind));

    // Compact serialization: identical geometries must serialize identically
    // across runs, since the disambiguation token hashes this value.
    let coordinates = feature
        .geometry
        .as_ref()
        .map(|geometry| &geometry.coordinates)
        .unwrap_or(&Value::Null);
    let coords_json = serde_json::to_string(coordinates).unwrap_or_default();
    row.insert(COORDS_JSON.to_string(), Value::String(coords_json));

    for field in decimal_comma_fields {
        if let Some(Value::String(text)) = row.get(field) {
            let replaced = text.replace(',', ".");
            row.insert(field.clone(), Value::String(replaced));
        }
    }

    row
}

/// Attaches provenance to feature properties. Existing values win: a layer
/// that already carries one of these fields is left untouched.
pub fn attach_provenance(
    features: &mut [RawFeature],
    layer: &LayerSpec,
    default_page: &str,
    license_hint: &str,
) {
    let source_url = layer.page.clone().unwrap_or_else(|| default_page.to_string());
    for feature in features {
        let props = feature.properties.get_or_insert_with(Map::new);
        set_default(props, SOURCE_LAYER, Value::String(layer.id.as_str().to_string()));
        set_default(props, LAYER_TITLE, Value::String(layer.title.clone()));
        set_default(props, SOURCE_URL, Value::String(source_url.clone()));
        set_default(props, LICENSE_HINT, Value::String(license_hint.to_string()));
    }
}

fn set_default(props: &mut Map<String, Value>, key: &str, value: Value) {
    props.entry(key.to_string()).or_insert(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Geometry;

    fn feature(json: &str) -> RawFeature {
        serde_json::from_str(json).unwrap()
    }

    fn spec() -> LayerSpec {
        LayerSpec {
            id: "geonode:gen_sin_20250131".parse().unwrap(),
            title: "Generating plants".to_string(),
            page: None,
        }
    }

    #[test]
    fn normalize_keeps_native_id() {
        let feature = feature(
            r#"{"id": "gen.12", "properties": {"Codigo": "CAR-SAD500"},
               "geometry": {"type": "Point", "coordinates": [ -68.1, -16.5 ]}}"#,
        );
        let row = normalize(&feature, 7, &[]);
        assert_eq!(row[FEATURE_ID], Value::String("gen.12".to_string()));
        assert_eq!(row[GEOMETRY_TYPE], Value::String("Point".to_string()));
        assert_eq!(row[COORDS_JSON], Value::String("[-68.1,-16.5]".to_string()));
        assert_eq!(row["Codigo"], Value::String("CAR-SAD500".to_string()));
    }

    #[test]
    fn normalize_falls_back_to_ordinal() {
        let row = normalize(&feature(r#"{"properties": {}}"#), 3, &[]);
        assert_eq!(row[FEATURE_ID], Value::from(3u64));

        let row = normalize(&feature(r#"{"id": "", "properties": {}}"#), 4, &[]);
        assert_eq!(row[FEATURE_ID], Value::from(4u64));
    }

    #[test]
    fn normalize_without_geometry() {
        let row = normalize(&feature(r#"{"id": 1, "properties": {}}"#), 1, &[]);
        assert_eq!(row[GEOMETRY_TYPE], Value::String(String::new()));
        assert_eq!(row[COORDS_JSON], Value::String("null".to_string()));
    }

    #[test]
    fn compact_coords_have_no_whitespace() {
        let feature = feature(
            r#"{"id": 1, "properties": {},
               "geometry": {"type": "MultiLineString",
                            "coordinates": [[[ -68.1 , -16.5 ], [ -68.2, -16.6 ]]]}}"#,
        );
        let row = normalize(&feature, 1, &[]);
        assert_eq!(
            row[COORDS_JSON],
            Value::String("[[[-68.1,-16.5],[-68.2,-16.6]]]".to_string())
        );
    }

    #[test]
    fn decimal_comma_rewrite_applies_to_designated_fields_only() {
        let feature = feature(
            r#"{"id": 1, "properties": {"Pn": "1,23", "Sn": "4,5", "Un": "2,2", "Long": 10}}"#,
        );
        let fields = vec!["Pn".to_string(), "Sn".to_string()];
        let row = normalize(&feature, 1, &fields);
        assert_eq!(row["Pn"], Value::String("1.23".to_string()));
        assert_eq!(row["Sn"], Value::String("4.5".to_string()));
        // Untouched: not designated, or not a string.
        assert_eq!(row["Un"], Value::String("2,2".to_string()));
        assert_eq!(row["Long"], Value::from(10));
    }

    #[test]
    fn provenance_never_overwrites() {
        let mut features = vec![feature(
            r#"{"id": 1, "properties": {"_source_url": "https://existing.test"}}"#,
        )];
        attach_provenance(
            &mut features,
            &spec(),
            "https://portal.test/layers/geonode%3Agen_sin_20250131",
            "check the layer page",
        );
        let props = features[0].properties.as_ref().unwrap();
        assert_eq!(
            props[SOURCE_URL],
            Value::String("https://existing.test".to_string())
        );
        assert_eq!(
            props[SOURCE_LAYER],
            Value::String("geonode:gen_sin_20250131".to_string())
        );
        assert_eq!(props[LAYER_TITLE], Value::String("Generating plants".to_string()));
        assert_eq!(
            props[LICENSE_HINT],
            Value::String("check the layer page".to_string())
        );
    }
}
