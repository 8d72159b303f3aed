//! Converters between host features and remote rows
//!
//! Pure functions, one direction each. Geometry travels to the remote store
//! as GeoJSON; it may come back either as GeoJSON (query interface) or as
//! hex-encoded EWKB (realtime stream), and both are accepted.

use serde_json::{json, Map, Number, Value};

use crate::error::SyncError;
use crate::models::{
    AttributeType, AttributeValue, LayerInfo, LocalFeature, Point3, RemoteFeature, RemoteId,
};

const EWKB_Z: u32 = 0x8000_0000;
const EWKB_M: u32 = 0x4000_0000;
const EWKB_SRID: u32 = 0x2000_0000;

/// A remote row converted for the host
#[derive(Debug, Clone, PartialEq)]
pub struct Converted {
    pub feature: LocalFeature,
    /// Full corrected attribute map to write back, when defaults were resolved
    pub backfill: Option<Map<String, Value>>,
}

/// Encode a point as a 3-D GeoJSON geometry carrying its SRID
pub fn encode_point(point: &Point3, srid: i32) -> Result<Value, SyncError> {
    if !point.is_finite() {
        return Err(SyncError::malformed(format!(
            "point ({}, {}, {}) has non-finite coordinates",
            point.x, point.y, point.z
        )));
    }
    Ok(json!({
        "type": "Point",
        "coordinates": [point.x, point.y, point.z],
        "crs": {"type": "name", "properties": {"name": format!("EPSG:{}", srid)}},
    }))
}

/// Decode a wire geometry into a 3-D point
///
/// 2-D coordinates are forced to 3-D with `z = 0`.
pub fn decode_point(geom: &Value) -> Result<Point3, SyncError> {
    match geom {
        Value::Object(obj) => {
            let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
            if kind != "Point" {
                return Err(SyncError::malformed(format!(
                    "geometry type '{}' is not supported",
                    kind
                )));
            }
            let coords = obj
                .get("coordinates")
                .and_then(Value::as_array)
                .ok_or_else(|| SyncError::malformed("point has no coordinates"))?;
            let values: Option<Vec<f64>> = coords.iter().map(Value::as_f64).collect();
            let point = match values.as_deref() {
                Some([x, y]) => Point3::new(*x, *y, 0.0),
                Some([x, y, z]) => Point3::new(*x, *y, *z),
                _ => {
                    return Err(SyncError::malformed(format!(
                        "invalid point coordinates {}",
                        Value::Array(coords.clone())
                    )))
                }
            };
            Ok(point)
        }
        Value::String(hex_str) => decode_ewkb_point(hex_str),
        other => Err(SyncError::malformed(format!("unexpected geometry {}", other))),
    }
}

/// Hex EWKB of a 3-D point with SRID, little endian
///
/// This is the form the change stream delivers geometry columns in.
pub fn encode_ewkb_hex(point: &Point3, srid: i32) -> String {
    let mut bytes = Vec::with_capacity(1 + 4 + 4 + 24);
    bytes.push(1u8);
    bytes.extend_from_slice(&(1u32 | EWKB_Z | EWKB_SRID).to_le_bytes());
    bytes.extend_from_slice(&(srid as u32).to_le_bytes());
    for v in [point.x, point.y, point.z] {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    hex::encode_upper(bytes)
}

struct WkbReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    little_endian: bool,
}

impl<'a> WkbReader<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], SyncError> {
        let end = self.pos + N;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| SyncError::malformed("truncated EWKB geometry"))?;
        self.pos = end;
        let mut buf = [0u8; N];
        buf.copy_from_slice(slice);
        Ok(buf)
    }

    fn u32(&mut self) -> Result<u32, SyncError> {
        let buf = self.take::<4>()?;
        Ok(if self.little_endian {
            u32::from_le_bytes(buf)
        } else {
            u32::from_be_bytes(buf)
        })
    }

    fn f64(&mut self) -> Result<f64, SyncError> {
        let buf = self.take::<8>()?;
        Ok(if self.little_endian {
            f64::from_le_bytes(buf)
        } else {
            f64::from_be_bytes(buf)
        })
    }
}

fn decode_ewkb_point(hex_str: &str) -> Result<Point3, SyncError> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| SyncError::malformed(format!("geometry is not hex EWKB: {}", e)))?;
    let order = *bytes
        .first()
        .ok_or_else(|| SyncError::malformed("empty EWKB geometry"))?;
    let mut reader = WkbReader {
        bytes: &bytes,
        pos: 1,
        little_endian: match order {
            0 => false,
            1 => true,
            other => {
                return Err(SyncError::malformed(format!(
                    "invalid EWKB byte order {}",
                    other
                )))
            }
        },
    };

    let type_word = reader.u32()?;
    let mut has_z = type_word & EWKB_Z != 0;
    let mut has_m = type_word & EWKB_M != 0;
    let base = type_word & 0x0FFF_FFFF;
    // ISO WKB encodes dimensions in the thousands
    let base = match base {
        1 => 1,
        1001 => {
            has_z = true;
            1
        }
        2001 => {
            has_m = true;
            1
        }
        3001 => {
            has_z = true;
            has_m = true;
            1
        }
        other => other,
    };
    if base != 1 {
        return Err(SyncError::malformed(format!(
            "EWKB geometry type {} is not a point",
            base
        )));
    }
    if type_word & EWKB_SRID != 0 {
        let _srid = reader.u32()?;
    }

    let x = reader.f64()?;
    let y = reader.f64()?;
    let z = if has_z { reader.f64()? } else { 0.0 };
    if has_m {
        let _m = reader.f64()?;
    }

    let point = Point3::new(x, y, z);
    if !point.is_finite() {
        return Err(SyncError::malformed("empty point geometry"));
    }
    Ok(point)
}

/// JSON form of an attribute value, with non-finite floats as null
pub fn sanitize_value(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::Null => Value::Null,
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Int(i) => Value::Number((*i).into()),
        AttributeValue::Float(x) => Number::from_f64(*x).map(Value::Number).unwrap_or(Value::Null),
        AttributeValue::Text(s) => Value::String(s.clone()),
    }
}

pub fn sanitize_attributes<'a>(
    attributes: impl IntoIterator<Item = (&'a String, &'a AttributeValue)>,
) -> Map<String, Value> {
    attributes
        .into_iter()
        .map(|(name, value)| (name.clone(), sanitize_value(value)))
        .collect()
}

/// Build the remote row for a host feature
pub fn local_to_remote(
    feature: &LocalFeature,
    layer: &LayerInfo,
    remote_id: RemoteId,
    parent_id: Option<RemoteId>,
) -> Result<RemoteFeature, SyncError> {
    Ok(RemoteFeature {
        id: remote_id,
        layer_id: layer.id,
        geom: encode_point(&feature.geometry, layer.srid)?,
        attributes: sanitize_attributes(&feature.attributes),
        parent_id,
    })
}

/// Coerce a JSON value to the declared attribute type
///
/// Returns `None` for null and for values that cannot represent the type.
pub fn coerce(value: &Value, kind: AttributeType) -> Option<AttributeValue> {
    match (kind, value) {
        (_, Value::Null) => None,
        (AttributeType::Bool, Value::Bool(b)) => Some(AttributeValue::Bool(*b)),
        (AttributeType::Bool, Value::Number(n)) => match n.as_i64() {
            Some(0) => Some(AttributeValue::Bool(false)),
            Some(1) => Some(AttributeValue::Bool(true)),
            _ => None,
        },
        (AttributeType::Bool, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Some(AttributeValue::Bool(true)),
            "false" | "f" | "0" => Some(AttributeValue::Bool(false)),
            _ => None,
        },
        (AttributeType::Int, Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Some(AttributeValue::Int(i)),
            (None, Some(x)) if x.fract() == 0.0 && x.abs() < i64::MAX as f64 => {
                Some(AttributeValue::Int(x as i64))
            }
            _ => None,
        },
        (AttributeType::Int, Value::String(s)) => s.trim().parse().ok().map(AttributeValue::Int),
        (AttributeType::Float, Value::Number(n)) => n.as_f64().map(AttributeValue::Float),
        (AttributeType::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|x| x.is_finite())
            .map(AttributeValue::Float),
        (
            AttributeType::Text | AttributeType::Date | AttributeType::Time | AttributeType::DateTime,
            Value::String(s),
        ) => Some(AttributeValue::Text(s.clone())),
        (
            AttributeType::Text | AttributeType::Date | AttributeType::Time | AttributeType::DateTime,
            Value::Number(_) | Value::Bool(_),
        ) => Some(AttributeValue::Text(value.to_string())),
        _ => None,
    }
}

/// Convert a remote row into a host feature
///
/// Schema attributes that are absent, null, or not representable in their
/// declared type resolve to the schema default. When that changes what the
/// server holds, `backfill` carries the corrected attribute map.
pub fn remote_to_local(row: &RemoteFeature, layer: &LayerInfo) -> Result<Converted, SyncError> {
    let geometry = decode_point(&row.geom)?;

    let mut feature = LocalFeature::new(geometry).with_remote_id(row.id);
    let mut needs_backfill = false;

    for attribute in &layer.attributes {
        let resolved = attribute.resolved_default();
        let value = match row.attributes.get(&attribute.name) {
            None => {
                needs_backfill = true;
                resolved
            }
            Some(Value::Null) => {
                if !resolved.is_null() {
                    needs_backfill = true;
                }
                resolved
            }
            Some(raw) => match coerce(raw, attribute.kind) {
                Some(value) => value,
                None => {
                    needs_backfill = true;
                    resolved
                }
            },
        };
        feature.attributes.insert(attribute.name.clone(), value);
    }

    for (name, raw) in &row.attributes {
        if layer.attribute(name).is_none() {
            feature
                .attributes
                .insert(name.clone(), AttributeValue::from_json(raw));
        }
    }

    let backfill = needs_backfill.then(|| sanitize_attributes(&feature.attributes));
    Ok(Converted { feature, backfill })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LayerAttribute, LayerId};

    fn layer() -> LayerInfo {
        LayerInfo::new("signs", 2949)
            .with_attribute(LayerAttribute::new("code", AttributeType::Text))
            .with_attribute(LayerAttribute::new("height", AttributeType::Float).with_default(1.5))
            .with_attribute(LayerAttribute::new("count", AttributeType::Int).with_default(0i64))
    }

    fn row(attributes: Value) -> RemoteFeature {
        RemoteFeature {
            id: RemoteId::new(),
            layer_id: LayerId::new(),
            geom: json!({"type": "Point", "coordinates": [1.0, 2.0, 3.0]}),
            attributes: attributes.as_object().cloned().unwrap_or_default(),
            parent_id: None,
        }
    }

    #[test]
    fn test_encode_point_carries_srid() {
        let geom = encode_point(&Point3::new(1.0, 2.0, 3.0), 2949).unwrap();
        assert_eq!(geom["type"], "Point");
        assert_eq!(geom["coordinates"], json!([1.0, 2.0, 3.0]));
        assert_eq!(geom["crs"]["properties"]["name"], "EPSG:2949");
    }

    #[test]
    fn test_encode_rejects_non_finite() {
        let err = encode_point(&Point3::new(f64::NAN, 0.0, 0.0), 4326).unwrap_err();
        assert!(matches!(err, SyncError::MalformedFeature { .. }));
    }

    #[test]
    fn test_decode_forces_3d() {
        let point = decode_point(&json!({"type": "Point", "coordinates": [4.0, 5.0]})).unwrap();
        assert_eq!(point, Point3::new(4.0, 5.0, 0.0));
    }

    #[test]
    fn test_decode_rejects_other_geometries() {
        let line = json!({"type": "LineString", "coordinates": [[0.0, 0.0], [1.0, 1.0]]});
        assert!(decode_point(&line).is_err());
        assert!(decode_point(&json!({"type": "Point", "coordinates": [1.0]})).is_err());
        assert!(decode_point(&json!(42)).is_err());
    }

    #[test]
    fn test_decode_ewkb_point_z_with_srid() {
        // SRID=4326;POINT Z (1 2 3)
        let hex_str = "01010000A0E6100000000000000000F03F00000000000000400000000000000840";
        let point = decode_point(&json!(hex_str)).unwrap();
        assert_eq!(point, Point3::new(1.0, 2.0, 3.0));
        assert_eq!(encode_ewkb_hex(&point, 4326), hex_str);
    }

    #[test]
    fn test_decode_wkb_big_endian_2d() {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&1u32.to_be_bytes());
        for v in [7.5f64, -2.25] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        let point = decode_point(&Value::String(hex::encode(&bytes))).unwrap();
        assert_eq!(point, Point3::new(7.5, -2.25, 0.0));
    }

    #[test]
    fn test_decode_truncated_ewkb() {
        assert!(decode_point(&json!("0101000000")).is_err());
        assert!(decode_point(&json!("not hex")).is_err());
    }

    #[test]
    fn test_non_finite_attributes_become_null() {
        let feature = LocalFeature::new(Point3::new(0.0, 0.0, 0.0))
            .with_attribute("a", f64::NAN)
            .with_attribute("b", f64::INFINITY)
            .with_attribute("c", f64::NEG_INFINITY)
            .with_attribute("d", 2.5)
            .with_attribute("e", "text");
        let remote = local_to_remote(&feature, &layer(), RemoteId::new(), None).unwrap();

        assert_eq!(remote.attributes["a"], Value::Null);
        assert_eq!(remote.attributes["b"], Value::Null);
        assert_eq!(remote.attributes["c"], Value::Null);
        assert_eq!(remote.attributes["d"], json!(2.5));
        assert_eq!(remote.attributes["e"], json!("text"));
    }

    #[test]
    fn test_sanitized_value_resolves_to_default() {
        let layer = layer();
        let feature = LocalFeature::new(Point3::new(0.0, 0.0, 0.0))
            .with_attribute("code", "A1")
            .with_attribute("height", f64::NAN)
            .with_attribute("count", 3i64);
        let remote = local_to_remote(&feature, &layer, RemoteId::new(), None).unwrap();
        let back = remote_to_local(&remote, &layer).unwrap();

        assert_eq!(back.feature.attribute("height"), Some(&AttributeValue::Float(1.5)));
        assert_eq!(back.feature.attribute("code"), Some(&AttributeValue::from("A1")));
        let backfill = back.backfill.unwrap();
        assert_eq!(backfill["height"], json!(1.5));
    }

    #[test]
    fn test_missing_attribute_backfills_default() {
        let converted = remote_to_local(&row(json!({"code": "B", "height": 2.0})), &layer()).unwrap();

        assert_eq!(converted.feature.attribute("count"), Some(&AttributeValue::Int(0)));
        let backfill = converted.backfill.unwrap();
        assert_eq!(backfill["count"], json!(0));
        assert_eq!(backfill["code"], json!("B"));
    }

    #[test]
    fn test_complete_row_needs_no_backfill() {
        let converted =
            remote_to_local(&row(json!({"code": null, "height": 2.0, "count": 4})), &layer()).unwrap();
        assert!(converted.backfill.is_none());
        assert_eq!(converted.feature.attribute("code"), Some(&AttributeValue::Null));
        assert_eq!(converted.feature.geometry, Point3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_values_coerced_to_schema_type() {
        let converted =
            remote_to_local(&row(json!({"code": 12, "height": 3, "count": 5.0})), &layer()).unwrap();
        assert_eq!(converted.feature.attribute("code"), Some(&AttributeValue::from("12")));
        assert_eq!(converted.feature.attribute("height"), Some(&AttributeValue::Float(3.0)));
        assert_eq!(converted.feature.attribute("count"), Some(&AttributeValue::Int(5)));
        assert!(converted.backfill.is_none());
    }

    #[test]
    fn test_unknown_attributes_carried_through() {
        let converted = remote_to_local(
            &row(json!({"code": "x", "height": 1.0, "count": 1, "extra": true})),
            &layer(),
        )
        .unwrap();
        assert_eq!(converted.feature.attribute("extra"), Some(&AttributeValue::Bool(true)));
    }

    #[test]
    fn test_coerce_rules() {
        assert_eq!(coerce(&json!("t"), AttributeType::Bool), Some(AttributeValue::Bool(true)));
        assert_eq!(coerce(&json!("abc"), AttributeType::Int), None);
        assert_eq!(coerce(&json!(2.5), AttributeType::Int), None);
        assert_eq!(coerce(&json!(" 7 "), AttributeType::Int), Some(AttributeValue::Int(7)));
        assert_eq!(
            coerce(&json!("2024-01-02"), AttributeType::Date),
            Some(AttributeValue::from("2024-01-02"))
        );
        assert_eq!(coerce(&Value::Null, AttributeType::Text), None);
    }

    #[test]
    fn test_malformed_geometry_fails_conversion() {
        let mut bad = row(json!({}));
        bad.geom = json!({"type": "Polygon", "coordinates": []});
        let err = remote_to_local(&bad, &layer()).unwrap_err();
        assert!(matches!(err, SyncError::MalformedFeature { .. }));
    }
}
