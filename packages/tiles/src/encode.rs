//! Mapbox Vector Tile encoding of point and cluster features.

use mvt::{GeomEncoder, GeomType, Tile};
use sha2::{Digest, Sha256};

use crate::error::TileError;
use crate::point::{Labels, PointRecord, TileFeature, TileFeatureKind};

/// Encodes `features` as a single-layer vector tile.
///
/// Clusters carry `cluster`, `cluster_id`, `point_count` and
/// `expansion_zoom`; points carry their feature id and location names.
/// Both carry the aggregate ticket count, revenue in dollars and the raw
/// year/month masks.
///
/// # Errors
///
/// Returns [`TileError::Encode`] if the vector tile writer rejects a
/// geometry or the layer.
pub fn encode_tile(
    layer_name: &str,
    features: &[TileFeature],
    records: &[PointRecord],
    labels: &Labels,
    extent: u32,
) -> Result<Vec<u8>, TileError> {
    let mut tile = Tile::new(extent);
    let mut layer = tile.create_layer(layer_name);

    for feature in features {
        let geom = GeomEncoder::new(GeomType::Point)
            .point(f64::from(feature.x), f64::from(feature.y))?
            .encode()?;
        let mut out = layer.into_feature(geom);

        match feature.kind {
            TileFeatureKind::Cluster {
                cluster_id,
                point_count,
                expansion_zoom,
            } => {
                out.set_id(u64::from(cluster_id));
                out.add_tag_bool("cluster", true);
                out.add_tag_uint("cluster_id", u64::from(cluster_id));
                out.add_tag_uint("point_count", point_count);
                out.add_tag_uint("expansion_zoom", u64::from(expansion_zoom));
            }
            TileFeatureKind::Point { record } => {
                out.add_tag_bool("cluster", false);
                if let Some(record) = records.get(record as usize) {
                    out.set_id(record.id);
                    if let Some(location) = labels.locations.get(record.location_id) {
                        out.add_tag_string("location", location);
                    }
                    if let Some(street) = record.street_id.and_then(|id| labels.streets.get(id)) {
                        out.add_tag_string("street", street);
                    }
                    if let Some(code) = record
                        .infraction_id
                        .and_then(|id| labels.infractions.get(id))
                    {
                        out.add_tag_string("top_infraction", code);
                    }
                }
            }
        }

        let aggregate = &feature.aggregate;
        out.add_tag_uint("ticket_count", aggregate.ticket_count);
        out.add_tag_double("total_revenue", aggregate.total_revenue.as_dollars());
        out.add_tag_uint("year_mask", u64::from(aggregate.year_mask.bits()));
        out.add_tag_uint("month_mask", u64::from(aggregate.month_mask.bits()));
        layer = out.into_layer();
    }

    tile.add_layer(layer)?;
    Ok(tile.to_bytes()?)
}

/// Content hash of an encoded tile, as lowercase hex SHA-256.
#[must_use]
pub fn etag(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::Aggregate;
    use ticket_map_tiles_models::{Cents, MonthMask, StringTable, YearMask};

    fn sample() -> (Vec<PointRecord>, Labels) {
        let mut locations = StringTable::new();
        let location_id = locations.intern("100 QUEEN ST W");
        let records = vec![PointRecord {
            id: 42,
            x: 0.5,
            y: 0.5,
            ticket_count: 5,
            total_revenue: Cents(15_000),
            year_mask: YearMask::from_bits(0b1),
            month_mask: MonthMask::from_bits(0b10),
            location_id,
            street_id: None,
            infraction_id: None,
        }];
        let labels = Labels {
            locations: locations.into(),
            ..Labels::default()
        };
        (records, labels)
    }

    #[test]
    fn encodes_points_and_clusters() {
        let (records, labels) = sample();
        let features = [
            TileFeature {
                x: 10,
                y: 20,
                kind: TileFeatureKind::Point { record: 0 },
                aggregate: Aggregate::of(&records[0]),
            },
            TileFeature {
                x: -12,
                y: 4100,
                kind: TileFeatureKind::Cluster {
                    cluster_id: 7,
                    point_count: 3,
                    expansion_zoom: 11,
                },
                aggregate: Aggregate::default(),
            },
        ];
        let bytes = encode_tile("parking", &features, &records, &labels, 4096).unwrap();
        assert!(!bytes.is_empty());
        let again = encode_tile("parking", &features, &records, &labels, 4096).unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn etag_is_stable_hex() {
        let tag = etag(b"tile");
        assert_eq!(tag.len(), 64);
        assert_eq!(tag, etag(b"tile"));
        assert_ne!(tag, etag(b"tile2"));
    }
}
