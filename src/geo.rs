use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Decimal places kept when a coordinate is stored (about 1 km).
pub const STORED_PRECISION: i32 = 2;
/// Decimal places used for the cluster key. Finer than the stored precision so
/// distinct rounded spots stay apart while repeated roundings still merge.
pub const CLUSTER_KEY_DECIMALS: usize = 4;
/// Slack, in units of the last key digit, absorbed before truncating.
const KEY_EPSILON: f64 = 1e-7;
/// Map centre used when there is nothing to show.
pub const FALLBACK_CENTER: (f64, f64) = (52.2297, 21.0122);
/// Characters shown in a hover preview before truncation.
pub const PREVIEW_CHARS: usize = 120;

/// Anything that can be pinned on the public map.
pub trait Geotagged {
    fn lat(&self) -> f64;
    fn lng(&self) -> f64;
    fn created_at(&self) -> DateTime<Utc>;

    fn has_finite_position(&self) -> bool {
        self.lat().is_finite() && self.lng().is_finite()
    }
}

/// Round a coordinate to the stored precision, half away from zero.
pub fn round_coordinate(value: f64) -> f64 {
    let factor = 10f64.powi(STORED_PRECISION);
    (value * factor).round() / factor
}

pub fn valid_latitude(lat: f64) -> bool {
    lat.is_finite() && (-90.0..=90.0).contains(&lat)
}

pub fn valid_longitude(lng: f64) -> bool {
    lng.is_finite() && (-180.0..=180.0).contains(&lng)
}

/// Grouping key for a coordinate pair: each coordinate truncated toward zero
/// to [`CLUSTER_KEY_DECIMALS`] places. A value that lands a hair below a
/// decimal boundary (52.2297 stored as 52.229699999...) keeps its last digit,
/// and a truncated `-0.0000` is written as `0.0000`.
pub fn cluster_key(lat: f64, lng: f64) -> String {
    format!(
        "{:.prec$},{:.prec$}",
        truncate_for_key(lat),
        truncate_for_key(lng),
        prec = CLUSTER_KEY_DECIMALS
    )
}

fn truncate_for_key(value: f64) -> f64 {
    let factor = 10f64.powi(CLUSTER_KEY_DECIMALS as i32);
    let scaled = value * factor;
    let nudged = scaled + KEY_EPSILON.copysign(scaled);
    nudged.trunc() / factor + 0.0
}

#[derive(Debug, Clone, Serialize)]
pub struct Cluster<P> {
    pub key: String,
    pub lat: f64,
    pub lng: f64,
    /// Newest first.
    pub posts: Vec<P>,
}

/// Group posts into map pins.
///
/// Posts with a non-finite coordinate are dropped. Posts whose coordinates
/// agree after truncation to [`CLUSTER_KEY_DECIMALS`] places share a cluster; members are
/// ordered by `created_at` descending (stable, so ties keep input order) and
/// the first member supplies the pin position. Clusters come back ordered by
/// key, so the output only depends on the input multiset and tie order.
pub fn build_clusters<P, I>(posts: I) -> Vec<Cluster<P>>
where
    P: Geotagged,
    I: IntoIterator<Item = P>,
{
    let mut groups: BTreeMap<String, Vec<P>> = BTreeMap::new();
    for post in posts {
        if !post.has_finite_position() {
            continue;
        }
        groups
            .entry(cluster_key(post.lat(), post.lng()))
            .or_default()
            .push(post);
    }

    groups
        .into_iter()
        .filter_map(|(key, mut posts)| {
            posts.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
            let (lat, lng) = posts.first().map(|p| (p.lat(), p.lng()))?;
            Some(Cluster { key, lat, lng, posts })
        })
        .collect()
}

/// Where to centre the map: the newest post with a usable position, or the
/// fallback.
pub fn map_center<P: Geotagged>(posts: &[P]) -> (f64, f64) {
    posts
        .iter()
        .filter(|p| p.has_finite_position())
        .max_by_key(|p| p.created_at())
        .map(|p| (p.lat(), p.lng()))
        .unwrap_or(FALLBACK_CENTER)
}

/// Shorten text for a hover card.
pub fn preview(content: &str, max_chars: usize) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}
