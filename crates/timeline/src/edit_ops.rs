//! Pure edit operations over single layers: the invariant maintainers
//! for the visual and text layers, asset splitting, and trim clamps.
//! The session decides *when* these run; nothing here touches I/O.

use crate::{Asset, AssetId, Layer, Ms, MIN_ASSET_DURATION_MS};

/// Visual-layer invariant maintainer: sort by begin, then force the
/// sequence contiguous from 0. Idempotent by construction.
pub fn collapse_video_photo(layer: &mut Layer) {
    layer.assets.sort_by_key(|a| a.begin);
    let mut cursor: Ms = 0;
    for asset in &mut layer.assets {
        asset.begin = cursor;
        cursor += asset.duration;
    }
}

/// Text-layer invariant maintainer. After this runs the layer exactly
/// covers `[0, target)`: real assets keep their positions where
/// possible, spacers absorb every gap, overlapping real assets lose
/// their overlapping front, and nothing zero-length survives.
///
/// Running it twice in a row leaves the layer unchanged.
pub fn rebuild_text_spacers(layer: &mut Layer, target: Ms) {
    layer.assets.sort_by_key(|a| a.begin);
    merge_adjacent_spacers(layer);

    // Normalize spans against the running end of kept assets. A spacer
    // stretches or shrinks to exactly fill the hole up to the next
    // asset (or `target` when last); a real asset overlapping its
    // predecessor keeps its end and loses the front.
    let mut cursor: Ms = 0;
    let mut i = 0;
    while i < layer.assets.len() {
        if layer.assets[i].is_spacer() {
            let next_begin = layer
                .assets
                .get(i + 1)
                .map(|a| a.begin)
                .unwrap_or(target);
            let spacer = &mut layer.assets[i];
            spacer.begin = cursor;
            spacer.duration = next_begin - cursor;
        } else if layer.assets[i].begin < cursor {
            let end = layer.assets[i].end();
            let asset = &mut layer.assets[i];
            asset.begin = cursor;
            asset.duration = end - cursor;
        }
        if layer.assets[i].duration <= 0 {
            layer.assets.remove(i);
        } else {
            cursor = layer.assets[i].end();
            i += 1;
        }
    }

    // Fill the holes that had no spacer at all, including ahead of the
    // first asset and behind the last one up to the derived duration.
    let mut cursor: Ms = 0;
    let mut i = 0;
    while i < layer.assets.len() {
        let begin = layer.assets[i].begin;
        if begin > cursor {
            layer.assets.insert(i, Asset::spacer(cursor, begin - cursor));
            i += 1;
        }
        cursor = layer.assets[i].end();
        i += 1;
    }
    if cursor < target {
        layer.assets.push(Asset::spacer(cursor, target - cursor));
    }

    // Dropping a swallowed real asset can leave two spacers touching.
    merge_adjacent_spacers(layer);
}

fn merge_adjacent_spacers(layer: &mut Layer) {
    let mut i = 1;
    while i < layer.assets.len() {
        if layer.assets[i].is_spacer() && layer.assets[i - 1].is_spacer() {
            let end = layer.assets[i].end().max(layer.assets[i - 1].end());
            layer.assets[i - 1].duration = end - layer.assets[i - 1].begin;
            layer.assets.remove(i);
        } else {
            i += 1;
        }
    }
}

/// Split one asset at a timeline position strictly inside it. The
/// first half keeps begin and source offset; the second half picks up
/// where the first ends, both on the timeline and (for source-bounded
/// kinds) in the source media. None when the position falls outside or
/// either half would drop below the minimum duration.
pub fn split_asset(asset: &Asset, position: Ms) -> Option<(Asset, Asset)> {
    if position <= asset.begin || position >= asset.end() {
        return None;
    }
    let diff = position - asset.begin;
    if diff < MIN_ASSET_DURATION_MS || asset.duration - diff < MIN_ASSET_DURATION_MS {
        return None;
    }

    let mut first = asset.clone();
    first.duration = diff;

    let mut second = asset.clone();
    second.id = AssetId::new();
    second.begin = asset.begin + diff;
    second.duration = asset.duration - diff;
    if asset.kind.source_bounded() {
        second.cut_from = asset.cut_from + diff;
    }
    Some((first, second))
}

/// Front-edge trim: shifts the source window forward while the clip
/// stays anchored on the timeline (`begin` never moves). Positive
/// delta shrinks, negative extends back into the source. The requested
/// delta is clamped before applying; the applied delta is returned.
pub fn apply_front_trim(asset: &mut Asset, delta: Ms) -> Ms {
    let mut d = delta.min(asset.duration - MIN_ASSET_DURATION_MS);
    if asset.kind.source_bounded() {
        d = d.max(-asset.cut_from);
    }
    if d != 0 {
        if asset.kind.source_bounded() {
            asset.cut_from += d;
        }
        asset.duration -= d;
    }
    d
}

/// Back-edge trim: grows or shrinks the displayed span only. Bounded
/// below by the minimum duration and above by the captured source
/// length. Returns the applied delta.
pub fn apply_back_trim(asset: &mut Asset, delta: Ms) -> Ms {
    let mut d = delta.max(MIN_ASSET_DURATION_MS - asset.duration);
    if asset.kind.source_bounded() {
        if let Some(original) = asset.original_duration {
            d = d.min(original - asset.media_end());
        }
    }
    if d != 0 {
        asset.duration += d;
    }
    d
}

/// The neighbor whose slot a dragged asset lands in: smallest
/// begin-time distance to the dragged asset's would-be begin.
pub fn closest_neighbor(layer: &Layer, index: usize, target_begin: Ms) -> Option<usize> {
    layer
        .assets
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != index)
        .min_by_key(|(_, a)| (a.begin - target_begin).abs())
        .map(|(j, _)| j)
}
