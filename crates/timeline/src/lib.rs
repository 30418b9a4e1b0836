use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

mod edit_ops;
pub use edit_ops::*;

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("layer not found: {0}")]
    LayerNotFound(usize),
    #[error("asset not found: layer {0}, index {1}")]
    AssetNotFound(usize, usize),
    #[error("invalid edit: {0}")]
    InvalidEdit(String),
}

/// Timeline time in integer milliseconds. Signed so deltas and trim
/// clamps can be expressed without casts.
pub type Ms = i64;

/// No edit may leave a real asset shorter than this.
pub const MIN_ASSET_DURATION_MS: Ms = 1_000;
pub const DEFAULT_IMAGE_DURATION_MS: Ms = 5_000;
pub const DEFAULT_TEXT_DURATION_MS: Ms = 5_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct AssetId(pub Uuid);

impl AssetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AssetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Video,
    Image,
    Text,
    Audio,
}

impl AssetKind {
    /// Text is pure timeline data; everything else is driven by a
    /// playback backend.
    pub fn has_backend(self) -> bool {
        !matches!(self, AssetKind::Text)
    }

    /// Kinds whose playable window is bounded by captured source media.
    pub fn source_bounded(self) -> bool {
        matches!(self, AssetKind::Video | AssetKind::Audio)
    }
}

/// Presentation attributes carried through the model; the playback core
/// never interprets them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Placement {
    pub x: f32,
    pub y: f32,
    pub scale: f32,
    pub rotation: f32,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            scale: 1.0,
            rotation: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Asset {
    pub id: AssetId,
    #[serde(rename = "type")]
    pub kind: AssetKind,
    pub src_path: PathBuf,
    pub begin: Ms,
    pub duration: Ms,
    #[serde(default)]
    pub cut_from: Ms,
    /// Natural length of the source media; None for text (unbounded)
    /// and for still images.
    #[serde(default)]
    pub original_duration: Option<Ms>,
    /// Per-asset override; the layer default applies when None.
    #[serde(default)]
    pub volume: Option<f32>,
    /// Source file no longer exists on disk.
    #[serde(default)]
    pub missing: bool,
    /// Text content; an empty title on a text asset marks a spacer.
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub font_size: Option<f32>,
    #[serde(default)]
    pub color: Option<String>,
}

impl Asset {
    pub fn new(
        kind: AssetKind,
        src_path: impl Into<PathBuf>,
        begin: Ms,
        duration: Ms,
        original_duration: Option<Ms>,
    ) -> Self {
        Self {
            id: AssetId::new(),
            kind,
            src_path: src_path.into(),
            begin,
            duration,
            cut_from: 0,
            original_duration,
            volume: None,
            missing: false,
            title: String::new(),
            placement: Placement::default(),
            font_size: None,
            color: None,
        }
    }

    /// Synthetic gap filler for the text layer. Never persisted.
    pub fn spacer(begin: Ms, duration: Ms) -> Self {
        Self::new(AssetKind::Text, PathBuf::new(), begin, duration, None)
    }

    pub fn end(&self) -> Ms {
        self.begin + self.duration
    }

    /// End of the playable window in source-media time.
    pub fn media_end(&self) -> Ms {
        self.cut_from + self.duration
    }

    pub fn is_spacer(&self) -> bool {
        matches!(self.kind, AssetKind::Text) && self.title.is_empty()
    }

    pub fn covers(&self, position: Ms) -> bool {
        self.begin <= position && position <= self.end() - 1
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Primary visual track: video and still images, contiguous from 0.
    VideoPhoto,
    /// Text overlays; fully covering via transient spacers.
    Text,
    /// Free placement, may overlap or leave gaps.
    Audio,
}

fn default_layer_volume() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Layer {
    pub kind: LayerKind,
    #[serde(default = "default_layer_volume")]
    pub volume: f32,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

impl Layer {
    pub fn new(kind: LayerKind) -> Self {
        Self {
            kind,
            volume: 1.0,
            assets: Vec::new(),
        }
    }

    /// End of the last real (non-spacer) asset.
    pub fn end(&self) -> Ms {
        self.assets
            .iter()
            .filter(|a| !a.is_spacer())
            .map(Asset::end)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Timeline {
    pub layers: Vec<Layer>,
}

impl Timeline {
    /// The fixed three-layer arrangement every project uses: visual,
    /// text, audio.
    pub fn standard() -> Self {
        Self {
            layers: vec![
                Layer::new(LayerKind::VideoPhoto),
                Layer::new(LayerKind::Text),
                Layer::new(LayerKind::Audio),
            ],
        }
    }

    /// Derived length: spacers never extend the timeline.
    pub fn duration(&self) -> Ms {
        self.layers.iter().map(Layer::end).max().unwrap_or(0)
    }

    pub fn asset(&self, layer: usize, index: usize) -> Option<&Asset> {
        self.layers.get(layer)?.assets.get(index)
    }

    pub fn asset_mut(&mut self, layer: usize, index: usize) -> Option<&mut Asset> {
        self.layers.get_mut(layer)?.assets.get_mut(index)
    }
}

/// Asset override wins over the layer default; the result is always a
/// valid gain factor.
pub fn effective_volume(asset: &Asset, layer: &Layer) -> f32 {
    asset.volume.unwrap_or(layer.volume).clamp(0.0, 1.0)
}
