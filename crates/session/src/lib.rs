use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use timeline::{AssetKind, Layer, Ms};

mod session;
pub use session::*;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("project store: {0}")]
    Store(#[source] anyhow::Error),
    #[error("managed storage: {0}")]
    Storage(#[source] anyhow::Error),
    #[error("export failed: {0}")]
    Export(String),
}

/// Durable persistence for the layer array. Spacers are filtered out
/// before `save_layers` runs; they are recomputed on load.
pub trait ProjectStore: Send {
    fn save_layers(&mut self, layers: &[Layer]) -> anyhow::Result<()>;
    fn load_layers(&mut self) -> anyhow::Result<Vec<Layer>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbSize {
    Mini,
    Medium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderResolution {
    Hd720,
    FullHd1080,
    Uhd2160,
}

impl RenderResolution {
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            RenderResolution::Hd720 => (1280, 720),
            RenderResolution::FullHd1080 => (1920, 1080),
            RenderResolution::Uhd2160 => (3840, 2160),
        }
    }
}

/// Source metadata probing, thumbnails, and the final render. The
/// session only supplies the layer array and receives a path back.
pub trait MediaGenerator: Send {
    fn probe_duration_ms(&self, src: &Path) -> anyhow::Result<Ms>;
    fn thumbnail(&self, src: &Path, cut_from: Ms, size: ThumbSize) -> anyhow::Result<PathBuf>;
    fn export(
        &self,
        layers: &[Layer],
        resolution: RenderResolution,
        out: &Path,
    ) -> anyhow::Result<PathBuf>;
}

/// Copies external media into managed storage so an import survives
/// the original file being moved or cleaned up.
pub trait MediaVault: Send {
    fn import(&self, src: &Path, kind: AssetKind) -> anyhow::Result<PathBuf>;
}

/// Discrete state-change notifications, delivered in mutation order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LayersChanged,
    PositionChanged(Ms),
    SelectionChanged(Option<(usize, usize)>),
    MissingSources(bool),
    PlaybackEnded,
}

/// Advisory busy flags. Structural mutators check `is_operating` and
/// drop the edit when another operation is in flight; this is the only
/// admission control, not a lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct OperatingFlags {
    pub entering: bool,
    pub exiting: bool,
    pub playing: bool,
    pub previewing: bool,
    pub dragging: bool,
    pub trimming_front: bool,
    pub trimming_back: bool,
    pub cutting: bool,
    pub scaling: bool,
    pub adding: bool,
    pub deleting: bool,
    pub exporting: bool,
}

impl OperatingFlags {
    pub fn is_operating(&self) -> bool {
        self.entering
            || self.exiting
            || self.playing
            || self.previewing
            || self.dragging
            || self.trimming_front
            || self.trimming_back
            || self.cutting
            || self.scaling
            || self.adding
            || self.deleting
            || self.exporting
    }
}
