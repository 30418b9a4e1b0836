use crossbeam_channel::Receiver;
use std::path::Path;
use timeline::Ms;

use crate::BackendError;

/// One report from a backend's position stream. Decoder-driven and
/// timer-driven sources emit the same shape, so end-of-asset detection
/// is written once against this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionTick {
    /// Current position in source-media time.
    pub position: Ms,
    /// The backend reports a natural end of stream (not buffering).
    pub stopped: bool,
}

/// Capability surface of one media handle. A layer engine owns at most
/// one of these per media kind; re-targeting to a different source goes
/// through `dispose` on the old handle first.
pub trait MediaBackend: Send {
    fn open(&mut self, src: &Path) -> Result<(), BackendError>;
    fn source(&self) -> Option<&Path>;
    /// Position in source-media time.
    fn seek(&mut self, position: Ms);
    fn play(&mut self);
    fn pause(&mut self);
    fn set_muted(&mut self, muted: bool);
    fn position(&self) -> Ms;
    /// The live position stream; ticks flow only while playing.
    fn ticks(&self) -> Receiver<PositionTick>;
    /// Release the handle. Safe to call more than once.
    fn dispose(&mut self);
}
