use crossbeam_channel::{unbounded, Receiver, Sender};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

use playback::{LayerEngine, PlaybackCallbacks};
use timeline::{
    apply_back_trim, apply_front_trim, closest_neighbor, collapse_video_photo, effective_volume,
    rebuild_text_spacers, split_asset, Asset, AssetId, AssetKind, Layer, LayerKind, Ms, Timeline,
    DEFAULT_IMAGE_DURATION_MS, DEFAULT_TEXT_DURATION_MS, MIN_ASSET_DURATION_MS,
};

use crate::{
    MediaGenerator, MediaVault, OperatingFlags, ProjectStore, RenderResolution, SessionError,
    SessionEvent, ThumbSize,
};

/// Gesture scratch state captured at drag start.
#[derive(Debug, Clone, Copy)]
struct DragState {
    layer: usize,
    index: usize,
    origin_begin: Ms,
    id: AssetId,
}

struct EngineNote {
    layer: usize,
    event: NoteEvent,
}

enum NoteEvent {
    Move(Ms),
    Jump(Ms),
    End,
}

/// Single owner of the timeline model and the only mutation entry
/// point. Every structural change re-validates the layer invariants,
/// persists through the project store, and notifies subscribers.
///
/// Playback callbacks arrive on engine threads as notes in a channel;
/// the UI thread drains them through `pump()` once per frame, so the
/// session itself stays single-threaded.
pub struct TimelineSession {
    timeline: Timeline,
    engines: Vec<LayerEngine>,
    position: Ms,
    selection: Option<(usize, usize)>,
    drag: Option<DragState>,
    flags: OperatingFlags,
    missing_sources: bool,
    store: Box<dyn ProjectStore>,
    generator: Box<dyn MediaGenerator>,
    vault: Box<dyn MediaVault>,
    subscribers: Vec<Sender<SessionEvent>>,
    notes_tx: Sender<EngineNote>,
    notes_rx: Receiver<EngineNote>,
}

impl TimelineSession {
    pub fn open(
        store: Box<dyn ProjectStore>,
        generator: Box<dyn MediaGenerator>,
        vault: Box<dyn MediaVault>,
    ) -> Result<Self, SessionError> {
        Self::open_with(store, generator, vault, LayerEngine::new)
    }

    /// `make_engine` lets callers swap the backend factory (tests drive
    /// scripted backends through it).
    pub fn open_with(
        mut store: Box<dyn ProjectStore>,
        generator: Box<dyn MediaGenerator>,
        vault: Box<dyn MediaVault>,
        mut make_engine: impl FnMut(usize, Layer) -> LayerEngine,
    ) -> Result<Self, SessionError> {
        let mut layers = store.load_layers().map_err(SessionError::Store)?;
        if layers.is_empty() {
            layers = Timeline::standard().layers;
        }
        let mut timeline = Timeline { layers };

        let mut missing = false;
        for layer in &mut timeline.layers {
            for asset in &mut layer.assets {
                if asset.kind.has_backend() {
                    asset.missing = !asset.src_path.is_file();
                    missing |= asset.missing;
                }
            }
        }
        if missing {
            warn!("project references files that are no longer on disk");
        }

        let (notes_tx, notes_rx) = unbounded();
        let mut session = Self {
            timeline,
            engines: Vec::new(),
            position: 0,
            selection: None,
            drag: None,
            flags: OperatingFlags {
                entering: true,
                ..OperatingFlags::default()
            },
            missing_sources: missing,
            store,
            generator,
            vault,
            subscribers: Vec::new(),
            notes_tx,
            notes_rx,
        };
        session.revalidate();
        session.engines = session
            .timeline
            .layers
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, layer)| make_engine(i, layer))
            .collect();
        for engine in &mut session.engines {
            engine.initialize();
        }
        session.flags.entering = false;
        Ok(session)
    }

    pub fn subscribe(&mut self) -> Receiver<SessionEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn duration(&self) -> Ms {
        self.timeline.duration()
    }

    pub fn position(&self) -> Ms {
        self.position
    }

    pub fn selection(&self) -> Option<(usize, usize)> {
        self.selection
    }

    pub fn flags(&self) -> OperatingFlags {
        self.flags
    }

    pub fn is_operating(&self) -> bool {
        self.flags.is_operating()
    }

    pub fn is_playing(&self) -> bool {
        self.flags.playing
    }

    pub fn missing_sources(&self) -> bool {
        self.missing_sources
    }

    pub fn effective_volume_at(&self, layer: usize, index: usize) -> Option<f32> {
        let l = self.timeline.layers.get(layer)?;
        let a = l.assets.get(index)?;
        Some(effective_volume(a, l))
    }

    // ----- selection -----

    pub fn select(&mut self, layer: usize, index: usize) {
        let valid = self
            .timeline
            .asset(layer, index)
            .map_or(false, |a| !a.is_spacer());
        let next = valid.then_some((layer, index));
        if next != self.selection {
            self.selection = next;
            self.emit(SessionEvent::SelectionChanged(next));
        }
    }

    pub fn clear_selection(&mut self) {
        if self.selection.take().is_some() {
            self.emit(SessionEvent::SelectionChanged(None));
        }
    }

    // ----- edits -----

    /// Import a media file and append it to the target layer. Audio
    /// lands at the current scrub position; video, images and text go
    /// to the end. A missing or unreadable source drops the edit
    /// silently; only a managed-storage failure is fatal.
    pub fn add_asset(
        &mut self,
        layer_index: usize,
        kind: AssetKind,
        src: &Path,
    ) -> Result<(), SessionError> {
        if self.flags.is_operating() {
            debug!("add dropped: session busy");
            return Ok(());
        }
        self.flags.adding = true;
        let result = self.add_asset_inner(layer_index, kind, src);
        self.flags.adding = false;
        result
    }

    fn add_asset_inner(
        &mut self,
        layer_index: usize,
        kind: AssetKind,
        src: &Path,
    ) -> Result<(), SessionError> {
        if self.timeline.layers.get(layer_index).is_none() {
            debug!(layer_index, "add dropped: no such layer");
            return Ok(());
        }
        if !kind.has_backend() {
            debug!("add dropped: text assets go through add_text");
            return Ok(());
        }
        if !src.is_file() {
            warn!(path = %src.display(), "add dropped: source file missing");
            return Ok(());
        }

        let (duration, original) = match kind {
            AssetKind::Video | AssetKind::Audio => match self.generator.probe_duration_ms(src) {
                Ok(ms) if ms >= MIN_ASSET_DURATION_MS => (ms, Some(ms)),
                Ok(ms) => {
                    warn!(ms, "add dropped: source shorter than the minimum asset duration");
                    return Ok(());
                }
                Err(e) => {
                    warn!(path = %src.display(), error = %e, "add dropped: probe failed");
                    return Ok(());
                }
            },
            AssetKind::Image => (DEFAULT_IMAGE_DURATION_MS, None),
            AssetKind::Text => return Ok(()),
        };

        // The import copy is the one failure the session cannot shrug
        // off: without managed storage nothing can be saved.
        let managed = self.vault.import(src, kind).map_err(SessionError::Storage)?;

        let begin = match self.timeline.layers[layer_index].kind {
            LayerKind::Audio => self.position,
            LayerKind::VideoPhoto | LayerKind::Text => self.timeline.layers[layer_index].end(),
        };
        let asset = Asset::new(kind, managed, begin, duration, original);
        self.timeline.layers[layer_index].assets.push(asset);
        self.commit_structural(Some(layer_index))
    }

    /// Add a text overlay at the current end of the timeline. The
    /// spacer rebuild normalizes the layer afterwards.
    pub fn add_text(&mut self, title: &str) -> Result<(), SessionError> {
        if self.flags.is_operating() {
            debug!("add dropped: session busy");
            return Ok(());
        }
        self.flags.adding = true;
        let result = self.add_text_inner(title);
        self.flags.adding = false;
        result
    }

    fn add_text_inner(&mut self, title: &str) -> Result<(), SessionError> {
        if title.is_empty() {
            debug!("add dropped: empty title would create a spacer");
            return Ok(());
        }
        let Some(layer_index) = self
            .timeline
            .layers
            .iter()
            .position(|l| l.kind == LayerKind::Text)
        else {
            return Ok(());
        };
        let begin = self.timeline.duration();
        let mut asset = Asset::new(
            AssetKind::Text,
            PathBuf::new(),
            begin,
            DEFAULT_TEXT_DURATION_MS,
            None,
        );
        asset.title = title.to_string();
        self.timeline.layers[layer_index].assets.push(asset);
        self.commit_structural(None)
    }

    /// Split the selected asset at the current scrub position. The
    /// position must fall strictly inside the asset and leave both
    /// halves at least the minimum duration; otherwise nothing happens.
    pub fn cut(&mut self) -> Result<(), SessionError> {
        if self.flags.is_operating() {
            debug!("cut dropped: session busy");
            return Ok(());
        }
        self.flags.cutting = true;
        let result = self.cut_inner();
        self.flags.cutting = false;
        result
    }

    fn cut_inner(&mut self) -> Result<(), SessionError> {
        let Some((layer, index)) = self.selection else {
            debug!("cut dropped: nothing selected");
            return Ok(());
        };
        let Some(asset) = self.timeline.asset(layer, index).cloned() else {
            return Ok(());
        };
        if asset.is_spacer() {
            return Ok(());
        }
        let Some((first, second)) = split_asset(&asset, self.position) else {
            debug!("cut dropped: position outside the selected asset");
            return Ok(());
        };
        let first_id = first.id;
        {
            let assets = &mut self.timeline.layers[layer].assets;
            assets[index] = first;
            assets.insert(index + 1, second);
        }
        // The second half's source window moved, so the open handle is
        // bound to a stale seek window.
        let result = self.commit_structural(asset.kind.source_bounded().then_some(layer));
        self.restore_selection(layer, first_id);
        result
    }

    /// Remove the selected asset. The scrub position clamps to the new
    /// timeline duration when the deleted asset carried it.
    pub fn delete_selected(&mut self) -> Result<(), SessionError> {
        if self.flags.is_operating() {
            debug!("delete dropped: session busy");
            return Ok(());
        }
        self.flags.deleting = true;
        let result = self.delete_inner();
        self.flags.deleting = false;
        result
    }

    fn delete_inner(&mut self) -> Result<(), SessionError> {
        let Some((layer, index)) = self.selection else {
            debug!("delete dropped: nothing selected");
            return Ok(());
        };
        if self
            .timeline
            .asset(layer, index)
            .map_or(true, |a| a.is_spacer())
        {
            return Ok(());
        }
        self.timeline.layers[layer].assets.remove(index);
        self.selection = None;
        self.emit(SessionEvent::SelectionChanged(None));
        let result = self.commit_structural(Some(layer));
        let duration = self.timeline.duration();
        if self.position > duration {
            self.position = duration;
            self.emit(SessionEvent::PositionChanged(duration));
        }
        result
    }

    /// Begin a reposition gesture on the selected asset.
    pub fn drag_start(&mut self) {
        if self.flags.is_operating() {
            debug!("drag dropped: session busy");
            return;
        }
        let Some((layer, index)) = self.selection else {
            debug!("drag dropped: nothing selected");
            return;
        };
        let Some(asset) = self.timeline.asset(layer, index) else {
            return;
        };
        if asset.is_spacer() {
            return;
        }
        self.drag = Some(DragState {
            layer,
            index,
            origin_begin: asset.begin,
            id: asset.id,
        });
        self.flags.dragging = true;
    }

    /// Finish the gesture with the accumulated delta. On the visual
    /// layer the dragged asset swaps slots with its closest neighbor
    /// (reorder, not free placement); text and audio assets take an
    /// arbitrary new begin clamped to zero.
    pub fn drag_end(&mut self, delta: Ms) -> Result<(), SessionError> {
        if !self.flags.dragging {
            return Ok(());
        }
        self.flags.dragging = false;
        let Some(drag) = self.drag.take() else {
            return Ok(());
        };
        let Some(l) = self.timeline.layers.get_mut(drag.layer) else {
            return Ok(());
        };
        if l.assets.get(drag.index).map_or(true, |a| a.id != drag.id) {
            return Ok(());
        }
        let target = (drag.origin_begin + delta).max(0);
        match l.kind {
            LayerKind::VideoPhoto => {
                if let Some(neighbor) = closest_neighbor(l, drag.index, target) {
                    l.assets.swap(drag.index, neighbor);
                    // Re-base begins to the new slot order so the
                    // collapse keeps it instead of sorting it back.
                    let mut cursor = 0;
                    for a in &mut l.assets {
                        a.begin = cursor;
                        cursor += a.duration;
                    }
                }
            }
            LayerKind::Text | LayerKind::Audio => {
                l.assets[drag.index].begin = target;
            }
        }
        let result = self.commit_structural(None);
        self.restore_selection(drag.layer, drag.id);
        result
    }

    /// Front-edge trim: the source window shifts while the clip stays
    /// anchored on the timeline. Shifting the window invalidates the
    /// open handle, so the layer's backend re-initializes.
    pub fn trim_front(&mut self, delta: Ms) -> Result<(), SessionError> {
        if self.flags.is_operating() {
            debug!("trim dropped: session busy");
            return Ok(());
        }
        self.flags.trimming_front = true;
        let result = self.trim_inner(delta, true);
        self.flags.trimming_front = false;
        result
    }

    /// Back-edge trim: only the displayed span changes.
    pub fn trim_back(&mut self, delta: Ms) -> Result<(), SessionError> {
        if self.flags.is_operating() {
            debug!("trim dropped: session busy");
            return Ok(());
        }
        self.flags.trimming_back = true;
        let result = self.trim_inner(delta, false);
        self.flags.trimming_back = false;
        result
    }

    fn trim_inner(&mut self, delta: Ms, front: bool) -> Result<(), SessionError> {
        let Some((layer, index)) = self.selection else {
            debug!("trim dropped: nothing selected");
            return Ok(());
        };
        let Some(asset) = self.timeline.asset_mut(layer, index) else {
            return Ok(());
        };
        if asset.is_spacer() {
            return Ok(());
        }
        let id = asset.id;
        let source_bounded = asset.kind.source_bounded();
        let applied = if front {
            apply_front_trim(asset, delta)
        } else {
            apply_back_trim(asset, delta)
        };
        if applied == 0 {
            return Ok(());
        }
        let reinit = (front && source_bounded).then_some(layer);
        let result = self.commit_structural(reinit);
        self.restore_selection(layer, id);
        result
    }

    pub fn set_asset_volume(&mut self, volume: f32) -> Result<(), SessionError> {
        let Some((layer, index)) = self.selection else {
            return Ok(());
        };
        let Some(asset) = self.timeline.asset_mut(layer, index) else {
            return Ok(());
        };
        if asset.is_spacer() {
            return Ok(());
        }
        asset.volume = Some(volume.clamp(0.0, 1.0));
        let result = self.persist();
        self.emit(SessionEvent::LayersChanged);
        result
    }

    pub fn set_layer_volume(&mut self, layer: usize, volume: f32) -> Result<(), SessionError> {
        let Some(l) = self.timeline.layers.get_mut(layer) else {
            return Ok(());
        };
        l.volume = volume.clamp(0.0, 1.0);
        let result = self.persist();
        self.emit(SessionEvent::LayersChanged);
        result
    }

    /// Presentation scale of the selected asset.
    pub fn set_asset_scale(&mut self, scale: f32) -> Result<(), SessionError> {
        if self.flags.is_operating() {
            debug!("scale dropped: session busy");
            return Ok(());
        }
        self.flags.scaling = true;
        let result = self.scale_inner(scale);
        self.flags.scaling = false;
        result
    }

    fn scale_inner(&mut self, scale: f32) -> Result<(), SessionError> {
        let Some((layer, index)) = self.selection else {
            return Ok(());
        };
        let Some(asset) = self.timeline.asset_mut(layer, index) else {
            return Ok(());
        };
        if asset.is_spacer() {
            return Ok(());
        }
        asset.placement.scale = scale.max(0.0);
        let result = self.persist();
        self.emit(SessionEvent::LayersChanged);
        result
    }

    // ----- playback -----

    /// Show the frame at `position` on every layer without starting
    /// playback. Safe to call at scrub rate.
    pub fn preview(&mut self, position: Ms) {
        if self.flags.playing {
            return;
        }
        self.flags.previewing = true;
        let clamped = position.clamp(0, self.timeline.duration());
        for engine in &mut self.engines {
            engine.preview(clamped);
        }
        self.position = clamped;
        self.flags.previewing = false;
        self.emit(SessionEvent::PositionChanged(clamped));
    }

    /// Start synchronized playback from the current position. Layer 0
    /// is the master clock; its notes drive the session position, the
    /// other layers report for monitoring only.
    pub fn play(&mut self) {
        if self.flags.playing {
            return;
        }
        if self.flags.is_operating() {
            debug!("play dropped: session busy");
            return;
        }
        while self.notes_rx.try_recv().is_ok() {}
        self.flags.playing = true;
        let position = self.position;
        let tx = self.notes_tx.clone();
        for (i, engine) in self.engines.iter_mut().enumerate() {
            let tx_move = tx.clone();
            let tx_jump = tx.clone();
            let tx_end = tx.clone();
            engine.play(
                position,
                PlaybackCallbacks {
                    on_move: Box::new(move |p| {
                        let _ = tx_move.send(EngineNote {
                            layer: i,
                            event: NoteEvent::Move(p),
                        });
                    }),
                    on_jump: Box::new(move |p| {
                        let _ = tx_jump.send(EngineNote {
                            layer: i,
                            event: NoteEvent::Jump(p),
                        });
                    }),
                    on_end: Box::new(move || {
                        let _ = tx_end.send(EngineNote {
                            layer: i,
                            event: NoteEvent::End,
                        });
                    }),
                },
            );
        }
        // Missing sources or backend failures can leave every layer
        // idle; playback never started then.
        if !self.engines.iter().any(LayerEngine::is_playing) {
            debug!("play dropped: no layer could start");
            self.flags.playing = false;
        }
    }

    /// Immediate, total cancellation: every engine's timers and
    /// subscriptions are gone before this returns.
    pub fn stop_playback(&mut self) {
        for engine in &mut self.engines {
            engine.stop();
        }
        self.flags.playing = false;
        while self.notes_rx.try_recv().is_ok() {}
    }

    /// Drain engine notes. Call once per UI frame; position updates
    /// and playback end are applied here, on the caller's thread.
    pub fn pump(&mut self) {
        while let Ok(note) = self.notes_rx.try_recv() {
            if note.layer != 0 {
                if let NoteEvent::Move(p) = note.event {
                    trace!(layer = note.layer, position = p, "monitor note");
                }
                continue;
            }
            if !self.flags.playing {
                continue;
            }
            match note.event {
                NoteEvent::Move(p) | NoteEvent::Jump(p) => {
                    self.position = p;
                    self.emit(SessionEvent::PositionChanged(p));
                }
                NoteEvent::End => {
                    for engine in &mut self.engines {
                        engine.stop();
                    }
                    self.flags.playing = false;
                    self.emit(SessionEvent::PlaybackEnded);
                }
            }
        }
    }

    // ----- collaborators -----

    pub fn thumbnail(&self, layer: usize, index: usize, size: ThumbSize) -> Option<PathBuf> {
        let asset = self.timeline.asset(layer, index)?;
        if !asset.kind.has_backend() || asset.missing {
            return None;
        }
        let cut_from = match asset.kind {
            AssetKind::Video => asset.cut_from,
            _ => 0,
        };
        match self.generator.thumbnail(&asset.src_path, cut_from, size) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "thumbnail failed");
                None
            }
        }
    }

    /// Render the full layer array to one output file. Failure never
    /// touches the in-memory timeline.
    pub fn export(
        &mut self,
        resolution: RenderResolution,
        out: &Path,
    ) -> Result<PathBuf, SessionError> {
        if self.flags.is_operating() {
            return Err(SessionError::Export("another operation is in flight".into()));
        }
        self.flags.exporting = true;
        let result = self
            .generator
            .export(&self.timeline.layers, resolution, out)
            .map_err(|e| SessionError::Export(e.to_string()));
        self.flags.exporting = false;
        result
    }

    /// Tear down every backend handle. The session is done afterwards.
    pub fn dispose(&mut self) {
        self.flags.exiting = true;
        for engine in &mut self.engines {
            engine.dispose();
        }
    }

    // ----- internals -----

    /// Re-establish the layer invariants, refresh engine snapshots,
    /// persist, and notify. `reinit_layer` re-opens that layer's
    /// backend handles (source windows moved).
    fn commit_structural(&mut self, reinit_layer: Option<usize>) -> Result<(), SessionError> {
        self.revalidate();
        self.sync_engines();
        if let Some(layer) = reinit_layer {
            if let Some(engine) = self.engines.get_mut(layer) {
                engine.reinit();
            }
        }
        self.refresh_missing_flag();
        let result = self.persist();
        self.emit(SessionEvent::LayersChanged);
        result
    }

    fn revalidate(&mut self) {
        for layer in &mut self.timeline.layers {
            if layer.kind == LayerKind::VideoPhoto {
                collapse_video_photo(layer);
            }
        }
        let target = self.timeline.duration();
        for layer in &mut self.timeline.layers {
            if layer.kind == LayerKind::Text {
                rebuild_text_spacers(layer, target);
            }
        }
    }

    fn sync_engines(&mut self) {
        for (engine, layer) in self.engines.iter_mut().zip(self.timeline.layers.iter()) {
            engine.set_layer(layer.clone());
        }
    }

    fn refresh_missing_flag(&mut self) {
        let missing = self
            .timeline
            .layers
            .iter()
            .flat_map(|l| l.assets.iter())
            .any(|a| a.missing);
        if missing != self.missing_sources {
            self.missing_sources = missing;
            self.emit(SessionEvent::MissingSources(missing));
        }
    }

    /// Spacers are recomputed state; what goes to disk is only the
    /// real content.
    fn persist(&mut self) -> Result<(), SessionError> {
        let layers: Vec<Layer> = self
            .timeline
            .layers
            .iter()
            .map(|l| {
                let mut l = l.clone();
                l.assets.retain(|a| !a.is_spacer());
                l
            })
            .collect();
        self.store
            .save_layers(&layers)
            .map_err(SessionError::Store)
    }

    fn restore_selection(&mut self, layer: usize, id: AssetId) {
        let found = self
            .timeline
            .layers
            .get(layer)
            .and_then(|l| l.assets.iter().position(|a| a.id == id))
            .map(|i| (layer, i));
        if found != self.selection {
            self.selection = found;
            self.emit(SessionEvent::SelectionChanged(found));
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct StoreState {
        layers: Vec<Layer>,
        saves: u32,
    }

    #[derive(Default, Clone)]
    struct MemoryStore {
        state: Arc<Mutex<StoreState>>,
    }

    impl MemoryStore {
        fn with(layers: Vec<Layer>) -> Self {
            let store = Self::default();
            store.state.lock().unwrap().layers = layers;
            store
        }

        fn saved(&self) -> Vec<Layer> {
            self.state.lock().unwrap().layers.clone()
        }

        fn saves(&self) -> u32 {
            self.state.lock().unwrap().saves
        }
    }

    impl ProjectStore for MemoryStore {
        fn save_layers(&mut self, layers: &[Layer]) -> anyhow::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.layers = layers.to_vec();
            state.saves += 1;
            Ok(())
        }

        fn load_layers(&mut self) -> anyhow::Result<Vec<Layer>> {
            Ok(self.state.lock().unwrap().layers.clone())
        }
    }

    struct FixedProbe {
        duration: Ms,
        fail_export: bool,
    }

    impl FixedProbe {
        fn new(duration: Ms) -> Self {
            Self {
                duration,
                fail_export: false,
            }
        }
    }

    impl MediaGenerator for FixedProbe {
        fn probe_duration_ms(&self, _src: &Path) -> anyhow::Result<Ms> {
            Ok(self.duration)
        }

        fn thumbnail(&self, src: &Path, cut_from: Ms, _size: ThumbSize) -> anyhow::Result<PathBuf> {
            Ok(src.with_extension(format!("{cut_from}.jpg")))
        }

        fn export(
            &self,
            _layers: &[Layer],
            _resolution: RenderResolution,
            out: &Path,
        ) -> anyhow::Result<PathBuf> {
            if self.fail_export {
                anyhow::bail!("encoder exploded");
            }
            Ok(out.to_path_buf())
        }
    }

    struct Passthrough;

    impl MediaVault for Passthrough {
        fn import(&self, src: &Path, _kind: AssetKind) -> anyhow::Result<PathBuf> {
            Ok(src.to_path_buf())
        }
    }

    fn open_session(store: MemoryStore, probed: Ms) -> TimelineSession {
        TimelineSession::open(
            Box::new(store),
            Box::new(FixedProbe::new(probed)),
            Box::new(Passthrough),
        )
        .expect("session open")
    }

    fn video(begin: Ms, duration: Ms) -> Asset {
        Asset::new(
            AssetKind::Video,
            "/no/such/clip.mp4",
            begin,
            duration,
            Some(duration),
        )
    }

    fn text_asset(begin: Ms, duration: Ms, title: &str) -> Asset {
        let mut a = Asset::new(AssetKind::Text, "", begin, duration, None);
        a.title = title.to_string();
        a
    }

    fn seeded(assets: Vec<Asset>) -> MemoryStore {
        let mut layers = Timeline::standard().layers;
        layers[0].assets = assets;
        MemoryStore::with(layers)
    }

    fn temp_media(ext: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "session-test-{}-{nanos}.{ext}",
            std::process::id()
        ));
        std::fs::write(&path, b"media").expect("write temp media");
        path
    }

    #[test]
    fn add_keeps_the_visual_layer_contiguous() {
        let file = temp_media("mp4");
        let mut session = open_session(MemoryStore::default(), 4_000);
        session.add_asset(0, AssetKind::Video, &file).unwrap();
        session.add_asset(0, AssetKind::Video, &file).unwrap();

        let layer = &session.timeline().layers[0];
        assert_eq!(layer.assets.len(), 2);
        assert_eq!(layer.assets[0].begin, 0);
        assert_eq!(layer.assets[1].begin, 4_000);
        std::fs::remove_file(&file).ok();
    }

    #[test]
    fn add_with_a_missing_source_mutates_nothing() {
        let store = MemoryStore::default();
        let mut session = open_session(store.clone(), 4_000);
        session
            .add_asset(0, AssetKind::Video, Path::new("/no/such/file.mp4"))
            .unwrap();
        assert!(session.timeline().layers[0].assets.is_empty());
        assert_eq!(store.saves(), 0);
    }

    #[test]
    fn audio_lands_at_the_scrub_position() {
        let file = temp_media("mp3");
        let store = seeded(vec![video(0, 10_000)]);
        let mut session = open_session(store, 3_000);
        session.preview(2_500);
        session.add_asset(2, AssetKind::Audio, &file).unwrap();
        assert_eq!(session.timeline().layers[2].assets[0].begin, 2_500);
        std::fs::remove_file(&file).ok();
    }

    #[test]
    fn cut_splits_at_the_scrub_position() {
        let store = seeded(vec![video(0, 5_000)]);
        let mut session = open_session(store, 5_000);
        session.preview(2_000);
        session.select(0, 0);
        session.cut().unwrap();

        let assets = &session.timeline().layers[0].assets;
        assert_eq!(assets.len(), 2);
        assert_eq!(
            (assets[0].begin, assets[0].duration, assets[0].cut_from),
            (0, 2_000, 0)
        );
        assert_eq!(
            (assets[1].begin, assets[1].duration, assets[1].cut_from),
            (2_000, 3_000, 2_000)
        );
        // Selection stays on the first half.
        assert_eq!(session.selection(), Some((0, 0)));
    }

    #[test]
    fn cut_outside_the_selected_asset_is_a_noop() {
        let store = seeded(vec![video(0, 5_000)]);
        let mut session = open_session(store, 5_000);
        session.select(0, 0);
        // Position sits on the asset's begin, not strictly inside.
        session.cut().unwrap();
        assert_eq!(session.timeline().layers[0].assets.len(), 1);
        // No selection at all is just as silent.
        session.clear_selection();
        session.cut().unwrap();
        assert_eq!(session.timeline().layers[0].assets.len(), 1);
    }

    #[test]
    fn delete_of_the_last_asset_clamps_the_position() {
        let store = seeded(vec![video(0, 5_000)]);
        let mut session = open_session(store, 5_000);
        session.preview(4_000);
        session.select(0, 0);
        let events = session.subscribe();
        session.delete_selected().unwrap();

        assert!(session.timeline().layers[0].assets.is_empty());
        assert_eq!(session.position(), 0);
        let seen: Vec<_> = events.try_iter().collect();
        assert!(seen.contains(&SessionEvent::PositionChanged(0)));
        assert!(seen.contains(&SessionEvent::LayersChanged));
        assert!(seen.contains(&SessionEvent::SelectionChanged(None)));
    }

    #[test]
    fn text_layer_covers_the_timeline_after_load() {
        let mut layers = Timeline::standard().layers;
        layers[0].assets = vec![video(0, 10_000)];
        layers[1].assets = vec![text_asset(2_000, 2_000, "hi")];
        let session = open_session(MemoryStore::with(layers), 10_000);

        let text = &session.timeline().layers[1];
        let mut cursor = 0;
        for a in &text.assets {
            assert_eq!(a.begin, cursor, "gap in text layer at {cursor}");
            cursor = a.end();
        }
        assert_eq!(cursor, 10_000);
    }

    #[test]
    fn spacers_never_reach_the_store() {
        let mut layers = Timeline::standard().layers;
        layers[0].assets = vec![video(0, 10_000)];
        layers[1].assets = vec![text_asset(2_000, 2_000, "hi")];
        let store = MemoryStore::with(layers);
        let mut session = open_session(store.clone(), 10_000);
        session.add_text("later").unwrap();

        let saved = store.saved();
        assert!(saved[1].assets.iter().all(|a| !a.is_spacer()));
        assert_eq!(saved[1].assets.len(), 2);
        // In memory the layer is fully covered, spacers included.
        assert!(session.timeline().layers[1].assets.len() > 2);
    }

    #[test]
    fn drag_exchanges_slots_on_the_visual_layer() {
        let store = seeded(vec![video(0, 2_000), video(2_000, 3_000), video(5_000, 2_000)]);
        let mut session = open_session(store, 0);
        let ids: Vec<_> = session.timeline().layers[0]
            .assets
            .iter()
            .map(|a| a.id)
            .collect();

        session.select(0, 0);
        session.drag_start();
        session.drag_end(5_500).unwrap();

        let layer = &session.timeline().layers[0];
        let after: Vec<_> = layer.assets.iter().map(|a| a.id).collect();
        assert_eq!(after, vec![ids[2], ids[1], ids[0]]);
        assert_eq!(layer.assets[0].begin, 0);
        assert_eq!(layer.assets[1].begin, 2_000);
        assert_eq!(layer.assets[2].begin, 5_000);
        // Selection follows the dragged asset to its new slot.
        assert_eq!(session.selection(), Some((0, 2)));
    }

    #[test]
    fn audio_assets_move_freely_and_clamp_at_zero() {
        let mut layers = Timeline::standard().layers;
        layers[0].assets = vec![video(0, 10_000)];
        layers[2].assets = vec![Asset::new(
            AssetKind::Audio,
            "/no/such/beat.mp3",
            1_000,
            3_000,
            Some(3_000),
        )];
        let mut session = open_session(MemoryStore::with(layers), 0);
        session.select(2, 0);
        session.drag_start();
        session.drag_end(-4_000).unwrap();
        assert_eq!(session.timeline().layers[2].assets[0].begin, 0);
    }

    #[test]
    fn trims_respect_anchors_and_bounds() {
        let mut asset = video(0, 5_000);
        asset.cut_from = 1_000;
        asset.original_duration = Some(10_000);
        let store = seeded(vec![asset]);
        let mut session = open_session(store, 5_000);
        session.select(0, 0);

        session.trim_front(1_000).unwrap();
        let a = session.timeline().asset(0, 0).unwrap().clone();
        assert_eq!(a.begin, 0, "front trim may not move the clip");
        assert_eq!(a.cut_from, 2_000);
        assert_eq!(a.duration, 4_000);

        session.trim_back(20_000).unwrap();
        let a = session.timeline().asset(0, 0).unwrap().clone();
        assert_eq!(a.cut_from, 2_000, "back trim may not touch the source offset");
        assert_eq!(a.duration, 8_000, "bounded by the captured source");

        session.trim_back(-20_000).unwrap();
        let a = session.timeline().asset(0, 0).unwrap().clone();
        assert_eq!(a.duration, MIN_ASSET_DURATION_MS);
    }

    #[test]
    fn busy_gate_drops_structural_edits() {
        let store = seeded(vec![video(0, 5_000)]);
        let mut session = open_session(store, 5_000);
        session.preview(2_000);
        session.select(0, 0);
        session.drag_start();
        assert!(session.is_operating());

        session.cut().unwrap();
        assert_eq!(session.timeline().layers[0].assets.len(), 1);
        session.add_text("t").unwrap();
        assert!(session.timeline().layers[1]
            .assets
            .iter()
            .all(|a| a.is_spacer()));

        session.drag_end(0).unwrap();
        assert!(!session.is_operating());
    }

    #[test]
    fn volume_resolution_prefers_the_asset_override() {
        let store = seeded(vec![video(0, 5_000)]);
        let mut session = open_session(store, 5_000);
        session.set_layer_volume(0, 0.5).unwrap();
        assert_eq!(session.effective_volume_at(0, 0), Some(0.5));

        session.select(0, 0);
        session.set_asset_volume(2.0).unwrap();
        assert_eq!(session.effective_volume_at(0, 0), Some(1.0));
    }

    #[test]
    fn missing_sources_raise_the_session_flag_and_block_play() {
        let store = seeded(vec![video(0, 5_000)]);
        let mut session = open_session(store, 5_000);
        assert!(session.missing_sources());

        session.play();
        assert!(!session.is_playing(), "no layer can start playing");
    }

    #[test]
    fn export_failure_leaves_the_timeline_untouched() {
        let store = seeded(vec![video(0, 5_000)]);
        let mut session = TimelineSession::open(
            Box::new(store),
            Box::new(FixedProbe {
                duration: 5_000,
                fail_export: true,
            }),
            Box::new(Passthrough),
        )
        .expect("session open");
        let before = session.timeline().clone();

        let result = session.export(RenderResolution::FullHd1080, Path::new("/tmp/out.mp4"));
        assert!(matches!(result, Err(SessionError::Export(_))));
        assert_eq!(session.timeline(), &before);
        assert!(!session.flags().exporting);
    }

    #[test]
    fn playback_drives_the_position_and_ends() {
        let file = temp_media("mp4");
        let mut layers = Timeline::standard().layers;
        layers[0].assets = vec![Asset::new(
            AssetKind::Video,
            file.clone(),
            0,
            1_200,
            Some(1_200),
        )];
        let mut session = open_session(MemoryStore::with(layers), 1_200);
        let events = session.subscribe();

        session.play();
        assert!(session.is_playing());

        let deadline = Instant::now() + Duration::from_secs(5);
        while session.is_playing() && Instant::now() < deadline {
            session.pump();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!session.is_playing(), "master layer should have ended");
        assert!(session.position() > 0);
        let seen: Vec<_> = events.try_iter().collect();
        assert!(seen.contains(&SessionEvent::PlaybackEnded));
        assert!(seen
            .iter()
            .any(|e| matches!(e, SessionEvent::PositionChanged(p) if *p > 0)));
        std::fs::remove_file(&file).ok();
    }

    #[test]
    fn stop_cuts_off_position_updates() {
        let file = temp_media("mp4");
        let mut layers = Timeline::standard().layers;
        layers[0].assets = vec![Asset::new(
            AssetKind::Video,
            file.clone(),
            0,
            30_000,
            Some(30_000),
        )];
        let mut session = open_session(MemoryStore::with(layers), 30_000);
        session.play();
        std::thread::sleep(Duration::from_millis(80));
        session.stop_playback();
        let frozen = {
            session.pump();
            session.position()
        };
        std::thread::sleep(Duration::from_millis(80));
        session.pump();
        assert_eq!(session.position(), frozen);
        std::fs::remove_file(&file).ok();
    }
}
