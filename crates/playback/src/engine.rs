use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use timeline::{AssetKind, Layer, Ms};
use tracing::{debug, warn};

use crate::{BackendError, ClockBackend, MediaBackend, PositionTick};

/// An asset counts as finished once this close to its declared end.
pub const END_TOLERANCE_MS: Ms = 100;
/// A backend-reported natural stop only counts past this share of the
/// declared duration.
pub const NATURAL_STOP_FRACTION: f64 = 0.8;
/// Stall guard: window before the end in which frozen positions mean
/// the decoder died short of EOF.
pub const STALL_WINDOW_MS: Ms = 500;
pub const STALL_MIN_ADVANCE_MS: Ms = 50;
pub const STALL_TICK_LIMIT: u32 = 4;

pub type BackendFactory = Box<dyn Fn(AssetKind) -> Box<dyn MediaBackend> + Send>;

/// Playback reporting surface one engine exposes to its caller. All
/// three fire from the engine's monitor thread; none fires after
/// `stop()` returns.
pub struct PlaybackCallbacks {
    /// Continuous timeline position.
    pub on_move: Box<dyn Fn(Ms) + Send>,
    /// Discontinuity: playback continued into the next asset.
    pub on_jump: Box<dyn Fn(Ms) + Send>,
    /// The layer ran out of assets.
    pub on_end: Box<dyn Fn() + Send>,
}

/// Per-layer playback state machine. Wraps at most one backend handle
/// per media kind, resolves which asset covers a timeline position,
/// and hands off between consecutive assets without a gap in reported
/// position.
pub struct LayerEngine {
    inner: Arc<Mutex<EngineInner>>,
    monitor: Option<Monitor>,
}

struct Monitor {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct EngineInner {
    layer_index: usize,
    layer: Layer,
    current: Option<usize>,
    video: Option<Box<dyn MediaBackend>>,
    audio: Option<Box<dyn MediaBackend>>,
    image: Option<Box<dyn MediaBackend>>,
    factory: BackendFactory,
}

/// Copy of the timing fields of one asset, so the monitor loop can
/// work without holding a borrow into the layer.
#[derive(Debug, Clone, Copy)]
struct Spans {
    begin: Ms,
    duration: Ms,
    cut_from: Ms,
}

impl Spans {
    fn media_end(&self) -> Ms {
        self.cut_from + self.duration
    }

    fn timeline_pos(&self, media_pos: Ms) -> Ms {
        media_pos - self.cut_from + self.begin
    }
}

impl LayerEngine {
    pub fn new(layer_index: usize, layer: Layer) -> Self {
        Self::with_factory(layer_index, layer, default_factory())
    }

    pub fn with_factory(layer_index: usize, layer: Layer, factory: BackendFactory) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EngineInner {
                layer_index,
                layer,
                current: None,
                video: None,
                audio: None,
                image: None,
                factory,
            })),
            monitor: None,
        }
    }

    /// Open a handle for the first playable asset. Failure is logged
    /// and non-fatal; the handle is retried on the next relevant edit.
    pub fn initialize(&mut self) {
        let mut inner = self.inner.lock();
        let Some(first) = inner.first_playable() else {
            return;
        };
        if let Err(e) = inner.ensure_open(first) {
            warn!(layer = inner.layer_index, error = %e, "backend open failed");
        }
    }

    /// Swap in a fresh layer snapshot after an edit. Cancels any
    /// running playback; the session restarts it when wanted.
    pub fn set_layer(&mut self, layer: Layer) {
        self.stop();
        let mut inner = self.inner.lock();
        inner.layer = layer;
        inner.current = None;
    }

    /// Drop and re-open backend handles. Required after edits that
    /// shift an asset's source window (the old handle stays bound to
    /// the previous seek window).
    pub fn reinit(&mut self) {
        self.stop();
        {
            let mut inner = self.inner.lock();
            inner.dispose_handles();
            inner.current = None;
        }
        self.initialize();
    }

    /// Show the frame at `position` without starting playback. Rapid
    /// repeat calls (scrubbing) reuse the open handle while the source
    /// is unchanged.
    pub fn preview(&mut self, position: Ms) {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.resolve(position) else {
            inner.current = None;
            return;
        };
        if inner.layer.assets[idx].missing {
            return;
        }
        if let Err(e) = inner.ensure_open(idx) {
            warn!(layer = inner.layer_index, error = %e, "backend open failed");
            return;
        }
        inner.current = Some(idx);
        let spans = inner.spans(idx);
        let seek_to = spans.cut_from + (position - spans.begin);
        if let Some(backend) = inner.active_backend() {
            // Muted play/pause pulse forces the target frame out of the
            // decoder without audible output.
            backend.set_muted(true);
            backend.seek(seek_to);
            backend.play();
            backend.pause();
        }
    }

    /// Start continuous playback from `position`. No-op when the
    /// position falls in a gap, the covering asset has no source on
    /// disk, or its backend cannot open.
    pub fn play(&mut self, position: Ms, callbacks: PlaybackCallbacks) {
        self.stop();
        let ticks = {
            let mut inner = self.inner.lock();
            let Some(idx) = inner.resolve(position) else {
                return;
            };
            if inner.layer.assets[idx].missing {
                debug!(layer = inner.layer_index, "play blocked by missing source");
                return;
            }
            match inner.start_asset(idx, position) {
                Ok(ticks) => ticks,
                Err(e) => {
                    warn!(layer = inner.layer_index, error = %e, "backend open failed");
                    return;
                }
            }
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let handle = {
            let inner = self.inner.clone();
            let cancel = cancel.clone();
            thread::spawn(move || run_monitor(inner, ticks, callbacks, cancel))
        };
        self.monitor = Some(Monitor { cancel, handle });
    }

    /// Cancel all subscriptions and pause (not dispose) the backends.
    /// Idempotent; once it returns no callback fires.
    pub fn stop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.cancel.store(true, Ordering::SeqCst);
            let _ = monitor.handle.join();
        }
        self.inner.lock().pause_all();
    }

    /// `stop()` plus handle release. Safe to call more than once.
    pub fn dispose(&mut self) {
        self.stop();
        self.inner.lock().dispose_handles();
    }

    pub fn is_playing(&self) -> bool {
        self.monitor.is_some()
    }

    pub fn current_asset(&self) -> Option<usize> {
        self.inner.lock().current
    }
}

impl Drop for LayerEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl EngineInner {
    fn resolve(&self, position: Ms) -> Option<usize> {
        self.layer
            .assets
            .iter()
            .position(|a| a.kind.has_backend() && a.covers(position))
    }

    fn first_playable(&self) -> Option<usize> {
        self.layer
            .assets
            .iter()
            .position(|a| a.kind.has_backend() && !a.missing)
    }

    fn next_playable(&self, after: usize) -> Option<usize> {
        self.layer
            .assets
            .iter()
            .enumerate()
            .skip(after + 1)
            .find(|(_, a)| a.kind.has_backend() && !a.missing)
            .map(|(i, _)| i)
    }

    fn spans(&self, idx: usize) -> Spans {
        let a = &self.layer.assets[idx];
        Spans {
            begin: a.begin,
            duration: a.duration,
            cut_from: a.cut_from,
        }
    }

    fn slot(&mut self, kind: AssetKind) -> &mut Option<Box<dyn MediaBackend>> {
        match kind {
            AssetKind::Video => &mut self.video,
            AssetKind::Audio => &mut self.audio,
            AssetKind::Image => &mut self.image,
            AssetKind::Text => unreachable!("text assets never dispatch to a backend"),
        }
    }

    /// Open (or reuse) the handle for the asset's kind. A handle bound
    /// to a different source is disposed before the new one opens.
    fn ensure_open(&mut self, idx: usize) -> Result<(), BackendError> {
        let (kind, src) = {
            let a = &self.layer.assets[idx];
            (a.kind, a.src_path.clone())
        };
        if !kind.has_backend() {
            return Ok(());
        }
        if let Some(backend) = self.slot(kind) {
            if backend.source() == Some(src.as_path()) {
                return Ok(());
            }
        }
        if let Some(mut old) = self.slot(kind).take() {
            old.dispose();
        }
        let mut backend = (self.factory)(kind);
        backend.open(&src)?;
        *self.slot(kind) = Some(backend);
        Ok(())
    }

    fn active_backend(&mut self) -> Option<&mut Box<dyn MediaBackend>> {
        let kind = self.layer.assets.get(self.current?)?.kind;
        if !kind.has_backend() {
            return None;
        }
        self.slot(kind).as_mut()
    }

    /// Seek the asset's backend to the media position matching
    /// `timeline_pos` and start it. Returns the fresh tick stream.
    fn start_asset(
        &mut self,
        idx: usize,
        timeline_pos: Ms,
    ) -> Result<Receiver<PositionTick>, BackendError> {
        self.ensure_open(idx)?;
        self.current = Some(idx);
        let spans = self.spans(idx);
        let backend = self.active_backend().ok_or(BackendError::NotOpened)?;
        backend.set_muted(false);
        backend.seek(spans.cut_from + (timeline_pos - spans.begin));
        backend.play();
        let ticks = backend.ticks();
        // Drain ticks queued before the seek; they belong to the
        // previous position.
        while ticks.try_recv().is_ok() {}
        Ok(ticks)
    }

    fn pause_all(&mut self) {
        for slot in [&mut self.video, &mut self.audio, &mut self.image] {
            if let Some(backend) = slot {
                backend.pause();
            }
        }
    }

    fn dispose_handles(&mut self) {
        for slot in [&mut self.video, &mut self.audio, &mut self.image] {
            if let Some(mut backend) = slot.take() {
                backend.dispose();
            }
        }
    }
}

fn default_factory() -> BackendFactory {
    Box::new(|kind| match kind {
        AssetKind::Video => Box::new(ClockBackend::video()),
        AssetKind::Audio => Box::new(ClockBackend::audio()),
        AssetKind::Image => Box::new(ClockBackend::image()),
        AssetKind::Text => unreachable!("text assets never dispatch to a backend"),
    })
}

/// Consecutive near-end ticks with no material advance mean a decoder
/// froze short of EOF.
#[derive(Default)]
struct StallTracker {
    last: Option<Ms>,
    frozen_ticks: u32,
}

impl StallTracker {
    fn observe(&mut self, position: Ms, media_end: Ms) -> bool {
        if media_end - position > STALL_WINDOW_MS {
            self.last = Some(position);
            self.frozen_ticks = 0;
            return false;
        }
        match self.last {
            Some(prev) if position - prev < STALL_MIN_ADVANCE_MS => {
                self.frozen_ticks += 1;
            }
            _ => self.frozen_ticks = 0,
        }
        self.last = Some(position);
        self.frozen_ticks >= STALL_TICK_LIMIT
    }
}

/// Any one signal suffices; container formats report end-of-stream too
/// unreliably for a single check.
fn end_reached(tick: &PositionTick, spans: &Spans, stall: &mut StallTracker) -> bool {
    let media_end = spans.media_end();
    if tick.position >= media_end - END_TOLERANCE_MS {
        return true;
    }
    let natural_floor = spans.cut_from + (spans.duration as f64 * NATURAL_STOP_FRACTION) as Ms;
    if tick.stopped && tick.position >= natural_floor {
        return true;
    }
    stall.observe(tick.position, media_end)
}

enum Step {
    Move(Ms),
    Jump(Ms),
    Finished,
}

fn run_monitor(
    inner: Arc<Mutex<EngineInner>>,
    mut ticks: Receiver<PositionTick>,
    callbacks: PlaybackCallbacks,
    cancel: Arc<AtomicBool>,
) {
    let mut stall = StallTracker::default();
    loop {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let tick = match ticks.recv_timeout(Duration::from_millis(100)) {
            Ok(tick) => tick,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        if cancel.load(Ordering::SeqCst) {
            return;
        }

        // Classify under the lock; invoke callbacks outside it.
        let step = {
            let mut guard = inner.lock();
            let Some(idx) = guard.current else {
                return;
            };
            let spans = guard.spans(idx);
            if !end_reached(&tick, &spans, &mut stall) {
                Step::Move(spans.timeline_pos(tick.position))
            } else {
                stall = StallTracker::default();
                if let Some(backend) = guard.active_backend() {
                    backend.pause();
                }
                match guard.next_playable(idx) {
                    Some(next) => {
                        let begin = guard.layer.assets[next].begin;
                        match guard.start_asset(next, begin) {
                            Ok(next_ticks) => {
                                ticks = next_ticks;
                                Step::Jump(begin)
                            }
                            Err(e) => {
                                warn!(
                                    layer = guard.layer_index,
                                    error = %e,
                                    "handoff aborted: backend open failed"
                                );
                                guard.current = None;
                                Step::Finished
                            }
                        }
                    }
                    None => {
                        guard.current = None;
                        Step::Finished
                    }
                }
            }
        };

        if cancel.load(Ordering::SeqCst) {
            return;
        }
        match step {
            Step::Move(pos) => (callbacks.on_move)(pos),
            Step::Jump(pos) => (callbacks.on_jump)(pos),
            Step::Finished => {
                (callbacks.on_end)();
                return;
            }
        }
    }
}
