use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use timeline::Ms;

use crate::{BackendError, MediaBackend, PositionTick};

/// Tick cadence of clock-driven position streams (~30 Hz).
pub const TICK_INTERVAL: Duration = Duration::from_millis(33);

/// Anchored wall-clock position. Every transition re-anchors so the
/// reported position never jumps.
#[derive(Debug, Clone, Copy)]
struct Anchor {
    playing: bool,
    at: Option<Instant>,
    media_ms: Ms,
}

impl Anchor {
    fn new() -> Self {
        Self {
            playing: false,
            at: None,
            media_ms: 0,
        }
    }

    fn play(&mut self) {
        self.media_ms = self.now();
        self.at = Some(Instant::now());
        self.playing = true;
    }

    fn pause(&mut self) {
        self.media_ms = self.now();
        self.at = None;
        self.playing = false;
    }

    fn seek(&mut self, position: Ms) {
        self.media_ms = position;
        if self.playing {
            self.at = Some(Instant::now());
        }
    }

    fn now(&self) -> Ms {
        match (self.playing, self.at) {
            (true, Some(at)) => self.media_ms + at.elapsed().as_millis() as Ms,
            _ => self.media_ms,
        }
    }
}

/// Monotonic-clock position source. Serves as the timer stream for
/// image assets and as the shipped position tracker for video/audio;
/// an actual decoder plugs in behind the same `MediaBackend` trait.
/// It never reports a natural end of stream (a clock has none), so
/// end-of-asset falls to the engine's duration tolerance.
pub struct ClockBackend {
    extensions: &'static [&'static str],
    src: Option<PathBuf>,
    muted: bool,
    anchor: Arc<Mutex<Anchor>>,
    tick_rx: Receiver<PositionTick>,
    shutdown: Arc<AtomicBool>,
    ticker: Option<JoinHandle<()>>,
}

impl ClockBackend {
    pub fn video() -> Self {
        Self::new(&["mp4", "mov", "mkv", "webm", "avi", "m4v"])
    }

    pub fn audio() -> Self {
        Self::new(&["mp3", "wav", "aac", "m4a", "flac", "ogg"])
    }

    pub fn image() -> Self {
        Self::new(&["png", "jpg", "jpeg", "bmp", "webp", "gif"])
    }

    fn new(extensions: &'static [&'static str]) -> Self {
        let anchor = Arc::new(Mutex::new(Anchor::new()));
        let (tick_tx, tick_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let ticker = {
            let anchor = anchor.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || run_ticker(anchor, tick_tx, shutdown))
        };
        Self {
            extensions,
            src: None,
            muted: false,
            anchor,
            tick_rx,
            shutdown,
            ticker: Some(ticker),
        }
    }
}

fn run_ticker(anchor: Arc<Mutex<Anchor>>, tx: Sender<PositionTick>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(TICK_INTERVAL);
        let tick = {
            let a = anchor.lock();
            a.playing.then(|| PositionTick {
                position: a.now(),
                stopped: false,
            })
        };
        if let Some(tick) = tick {
            if tx.send(tick).is_err() {
                return;
            }
        }
    }
}

impl MediaBackend for ClockBackend {
    fn open(&mut self, src: &Path) -> Result<(), BackendError> {
        if !src.is_file() {
            return Err(BackendError::SourceMissing(src.to_path_buf()));
        }
        let known = src
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .map(|e| self.extensions.contains(&e.as_str()))
            .unwrap_or(false);
        if !known {
            return Err(BackendError::UnsupportedExtension(src.to_path_buf()));
        }
        self.src = Some(src.to_path_buf());
        *self.anchor.lock() = Anchor::new();
        Ok(())
    }

    fn source(&self) -> Option<&Path> {
        self.src.as_deref()
    }

    fn seek(&mut self, position: Ms) {
        self.anchor.lock().seek(position);
    }

    fn play(&mut self) {
        self.anchor.lock().play();
    }

    fn pause(&mut self) {
        self.anchor.lock().pause();
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    fn position(&self) -> Ms {
        self.anchor.lock().now()
    }

    fn ticks(&self) -> Receiver<PositionTick> {
        self.tick_rx.clone()
    }

    fn dispose(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
        self.src = None;
        self.anchor.lock().pause();
    }
}

impl Drop for ClockBackend {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_holds_position_while_paused() {
        let mut anchor = Anchor::new();
        anchor.seek(4_000);
        assert_eq!(anchor.now(), 4_000);
        anchor.play();
        thread::sleep(Duration::from_millis(40));
        anchor.pause();
        let frozen = anchor.now();
        assert!(frozen >= 4_030, "clock did not advance: {frozen}");
        thread::sleep(Duration::from_millis(30));
        assert_eq!(anchor.now(), frozen);
    }

    #[test]
    fn open_rejects_missing_files_and_foreign_extensions() {
        let mut backend = ClockBackend::video();
        assert!(matches!(
            backend.open(Path::new("/nonexistent/clip.mp4")),
            Err(BackendError::SourceMissing(_))
        ));

        let dir = std::env::temp_dir();
        let path = dir.join(format!("{}.txt", uuid_like()));
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(
            backend.open(&path),
            Err(BackendError::UnsupportedExtension(_))
        ));
        assert!(backend.source().is_none());
        let _ = std::fs::remove_file(&path);
    }

    fn uuid_like() -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("clock-test-{}-{nanos}", std::process::id())
    }
}
