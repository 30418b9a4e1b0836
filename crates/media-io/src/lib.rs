use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::debug;

use timeline::{AssetKind, Layer, LayerKind, Ms};

#[derive(Debug, Error)]
pub enum MediaIoError {
    #[error("ffprobe/ffmpeg not found on PATH; please install FFmpeg")]
    FfmpegMissing,
    #[error("ffmpeg failed: {0}")]
    CommandFailed(String),
    #[error("parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeJson {
    streams: Option<Vec<FfprobeStream>>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub kind: AssetKind,
    pub duration_ms: Option<Ms>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

pub fn probe_media(path: &Path) -> Result<MediaInfo, MediaIoError> {
    let ffprobe = which::which("ffprobe").map_err(|_| MediaIoError::FfmpegMissing)?;
    let out = Command::new(ffprobe)
        .arg("-v")
        .arg("error")
        .arg("-show_format")
        .arg("-show_streams")
        .arg("-print_format")
        .arg("json")
        .arg(path)
        .output()
        .map_err(|e| MediaIoError::CommandFailed(e.to_string()))?;
    if !out.status.success() {
        return Err(MediaIoError::CommandFailed(
            String::from_utf8_lossy(&out.stderr).into(),
        ));
    }
    let parsed: FfprobeJson =
        serde_json::from_slice(&out.stdout).map_err(|e| MediaIoError::Parse(e.to_string()))?;

    let mut kind = AssetKind::Audio;
    let mut width = None;
    let mut height = None;
    if let Some(streams) = &parsed.streams {
        for s in streams {
            if s.codec_type.as_deref() == Some("video") {
                kind = AssetKind::Video;
                width = width.or(s.width);
                height = height.or(s.height);
            }
        }
    }

    let duration_ms = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .map(|secs| (secs * 1000.0).round() as Ms);
    // Still images probe as a video stream with no duration.
    if kind == AssetKind::Video && duration_ms.is_none() {
        kind = AssetKind::Image;
    }

    Ok(MediaInfo {
        path: path.to_path_buf(),
        kind,
        duration_ms,
        width,
        height,
    })
}

/// Duration in ms, as the session's add path wants it.
pub fn probe_duration_ms(path: &Path) -> Result<Ms, MediaIoError> {
    probe_media(path)?
        .duration_ms
        .ok_or_else(|| MediaIoError::Parse("source reports no duration".into()))
}

/// Grab one frame at `seek_ms` scaled to the requested size. The
/// output name is the cache key; an existing file is reused untouched.
pub fn generate_thumbnail(
    input: &Path,
    output: &Path,
    seek_ms: Ms,
    width: u32,
    height: u32,
) -> Result<(), MediaIoError> {
    if output.is_file() {
        debug!(path = %output.display(), "thumbnail cache hit");
        return Ok(());
    }
    let ffmpeg = which::which("ffmpeg").map_err(|_| MediaIoError::FfmpegMissing)?;
    let out = Command::new(ffmpeg)
        .arg("-ss")
        .arg(fmt_secs(seek_ms))
        .arg("-i")
        .arg(input)
        .arg("-vframes")
        .arg("1")
        .arg("-vf")
        .arg(format!(
            "scale={width}:{height}:force_original_aspect_ratio=decrease"
        ))
        .arg("-y")
        .arg(output)
        .output()
        .map_err(|e| MediaIoError::CommandFailed(e.to_string()))?;
    if !out.status.success() {
        return Err(MediaIoError::CommandFailed(
            String::from_utf8_lossy(&out.stderr).into(),
        ));
    }
    Ok(())
}

/// Render the layer array to one file: the visual layer becomes a
/// trimmed concat, text assets draw on top of it, audio assets are
/// delayed to their begin and mixed. Spacers and missing sources are
/// skipped.
pub fn render_timeline(
    layers: &[Layer],
    width: u32,
    height: u32,
    out_path: &Path,
) -> Result<(), MediaIoError> {
    let ffmpeg = which::which("ffmpeg").map_err(|_| MediaIoError::FfmpegMissing)?;

    let visual: Vec<_> = layers
        .iter()
        .filter(|l| l.kind == LayerKind::VideoPhoto)
        .flat_map(|l| l.assets.iter())
        .filter(|a| !a.missing)
        .collect();
    if visual.is_empty() {
        return Err(MediaIoError::CommandFailed(
            "nothing to render: the visual layer is empty".into(),
        ));
    }
    let audio: Vec<_> = layers
        .iter()
        .filter(|l| l.kind == LayerKind::Audio)
        .flat_map(|l| {
            let volume = l.volume;
            l.assets
                .iter()
                .filter(|a| !a.missing)
                .map(move |a| (a, a.volume.unwrap_or(volume).clamp(0.0, 1.0)))
        })
        .collect();
    let texts: Vec<_> = layers
        .iter()
        .filter(|l| l.kind == LayerKind::Text)
        .flat_map(|l| l.assets.iter())
        .filter(|a| !a.is_spacer())
        .collect();

    let mut cmd = Command::new(ffmpeg);
    let mut filters: Vec<String> = Vec::new();

    for (i, asset) in visual.iter().enumerate() {
        match asset.kind {
            AssetKind::Image => {
                cmd.arg("-loop")
                    .arg("1")
                    .arg("-t")
                    .arg(fmt_secs(asset.duration))
                    .arg("-i")
                    .arg(&asset.src_path);
            }
            _ => {
                cmd.arg("-ss")
                    .arg(fmt_secs(asset.cut_from))
                    .arg("-t")
                    .arg(fmt_secs(asset.duration))
                    .arg("-i")
                    .arg(&asset.src_path);
            }
        }
        filters.push(format!(
            "[{i}:v]scale={width}:{height}:force_original_aspect_ratio=decrease,\
             pad={width}:{height}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps=30[v{i}]"
        ));
    }

    let concat_inputs: String = (0..visual.len()).map(|i| format!("[v{i}]")).collect();
    filters.push(format!(
        "{concat_inputs}concat=n={}:v=1:a=0[vcat]",
        visual.len()
    ));

    let mut video_tag = String::from("vcat");
    for (t, asset) in texts.iter().enumerate() {
        let next = format!("vtxt{t}");
        filters.push(format!(
            "[{video_tag}]drawtext=text='{}':fontsize={}:fontcolor={}:\
             x=(w-text_w)/2:y=(h-text_h)*0.8:\
             enable='between(t,{},{})'[{next}]",
            escape_drawtext(&asset.title),
            asset.font_size.unwrap_or(48.0) as u32,
            asset.color.as_deref().unwrap_or("white"),
            fmt_secs(asset.begin),
            fmt_secs(asset.end()),
        ));
        video_tag = next;
    }

    let audio_base = visual.len();
    for (j, (asset, volume)) in audio.iter().enumerate() {
        cmd.arg("-ss")
            .arg(fmt_secs(asset.cut_from))
            .arg("-t")
            .arg(fmt_secs(asset.duration))
            .arg("-i")
            .arg(&asset.src_path);
        filters.push(format!(
            "[{}:a]asetpts=PTS-STARTPTS,volume={volume:.3},adelay={delay}|{delay}[a{j}]",
            audio_base + j,
            delay = asset.begin.max(0),
        ));
    }
    if !audio.is_empty() {
        let mix_inputs: String = (0..audio.len()).map(|j| format!("[a{j}]")).collect();
        filters.push(format!(
            "{mix_inputs}amix=inputs={}:normalize=0[aout]",
            audio.len()
        ));
    }

    cmd.arg("-filter_complex").arg(filters.join(";"));
    cmd.arg("-map").arg(format!("[{video_tag}]"));
    if audio.is_empty() {
        cmd.arg("-an");
    } else {
        cmd.arg("-map").arg("[aout]");
    }
    cmd.arg("-c:v")
        .arg("libx264")
        .arg("-pix_fmt")
        .arg("yuv420p")
        .arg("-c:a")
        .arg("aac")
        .arg("-y")
        .arg(out_path);

    debug!(?cmd, "render command");
    let out = cmd
        .output()
        .map_err(|e| MediaIoError::CommandFailed(e.to_string()))?;
    if !out.status.success() {
        return Err(MediaIoError::CommandFailed(
            String::from_utf8_lossy(&out.stderr).into(),
        ));
    }
    Ok(())
}

fn fmt_secs(ms: Ms) -> String {
    format!("{:.3}", ms as f64 / 1000.0)
}

fn escape_drawtext(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace(':', "\\:")
        .replace('%', "\\%")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_formatting_keeps_millisecond_precision() {
        assert_eq!(fmt_secs(0), "0.000");
        assert_eq!(fmt_secs(2_500), "2.500");
        assert_eq!(fmt_secs(61_001), "61.001");
    }

    #[test]
    fn drawtext_escaping_neutralizes_filter_syntax() {
        assert_eq!(escape_drawtext("it's 50%"), "it\\'s 50\\%");
        assert_eq!(escape_drawtext("a:b"), "a\\:b");
    }

    #[test]
    fn render_refuses_an_empty_visual_layer() {
        let layers = timeline::Timeline::standard().layers;
        let err = render_timeline(&layers, 1280, 720, Path::new("/tmp/out.mp4"));
        assert!(err.is_err());
    }
}
