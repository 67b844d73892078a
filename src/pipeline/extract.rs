//! Extract stage: plain text, PDF via `pdftotext`, audio/video via ffmpeg
//! and chunked whisper-cli transcription.
//!
//! Every subprocess is raced against the task's cancellation token and
//! killed when it trips. Media work happens in a temp dir that is removed
//! when the stage returns, whatever the outcome.

use super::artifact::{
    ExecutionProfile, Extracted, PageRange, ProfileName, SourceInput, SourceKind,
    TranscriptSegment,
};
use super::backend::Extractor;
use super::{Stage, StageContext};
use crate::config::MediaConfig;
use crate::error::BackendError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const TEXT_TYPES: &[&str] = &[".txt", ".md"];
const MEDIA_TYPES: &[&str] = &[
    ".mp4", ".mov", ".mkv", ".webm", ".avi", ".mp3", ".wav", ".m4a", ".ogg", ".flac",
];

pub fn classify(file_type: &str) -> Option<SourceKind> {
    if TEXT_TYPES.contains(&file_type) {
        Some(SourceKind::Text)
    } else if file_type == ".pdf" {
        Some(SourceKind::Pdf)
    } else if MEDIA_TYPES.contains(&file_type) {
        Some(SourceKind::Media)
    } else {
        None
    }
}

impl ExecutionProfile {
    /// Longer recordings trade accuracy for speed.
    pub fn for_duration(seconds: Option<f64>) -> Self {
        match seconds {
            Some(s) if s > 3600.0 => Self {
                name: ProfileName::Express,
                chunk_seconds: 900,
                best_of: 1,
            },
            Some(s) if s > 1800.0 => Self {
                name: ProfileName::Fast,
                chunk_seconds: 600,
                best_of: 2,
            },
            Some(s) if s > 600.0 => Self {
                name: ProfileName::Balanced,
                chunk_seconds: 300,
                best_of: 4,
            },
            _ => Self {
                name: ProfileName::Accurate,
                chunk_seconds: 120,
                best_of: 8,
            },
        }
    }
}

/// Run `command` to completion unless `cancel` trips first, in which case
/// the child is killed and `BackendError::Cancelled` returned.
pub async fn run_cancellable(
    mut command: Command,
    program: &str,
    cancel: &CancellationToken,
) -> Result<Output, BackendError> {
    if cancel.is_cancelled() {
        return Err(BackendError::Cancelled);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| {
        BackendError::Permanent(format!("Failed to spawn {}: {}", program, e))
    })?;

    // Drain pipes concurrently so a chatty child never blocks on a full pipe
    let stdout = tokio::spawn(read_to_end(child.stdout.take()));
    let stderr = tokio::spawn(read_to_end(child.stderr.take()));

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            log::info!("Killing {} subprocess", program);
            let _ = child.kill().await;
            return Err(BackendError::Cancelled);
        }
        status = child.wait() => status
            .map_err(|e| BackendError::Permanent(format!("Failed to wait for {}: {}", program, e)))?,
    };

    let output = Output {
        status,
        stdout: stdout.await.unwrap_or_default(),
        stderr: stderr.await.unwrap_or_default(),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
        return Err(BackendError::Permanent(format!(
            "{} failed with status {}: {}",
            program, output.status, tail
        )));
    }
    Ok(output)
}

async fn read_to_end<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

pub struct FileExtractor {
    media: MediaConfig,
}

impl FileExtractor {
    pub fn new(media: MediaConfig) -> Self {
        Self { media }
    }

    async fn extract_text(&self, path: &Path) -> Result<Extracted, BackendError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(Extracted::text(
            SourceKind::Text,
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    }

    async fn extract_pdf(
        &self,
        path: &Path,
        pages: Option<PageRange>,
        ctx: &StageContext<'_>,
    ) -> Result<Extracted, BackendError> {
        let mut cmd = Command::new(&self.media.pdftotext_path);
        if let Some(pages) = pages {
            cmd.arg("-f")
                .arg(pages.first.to_string())
                .arg("-l")
                .arg(pages.last.to_string());
        }
        cmd.arg(path).arg("-");

        ctx.report(Stage::Extract, 0.2, "reading PDF");
        let output = run_cancellable(cmd, "pdftotext", ctx.cancel).await?;
        let text = String::from_utf8_lossy(&output.stdout).replace('\u{c}', "\n\n");
        Ok(Extracted::text(SourceKind::Pdf, text))
    }

    async fn probe_duration(&self, path: &Path, ctx: &StageContext<'_>) -> Option<f64> {
        let mut cmd = Command::new(&self.media.ffprobe_path);
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path);

        match run_cancellable(cmd, "ffprobe", ctx.cancel).await {
            Ok(output) => String::from_utf8_lossy(&output.stdout).trim().parse().ok(),
            Err(e) => {
                log::warn!("Could not probe duration of {:?}: {}", path, e);
                None
            }
        }
    }

    async fn extract_media(
        &self,
        path: &Path,
        ctx: &StageContext<'_>,
    ) -> Result<Extracted, BackendError> {
        if !self.media.whisper_model_path.exists() {
            return Err(BackendError::Permanent(format!(
                "Whisper model not found: {:?}",
                self.media.whisper_model_path
            )));
        }

        let duration = self.probe_duration(path, ctx).await;
        ctx.checkpoint()?;
        let profile = ExecutionProfile::for_duration(duration);
        log::info!(
            "Task {}: media duration {:?}s, profile {}",
            ctx.task_id,
            duration,
            profile.name
        );

        let workdir = tempfile::Builder::new()
            .prefix(&format!("analysis-{}-", ctx.task_id))
            .tempdir()?;
        let wav = workdir.path().join("audio.wav");

        ctx.report(Stage::Extract, 0.1, "converting audio");
        let mut cmd = Command::new(&self.media.ffmpeg_path);
        cmd.arg("-y")
            .arg("-i")
            .arg(path)
            .args(["-vn", "-ac", "1", "-ar", "16000", "-c:a", "pcm_s16le"])
            .arg(&wav);
        run_cancellable(cmd, "ffmpeg", ctx.cancel).await?;

        let chunks = chunk_plan(duration, profile.chunk_seconds);
        let mut segments = Vec::new();
        ctx.report(
            Stage::Extract,
            0.2,
            &format!("transcribing {} parts", chunks.len()),
        );
        for (i, chunk) in chunks.iter().enumerate() {
            ctx.checkpoint()?;
            let json_path = self
                .transcribe_chunk(&wav, workdir.path(), i, *chunk, &profile, ctx)
                .await?;
            let raw = tokio::fs::read_to_string(&json_path).await?;
            segments.extend(parse_whisper_json(&raw)?);
            ctx.report(
                Stage::Extract,
                0.2 + 0.8 * (i + 1) as f32 / chunks.len() as f32,
                &format!("transcribed part {}/{}", i + 1, chunks.len()),
            );
        }

        let text = segments_to_paragraphs(&segments);
        Ok(Extracted {
            kind: SourceKind::Media,
            text,
            segments,
            duration_seconds: duration,
            profile: Some(profile),
        })
    }

    async fn transcribe_chunk(
        &self,
        wav: &Path,
        workdir: &Path,
        index: usize,
        chunk: Option<(u64, u64)>,
        profile: &ExecutionProfile,
        ctx: &StageContext<'_>,
    ) -> Result<PathBuf, BackendError> {
        let output_base = workdir.join(format!("chunk-{}", index));
        let mut cmd = Command::new(&self.media.whisper_cli_path);
        cmd.arg("-m")
            .arg(&self.media.whisper_model_path)
            .arg("-f")
            .arg(wav)
            .arg("-bo")
            .arg(profile.best_of.to_string())
            .arg("-oj")
            .arg("-np")
            .arg("-of")
            .arg(&output_base);
        if let Some((offset_ms, duration_ms)) = chunk {
            cmd.arg("-ot")
                .arg(offset_ms.to_string())
                .arg("-d")
                .arg(duration_ms.to_string());
        }
        run_cancellable(cmd, "whisper-cli", ctx.cancel).await?;
        Ok(output_base.with_extension("json"))
    }
}

/// `(offset_ms, duration_ms)` per transcriber run. Unknown duration means a
/// single run over the whole file.
pub fn chunk_plan(duration: Option<f64>, chunk_seconds: u32) -> Vec<Option<(u64, u64)>> {
    let Some(duration) = duration.filter(|d| d.is_finite() && *d > 0.0) else {
        return vec![None];
    };
    let total_ms = (duration * 1000.0).ceil() as u64;
    let step = chunk_seconds.max(1) as u64 * 1000;
    (0..total_ms)
        .step_by(step as usize)
        .map(|offset| Some((offset, step.min(total_ms - offset))))
        .collect()
}

/// Segments from whisper-cli's `-oj` output. Offsets are milliseconds.
pub fn parse_whisper_json(raw: &str) -> Result<Vec<TranscriptSegment>, BackendError> {
    let json: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| BackendError::Permanent(format!("Bad transcriber output: {}", e)))?;
    let Some(items) = json.get("transcription").and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };
    Ok(items
        .iter()
        .filter_map(|seg| {
            let text = seg.get("text").and_then(|t| t.as_str())?.trim().to_string();
            if text.is_empty() {
                return None;
            }
            let offsets = seg.get("offsets");
            let start = offsets
                .and_then(|o| o.get("from"))
                .and_then(|v| v.as_f64())
                .map(|ms| ms / 1000.0)?;
            let end = offsets
                .and_then(|o| o.get("to"))
                .and_then(|v| v.as_f64())
                .map(|ms| ms / 1000.0)
                .unwrap_or(start);
            Some(TranscriptSegment { start, end, text })
        })
        .collect())
}

/// Join segments into paragraphs, breaking on pauses and on length so the
/// topic stage has paragraphs to work with.
pub fn segments_to_paragraphs(segments: &[TranscriptSegment]) -> String {
    const PAUSE_SECONDS: f64 = 2.0;
    const MAX_PARAGRAPH_CHARS: usize = 500;

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut last_end: Option<f64> = None;

    for seg in segments {
        let pause = last_end.map_or(false, |end| seg.start - end > PAUSE_SECONDS);
        if !current.is_empty() && (pause || current.len() >= MAX_PARAGRAPH_CHARS) {
            paragraphs.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&seg.text);
        last_end = Some(seg.end);
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }
    paragraphs.join("\n\n")
}

#[async_trait]
impl Extractor for FileExtractor {
    async fn extract(
        &self,
        input: &SourceInput,
        ctx: &StageContext<'_>,
    ) -> Result<Extracted, BackendError> {
        let file_type = input.file_type();
        let Some(kind) = classify(&file_type) else {
            return Err(BackendError::Invalid(format!(
                "Unsupported file type: {:?}",
                file_type
            )));
        };
        if tokio::fs::metadata(&input.path).await.is_err() {
            return Err(BackendError::Invalid(format!(
                "Source file not found: {:?}",
                input.path
            )));
        }

        let extracted = match kind {
            SourceKind::Text => self.extract_text(&input.path).await?,
            SourceKind::Pdf => self.extract_pdf(&input.path, input.page_range, ctx).await?,
            SourceKind::Media => self.extract_media(&input.path, ctx).await?,
        };

        if extracted.text.trim().is_empty() {
            return Err(BackendError::Invalid(format!(
                "No text could be extracted from {}",
                input.filename
            )));
        }
        ctx.report(Stage::Extract, 1.0, "text extracted");
        Ok(extracted)
    }
}
