//! Still-image animator: ffmpeg loops the avatar image over the speech track.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use facetalk_core::config::AnimationConfig;

use crate::{Animator, AudioArtifact, AvatarImage, StageContext, VideoArtifact};

pub struct FfmpegAnimator {
    config: AnimationConfig,
}

impl FfmpegAnimator {
    pub fn new(config: AnimationConfig) -> Self {
        Self { config }
    }

    /// ffmpeg arguments rendering `image` + `audio` into an H.264/AAC mp4.
    pub fn render_args(&self, image: &Path, audio: &Path, duration: f64, output: &Path) -> Vec<String> {
        let res = self.config.resolution;
        vec![
            "-y".into(),
            "-loop".into(),
            "1".into(),
            "-i".into(),
            image.display().to_string(),
            "-i".into(),
            audio.display().to_string(),
            "-c:v".into(),
            "libx264".into(),
            "-tune".into(),
            "stillimage".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "192k".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-shortest".into(),
            "-t".into(),
            format!("{duration:.3}"),
            "-vf".into(),
            format!("fps={},scale={res}:{res}", self.config.fps),
            output.display().to_string(),
        ]
    }

    /// Audio duration in seconds via ffprobe.
    async fn probe_duration(&self, audio: &Path) -> Result<f64> {
        let output = Command::new(&self.config.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(audio)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.config.ffprobe_path))?;

        if !output.status.success() {
            anyhow::bail!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_duration(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse ffprobe's bare duration output.
pub fn parse_duration(raw: &str) -> Result<f64> {
    let secs: f64 = raw
        .trim()
        .parse()
        .with_context(|| format!("unexpected ffprobe output: {raw:?}"))?;
    if !secs.is_finite() || secs <= 0.0 {
        anyhow::bail!("audio has no duration");
    }
    Ok(secs)
}

#[async_trait]
impl Animator for FfmpegAnimator {
    async fn animate(
        &self,
        avatar: &AvatarImage,
        audio: &AudioArtifact,
        ctx: &StageContext,
    ) -> Result<VideoArtifact> {
        let duration = match audio.duration_secs {
            Some(d) => d,
            None => self.probe_duration(&audio.path).await?,
        };
        let output = ctx.scratch_dir.join("video.mp4");
        let args = self.render_args(&avatar.path, &audio.path, duration, &output);

        debug!(
            session_id = %ctx.session_id,
            avatar_id = %avatar.avatar_id,
            duration,
            "Rendering avatar video"
        );

        // Dropping the future (turn cancelled or timed out) kills ffmpeg.
        let result = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.config.ffmpeg_path))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            warn!(session_id = %ctx.session_id, "ffmpeg failed: {}", stderr.trim());
            anyhow::bail!("ffmpeg exited with {}", result.status);
        }

        Ok(VideoArtifact {
            path: output,
            duration_secs: duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_args() {
        let animator = FfmpegAnimator::new(AnimationConfig::default());
        let args = animator.render_args(
            Path::new("/a/face.png"),
            Path::new("/t/speech.mp3"),
            2.5,
            Path::new("/t/video.mp4"),
        );
        assert_eq!(args.first().map(String::as_str), Some("-y"));
        assert_eq!(args.last().map(String::as_str), Some("/t/video.mp4"));
        assert!(args.contains(&"/a/face.png".to_string()));
        assert!(args.contains(&"2.500".to_string()));
        assert!(args.contains(&"fps=25,scale=512:512".to_string()));
    }

    #[test]
    fn test_parse_duration() {
        assert!((parse_duration("3.456000\n").unwrap() - 3.456).abs() < 1e-9);
        assert!(parse_duration("N/A").is_err());
        assert!(parse_duration("0").is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let animator = FfmpegAnimator::new(AnimationConfig {
            ffmpeg_path: "/nonexistent/ffmpeg".into(),
            ffprobe_path: "/nonexistent/ffprobe".into(),
            ..AnimationConfig::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let ctx = StageContext {
            session_id: "s".into(),
            cancel: Default::default(),
            scratch_dir: dir.path().to_path_buf(),
        };
        let avatar = AvatarImage {
            avatar_id: "a".into(),
            path: dir.path().join("a.png"),
        };
        let audio = AudioArtifact {
            path: dir.path().join("speech.mp3"),
            duration_secs: Some(1.0),
        };
        assert!(animator.animate(&avatar, &audio, &ctx).await.is_err());
    }
}
