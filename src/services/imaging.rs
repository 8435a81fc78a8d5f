use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use log::debug;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;

use crate::core::config::ImagingConfig;
use crate::core::error::PipelineError;

pub const IMAGE_EXTENSIONS: [&str; 4] = ["webp", "jpg", "jpeg", "png"];

const REMBG_TIMEOUT: Duration = Duration::from_secs(300);

#[async_trait]
pub trait BackgroundRemover: Send + Sync {
    /// Image bytes in, cut-out image bytes (with alpha) out.
    async fn remove_background(&self, image: &[u8], extension: &str) -> Result<Vec<u8>>;
}

/// The `rembg i <in> <out>` command.
pub struct RembgCli {
    bin: String,
    model: Option<String>,
}

impl RembgCli {
    pub fn new(config: &ImagingConfig) -> Self {
        Self {
            bin: config.rembg_bin.clone(),
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl BackgroundRemover for RembgCli {
    async fn remove_background(&self, image: &[u8], extension: &str) -> Result<Vec<u8>> {
        let workdir = tempfile::tempdir()?;
        let input = workdir.path().join(format!("input.{}", extension.trim_start_matches('.')));
        let output = workdir.path().join("output.png");
        fs::write(&input, image).await?;

        let mut cmd = Command::new(&self.bin);
        cmd.arg("i");
        if let Some(model) = &self.model {
            cmd.args(["-m", model]);
        }
        cmd.arg(&input)
            .arg(&output)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        debug!("{} i {} {}", self.bin, input.display(), output.display());

        let out = tokio::time::timeout(REMBG_TIMEOUT, cmd.output())
            .await
            .map_err(|_| PipelineError::tool(&self.bin, "timed out"))?
            .map_err(|e| PipelineError::tool(&self.bin, e.to_string()))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(PipelineError::tool(
                &self.bin,
                format!("{}: {}", out.status, stderr.lines().last().unwrap_or("").trim()),
            )
            .into());
        }
        fs::read(&output)
            .await
            .map_err(|e| PipelineError::tool(&self.bin, format!("no output file: {}", e)).into())
    }
}

/// RGBA, shrunk to fit `max_side` (never enlarged), encoded as PNG.
pub fn finish_cutout(bytes: &[u8], max_side: u32) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| PipelineError::tool("image", e.to_string()))?;
    let mut img = DynamicImage::ImageRgba8(img.to_rgba8());
    if max_side > 0 && (img.width() > max_side || img.height() > max_side) {
        img = img.thumbnail(max_side, max_side);
    }
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .context("Failed to encode PNG")?;
    Ok(buf)
}

pub async fn cutout(
    remover: &dyn BackgroundRemover,
    image: &[u8],
    extension: &str,
    max_side: u32,
) -> Result<Vec<u8>> {
    let raw = remover.remove_background(image, extension).await?;
    finish_cutout(&raw, max_side)
}

pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_else(|| "png".to_string())
}

pub fn mime_for(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        "webp" => "image/webp",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "image/png",
    }
}

/// Writes `<stem>.png` next to `input` (or into `out_dir`), optionally
/// deleting the original afterwards.
pub async fn remove_bg_file(
    remover: &dyn BackgroundRemover,
    input: &Path,
    out_dir: Option<&Path>,
    delete_original: bool,
    max_side: u32,
) -> Result<PathBuf> {
    let bytes = fs::read(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let png = cutout(remover, &bytes, &extension_of(input), max_side).await?;

    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let dir = match out_dir {
        Some(d) => d.to_path_buf(),
        None => input.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    fs::create_dir_all(&dir).await?;
    let target = dir.join(format!("{}.png", stem));
    fs::write(&target, &png)
        .await
        .with_context(|| format!("Failed to write {}", target.display()))?;

    if delete_original && target != input {
        fs::remove_file(input).await?;
    }
    Ok(target)
}
