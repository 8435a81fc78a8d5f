use anyhow::{anyhow, Context, Result};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::core::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    Wav,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Wav => "audio/wav",
        }
    }
}

struct WavInfo {
    byte_rate: u32,
    data_size: u32,
}

fn scan_wav<R: Read + Seek>(f: &mut R) -> Result<WavInfo> {
    // Check RIFF
    let mut id = [0u8; 4];
    f.read_exact(&mut id)?;
    if &id != b"RIFF" {
        return Err(anyhow!("Not a RIFF file"));
    }

    // Skip File Size
    f.seek(SeekFrom::Current(4))?;

    f.read_exact(&mut id)?;
    if &id != b"WAVE" {
        return Err(anyhow!("Not a WAVE file"));
    }

    let mut byte_rate: Option<u32> = None;
    let mut data_size: Option<u32> = None;

    loop {
        let mut chunk_id = [0u8; 4];
        let n = f.read(&mut chunk_id)?;
        if n == 0 {
            break;
        }
        if n < 4 {
            return Err(anyhow!("Unexpected EOF reading chunk ID"));
        }

        let mut size_buf = [0u8; 4];
        f.read_exact(&mut size_buf)?;
        let chunk_size = u32::from_le_bytes(size_buf);

        if &chunk_id == b"fmt " {
            let mut buf = vec![0u8; chunk_size as usize];
            f.read_exact(&mut buf)?;
            if buf.len() < 12 {
                return Err(anyhow!("fmt chunk too short"));
            }
            // AudioFormat(2) Channels(2) SampleRate(4) ByteRate(4)
            byte_rate = Some(u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]));
        } else if &chunk_id == b"data" {
            data_size = Some(chunk_size);
            break;
        } else {
            // Chunks are word aligned.
            let skip = chunk_size as i64 + (chunk_size as i64 & 1);
            f.seek(SeekFrom::Current(skip))?;
        }
    }

    Ok(WavInfo {
        byte_rate: byte_rate.ok_or_else(|| anyhow!("Missing fmt chunk"))?,
        data_size: data_size.ok_or_else(|| anyhow!("Missing data chunk"))?,
    })
}

/// Playback length of an in-memory WAV file, from its header alone.
pub fn wav_duration_secs(bytes: &[u8]) -> Result<f64> {
    let info = scan_wav(&mut Cursor::new(bytes))?;
    if info.byte_rate == 0 {
        return Err(anyhow!("WAV byte rate is zero"));
    }
    Ok(info.data_size as f64 / info.byte_rate as f64)
}

/// Asks `ffprobe` for the container duration. `None` when the tool is
/// missing, times out, or prints nothing usable.
pub async fn probe_duration_secs(path: &Path) -> Option<f64> {
    let fut = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(Duration::from_secs(5), fut).await {
        Ok(Ok(out)) if out.status.success() => out,
        Ok(Ok(_)) => return None,
        Ok(Err(e)) => {
            log::debug!("ffprobe unavailable: {}", e);
            return None;
        }
        Err(_) => {
            log::debug!("ffprobe timed out on {}", path.display());
            return None;
        }
    };
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

/// Duration of synthesized audio: header for WAV, `ffprobe` otherwise.
pub async fn measure_duration(bytes: &[u8], format: AudioFormat, path: &Path) -> Option<f64> {
    match format {
        AudioFormat::Wav => match wav_duration_secs(bytes) {
            Ok(d) => Some(d),
            Err(e) => {
                log::debug!("WAV header unreadable ({}), trying ffprobe", e);
                probe_duration_secs(path).await
            }
        },
        AudioFormat::Mp3 => probe_duration_secs(path).await,
    }
}

/// WAV -> MP3 through `ffmpeg` pipes.
pub async fn wav_to_mp3(wav: &[u8]) -> Result<Vec<u8>> {
    use tokio::io::AsyncWriteExt;

    let mut child = Command::new("ffmpeg")
        .args([
            "-f", "wav", "-i", "pipe:0", "-acodec", "libmp3lame", "-q:a", "2", "-f", "mp3", "-y",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PipelineError::tool("ffmpeg", e.to_string()))?;

    let mut stdin = child.stdin.take().context("Failed to open ffmpeg stdin")?;
    let input = wav.to_vec();
    let writer = tokio::spawn(async move {
        let res = stdin.write_all(&input).await;
        drop(stdin);
        res
    });

    let output = tokio::time::timeout(Duration::from_secs(60), child.wait_with_output())
        .await
        .map_err(|_| PipelineError::tool("ffmpeg", "timed out"))?
        .context("Failed to wait for ffmpeg")?;
    writer.await?.context("Failed to write to ffmpeg stdin")?;

    if !output.status.success() || output.stdout.is_empty() {
        return Err(PipelineError::tool("ffmpeg", format!("conversion failed ({})", output.status)).into());
    }
    Ok(output.stdout)
}

#[cfg(test)]
pub(crate) fn create_dummy_wav(data_size: u32, sample_rate: u32) -> Vec<u8> {
    use std::io::Write;

    let mut buf = Vec::new();
    buf.write_all(b"RIFF").unwrap();
    buf.write_all(&(36 + data_size).to_le_bytes()).unwrap();
    buf.write_all(b"WAVE").unwrap();

    buf.write_all(b"fmt ").unwrap();
    buf.write_all(&16u32.to_le_bytes()).unwrap();
    // PCM (1), Mono (1), SampleRate, ByteRate, BlockAlign (2), Bits (16)
    buf.write_all(&1u16.to_le_bytes()).unwrap();
    buf.write_all(&1u16.to_le_bytes()).unwrap();
    buf.write_all(&sample_rate.to_le_bytes()).unwrap();
    buf.write_all(&(sample_rate * 2).to_le_bytes()).unwrap();
    buf.write_all(&2u16.to_le_bytes()).unwrap();
    buf.write_all(&16u16.to_le_bytes()).unwrap();

    buf.write_all(b"data").unwrap();
    buf.write_all(&data_size.to_le_bytes()).unwrap();
    buf.write_all(&vec![0u8; data_size as usize]).unwrap();

    buf
}
