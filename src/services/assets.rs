use crate::core::records::{has_file, FileField, Sticker, Story, STICKERS, STORIES};
use crate::services::backend::{list_as, Backend, FileUpload, RecordQuery};
use crate::services::imaging::{cutout, extension_of, mime_for, BackgroundRemover, IMAGE_EXTENSIONS};
use anyhow::{anyhow, Context, Result};
use log::warn;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Backend record ids are 15 characters; shorter stems are other files.
const MIN_ID_LEN: usize = 10;
const STICKER_PREFIX: &str = "sticker_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Thumbnail,
    Sticker,
}

impl AssetKind {
    pub fn collection(self) -> &'static str {
        match self {
            AssetKind::Thumbnail => STORIES,
            AssetKind::Sticker => STICKERS,
        }
    }

    pub fn field(self) -> &'static str {
        match self {
            AssetKind::Thumbnail => "thumbnail",
            AssetKind::Sticker => "image",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImagePair {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadReport {
    pub ok: usize,
    pub failed: usize,
    /// Uploads that fell back to the original after background removal failed.
    pub fallbacks: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedReport {
    pub created: Vec<String>,
    pub enabled: Vec<String>,
}

// --- Pair discovery ---

/// `"id1:path1.webp, id2:path2.png"`. Entries without a colon are ignored.
pub fn parse_map(map: &str) -> Vec<ImagePair> {
    map.split(',')
        .filter_map(|part| {
            let (id, path) = part.trim().split_once(':')?;
            let (id, path) = (id.trim(), path.trim());
            (!id.is_empty() && !path.is_empty()).then(|| ImagePair {
                id: id.to_string(),
                path: PathBuf::from(path),
            })
        })
        .collect()
}

// Files per extension in IMAGE_EXTENSIONS order, names sorted within each.
fn images_by_extension(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(anyhow!("Not a directory: {}", dir.display()));
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut ordered = Vec::new();
    for ext in IMAGE_EXTENSIONS {
        ordered.extend(
            files
                .iter()
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(ext))
                .cloned(),
        );
    }
    Ok(ordered)
}

fn collect_pairs<F>(dir: &Path, id_of: F) -> Result<Vec<ImagePair>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();
    for path in images_by_extension(dir)? {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(id) = id_of(stem) {
            // Later extensions win.
            seen.insert(id, path.clone());
        }
    }
    Ok(seen.into_iter().map(|(id, path)| ImagePair { id, path }).collect())
}

/// `{story_id}.{ext}` files. With `story_id`, the first extension found.
pub fn scan_thumbnails(dir: &Path, story_id: Option<&str>) -> Result<Vec<ImagePair>> {
    if let Some(id) = story_id {
        if !dir.is_dir() {
            return Err(anyhow!("Not a directory: {}", dir.display()));
        }
        return Ok(IMAGE_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{}.{}", id, ext)))
            .find(|p| p.exists())
            .map(|path| ImagePair {
                id: id.to_string(),
                path,
            })
            .into_iter()
            .collect());
    }
    collect_pairs(dir, |stem| {
        (stem.chars().count() >= MIN_ID_LEN).then(|| stem.to_string())
    })
}

/// `sticker_{id}.{ext}` files.
pub fn scan_stickers(dir: &Path) -> Result<Vec<ImagePair>> {
    collect_pairs(dir, |stem| {
        stem.strip_prefix(STICKER_PREFIX)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    })
}

// --- Commands ---

pub struct AssetWorkflow {
    backend: Arc<dyn Backend>,
    remover: Box<dyn BackgroundRemover>,
    max_side: u32,
}

impl AssetWorkflow {
    pub fn new(backend: Arc<dyn Backend>, remover: Box<dyn BackgroundRemover>, max_side: u32) -> Self {
        Self {
            backend,
            remover,
            max_side,
        }
    }

    pub async fn missing_thumbnails(&self) -> Result<Vec<Story>> {
        let stories: Vec<Story> = list_as(
            self.backend.as_ref(),
            STORIES,
            &RecordQuery::filter("is_published=true").sort("title"),
        )
        .await?;
        Ok(stories.into_iter().filter(|s| !has_file(&s.thumbnail)).collect())
    }

    pub async fn missing_sticker_images(&self) -> Result<Vec<Sticker>> {
        let stickers: Vec<Sticker> = list_as(
            self.backend.as_ref(),
            STICKERS,
            &RecordQuery::filter("type=\"story\"").expand("story"),
        )
        .await?;
        Ok(stickers.into_iter().filter(|s| !has_file(&s.image)).collect())
    }

    pub async fn upload(
        &self,
        kind: AssetKind,
        pairs: &[ImagePair],
        remove_bg: bool,
        dry_run: bool,
    ) -> Result<UploadReport> {
        let mut report = UploadReport::default();
        for pair in pairs {
            println!("  {}: {}", pair.id, pair.path.display());
            if dry_run {
                continue;
            }
            match self.upload_one(kind, pair, remove_bg).await {
                Ok(fallback) => {
                    report.ok += 1;
                    if fallback {
                        report.fallbacks += 1;
                    }
                    println!("    -> OK");
                }
                Err(e) => {
                    warn!("{} {}: {:#}", kind.collection(), pair.id, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    // Returns true when background removal failed and the original went up.
    async fn upload_one(&self, kind: AssetKind, pair: &ImagePair, remove_bg: bool) -> Result<bool> {
        let bytes = fs::read(&pair.path).with_context(|| format!("Image not found: {}", pair.path.display()))?;
        let ext = extension_of(&pair.path);
        let name = pair
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image")
            .to_string();

        let mut fallback = false;
        let file = if remove_bg {
            match cutout(self.remover.as_ref(), &bytes, &ext, self.max_side).await {
                Ok(png) => {
                    println!("    (bg removed)");
                    FileUpload {
                        field: kind.field().to_string(),
                        file_name: format!("{}.png", stem_of(&pair.path)),
                        mime: "image/png".to_string(),
                        bytes: png,
                    }
                }
                Err(e) => {
                    warn!("Background removal failed ({:#}), uploading original", e);
                    fallback = true;
                    original_upload(kind, name, &ext, bytes)
                }
            }
        } else {
            original_upload(kind, name, &ext, bytes)
        };

        self.backend
            .update_file(kind.collection(), &pair.id, file)
            .await?;
        Ok(fallback)
    }

    /// Creates a story sticker for each published story that has none.
    pub async fn seed_stickers(&self, enable_all: bool, dry_run: bool) -> Result<SeedReport> {
        let stories: Vec<Story> = list_as(
            self.backend.as_ref(),
            STORIES,
            &RecordQuery::filter("is_published=true").sort("title"),
        )
        .await?;
        let stickers: Vec<Sticker> = list_as(
            self.backend.as_ref(),
            STICKERS,
            &RecordQuery::filter("type=\"story\""),
        )
        .await?;
        let existing: HashSet<&str> = stickers.iter().map(|s| s.story.as_str()).collect();

        let mut report = SeedReport::default();
        for story in &stories {
            if enable_all && !story.has_sticker {
                if !dry_run {
                    self.backend
                        .update(STORIES, &story.id, json!({ "has_sticker": true }))
                        .await?;
                }
                println!("  Enabled has_sticker: {}", story.title);
                report.enabled.push(story.id.clone());
            }
            if existing.contains(story.id.as_str()) {
                continue;
            }
            let key = format!("story_{}", story.id);
            if !dry_run {
                self.backend
                    .create(
                        STICKERS,
                        json!({
                            "type": "story",
                            "key": key,
                            "name_ko": story.title,
                            "story": story.id,
                            "sort_order": 0,
                            "is_published": true,
                        }),
                    )
                    .await?;
            }
            println!("  Created sticker: {} ({})", story.title, key);
            report.created.push(story.id.clone());
        }
        Ok(report)
    }

    /// Re-cuts every level sticker image. Dry-run writes the PNGs into
    /// `out_dir` instead of uploading.
    pub async fn reprocess_level_stickers(&self, dry_run: bool, out_dir: &Path) -> Result<UploadReport> {
        let stickers: Vec<Sticker> = list_as(
            self.backend.as_ref(),
            STICKERS,
            &RecordQuery::filter("type=\"level\"").sort("sort_order"),
        )
        .await?;
        let stickers: Vec<(Sticker, String)> = stickers
            .into_iter()
            .filter_map(|s| {
                let name = s.image.as_ref().and_then(FileField::first)?.to_string();
                Some((s, name))
            })
            .collect();
        println!("Found {} level stickers with images.", stickers.len());

        let mut report = UploadReport::default();
        for (i, (sticker, file_name)) in stickers.iter().enumerate() {
            println!("[{}/{}] {} ({})", i + 1, stickers.len(), sticker.name_ko, sticker.id);
            match self.reprocess_one(sticker, file_name, dry_run, out_dir).await {
                Ok(target) => {
                    println!("  -> {}", target);
                    report.ok += 1;
                }
                Err(e) => {
                    warn!("Sticker {}: {:#}", sticker.id, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn reprocess_one(&self, sticker: &Sticker, file_name: &str, dry_run: bool, out_dir: &Path) -> Result<String> {
        let original = self
            .backend
            .download_file(STICKERS, &sticker.id, file_name)
            .await
            .context("Download failed")?;
        let ext = extension_of(Path::new(file_name));
        let png = cutout(self.remover.as_ref(), &original, &ext, self.max_side).await?;

        if dry_run {
            fs::create_dir_all(out_dir)?;
            let out = out_dir.join(format!("sticker_{}_no_bg.png", sticker.id));
            fs::write(&out, &png)?;
            return Ok(format!("{} (dry-run, no upload)", out.display()));
        }
        self.backend
            .update_file(
                STICKERS,
                &sticker.id,
                FileUpload {
                    field: AssetKind::Sticker.field().to_string(),
                    file_name: format!("sticker_{}.png", sticker.id),
                    mime: "image/png".to_string(),
                    bytes: png,
                },
            )
            .await?;
        Ok("OK (uploaded)".to_string())
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image")
        .to_string()
}

fn original_upload(kind: AssetKind, file_name: String, ext: &str, bytes: Vec<u8>) -> FileUpload {
    FileUpload {
        field: kind.field().to_string(),
        file_name,
        mime: mime_for(ext).to_string(),
        bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::mock::MockBackend;
    use crate::services::imaging::mock::{sample_png, MockRemover};

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), sample_png(4, 4)).unwrap();
    }

    fn workflow(backend: Arc<MockBackend>, fail_remover: bool) -> AssetWorkflow {
        let remover = MockRemover {
            fail: fail_remover,
            ..Default::default()
        };
        AssetWorkflow::new(backend, Box::new(remover), 512)
    }

    #[test]
    fn test_parse_map() {
        let pairs = parse_map(" abc:/tmp/a.webp, nocolon ,def: b.png,:x,");
        assert_eq!(
            pairs,
            vec![
                ImagePair { id: "abc".into(), path: "/tmp/a.webp".into() },
                ImagePair { id: "def".into(), path: "b.png".into() },
            ]
        );
    }

    #[test]
    fn test_scan_thumbnails_later_extension_wins() -> Result<()> {
        let dir = tempfile::tempdir()?;
        touch(dir.path(), "abcdefghij12345.webp");
        touch(dir.path(), "abcdefghij12345.png");
        touch(dir.path(), "zzzzzzzzzz00000.jpg");
        touch(dir.path(), "short.png");
        touch(dir.path(), "abcdefghij99999.gif");

        let pairs = scan_thumbnails(dir.path(), None)?;
        let got: Vec<(&str, String)> = pairs
            .iter()
            .map(|p| (p.id.as_str(), extension_of(&p.path)))
            .collect();
        assert_eq!(
            got,
            vec![("abcdefghij12345", "png".to_string()), ("zzzzzzzzzz00000", "jpg".to_string())]
        );

        // A single story takes the first extension that exists.
        let one = scan_thumbnails(dir.path(), Some("abcdefghij12345"))?;
        assert_eq!(one.len(), 1);
        assert_eq!(extension_of(&one[0].path), "webp");
        assert!(scan_thumbnails(dir.path(), Some("missing")).map(|p| p.is_empty())?);
        Ok(())
    }

    #[test]
    fn test_scan_stickers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        touch(dir.path(), "sticker_a1.jpg");
        touch(dir.path(), "sticker_a1.jpeg");
        touch(dir.path(), "sticker_.png");
        touch(dir.path(), "cover.png");
        let pairs = scan_stickers(dir.path())?;
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].id, "a1");
        assert_eq!(extension_of(&pairs[0].path), "jpeg");
        assert!(scan_stickers(&dir.path().join("nope")).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_lists() -> Result<()> {
        let backend = MockBackend::with(
            STORIES,
            vec![
                json!({"id": "s1", "title": "B", "is_published": true, "thumbnail": "b.webp"}),
                json!({"id": "s2", "title": "A", "is_published": true, "thumbnail": ""}),
                json!({"id": "s3", "title": "C", "is_published": false}),
            ],
        );
        backend.insert(
            STICKERS,
            vec![
                json!({"id": "k1", "type": "story", "story": "s1", "image": "k.png"}),
                json!({"id": "k2", "type": "story", "story": "s2", "image": [], "name_ko": "에이"}),
                json!({"id": "k3", "type": "level", "image": ""}),
            ],
        );
        let wf = workflow(Arc::new(backend), false);

        let stories = wf.missing_thumbnails().await?;
        assert_eq!(stories.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), ["s2"]);

        let stickers = wf.missing_sticker_images().await?;
        assert_eq!(stickers.len(), 1);
        assert_eq!(stickers[0].id, "k2");
        assert_eq!(stickers[0].display_title(), "에이");
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_with_remove_bg_and_fallback() -> Result<()> {
        let dir = tempfile::tempdir()?;
        touch(dir.path(), "sticker_k1.jpg");
        let pairs = vec![
            ImagePair { id: "k1".into(), path: dir.path().join("sticker_k1.jpg") },
            ImagePair { id: "k2".into(), path: dir.path().join("missing.jpg") },
        ];

        let backend = Arc::new(MockBackend::default());
        let report = workflow(backend.clone(), false)
            .upload(AssetKind::Sticker, &pairs, true, false)
            .await?;
        assert_eq!((report.ok, report.failed, report.fallbacks), (1, 1, 0));
        {
            let uploads = backend.uploads.lock().unwrap();
            assert_eq!(uploads[0].2.field, "image");
            assert_eq!(uploads[0].2.file_name, "sticker_k1.png");
            assert_eq!(uploads[0].2.mime, "image/png");
        }

        let backend = Arc::new(MockBackend::default());
        let report = workflow(backend.clone(), true)
            .upload(AssetKind::Sticker, &pairs[..1], true, false)
            .await?;
        assert_eq!((report.ok, report.fallbacks), (1, 1));
        let uploads = backend.uploads.lock().unwrap();
        assert_eq!(uploads[0].2.file_name, "sticker_k1.jpg");
        assert_eq!(uploads[0].2.mime, "image/jpeg");
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_dry_run_writes_nothing() -> Result<()> {
        let backend = Arc::new(MockBackend::default());
        let pairs = parse_map("s1:/nowhere/a.webp");
        let report = workflow(backend.clone(), false)
            .upload(AssetKind::Thumbnail, &pairs, false, true)
            .await?;
        assert_eq!(report, UploadReport::default());
        assert_eq!(backend.write_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_seed_stickers() -> Result<()> {
        let backend = MockBackend::with(
            STORIES,
            vec![
                json!({"id": "s1", "title": "하나", "is_published": true, "has_sticker": true}),
                json!({"id": "s2", "title": "둘", "is_published": true, "has_sticker": false}),
            ],
        );
        backend.insert(STICKERS, vec![json!({"id": "k1", "type": "story", "story": "s1"})]);
        let backend = Arc::new(backend);
        let wf = workflow(backend.clone(), false);

        let dry = wf.seed_stickers(true, true).await?;
        assert_eq!(dry.created, ["s2"]);
        assert_eq!(dry.enabled, ["s2"]);
        assert_eq!(backend.write_count(), 0);

        let real = wf.seed_stickers(true, false).await?;
        assert_eq!(real, dry);
        let created = backend
            .records(STICKERS)
            .into_iter()
            .find(|r| r["story"] == "s2")
            .unwrap();
        assert_eq!(created["key"], "story_s2");
        assert_eq!(created["name_ko"], "둘");
        assert_eq!(created["is_published"], true);

        let again = wf.seed_stickers(true, false).await?;
        assert!(again.created.is_empty() && again.enabled.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_reprocess_level_stickers() -> Result<()> {
        let backend = MockBackend::with(
            STICKERS,
            vec![
                json!({"id": "l1", "type": "level", "name_ko": "별", "image": "l1.jpg", "sort_order": 2}),
                json!({"id": "l2", "type": "level", "name_ko": "달", "image": ["l2.png"], "sort_order": 1}),
                json!({"id": "l3", "type": "level", "image": ""}),
                json!({"id": "k1", "type": "story", "image": "k.png"}),
            ],
        );
        backend
            .files
            .lock()
            .unwrap()
            .insert("stickers/l1/l1.jpg".to_string(), sample_png(800, 400));
        let backend = Arc::new(backend);
        let wf = workflow(backend.clone(), false);
        let out = tempfile::tempdir()?;

        // l2 has no downloadable file and fails; the loop continues.
        let report = wf.reprocess_level_stickers(true, out.path()).await?;
        assert_eq!((report.ok, report.failed), (1, 1));
        let png = fs::read(out.path().join("sticker_l1_no_bg.png"))?;
        let img = image::load_from_memory(&png)?;
        assert_eq!((img.width(), img.height()), (512, 256));
        assert_eq!(backend.write_count(), 0);

        let report = wf.reprocess_level_stickers(false, out.path()).await?;
        assert_eq!(report.ok, 1);
        assert_eq!(backend.write_count(), 1);
        Ok(())
    }
}
