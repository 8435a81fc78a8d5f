use crate::core::records::{Chapter, ChapterAudio, Story, CHAPTERS, CHAPTER_AUDIOS, STORIES};
use crate::core::voice::VoiceRole;
use crate::services::backend::{get_as, list_as, Backend, FileUpload, RecordQuery};
use crate::services::budget::{Admission, Budget, StopReason};
use crate::services::coverage::{CoverageReport, NarratorIndex};
use crate::services::tts::{SynthesizedAudio, TtsClient};
use crate::utils::audio::{measure_duration, wav_to_mp3, AudioFormat};
use crate::utils::text::{char_len, strip_content, truncate_chars};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde_json::json;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Chapters shorter than this (after stripping) are not worth narrating.
pub const MIN_CONTENT_CHARS: usize = 10;
pub const STORY_MAX_CHARS: usize = 1500;

const REPORT_SAMPLE: usize = 20;

#[derive(Debug, Clone)]
pub struct NarrationOptions {
    pub role: VoiceRole,
    /// 0 = no limit.
    pub limit: usize,
    pub max_chars: usize,
    /// End truncated text with a period.
    pub close_truncated: bool,
    pub dry_run: bool,
    pub max_budget: f64,
    pub pause: Duration,
    /// Keep a copy of every uploaded file here.
    pub output_dir: Option<PathBuf>,
    pub transcode_wav: bool,
}

impl NarrationOptions {
    pub fn new(role: VoiceRole) -> Self {
        Self {
            role,
            limit: 0,
            max_chars: 3500,
            close_truncated: false,
            dry_run: false,
            max_budget: 3.0,
            pause: Duration::from_millis(500),
            output_dir: None,
            transcode_wav: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedItem {
    pub chapter_id: String,
    pub title: String,
    pub text: String,
    pub estimate: f64,
}

impl PlannedItem {
    pub fn chars(&self) -> usize {
        char_len(&self.text)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NarrationPlan {
    pub items: Vec<PlannedItem>,
    /// (chapter id, reason)
    pub skipped: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Uploaded,
    Planned,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult {
    pub chapter_id: String,
    pub estimate: f64,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NarrationReport {
    pub ok: usize,
    pub failed: usize,
    pub skipped: usize,
    pub spent: f64,
    pub stop: Option<StopReason>,
    pub items: Vec<ItemResult>,
}

impl NarrationReport {
    pub fn print(&self, dry_run: bool) {
        let verb = if dry_run { "planned" } else { "ok" };
        println!(
            "\nDone. {}={} failed={} skipped={} spent=${:.3}",
            verb, self.ok, self.failed, self.skipped, self.spent
        );
        match self.stop {
            Some(StopReason::Exhausted) => println!("Stopped: budget exhausted."),
            Some(StopReason::WouldExceed { estimate }) => {
                println!("Stopped: next item (~${:.3}) would exceed the budget.", estimate)
            }
            None => {}
        }
    }
}

/// Published story with chapters that have no audio at all.
#[derive(Debug, Clone)]
pub struct StoryGap {
    pub story: Story,
    pub total_chapters: usize,
    pub missing: Vec<Chapter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NarratorRename {
    pub audio_id: String,
    pub from: String,
    pub to: VoiceRole,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenameReport {
    pub planned: Vec<NarratorRename>,
    pub updated: usize,
    pub failed: usize,
}

/// Text to send for one chapter, or `None` when the chapter is too short.
pub fn prepare_text(content: &str, max_chars: usize, close_truncated: bool) -> Option<String> {
    let text = strip_content(content);
    let len = char_len(&text);
    if len < MIN_CONTENT_CHARS {
        return None;
    }
    if max_chars == 0 || len <= max_chars {
        return Some(text);
    }
    let mut cut = truncate_chars(&text, max_chars);
    if close_truncated {
        cut.push('.');
    }
    Some(cut)
}

/// Legacy narrator labels that should be rewritten to a canonical one.
pub fn plan_renames(audios: &[ChapterAudio]) -> Vec<NarratorRename> {
    audios
        .iter()
        .filter_map(|a| {
            let label = a.narrator.as_deref()?.trim();
            if label.is_empty() {
                return None;
            }
            let role = VoiceRole::from_legacy_label(label)?;
            (role.label() != label).then(|| NarratorRename {
                audio_id: a.id.clone(),
                from: label.to_string(),
                to: role,
            })
        })
        .collect()
}

pub struct NarrationWorkflow {
    backend: Arc<dyn Backend>,
    tts: Box<dyn TtsClient>,
}

impl NarrationWorkflow {
    pub fn new(backend: Arc<dyn Backend>, tts: Box<dyn TtsClient>) -> Self {
        Self { backend, tts }
    }

    pub fn tts_name(&self) -> String {
        self.tts.name()
    }

    pub fn is_free(&self) -> bool {
        self.tts.cost_model().usd_per_minute <= 0.0
    }

    // --- Planning ---

    fn plan_chapters(&self, chapters: Vec<Chapter>, options: &NarrationOptions) -> NarrationPlan {
        let mut plan = NarrationPlan::default();
        for ch in chapters {
            match prepare_text(&ch.content, options.max_chars, options.close_truncated) {
                Some(text) => {
                    let estimate = self.tts.estimate_usd(char_len(&text));
                    plan.items.push(PlannedItem {
                        chapter_id: ch.id,
                        title: ch.title,
                        text,
                        estimate,
                    });
                }
                None => plan.skipped.push((ch.id, "content too short".to_string())),
            }
        }
        plan
    }

    /// Chapters that already have some audio but lack `options.role`.
    pub async fn plan_backfill(&self, options: &NarrationOptions) -> Result<NarrationPlan> {
        println!("Fetching chapter audios...");
        let audios: Vec<ChapterAudio> =
            list_as(self.backend.as_ref(), CHAPTER_AUDIOS, &RecordQuery::default()).await?;
        let index = NarratorIndex::from_audios(&audios);
        let mut candidates = index.backfill_candidates(options.role);
        println!(
            "{} chapters with audio, {} missing {}",
            index.len(),
            candidates.len(),
            options.role
        );
        if options.limit > 0 {
            candidates.truncate(options.limit);
        }

        let mut chapters = Vec::with_capacity(candidates.len());
        let mut gone = Vec::new();
        for id in candidates {
            match get_as::<Chapter>(self.backend.as_ref(), CHAPTERS, &id)
                .await
                .with_context(|| format!("Fetching chapter {}", id))?
            {
                Some(ch) => chapters.push(ch),
                None => {
                    warn!("Chapter {} no longer exists, skipping", id);
                    gone.push((id, "chapter not found".to_string()));
                }
            }
        }

        let mut plan = self.plan_chapters(chapters, options);
        plan.skipped.extend(gone);
        Ok(plan)
    }

    // --- Execution ---

    pub async fn execute(&self, plan: NarrationPlan, options: &NarrationOptions) -> Result<NarrationReport> {
        let mut report = NarrationReport {
            skipped: plan.skipped.len(),
            ..Default::default()
        };
        let mut budget = Budget::new(options.max_budget);
        let total = plan.items.len();

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );

        for (i, item) in plan.items.iter().enumerate() {
            if let Admission::Stop(reason) = budget.admit(item.estimate) {
                report.stop = Some(reason);
                break;
            }
            let title: String = item.title.chars().take(30).collect();

            if options.dry_run {
                pb.println(format!(
                    "  [{}/{}] {} ({}): would add {} ({} chars, ~${:.3})",
                    i + 1,
                    total,
                    item.chapter_id,
                    title,
                    options.role.label(),
                    item.chars(),
                    item.estimate
                ));
                budget.record(item.estimate);
                report.ok += 1;
                report.items.push(ItemResult {
                    chapter_id: item.chapter_id.clone(),
                    estimate: item.estimate,
                    outcome: Outcome::Planned,
                });
                pb.inc(1);
                continue;
            }

            pb.set_message(item.chapter_id.clone());
            let outcome = match self.narrate_item(item, options, &mut budget).await {
                Ok((id, duration)) => {
                    pb.println(format!(
                        "  [{}/{}] {} ({}): ok {} ({}, total ${:.2})",
                        i + 1,
                        total,
                        item.chapter_id,
                        title,
                        id,
                        duration.map_or("?s".to_string(), |d| format!("{:.0}s", d)),
                        budget.spent()
                    ));
                    report.ok += 1;
                    Outcome::Uploaded
                }
                Err(e) => {
                    pb.println(format!("  [{}/{}] {} ({}): failed", i + 1, total, item.chapter_id, title));
                    warn!("Chapter {}: {:#}", item.chapter_id, e);
                    report.failed += 1;
                    Outcome::Failed
                }
            };
            report.items.push(ItemResult {
                chapter_id: item.chapter_id.clone(),
                estimate: item.estimate,
                outcome,
            });
            pb.inc(1);

            if i + 1 < total && !options.pause.is_zero() {
                tokio::time::sleep(options.pause).await;
            }
        }
        pb.finish_and_clear();

        report.spent = budget.spent();
        Ok(report)
    }

    /// Synthesize, book the estimate, upload. Returns the new record id and
    /// the measured duration.
    async fn narrate_item(
        &self,
        item: &PlannedItem,
        options: &NarrationOptions,
        budget: &mut Budget,
    ) -> Result<(String, Option<f64>)> {
        let audio = self.tts.synthesize(&item.text).await?;
        // Paid from here on, whatever happens to the upload.
        budget.record(item.estimate);

        let duration = measure(&audio).await;
        if let Some(d) = duration {
            info!(
                "Chapter {}: {:.1}s of audio, ~${:.4} at the per-minute rate (booked ${:.4})",
                item.chapter_id,
                d,
                self.tts.cost_model().usd_for_duration(d),
                item.estimate
            );
        }

        let (bytes, format) = match audio.format {
            AudioFormat::Wav if options.transcode_wav => match wav_to_mp3(&audio.bytes).await {
                Ok(mp3) => (mp3, AudioFormat::Mp3),
                Err(e) => {
                    warn!("{:#}; uploading WAV", e);
                    (audio.bytes, AudioFormat::Wav)
                }
            },
            _ => (audio.bytes, audio.format),
        };
        let file_name = format!("{}.{}", item.chapter_id, format.extension());

        if let Some(dir) = &options.output_dir {
            std::fs::create_dir_all(dir)?;
            let copy = dir.join(format!(
                "{}_{}.{}",
                item.chapter_id,
                options.role.label(),
                format.extension()
            ));
            std::fs::write(&copy, &bytes).with_context(|| format!("Failed to write {}", copy.display()))?;
        }

        let mut fields = vec![
            ("chapter", item.chapter_id.clone()),
            ("narrator", options.role.label().to_string()),
        ];
        if let Some(d) = duration {
            fields.push(("audio_duration", format!("{:.2}", d)));
        }
        let record = self
            .backend
            .create_with_file(
                CHAPTER_AUDIOS,
                &fields,
                FileUpload {
                    field: "audio_file".to_string(),
                    file_name,
                    mime: format.mime().to_string(),
                    bytes,
                },
            )
            .await
            .context("Upload failed")?;
        let id = record["id"].as_str().unwrap_or("?").to_string();
        Ok((id, duration))
    }

    // --- Commands ---

    pub async fn check_voices(&self) -> Result<(NarratorIndex, CoverageReport)> {
        println!("Fetching chapter audios...");
        let audios: Vec<ChapterAudio> =
            list_as(self.backend.as_ref(), CHAPTER_AUDIOS, &RecordQuery::default()).await?;
        let index = NarratorIndex::from_audios(&audios);
        let report = index.classify();
        Ok((index, report))
    }

    pub async fn add_voice(&self, options: &NarrationOptions) -> Result<NarrationReport> {
        info!("Backfilling {} with {}", options.role, self.tts.name());
        let plan = self.plan_backfill(options).await?;
        if plan.items.is_empty() {
            println!("Nothing to do.");
        }
        self.execute(plan, options).await
    }

    /// Narrates every chapter of one story (the first published one when no
    /// id is given), in chapter order.
    pub async fn narrate_story(&self, story_id: Option<&str>, options: &NarrationOptions) -> Result<NarrationReport> {
        let story = match story_id {
            Some(id) => get_as::<Story>(self.backend.as_ref(), STORIES, id)
                .await?
                .with_context(|| format!("Story {} not found", id))?,
            None => list_as::<Story>(
                self.backend.as_ref(),
                STORIES,
                &RecordQuery::filter("is_published=true"),
            )
            .await?
            .into_iter()
            .next()
            .context("No published story found")?,
        };

        let mut chapters = self.story_chapters(&story.id).await?;
        println!("Story: {} (id={}), chapters: {}", story.title, story.id, chapters.len());
        if options.limit > 0 {
            chapters.truncate(options.limit);
        }
        let plan = self.plan_chapters(chapters, options);
        self.execute(plan, options).await
    }

    async fn story_chapters(&self, story_id: &str) -> Result<Vec<Chapter>> {
        let mut chapters: Vec<Chapter> = list_as(
            self.backend.as_ref(),
            CHAPTERS,
            &RecordQuery::filter(format!("(story='{}')", story_id)).sort("chapter_number"),
        )
        .await?;
        chapters.sort_by_key(|c| c.chapter_number);
        Ok(chapters)
    }

    pub async fn missing_audio(&self) -> Result<Vec<StoryGap>> {
        println!("Fetching stories...");
        let stories: Vec<Story> = list_as(
            self.backend.as_ref(),
            STORIES,
            &RecordQuery::filter("is_published=true").sort("title"),
        )
        .await?;

        println!("Fetching chapter audios...");
        let audios: Vec<ChapterAudio> =
            list_as(self.backend.as_ref(), CHAPTER_AUDIOS, &RecordQuery::default()).await?;
        let with_audio: HashSet<&str> = audios.iter().map(|a| a.chapter.as_str()).collect();

        println!("Fetching chapters...");
        let mut gaps = Vec::new();
        for story in stories {
            let chapters = self.story_chapters(&story.id).await?;
            let total_chapters = chapters.len();
            let missing: Vec<Chapter> = chapters
                .into_iter()
                .filter(|c| !with_audio.contains(c.id.as_str()))
                .collect();
            if !missing.is_empty() {
                gaps.push(StoryGap {
                    story,
                    total_chapters,
                    missing,
                });
            }
        }
        Ok(gaps)
    }

    pub async fn generate_missing(&self, gaps: &[StoryGap], options: &NarrationOptions) -> Result<NarrationReport> {
        let mut chapters: Vec<Chapter> = gaps.iter().flat_map(|g| g.missing.iter().cloned()).collect();
        if options.limit > 0 {
            chapters.truncate(options.limit);
        }
        let plan = self.plan_chapters(chapters, options);
        self.execute(plan, options).await
    }

    pub async fn rename_narrators(&self, dry_run: bool) -> Result<RenameReport> {
        let audios: Vec<ChapterAudio> =
            list_as(self.backend.as_ref(), CHAPTER_AUDIOS, &RecordQuery::default()).await?;
        let planned = plan_renames(&audios);
        let mut report = RenameReport {
            planned,
            ..Default::default()
        };
        println!("{} audio records, {} to rename", audios.len(), report.planned.len());

        for r in &report.planned {
            if dry_run {
                println!("  {}: {:?} -> {}", r.audio_id, r.from, r.to.label());
                continue;
            }
            match self
                .backend
                .update(CHAPTER_AUDIOS, &r.audio_id, json!({ "narrator": r.to.label() }))
                .await
            {
                Ok(_) => {
                    println!("  {}: {:?} -> {}", r.audio_id, r.from, r.to.label());
                    report.updated += 1;
                }
                Err(e) => {
                    warn!("Failed to rename {}: {:#}", r.audio_id, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

/// Stages the audio on disk in case the header alone does not give a length.
async fn measure(audio: &SynthesizedAudio) -> Option<f64> {
    let temp = tempfile::Builder::new()
        .suffix(&format!(".{}", audio.format.extension()))
        .tempfile()
        .and_then(|t| std::fs::write(t.path(), &audio.bytes).map(|_| t));
    match temp {
        Ok(t) => measure_duration(&audio.bytes, audio.format, t.path()).await,
        Err(e) => {
            warn!("Could not stage audio for probing: {}", e);
            None
        }
    }
}

// --- Reports ---

fn follow_up_hint(role: VoiceRole) -> String {
    format!(
        "Run `storybook-narrator add-voice --role {}` to fill in {}.",
        role.cli_name(),
        role.label()
    )
}

pub fn print_coverage(index: &NarratorIndex, report: &CoverageReport) {
    println!("\nChapters with audio: {}", report.total);
    println!("  complete (남자 + 여자): {}", report.complete.len());
    for (role, ids) in &report.missing {
        println!("  missing {}: {}", role, ids.len());
    }
    for (role, ids) in &report.missing {
        if ids.is_empty() {
            continue;
        }
        println!("\nMissing {}:", role);
        for id in ids.iter().take(REPORT_SAMPLE) {
            println!("  {}  {:?}", id, index.labels(id));
        }
        if ids.len() > REPORT_SAMPLE {
            println!("  ... +{} more", ids.len() - REPORT_SAMPLE);
        }
    }
    for (role, ids) in &report.missing {
        if !ids.is_empty() {
            println!("\n{}", follow_up_hint(*role));
        }
    }
}

pub fn print_gaps(gaps: &[StoryGap]) {
    if gaps.is_empty() {
        println!("Every published chapter has audio.");
        return;
    }
    println!("\n{} stories with chapters lacking audio:", gaps.len());
    for gap in gaps {
        println!(
            "\n{} | {} ({}/{} chapters missing)",
            gap.story.id,
            gap.story.title,
            gap.missing.len(),
            gap.total_chapters
        );
        for ch in gap.missing.iter().take(3) {
            println!("  Ch{} {} {}", ch.chapter_number, ch.id, ch.title);
        }
        if gap.missing.len() > 3 {
            println!("  +{} more", gap.missing.len() - 3);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::mock::MockBackend;
    use crate::services::tts::mock::MockTts;

    fn body(n: usize) -> String {
        format!("<p>{}</p>", "가".repeat(n))
    }

    /// Audio for five chapters plus one deleted chapter; only c3 has both
    /// voices and "Clova Female" is not yet a recognised label.
    fn fixture() -> MockBackend {
        let backend = MockBackend::with(
            CHAPTER_AUDIOS,
            vec![
                json!({"id": "a1", "chapter": "c1", "narrator": "여자"}),
                json!({"id": "a2", "chapter": "c2", "narrator": "Clova Female"}),
                json!({"id": "a3", "chapter": "c3", "narrator": "남자"}),
                json!({"id": "a4", "chapter": "c3", "narrator": "여자"}),
                json!({"id": "a5", "chapter": "c4", "narrator": "male"}),
                json!({"id": "a6", "chapter": "c_gone", "narrator": "KSS"}),
                json!({"id": "a7", "chapter": "c5", "narrator": "새 목소리"}),
            ],
        );
        backend.insert(
            CHAPTERS,
            vec![
                json!({"id": "c1", "story": "s1", "title": "하나", "chapter_number": 1, "content": body(900)}),
                json!({"id": "c2", "story": "s1", "title": "둘", "chapter_number": 2, "content": body(900)}),
                json!({"id": "c3", "story": "s1", "title": "셋", "chapter_number": 3, "content": body(900)}),
                json!({"id": "c4", "story": "s2", "title": "넷", "chapter_number": 1, "content": body(900)}),
                json!({"id": "c5", "story": "s2", "title": "다섯", "chapter_number": 2, "content": "<p>짧다</p>"}),
                json!({"id": "c6", "story": "s2", "title": "여섯", "chapter_number": 3, "content": body(30)}),
            ],
        );
        backend.insert(
            STORIES,
            vec![
                json!({"id": "s1", "title": "B story", "is_published": true}),
                json!({"id": "s2", "title": "A story", "is_published": true}),
                json!({"id": "s3", "title": "Draft", "is_published": false}),
            ],
        );
        backend
    }

    fn options(dry_run: bool, budget: f64) -> NarrationOptions {
        NarrationOptions {
            dry_run,
            max_budget: budget,
            pause: Duration::ZERO,
            transcode_wav: false,
            ..NarrationOptions::new(VoiceRole::Male)
        }
    }

    #[test]
    fn test_prepare_text() {
        assert_eq!(prepare_text("<p>짧다</p>", 100, false), None);
        assert_eq!(prepare_text(&body(20), 100, false).map(|t| char_len(&t)), Some(20));
        assert_eq!(prepare_text(&body(20), 12, false).map(|t| char_len(&t)), Some(12));
        let closed = prepare_text(&body(20), 12, true).unwrap();
        assert!(closed.ends_with('.'));
        assert_eq!(char_len(&closed), 13);
        assert_eq!(prepare_text(&body(20), 20, true).map(|t| t.ends_with('.')), Some(false));
    }

    #[test]
    fn test_plan_renames() {
        let audios: Vec<ChapterAudio> = serde_json::from_value(json!([
            {"id": "a", "chapter": "c", "narrator": "Clova Female"},
            {"id": "b", "chapter": "c", "narrator": "clova male"},
            {"id": "c", "chapter": "c", "narrator": "KSS"},
            {"id": "d", "chapter": "c", "narrator": "남자"},
            {"id": "e", "chapter": "c", "narrator": ""},
            {"id": "f", "chapter": "c"},
            {"id": "g", "chapter": "c", "narrator": "Chú Ba"}
        ]))
        .unwrap();
        let plan = plan_renames(&audios);
        let got: Vec<(&str, VoiceRole)> = plan.iter().map(|r| (r.audio_id.as_str(), r.to)).collect();
        assert_eq!(
            got,
            vec![
                ("a", VoiceRole::Female),
                ("b", VoiceRole::Male),
                ("c", VoiceRole::Female),
                ("g", VoiceRole::Male)
            ]
        );
    }

    #[tokio::test]
    async fn test_plan_backfill_skips_gone_and_short() -> Result<()> {
        let backend = Arc::new(fixture());
        let wf = NarrationWorkflow::new(backend, Box::new(MockTts::paid()));
        let plan = wf.plan_backfill(&options(true, 1.0)).await?;
        let ids: Vec<&str> = plan.items.iter().map(|i| i.chapter_id.as_str()).collect();
        assert_eq!(ids, ["c1", "c2"]);
        let skipped: Vec<&str> = plan.skipped.iter().map(|(id, _)| id.as_str()).collect();
        assert!(skipped.contains(&"c5"));
        assert!(skipped.contains(&"c_gone"));
        // 900 chars at 15/s is one minute.
        assert!((plan.items[0].estimate - 0.015).abs() < 1e-12);
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing_and_matches_real_plan() -> Result<()> {
        let dry_backend = Arc::new(fixture());
        let dry_tts = MockTts::paid();
        let wf = NarrationWorkflow::new(dry_backend.clone(), Box::new(dry_tts));
        let dry_plan = wf.plan_backfill(&options(true, 1.0)).await?;
        let dry = wf.execute(dry_plan.clone(), &options(true, 1.0)).await?;
        assert_eq!(dry_backend.write_count(), 0);
        assert_eq!(dry.ok, 2);

        let real_backend = Arc::new(fixture());
        let wf = NarrationWorkflow::new(real_backend.clone(), Box::new(MockTts::paid()));
        let real_plan = wf.plan_backfill(&options(false, 1.0)).await?;
        assert_eq!(dry_plan, real_plan);
        let real = wf.execute(real_plan, &options(false, 1.0)).await?;
        assert_eq!(real.ok, 2);
        assert_eq!(real_backend.write_count(), 2);

        let estimates = |r: &NarrationReport| -> Vec<(String, f64)> {
            r.items.iter().map(|i| (i.chapter_id.clone(), i.estimate)).collect()
        };
        assert_eq!(estimates(&dry), estimates(&real));
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_carries_canonical_label_and_duration() -> Result<()> {
        let backend = Arc::new(fixture());
        let wf = NarrationWorkflow::new(backend.clone(), Box::new(MockTts::paid()));
        let opts = NarrationOptions {
            limit: 1,
            ..options(false, 1.0)
        };
        let report = wf.add_voice(&opts).await?;
        assert_eq!(report.ok, 1);

        let uploads = backend.uploads.lock().unwrap();
        let (collection, fields, file) = &uploads[0];
        assert_eq!(collection, CHAPTER_AUDIOS);
        assert!(fields.contains(&("narrator".to_string(), "남자".to_string())));
        assert!(fields.contains(&("chapter".to_string(), "c1".to_string())));
        assert!(fields.contains(&("audio_duration".to_string(), "1.00".to_string())));
        assert_eq!(file.field, "audio_file");
        assert_eq!(file.file_name, "c1.wav");
        // The estimate is booked, not the one-second measurement.
        assert!((report.spent - 0.015).abs() < 1e-12);
        Ok(())
    }

    #[tokio::test]
    async fn test_budget_stops_before_next_item() -> Result<()> {
        let backend = Arc::new(fixture());
        let wf = NarrationWorkflow::new(backend.clone(), Box::new(MockTts::paid()));
        // One 900-char chapter costs ~$0.015; the second would exceed.
        let opts = options(true, 0.02);
        let plan = wf.plan_backfill(&opts).await?;
        let report = wf.execute(plan, &opts).await?;
        assert_eq!(report.ok, 1);
        assert!(matches!(report.stop, Some(StopReason::WouldExceed { .. })));
        assert!(report.spent <= 0.02);
        Ok(())
    }

    #[tokio::test]
    async fn test_slow_speech_stays_within_one_estimate_of_ceiling() -> Result<()> {
        let backend = Arc::new(fixture());
        // 900 chars read in 150 s instead of the assumed 60 s.
        let tts = MockTts {
            audio_secs: 150,
            ..MockTts::paid()
        };
        let wf = NarrationWorkflow::new(backend.clone(), Box::new(tts));
        let opts = options(false, 0.02);
        let plan = wf.plan_backfill(&opts).await?;
        let largest = plan.items.iter().map(|i| i.estimate).fold(0.0, f64::max);
        let report = wf.execute(plan, &opts).await?;
        assert_eq!(report.ok, 1);
        assert!(matches!(report.stop, Some(StopReason::WouldExceed { .. })));
        assert!(report.spent <= 0.02 + largest);
        assert!((report.spent - 0.015).abs() < 1e-12);
        let uploads = backend.uploads.lock().unwrap();
        assert!(uploads[0].1.contains(&("audio_duration".to_string(), "150.00".to_string())));
        Ok(())
    }

    #[tokio::test]
    async fn test_local_write_failure_after_synthesis_books_cost() -> Result<()> {
        let backend = Arc::new(fixture());
        let wf = NarrationWorkflow::new(backend.clone(), Box::new(MockTts::paid()));
        // A regular file where the copy directory should go.
        let blocker = tempfile::NamedTempFile::new()?;
        let opts = NarrationOptions {
            limit: 1,
            output_dir: Some(blocker.path().join("copies")),
            ..options(false, 1.0)
        };
        let report = wf.add_voice(&opts).await?;
        assert_eq!((report.ok, report.failed), (0, 1));
        assert_eq!(backend.write_count(), 0);
        assert!((report.spent - 0.015).abs() < 1e-12);
        Ok(())
    }

    #[tokio::test]
    async fn test_engine_failure_is_counted_and_loop_continues() -> Result<()> {
        let backend = Arc::new(fixture());
        let tts = MockTts {
            fail_on: Some(1),
            ..MockTts::paid()
        };
        let wf = NarrationWorkflow::new(backend.clone(), Box::new(tts));
        let opts = options(false, 1.0);
        let plan = wf.plan_backfill(&opts).await?;
        let report = wf.execute(plan, &opts).await?;
        assert_eq!((report.ok, report.failed), (1, 1));
        assert_eq!(report.items[0].outcome, Outcome::Failed);
        assert_eq!(backend.write_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_failure_still_books_cost() -> Result<()> {
        let backend = Arc::new(MockBackend {
            fail_uploads: true,
            ..fixture()
        });
        let wf = NarrationWorkflow::new(backend, Box::new(MockTts::paid()));
        let opts = NarrationOptions {
            limit: 1,
            ..options(false, 1.0)
        };
        let report = wf.add_voice(&opts).await?;
        assert_eq!(report.failed, 1);
        assert!(report.spent > 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_narrate_story_in_chapter_order() -> Result<()> {
        let backend = Arc::new(fixture());
        let wf = NarrationWorkflow::new(backend.clone(), Box::new(MockTts::paid()));
        let opts = NarrationOptions {
            max_chars: STORY_MAX_CHARS,
            close_truncated: true,
            ..options(true, 10.0)
        };
        let report = wf.narrate_story(Some("s2"), &opts).await?;
        let ids: Vec<&str> = report.items.iter().map(|i| i.chapter_id.as_str()).collect();
        assert_eq!(ids, ["c4", "c6"]);
        assert_eq!(report.skipped, 1);

        assert!(wf.narrate_story(Some("nope"), &opts).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_audio_lists_chapters_without_any_record() -> Result<()> {
        let backend = Arc::new(fixture());
        let wf = NarrationWorkflow::new(backend, Box::new(MockTts::paid()));
        let gaps = wf.missing_audio().await?;
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].story.id, "s2");
        assert_eq!(gaps[0].total_chapters, 3);
        let ids: Vec<&str> = gaps[0].missing.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["c6"]);

        let report = wf.generate_missing(&gaps, &options(true, 10.0)).await?;
        assert_eq!(report.ok, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_rename_narrators() -> Result<()> {
        let backend = Arc::new(fixture());
        let wf = NarrationWorkflow::new(backend.clone(), Box::new(MockTts::paid()));

        let dry = wf.rename_narrators(true).await?;
        assert_eq!(dry.planned.len(), 3);
        assert_eq!(backend.write_count(), 0);

        let real = wf.rename_narrators(false).await?;
        assert_eq!((real.updated, real.failed), (3, 0));
        let a2 = backend.records(CHAPTER_AUDIOS).into_iter().find(|r| r["id"] == "a2").unwrap();
        assert_eq!(a2["narrator"], "여자");

        let again = wf.rename_narrators(true).await?;
        assert!(again.planned.is_empty());
        Ok(())
    }

    #[test]
    fn test_follow_up_hint_uses_cli_role_name() {
        let hint = follow_up_hint(VoiceRole::Female);
        assert!(hint.contains("--role female "));
        assert!(hint.ends_with("여자."));
    }

    #[tokio::test]
    async fn test_check_voices() -> Result<()> {
        let backend = Arc::new(fixture());
        let wf = NarrationWorkflow::new(backend, Box::new(MockTts::paid()));
        let (_, report) = wf.check_voices().await?;
        assert_eq!(report.complete, vec!["c3"]);
        assert_eq!(report.missing(VoiceRole::Male), ["c1", "c2", "c5", "c_gone"]);
        assert_eq!(report.missing(VoiceRole::Female), ["c2", "c4", "c_gone"]);
        Ok(())
    }
}
