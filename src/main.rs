use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use inquire::Confirm;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use storybook_narrator::core::config::Config;
use storybook_narrator::core::voice::VoiceRole;
use storybook_narrator::services::assets::{parse_map, scan_stickers, scan_thumbnails, AssetKind, AssetWorkflow};
use storybook_narrator::services::backend::{Backend, PocketBaseClient};
use storybook_narrator::services::imaging::{remove_bg_file, RembgCli};
use storybook_narrator::services::tts::coqui::{download_kss_model, KSS_REPO};
use storybook_narrator::services::tts::openai::{OpenAiTts, VOICES};
use storybook_narrator::services::tts::{create_for_role, estimator_for_role, EstimateOnly, TtsClient};
use storybook_narrator::services::workflow::{
    print_coverage, print_gaps, NarrationOptions, NarrationWorkflow, STORY_MAX_CHARS,
};
use storybook_narrator::utils::audio::probe_duration_secs;
use storybook_narrator::utils::text::char_len;

const SAMPLE_TEXT: &str = "옛날 옛적에 착한 형 흥부와 욕심 많은 동생 놀부가 살았습니다. \
흥부는 가난했지만 마음이 넓었고, 놀부는 부자였지만 인색했습니다. \
어느 날 제비가 다리가 부러져 흥부가 구해 주었지요.";

#[derive(Parser)]
#[command(name = "storybook-narrator")]
#[command(about = "Narration and media maintenance for the storybook backend", long_about = None)]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, global = true, default_value = "config.yml")]
    config: PathBuf,

    /// Backend URL (overrides config and PB_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct SynthesisArgs {
    /// Max chapters (0 = all)
    #[arg(long, default_value_t = 0)]
    limit: usize,

    /// Max characters sent per chapter
    #[arg(long)]
    max_chars: Option<usize>,

    /// Stop before spending more than this (USD)
    #[arg(long, default_value_t = 3.0)]
    max_budget: f64,

    /// TTS engine (openai or coqui); defaults per voice role
    #[arg(long)]
    engine: Option<String>,

    /// Cloud voice name
    #[arg(long)]
    voice: Option<String>,

    /// Keep a copy of every produced file here
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Skip the confirmation prompt
    #[arg(long, short)]
    yes: bool,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Report which chapters lack the male or female narration
    CheckVoices,
    /// Add one narrator voice to chapters that lack it
    AddVoice {
        /// male, female or storyteller
        #[arg(long, default_value = "male")]
        role: VoiceRole,
        #[command(flatten)]
        synth: SynthesisArgs,
    },
    /// Narrate every chapter of one story
    NarrateStory {
        /// Story id (default: first published story)
        #[arg(long)]
        story_id: Option<String>,
        #[arg(long, default_value = "female")]
        role: VoiceRole,
        #[command(flatten)]
        synth: SynthesisArgs,
    },
    /// List published stories whose chapters have no audio
    MissingAudio {
        /// Narrate the chapters without audio
        #[arg(long)]
        generate: bool,
        #[arg(long, default_value = "female")]
        role: VoiceRole,
        #[command(flatten)]
        synth: SynthesisArgs,
    },
    /// Rewrite legacy narrator labels to the canonical ones
    RenameNarrators {
        #[arg(long)]
        dry_run: bool,
    },
    /// List published stories without a cover image
    MissingThumbnails,
    /// List story stickers without an image
    MissingStickers,
    /// Upload cover images to stories
    UploadThumbnails {
        /// Directory with {story_id}.webp|jpg|jpeg|png
        #[arg(long, conflicts_with = "map")]
        image_dir: Option<PathBuf>,
        /// Only this story (with --image-dir)
        #[arg(long, requires = "image_dir")]
        story_id: Option<String>,
        /// "id1:path1,id2:path2"
        #[arg(long)]
        map: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Upload sticker images
    UploadStickers {
        /// Directory with sticker_{id}.webp|jpg|jpeg|png
        #[arg(long, conflicts_with = "map")]
        image_dir: Option<PathBuf>,
        /// "id1:path1,id2:path2"
        #[arg(long)]
        map: Option<String>,
        /// Cut out the background before uploading
        #[arg(long)]
        remove_bg: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Create a story sticker for every published story
    SeedStickers {
        /// Also set has_sticker on stories lacking it
        #[arg(long)]
        enable_all: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-cut level sticker images and upload them again
    ReprocessLevelStickers {
        /// Write PNGs to --output-dir instead of uploading
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Remove the background of local image files
    RemoveBg {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Delete each input after writing its PNG
        #[arg(long)]
        delete_original: bool,
    },
    /// Synthesize a sample passage with the cloud engine and print its cost
    TtsSample {
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        voice: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// Print the known cloud voices and exit
        #[arg(long)]
        list_voices: bool,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Check (and optionally download) local TTS model files
    TtsModels {
        #[arg(long)]
        download: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(url) = cli.base_url {
        config.backend.base_url = url;
    }

    match cli.command {
        Commands::CheckVoices => {
            let backend = connect(&config).await?;
            let workflow = NarrationWorkflow::new(backend, Box::new(EstimateOnly::none()));
            let (index, report) = workflow.check_voices().await?;
            print_coverage(&index, &report);
        }
        Commands::AddVoice { role, synth } => {
            // The local engine is slow on long passages.
            let cap = (role == VoiceRole::Female && synth.engine.is_none()).then_some(STORY_MAX_CHARS);
            let options = narration_options(role, &synth, cap);
            run_backfill(&config, &synth, options).await?;
        }
        Commands::NarrateStory { story_id, role, synth } => {
            let mut options = narration_options(role, &synth, Some(STORY_MAX_CHARS));
            options.close_truncated = true;
            let tts = engine(&config, role, &synth)?;
            config.credentials()?;
            if !confirm_spend(tts.as_ref(), &options, synth.yes)? {
                return Ok(());
            }
            let backend = connect(&config).await?;
            let workflow = NarrationWorkflow::new(backend, tts);
            let report = workflow.narrate_story(story_id.as_deref(), &options).await?;
            report.print(options.dry_run);
        }
        Commands::MissingAudio { generate, role, synth } => {
            let mut options = narration_options(role, &synth, Some(STORY_MAX_CHARS));
            options.close_truncated = true;
            let tts: Box<dyn TtsClient> = if generate {
                engine(&config, role, &synth)?
            } else {
                Box::new(EstimateOnly::none())
            };
            let backend = connect(&config).await?;
            let workflow = NarrationWorkflow::new(backend, tts);
            let gaps = workflow.missing_audio().await?;
            print_gaps(&gaps);
            if generate && !gaps.is_empty() {
                let needs_prompt = !options.dry_run && !synth.yes && !workflow.is_free();
                if needs_prompt && !ask_budget(&workflow.tts_name(), options.max_budget)? {
                    return Ok(());
                }
                let report = workflow.generate_missing(&gaps, &options).await?;
                report.print(options.dry_run);
            }
        }
        Commands::RenameNarrators { dry_run } => {
            let backend = connect(&config).await?;
            let workflow = NarrationWorkflow::new(backend, Box::new(EstimateOnly::none()));
            let report = workflow.rename_narrators(dry_run).await?;
            if dry_run {
                println!("\nDry run: {} records would be renamed.", report.planned.len());
            } else {
                println!("\nUpdated {} records, {} failed.", report.updated, report.failed);
            }
        }
        Commands::MissingThumbnails => {
            let assets = asset_workflow(&config).await?;
            let stories = assets.missing_thumbnails().await?;
            println!("{} published stories without a thumbnail:", stories.len());
            for s in stories {
                println!("{}|{}", s.id, s.title);
            }
        }
        Commands::MissingStickers => {
            let assets = asset_workflow(&config).await?;
            let stickers = assets.missing_sticker_images().await?;
            println!("{} story stickers without an image:", stickers.len());
            for s in stickers {
                println!("{}|{}|{}", s.id, s.story, s.display_title());
            }
        }
        Commands::UploadThumbnails {
            image_dir,
            story_id,
            map,
            dry_run,
        } => {
            let pairs = match (map, image_dir) {
                (Some(m), _) => parse_map(&m),
                (None, Some(dir)) => scan_thumbnails(&dir, story_id.as_deref())?,
                (None, None) => bail!("Use --map or --image-dir (and optionally --story-id)"),
            };
            upload_pairs(&config, AssetKind::Thumbnail, pairs, false, dry_run).await?;
        }
        Commands::UploadStickers {
            image_dir,
            map,
            remove_bg,
            dry_run,
        } => {
            let pairs = match (map, image_dir) {
                (Some(m), _) => parse_map(&m),
                (None, Some(dir)) => scan_stickers(&dir)?,
                (None, None) => bail!("Use --map or --image-dir"),
            };
            upload_pairs(&config, AssetKind::Sticker, pairs, remove_bg, dry_run).await?;
        }
        Commands::SeedStickers { enable_all, dry_run } => {
            let assets = asset_workflow(&config).await?;
            let report = assets.seed_stickers(enable_all, dry_run).await?;
            println!(
                "\n{} {} stickers, enabled has_sticker for {} stories.",
                if dry_run { "Would create" } else { "Created" },
                report.created.len(),
                report.enabled.len()
            );
        }
        Commands::ReprocessLevelStickers { dry_run, output_dir } => {
            let out = config.output_dir(output_dir.as_deref());
            let assets = asset_workflow(&config).await?;
            let report = assets.reprocess_level_stickers(dry_run, &out).await?;
            println!("\nDone. ok={} failed={}", report.ok, report.failed);
        }
        Commands::RemoveBg {
            files,
            output_dir,
            delete_original,
        } => {
            let remover = RembgCli::new(&config.imaging);
            let mut failed = 0;
            for file in &files {
                match remove_bg_file(
                    &remover,
                    file,
                    output_dir.as_deref(),
                    delete_original,
                    config.imaging.max_side,
                )
                .await
                {
                    Ok(out) => println!("{} -> {}", file.display(), out.display()),
                    Err(e) => {
                        log::error!("{}: {:#}", file.display(), e);
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("{} of {} files failed", failed, files.len());
            }
        }
        Commands::TtsSample {
            text,
            voice,
            model,
            list_voices,
            output_dir,
        } => {
            if list_voices {
                println!("Voices: {}", VOICES.join(", "));
                return Ok(());
            }
            if let Some(m) = model {
                config.audio.openai.model = m;
            }
            let out = config.output_dir(output_dir.as_deref());
            tts_sample(&config, text.as_deref().unwrap_or(SAMPLE_TEXT), voice.as_deref(), &out).await?;
        }
        Commands::TtsModels { download } => {
            let coqui = &config.audio.coqui;
            if download {
                let paths = download_kss_model(Path::new(&coqui.models_dir)).await?;
                for p in paths {
                    println!("  {}", p.display());
                }
            }
            let status = coqui.status();
            let mark = |ok: bool| if ok { "ok" } else { "missing" };
            println!("KSS model:   {} ({})", status.kss_model.display(), mark(status.kss_model.exists()));
            println!("KSS config:  {} ({})", status.kss_config.display(), mark(status.kss_config.exists()));
            match &status.speaker_wav {
                Some(p) => println!("XTTS speaker: {} (ok)", p.display()),
                None => println!("XTTS speaker: missing (set coqui.speaker_wav)"),
            }
            if !status.kss_ready {
                println!("\nRun `storybook-narrator tts-models --download` to fetch {}.", KSS_REPO);
            }
        }
    }

    Ok(())
}

/// Validates credentials, then authenticates.
async fn connect(config: &Config) -> Result<Arc<dyn Backend>> {
    let creds = config.credentials()?;
    println!("Authenticating...");
    Ok(Arc::new(PocketBaseClient::connect(&creds).await?))
}

async fn asset_workflow(config: &Config) -> Result<AssetWorkflow> {
    let backend = connect(config).await?;
    Ok(AssetWorkflow::new(
        backend,
        Box::new(RembgCli::new(&config.imaging)),
        config.imaging.max_side,
    ))
}

async fn upload_pairs(
    config: &Config,
    kind: AssetKind,
    pairs: Vec<storybook_narrator::services::assets::ImagePair>,
    remove_bg: bool,
    dry_run: bool,
) -> Result<()> {
    if pairs.is_empty() {
        println!("No image pairs to upload.");
        return Ok(());
    }
    let assets = asset_workflow(config).await?;
    let report = assets.upload(kind, &pairs, remove_bg, dry_run).await?;
    if !dry_run {
        println!("\nDone. ok={} failed={}", report.ok, report.failed);
    }
    Ok(())
}

fn narration_options(role: VoiceRole, synth: &SynthesisArgs, default_max_chars: Option<usize>) -> NarrationOptions {
    let mut options = NarrationOptions::new(role);
    options.limit = synth.limit;
    options.max_budget = synth.max_budget;
    options.dry_run = synth.dry_run;
    options.output_dir = synth.output_dir.clone();
    if let Some(n) = synth.max_chars.or(default_max_chars) {
        options.max_chars = n;
    }
    options
}

/// Dry runs only price the work, so they need no engine credentials.
fn engine(config: &Config, role: VoiceRole, synth: &SynthesisArgs) -> Result<Box<dyn TtsClient>> {
    let (provider, voice) = (synth.engine.as_deref(), synth.voice.as_deref());
    if synth.dry_run {
        return Ok(Box::new(estimator_for_role(config, role, provider, voice)?));
    }
    create_for_role(config, role, provider, voice)
}

async fn run_backfill(config: &Config, synth: &SynthesisArgs, options: NarrationOptions) -> Result<()> {
    let tts = engine(config, options.role, synth)?;
    config.credentials()?;
    if !confirm_spend(tts.as_ref(), &options, synth.yes)? {
        return Ok(());
    }
    let backend = connect(config).await?;
    let workflow = NarrationWorkflow::new(backend, tts);
    let report = workflow.add_voice(&options).await?;
    report.print(options.dry_run);
    Ok(())
}

fn confirm_spend(tts: &dyn TtsClient, options: &NarrationOptions, yes: bool) -> Result<bool> {
    if options.dry_run || yes || tts.cost_model().usd_per_minute <= 0.0 {
        return Ok(true);
    }
    ask_budget(&tts.name(), options.max_budget)
}

fn ask_budget(engine: &str, budget: f64) -> Result<bool> {
    let ok = Confirm::new(&format!("Spend up to ${:.2} on {}?", budget, engine))
        .with_default(false)
        .prompt()?;
    if !ok {
        println!("Aborted.");
    }
    Ok(ok)
}

async fn tts_sample(config: &Config, text: &str, voice: Option<&str>, out_dir: &Path) -> Result<()> {
    let mut client = OpenAiTts::new(config.audio.openai.clone(), config.audio.cost)?;
    if let Some(v) = voice {
        client = client.with_voice(v);
    }
    let text = text.trim();
    let chars = char_len(text);
    let estimate = client.estimate_usd(chars);

    println!("Characters: {}", chars);
    println!("Voice:      {}", client.voice());
    println!("Model:      {}", client.model());
    println!("Estimated:  ${:.4}", estimate);

    let audio = client.synthesize(text).await?;
    std::fs::create_dir_all(out_dir)?;
    let path = out_dir.join(format!("sample_{}.{}", client.voice(), audio.format.extension()));
    std::fs::write(&path, &audio.bytes)?;
    println!("Saved:      {}", path.display());

    match probe_duration_secs(&path).await {
        Some(d) => println!(
            "Duration:   {:.1}s (~${:.4})",
            d,
            client.cost_model().usd_for_duration(d)
        ),
        None => println!("Duration:   unknown (ffprobe not available)"),
    }
    Ok(())
}
