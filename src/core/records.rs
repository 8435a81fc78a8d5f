use serde::{Deserialize, Serialize};

pub const STORIES: &str = "stories";
pub const CHAPTERS: &str = "chapters";
pub const CHAPTER_AUDIOS: &str = "chapter_audios";
pub const STICKERS: &str = "stickers";

/// A backend file field: a single filename, a list of them, or nothing.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum FileField {
    Single(String),
    Multiple(Vec<String>),
}

impl FileField {
    pub fn first(&self) -> Option<&str> {
        match self {
            FileField::Single(name) => Some(name.as_str()).filter(|n| !n.trim().is_empty()),
            FileField::Multiple(names) => names
                .iter()
                .map(String::as_str)
                .find(|n| !n.trim().is_empty()),
        }
    }
}

pub fn has_file(field: &Option<FileField>) -> bool {
    field.as_ref().and_then(FileField::first).is_some()
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Story {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub is_published: bool,
    #[serde(default)]
    pub has_sticker: bool,
    #[serde(default)]
    pub thumbnail: Option<FileField>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Chapter {
    pub id: String,
    #[serde(default)]
    pub story: String,
    #[serde(default)]
    pub title: String,
    /// HTML body.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub chapter_number: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ChapterAudio {
    pub id: String,
    #[serde(default)]
    pub chapter: String,
    #[serde(default)]
    pub narrator: Option<String>,
    #[serde(default)]
    pub audio_duration: Option<f64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Sticker {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub name_ko: String,
    #[serde(default)]
    pub story: String,
    #[serde(default)]
    pub image: Option<FileField>,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default)]
    pub expand: Option<StickerExpand>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StickerExpand {
    pub story: Option<Story>,
}

impl Sticker {
    /// Title of the expanded story, falling back to the sticker's own name.
    pub fn display_title(&self) -> &str {
        self.expand
            .as_ref()
            .and_then(|e| e.story.as_ref())
            .map(|s| s.title.as_str())
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.name_ko)
    }
}
