use std::collections::{BTreeMap, BTreeSet};

use crate::core::records::ChapterAudio;
use crate::core::voice::{VoiceRole, REQUIRED_ROLES};

/// Narrator labels already present, per chapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NarratorIndex {
    chapters: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageReport {
    /// Chapters carrying every required role.
    pub complete: Vec<String>,
    /// Chapters lacking a role. A chapter lacking two roles shows up twice.
    pub missing: BTreeMap<VoiceRole, Vec<String>>,
    pub total: usize,
}

impl CoverageReport {
    pub fn missing(&self, role: VoiceRole) -> &[String] {
        self.missing.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl NarratorIndex {
    pub fn from_pairs<I, C, N>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (C, N)>,
        C: AsRef<str>,
        N: AsRef<str>,
    {
        let mut index = Self::default();
        for (chapter, narrator) in pairs {
            index.insert(chapter.as_ref(), narrator.as_ref());
        }
        index
    }

    pub fn from_audios(audios: &[ChapterAudio]) -> Self {
        Self::from_pairs(
            audios
                .iter()
                .map(|a| (a.chapter.as_str(), a.narrator.as_deref().unwrap_or(""))),
        )
    }

    /// A record with a blank narrator still marks the chapter as having audio.
    pub fn insert(&mut self, chapter: &str, narrator: &str) {
        let chapter = chapter.trim();
        if chapter.is_empty() {
            return;
        }
        let labels = self.chapters.entry(chapter.to_string()).or_default();
        let narrator = narrator.trim();
        if !narrator.is_empty() {
            labels.insert(narrator.to_string());
        }
    }

    /// Adds chapters known to exist even when they have no audio at all.
    pub fn with_chapters<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for id in ids {
            let id = id.as_ref().trim();
            if !id.is_empty() {
                self.chapters.entry(id.to_string()).or_default();
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    pub fn contains(&self, chapter: &str) -> bool {
        self.chapters.contains_key(chapter)
    }

    pub fn labels(&self, chapter: &str) -> Vec<&str> {
        self.chapters
            .get(chapter)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn has_role(&self, chapter: &str, role: VoiceRole) -> bool {
        self.chapters
            .get(chapter)
            .is_some_and(|labels| labels.iter().any(|l| role.matches(l)))
    }

    pub fn is_complete(&self, chapter: &str) -> bool {
        REQUIRED_ROLES.iter().all(|r| self.has_role(chapter, *r))
    }

    pub fn classify(&self) -> CoverageReport {
        let mut report = CoverageReport {
            total: self.chapters.len(),
            ..Default::default()
        };
        for role in REQUIRED_ROLES {
            report.missing.insert(role, Vec::new());
        }
        for chapter in self.chapters.keys() {
            let mut complete = true;
            for role in REQUIRED_ROLES {
                if !self.has_role(chapter, role) {
                    complete = false;
                    report.missing.entry(role).or_default().push(chapter.clone());
                }
            }
            if complete {
                report.complete.push(chapter.clone());
            }
        }
        report
    }

    /// Chapters a backfill of `role` should target: for a required role the
    /// chapters missing it, for an extra voice the complete chapters that do
    /// not have it yet.
    pub fn backfill_candidates(&self, role: VoiceRole) -> Vec<String> {
        self.chapters
            .keys()
            .filter(|ch| {
                if role.is_required() {
                    !self.has_role(ch, role)
                } else {
                    self.is_complete(ch) && !self.has_role(ch, role)
                }
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<(&'static str, &'static str)> {
        vec![
            ("ch_both", "남자"),
            ("ch_both", "여자"),
            ("ch_new_voice", "male"),
            ("ch_new_voice", "새 목소리"),
            ("ch_female_only", "Female"),
            ("ch_male_only", "nam"),
            ("ch_blank", ""),
            ("ch_fable", "남자"),
            ("ch_fable", "nữ"),
            ("ch_fable", "페이블"),
        ]
    }

    #[test]
    fn test_classify_partition() {
        let report = NarratorIndex::from_pairs(sample()).classify();
        assert_eq!(report.total, 6);
        assert_eq!(report.complete, vec!["ch_both", "ch_fable", "ch_new_voice"]);
        assert_eq!(report.missing(VoiceRole::Male), ["ch_blank", "ch_female_only"]);
        assert_eq!(report.missing(VoiceRole::Female), ["ch_blank", "ch_male_only"]);
    }

    #[test]
    fn test_classify_is_idempotent() {
        let index = NarratorIndex::from_pairs(sample());
        let first = index.classify();
        let second = index.classify();
        assert_eq!(first, second);

        let mut reversed = sample();
        reversed.reverse();
        assert_eq!(NarratorIndex::from_pairs(reversed).classify(), first);

        let doubled: Vec<_> = sample().into_iter().chain(sample()).collect();
        assert_eq!(NarratorIndex::from_pairs(doubled).classify(), first);
    }

    #[test]
    fn test_chapter_without_audio_misses_every_required_voice() {
        let index = NarratorIndex::from_pairs(sample()).with_chapters(["ch_silent", "ch_both"]);
        let report = index.classify();
        assert_eq!(report.total, 7);
        for role in REQUIRED_ROLES {
            assert!(report.missing(role).contains(&"ch_silent".to_string()));
        }
        assert!(!report.complete.contains(&"ch_silent".to_string()));
    }

    #[test]
    fn test_female_label_does_not_count_as_male() {
        let index = NarratorIndex::from_pairs([("c", "female")]);
        assert!(index.has_role("c", VoiceRole::Female));
        assert!(!index.has_role("c", VoiceRole::Male));
    }

    #[test]
    fn test_backfill_candidates() {
        let index = NarratorIndex::from_pairs(sample());
        assert_eq!(
            index.backfill_candidates(VoiceRole::Male),
            vec!["ch_blank", "ch_female_only"]
        );
        // Only complete chapters without the storyteller.
        assert_eq!(
            index.backfill_candidates(VoiceRole::Storyteller),
            vec!["ch_both", "ch_new_voice"]
        );
    }
}
