use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which synthesized voice an audio record belongs to.
///
/// Stored narrator labels are free text written by several generations of
/// tooling ("남자", "Clova Male", "새 목소리", ...). All label handling goes
/// through this type so the alias lists cannot drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceRole {
    Male,
    Female,
    Storyteller,
}

/// Roles every chapter should eventually carry.
pub const REQUIRED_ROLES: [VoiceRole; 2] = [VoiceRole::Male, VoiceRole::Female];

// Substring table for labels written before the canonical ones existed.
// Order matters: "female" contains "male".
const LEGACY_LABELS: &[(&str, VoiceRole)] = &[
    ("clova female", VoiceRole::Female),
    ("clova male", VoiceRole::Male),
    ("female", VoiceRole::Female),
    ("male", VoiceRole::Male),
    ("kss", VoiceRole::Female),
    ("mms", VoiceRole::Male),
    ("cô", VoiceRole::Female),
    ("chú", VoiceRole::Male),
];

impl VoiceRole {
    pub const ALL: [VoiceRole; 3] = [VoiceRole::Male, VoiceRole::Female, VoiceRole::Storyteller];

    /// Value accepted by `--role`.
    pub fn cli_name(self) -> &'static str {
        match self {
            VoiceRole::Male => "male",
            VoiceRole::Female => "female",
            VoiceRole::Storyteller => "storyteller",
        }
    }

    /// Label written to `chapter_audios.narrator` for new uploads.
    pub fn label(self) -> &'static str {
        match self {
            VoiceRole::Male => "남자",
            VoiceRole::Female => "여자",
            VoiceRole::Storyteller => "페이블",
        }
    }

    /// Whole-label aliases, compared trimmed and lower-cased.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            VoiceRole::Male => &["남자", "male", "nam"],
            VoiceRole::Female => &["여자", "female", "nu", "nữ", "새 목소리"],
            VoiceRole::Storyteller => &["페이블", "fable"],
        }
    }

    /// Fragments that identify the role anywhere inside a label.
    fn markers(self) -> &'static [&'static str] {
        match self {
            VoiceRole::Male => &["남자"],
            VoiceRole::Female => &["여자", "새 목소리"],
            VoiceRole::Storyteller => &["페이블"],
        }
    }

    pub fn matches(self, label: &str) -> bool {
        let trimmed = label.trim();
        if trimmed.is_empty() {
            return false;
        }
        let lower = trimmed.to_lowercase();
        self.aliases().iter().any(|a| *a == lower)
            || self.markers().iter().any(|m| trimmed.contains(m))
    }

    pub fn is_required(self) -> bool {
        REQUIRED_ROLES.contains(&self)
    }

    /// Maps an old-style label ("Clova Female", "KSS", "Chú") to a role.
    pub fn from_legacy_label(label: &str) -> Option<VoiceRole> {
        let lower = label.trim().to_lowercase();
        if lower.is_empty() {
            return None;
        }
        LEGACY_LABELS
            .iter()
            .find(|(needle, _)| lower.contains(needle))
            .map(|(_, role)| *role)
    }
}

impl fmt::Display for VoiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.cli_name(), self.label())
    }
}

impl FromStr for VoiceRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "male" | "namja" => Ok(VoiceRole::Male),
            "female" | "yeoja" => Ok(VoiceRole::Female),
            "storyteller" | "fable" | "third" => Ok(VoiceRole::Storyteller),
            other => VoiceRole::ALL
                .into_iter()
                .find(|r| r.label() == other)
                .ok_or_else(|| anyhow::anyhow!("Unknown voice role: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_name_parses_back() {
        for role in VoiceRole::ALL {
            assert_eq!(role.cli_name().parse::<VoiceRole>().unwrap(), role);
            assert_eq!(role.cli_name(), role.cli_name().to_lowercase());
        }
    }

    #[test]
    fn test_male_aliases() {
        for label in ["남자", "male", "Male", " MALE ", "nam", "남자 (OpenAI)"] {
            assert!(VoiceRole::Male.matches(label), "{label:?} should be male");
        }
        for label in ["female", "여자", "", "namja voice", "새 목소리"] {
            assert!(!VoiceRole::Male.matches(label), "{label:?} should not be male");
        }
    }

    #[test]
    fn test_female_aliases() {
        for label in ["여자", "female", "FEMALE", "nữ", "Nữ", "nu", "새 목소리", "여자 KSS"] {
            assert!(VoiceRole::Female.matches(label), "{label:?} should be female");
        }
        for label in ["male", "남자", "페이블", "   "] {
            assert!(!VoiceRole::Female.matches(label), "{label:?} should not be female");
        }
    }

    #[test]
    fn test_storyteller_is_not_required() {
        assert!(VoiceRole::Storyteller.matches("페이블"));
        assert!(VoiceRole::Storyteller.matches("Fable"));
        assert!(!VoiceRole::Storyteller.is_required());
        assert!(VoiceRole::Male.is_required() && VoiceRole::Female.is_required());
    }

    #[test]
    fn test_legacy_labels() {
        assert_eq!(VoiceRole::from_legacy_label("Clova Female"), Some(VoiceRole::Female));
        assert_eq!(VoiceRole::from_legacy_label("Clova Male"), Some(VoiceRole::Male));
        assert_eq!(VoiceRole::from_legacy_label("female"), Some(VoiceRole::Female));
        assert_eq!(VoiceRole::from_legacy_label("MALE"), Some(VoiceRole::Male));
        assert_eq!(VoiceRole::from_legacy_label("KSS"), Some(VoiceRole::Female));
        assert_eq!(VoiceRole::from_legacy_label("mms-kor"), Some(VoiceRole::Male));
        assert_eq!(VoiceRole::from_legacy_label("Cô"), Some(VoiceRole::Female));
        assert_eq!(VoiceRole::from_legacy_label("Chú"), Some(VoiceRole::Male));
        assert_eq!(VoiceRole::from_legacy_label("여자"), None);
        assert_eq!(VoiceRole::from_legacy_label(""), None);
    }

    #[test]
    fn test_parse_role() {
        assert_eq!("male".parse::<VoiceRole>().unwrap(), VoiceRole::Male);
        assert_eq!("여자".parse::<VoiceRole>().unwrap(), VoiceRole::Female);
        assert_eq!("fable".parse::<VoiceRole>().unwrap(), VoiceRole::Storyteller);
        assert!("robot".parse::<VoiceRole>().is_err());
    }
}
