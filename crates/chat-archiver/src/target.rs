//! Archive targets: the chats and users whose data gets archived.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::ArchiveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Chat,
    User,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Chat => "chat",
            TargetType::User => "user",
        }
    }
}

impl FromStr for TargetType {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chat" => Ok(TargetType::Chat),
            "user" => Ok(TargetType::User),
            other => Err(ArchiveError::InvalidTarget(other.to_string())),
        }
    }
}

/// A chat or user to archive, written as `chat:<id>` or `user:<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub target_type: TargetType,
    pub target_id: i64,
}

impl Target {
    pub fn chat(target_id: i64) -> Self {
        Self { target_type: TargetType::Chat, target_id }
    }

    pub fn user(target_id: i64) -> Self {
        Self { target_type: TargetType::User, target_id }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target_type.as_str(), self.target_id)
    }
}

impl FromStr for Target {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ArchiveError::InvalidTarget(s.to_string()))?;
        let target_type = kind.trim().parse()?;
        let target_id = id
            .trim()
            .parse()
            .map_err(|_| ArchiveError::InvalidTarget(s.to_string()))?;
        Ok(Self { target_type, target_id })
    }
}

// Targets are keys in JSON maps (settings, replay dumps), so they serialize as strings.
impl Serialize for Target {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Target {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selector() {
        assert_eq!("chat:42".parse::<Target>().unwrap(), Target::chat(42));
        assert_eq!("USER: -7".parse::<Target>().unwrap(), Target::user(-7));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("42".parse::<Target>().is_err());
        assert!("channel:1".parse::<Target>().is_err());
        assert!("chat:abc".parse::<Target>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&Target::chat(5)).unwrap();
        assert_eq!(json, "\"chat:5\"");
        let back: Target = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Target::chat(5));
    }
}
