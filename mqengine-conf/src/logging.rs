use std::ops::Deref;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

/// `[log]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::to_default")]
    pub to: To,
    #[serde(default = "Log::level_default")]
    pub level: Level,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
}

impl Default for Log {
    #[inline]
    fn default() -> Self {
        Self {
            to: Self::to_default(),
            level: Self::level_default(),
            dir: Self::dir_default(),
            file: Self::file_default(),
        }
    }
}

impl Log {
    #[inline]
    fn to_default() -> To {
        To::Console
    }
    #[inline]
    fn level_default() -> Level {
        Level::default()
    }
    #[inline]
    fn dir_default() -> String {
        "/var/log/mqengine".into()
    }
    #[inline]
    fn file_default() -> String {
        "mqengine.log".into()
    }

    /// Full path of the log file, or an empty string when no file is configured.
    #[inline]
    pub fn filename(&self) -> String {
        if self.file.is_empty() {
            return String::new();
        }
        if self.dir.is_empty() {
            return self.file.clone();
        }
        format!("{}/{}", self.dir.trim_end_matches(['/', '\\']), self.file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

impl<'de> Deserialize<'de> for To {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let to = String::deserialize(deserializer)?;
        match to.to_ascii_lowercase().as_str() {
            "off" => Ok(To::Off),
            "file" => Ok(To::File),
            "console" => Ok(To::Console),
            "both" => Ok(To::Both),
            other => Err(de::Error::unknown_variant(other, &["off", "file", "console", "both"])),
        }
    }
}

/// Log level, spelled the way slog spells it ("info", "debug", "warn", ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl Default for Level {
    #[inline]
    fn default() -> Self {
        Level(slog::Level::Info)
    }
}

impl From<slog::Level> for Level {
    #[inline]
    fn from(level: slog::Level) -> Self {
        Level(level)
    }
}

impl Deref for Level {
    type Target = slog::Level;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Level {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        slog::Level::from_str(&level)
            .map(Level)
            .map_err(|_| de::Error::custom(format!("invalid log level '{level}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_joins_dir_and_file() {
        let log = Log { dir: "/tmp/logs/".into(), ..Default::default() };
        assert_eq!(log.filename(), "/tmp/logs/mqengine.log");

        let log = Log { dir: String::new(), file: "engine.log".into(), ..Default::default() };
        assert_eq!(log.filename(), "engine.log");

        let log = Log { file: String::new(), ..Default::default() };
        assert_eq!(log.filename(), "");
    }

    #[test]
    fn destinations() {
        assert!(To::Both.file() && To::Both.console());
        assert!(!To::Console.file());
        assert!(To::Off.off());
    }
}
