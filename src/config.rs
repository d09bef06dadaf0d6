//! # Config
//!
//! Fixers read an INI file placed next to their own module:
//!
//! ```ini
//! [Settings]
//! Enabled = true
//! Width = 0        ; 0 uses the desktop resolution
//! Height = 0
//! FOVFactor = 1.0
//! ```
//!
//! Section and key names are case-insensitive. Lines starting with `;` or `#` are comments, as is
//! anything after a `;` or `#` that follows whitespace in a value.
//! Sections and keys the fixer does not know about are kept and can be read with
//! [`Config::get`].

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{info, warn};

use crate::error::{Error, Result};

/// Section holding the common settings
pub const SETTINGS: &str = "Settings";
/// Resolution used when neither the file nor the desktop gives one
pub const FALLBACK_RESOLUTION: (u32, u32) = (1920, 1080);

/// A value and the line it came from
#[derive(Debug, Clone, PartialEq)]
struct Entry {
    /// Trimmed value
    value: String,
    /// One-based line number
    line: usize,
}

/// Parsed INI file. Names are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ini {
    /// Keys before the first section header live in the `""` section
    sections: HashMap<String, HashMap<String, Entry>>,
}

impl Ini {
    /// Looks up `key` in `section`
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.entry(section, key).map(|entry| entry.value.as_str())
    }

    /// Looks up an entry, ignoring case
    fn entry(&self, section: &str, key: &str) -> Option<&Entry> {
        self.sections
            .get(&section.to_lowercase())?
            .get(&key.to_lowercase())
    }

    /// Parses `key` in `section` as `T`. Missing keys give `Ok(None)`.
    pub fn parse<T: FromStr>(&self, section: &str, key: &str) -> Result<Option<T>> {
        let Some(entry) = self.entry(section, key) else {
            return Ok(None);
        };
        entry.value.parse().map(Some).map_err(|_| Error::Config {
            line: entry.line,
            message: format!("invalid value `{}` for {key}", entry.value),
        })
    }

    /// Parses a boolean; accepts `true/false`, `yes/no`, `on/off` and `1/0`
    pub fn parse_bool(&self, section: &str, key: &str) -> Result<Option<bool>> {
        let Some(entry) = self.entry(section, key) else {
            return Ok(None);
        };
        match entry.value.to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(Some(true)),
            "false" | "no" | "off" | "0" => Ok(Some(false)),
            _ => Err(Error::Config {
                line: entry.line,
                message: format!("invalid value `{}` for {key}, expected true or false", entry.value),
            }),
        }
    }
}

impl FromStr for Ini {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let mut ini = Ini::default();
        let mut section = String::new();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
                continue;
            }

            if let Some(header) = trimmed.strip_prefix('[') {
                let name = header.strip_suffix(']').ok_or_else(|| Error::Config {
                    line,
                    message: "unterminated section header".to_string(),
                })?;
                section = name.trim().to_lowercase();
                ini.sections.entry(section.clone()).or_default();
                continue;
            }

            let (key, value) = trimmed.split_once('=').ok_or_else(|| Error::Config {
                line,
                message: format!("expected `key = value`, found `{trimmed}`"),
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::Config {
                    line,
                    message: "missing key".to_string(),
                });
            }
            let value = strip_comment(value.trim());
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);

            ini.sections.entry(section.clone()).or_default().insert(
                key.to_lowercase(),
                Entry {
                    value: value.to_string(),
                    line,
                },
            );
        }

        Ok(ini)
    }
}

/// Cuts a trailing ` ; comment` off a value
fn strip_comment(value: &str) -> &str {
    value
        .char_indices()
        .find(|&(i, c)| (c == ';' || c == '#') && value[..i].ends_with(char::is_whitespace))
        .map_or(value, |(i, _)| value[..i].trim_end())
}

/// Settings shared by every fixer
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Master switch. A disabled fixer applies nothing.
    pub enabled: bool,
    /// Target width in pixels
    pub width: u32,
    /// Target height in pixels
    pub height: u32,
    /// Extra multiplier applied on top of the aspect correction
    pub fov_factor: f32,
    /// Everything that was in the file
    ini: Ini,
}

impl Config {
    /// Loads and parses `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config = Self::from_ini(text.parse()?)?;
        info!("loaded config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Loads the `.ini` file with the same stem as `module_path`, e.g. `fix.dll` reads `fix.ini`.
    ///
    /// A missing file is not an error: the defaults are used.
    pub fn load_beside(module_path: impl AsRef<Path>) -> Result<Self> {
        let path = config_path(module_path.as_ref());
        match Self::load(&path) {
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                warn!("{} not found, using defaults", path.display());
                Self::from_ini(Ini::default())
            }
            result => result,
        }
    }

    /// Builds the typed settings, filling unset resolutions from the desktop
    pub fn from_ini(ini: Ini) -> Result<Self> {
        Self::from_ini_with(ini, desktop_resolution())
    }

    /// Builds the typed settings with an explicit desktop resolution
    pub fn from_ini_with(ini: Ini, desktop: Option<(u32, u32)>) -> Result<Self> {
        let (desktop_width, desktop_height) = desktop.unwrap_or(FALLBACK_RESOLUTION);
        let dimension = |key: &str, fallback: u32| -> Result<u32> {
            let value: Option<i64> = ini.parse(SETTINGS, key)?;
            Ok(match value {
                Some(value) if value > 0 => u32::try_from(value).unwrap_or(fallback),
                _ => fallback,
            })
        };

        let width = dimension("Width", desktop_width)?;
        let height = dimension("Height", desktop_height)?;
        let enabled = ini.parse_bool(SETTINGS, "Enabled")?.unwrap_or(true);
        let fov_factor: f32 = ini.parse(SETTINGS, "FOVFactor")?.unwrap_or(1.0);

        Ok(Self {
            enabled,
            width,
            height,
            fov_factor,
            ini,
        })
    }

    /// Width divided by height
    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }

    /// Raw value of any key in the file
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.ini.get(section, key)
    }

    /// Parsed file, for typed access to fixer-specific keys
    pub fn ini(&self) -> &Ini {
        &self.ini
    }
}

/// `<module stem>.ini` next to the module
pub fn config_path(module_path: &Path) -> PathBuf {
    module_path.with_extension("ini")
}

/// Primary monitor resolution
#[cfg(windows)]
pub fn desktop_resolution() -> Option<(u32, u32)> {
    use windows_sys::Win32::UI::WindowsAndMessaging::{GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN};

    let (width, height) = unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) };
    Some((u32::try_from(width).ok()?, u32::try_from(height).ok()?)).filter(|&(w, h)| w > 0 && h > 0)
}

/// Primary monitor resolution. Not queried outside Windows.
#[cfg(not(windows))]
pub fn desktop_resolution() -> Option<(u32, u32)> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "\
; fixer settings
[Settings]
Enabled = false
width=3440
HEIGHT = 1440 ; ultrawide
FOVFactor = 1.25

# per-game extras
[Camera]
Mode = \"hor+\"
Tag = a;b
";

    #[test]
    fn test_parse() {
        let ini: Ini = FILE.parse().unwrap();
        assert_eq!(ini.get("settings", "Width"), Some("3440"));
        assert_eq!(ini.get("SETTINGS", "height"), Some("1440"));
        assert_eq!(ini.get("Camera", "mode"), Some("hor+"));
        assert_eq!(ini.get("Camera", "Tag"), Some("a;b"));
        assert_eq!(ini.get("Camera", "Missing"), None);
        assert_eq!(ini.get("Missing", "Mode"), None);
    }

    #[test]
    fn test_config() {
        let config = Config::from_ini_with(FILE.parse().unwrap(), Some((2560, 1440))).unwrap();
        assert!(!config.enabled);
        assert_eq!((config.width, config.height), (3440, 1440));
        assert_eq!(config.fov_factor, 1.25);
        assert!((config.aspect_ratio() - 2.3888888).abs() < 1e-5);
        assert_eq!(config.get("camera", "MODE"), Some("hor+"));
    }

    #[test]
    /// Missing or non-positive resolutions come from the desktop, then the fallback
    fn test_resolution_fallback() {
        let ini: Ini = "[Settings]\nWidth = 0\n".parse().unwrap();
        let config = Config::from_ini_with(ini.clone(), Some((2560, 1080))).unwrap();
        assert_eq!((config.width, config.height), (2560, 1080));
        assert!(config.enabled);
        assert_eq!(config.fov_factor, 1.0);

        let config = Config::from_ini_with(ini, None).unwrap();
        assert_eq!((config.width, config.height), FALLBACK_RESOLUTION);

        let ini: Ini = "[Settings]\nWidth = -5\nHeight = 900\n".parse().unwrap();
        let config = Config::from_ini_with(ini, Some((2560, 1080))).unwrap();
        assert_eq!((config.width, config.height), (2560, 900));
    }

    #[test]
    fn test_syntax_errors() {
        let err = "[Settings\nWidth = 1".parse::<Ini>().unwrap_err();
        assert!(matches!(err, Error::Config { line: 1, .. }));

        let err = "[Settings]\n\nWidth 1920".parse::<Ini>().unwrap_err();
        assert!(matches!(err, Error::Config { line: 3, .. }));

        let err = "= 5".parse::<Ini>().unwrap_err();
        assert!(matches!(err, Error::Config { line: 1, .. }));
    }

    #[test]
    /// Bad values report the line they are on
    fn test_value_errors() {
        let ini: Ini = "[Settings]\nEnabled = maybe\n".parse().unwrap();
        let err = Config::from_ini_with(ini, None).unwrap_err();
        assert!(matches!(err, Error::Config { line: 2, .. }));

        let ini: Ini = "[Settings]\nWidth = 1920\nFOVFactor = wide\n".parse().unwrap();
        let err = Config::from_ini_with(ini, None).unwrap_err();
        assert!(matches!(err, Error::Config { line: 3, .. }));
    }

    #[test]
    fn test_load_beside() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("ultrawide.dll");

        // no file: defaults
        let config = Config::load_beside(&module).unwrap();
        assert!(config.enabled);

        fs::write(dir.path().join("ultrawide.ini"), FILE).unwrap();
        let config = Config::load_beside(&module).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.width, 3440);
    }
}
