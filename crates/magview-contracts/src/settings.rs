use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColoringMode {
    Deuteranopia,
    Protanopia,
    Tritanopia,
}

impl ColoringMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ColoringMode::Deuteranopia => "Deuteranopia",
            ColoringMode::Protanopia => "Protanopia",
            ColoringMode::Tritanopia => "Tritanopia",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "deuteranopia" => Some(ColoringMode::Deuteranopia),
            "protanopia" => Some(ColoringMode::Protanopia),
            "tritanopia" => Some(ColoringMode::Tritanopia),
            _ => None,
        }
    }

    pub fn all() -> [ColoringMode; 3] {
        [
            ColoringMode::Deuteranopia,
            ColoringMode::Protanopia,
            ColoringMode::Tritanopia,
        ]
    }
}

impl fmt::Display for ColoringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppSettings {
    pub coloring: ColoringMode,
    pub alt_text_enabled: bool,
    pub resize_percent: f64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            coloring: ColoringMode::Deuteranopia,
            alt_text_enabled: true,
            resize_percent: 100.0,
        }
    }
}

impl AppSettings {
    pub fn scale_factor(&self) -> f64 {
        self.resize_percent / 100.0
    }

    pub fn resize_label(&self) -> String {
        if (self.resize_percent - self.resize_percent.round()).abs() < f64::EPSILON {
            format!("{}%", self.resize_percent.round() as i64)
        } else {
            format!("{}%", self.resize_percent)
        }
    }

    pub fn alt_text_label(&self) -> &'static str {
        if self.alt_text_enabled {
            "Enabled"
        } else {
            "Disabled"
        }
    }
}

/// Field-level update parsed from a settings submission. Absent fields keep
/// their current value; present fields are validated before any commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsUpdate {
    pub coloring: Option<String>,
    pub alt_text: Option<String>,
    pub resize_percent: Option<String>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.coloring.is_none() && self.alt_text.is_none() && self.resize_percent.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    UnknownColoring(String),
    UnknownAltText(String),
    InvalidResizePercent(String),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::UnknownColoring(raw) => {
                write!(f, "unknown coloring mode '{raw}'")
            }
            SettingsError::UnknownAltText(raw) => {
                write!(f, "unknown alt text choice '{raw}' (expected Enabled or Disabled)")
            }
            SettingsError::InvalidResizePercent(raw) => {
                write!(f, "invalid resize percent '{raw}' (expected a positive percentage)")
            }
        }
    }
}

impl std::error::Error for SettingsError {}

/// Process-wide settings record. Updates are all-or-nothing: every present
/// field is validated before the record is touched, and a run reads the
/// record exactly once via `snapshot`.
#[derive(Debug)]
pub struct SettingsStore {
    inner: Mutex<AppSettings>,
}

impl SettingsStore {
    pub fn new(initial: AppSettings) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    pub fn snapshot(&self) -> AppSettings {
        // A poisoned lock still holds a fully committed record.
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn apply(&self, update: &SettingsUpdate) -> Result<AppSettings, SettingsError> {
        let coloring = match update.coloring.as_deref() {
            Some(raw) => Some(
                ColoringMode::parse(raw)
                    .ok_or_else(|| SettingsError::UnknownColoring(raw.to_string()))?,
            ),
            None => None,
        };
        let alt_text_enabled = match update.alt_text.as_deref() {
            Some(raw) => Some(parse_alt_text(raw)?),
            None => None,
        };
        let resize_percent = match update.resize_percent.as_deref() {
            Some(raw) => Some(parse_resize_percent(raw)?),
            None => None,
        };

        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(coloring) = coloring {
            guard.coloring = coloring;
        }
        if let Some(enabled) = alt_text_enabled {
            guard.alt_text_enabled = enabled;
        }
        if let Some(percent) = resize_percent {
            guard.resize_percent = percent;
        }
        Ok(guard.clone())
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(AppSettings::default())
    }
}

fn parse_alt_text(raw: &str) -> Result<bool, SettingsError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "enabled" => Ok(true),
        "disabled" => Ok(false),
        _ => Err(SettingsError::UnknownAltText(raw.to_string())),
    }
}

fn parse_resize_percent(raw: &str) -> Result<f64, SettingsError> {
    let trimmed = raw.trim().trim_end_matches('%').trim();
    let percent = trimmed
        .parse::<f64>()
        .map_err(|_| SettingsError::InvalidResizePercent(raw.to_string()))?;
    if !percent.is_finite() || percent <= 0.0 {
        return Err(SettingsError::InvalidResizePercent(raw.to_string()));
    }
    Ok(percent)
}

#[cfg(test)]
mod tests {
    use super::{AppSettings, ColoringMode, SettingsError, SettingsStore, SettingsUpdate};

    #[test]
    fn coloring_mode_parse_is_case_insensitive() {
        assert_eq!(
            ColoringMode::parse("deuteranopia"),
            Some(ColoringMode::Deuteranopia)
        );
        assert_eq!(
            ColoringMode::parse(" Protanopia "),
            Some(ColoringMode::Protanopia)
        );
        assert_eq!(
            ColoringMode::parse("TRITANOPIA"),
            Some(ColoringMode::Tritanopia)
        );
        assert_eq!(ColoringMode::parse("monochromacy"), None);
    }

    #[test]
    fn defaults_match_initial_service_configuration() {
        let settings = AppSettings::default();
        assert_eq!(settings.coloring, ColoringMode::Deuteranopia);
        assert!(settings.alt_text_enabled);
        assert_eq!(settings.resize_percent, 100.0);
        assert_eq!(settings.resize_label(), "100%");
        assert_eq!(settings.alt_text_label(), "Enabled");
    }

    #[test]
    fn apply_commits_all_present_fields() {
        let store = SettingsStore::default();
        let update = SettingsUpdate {
            coloring: Some("Tritanopia".to_string()),
            alt_text: Some("Disabled".to_string()),
            resize_percent: Some("150%".to_string()),
        };
        let applied = store.apply(&update).expect("valid update");
        assert_eq!(applied.coloring, ColoringMode::Tritanopia);
        assert!(!applied.alt_text_enabled);
        assert_eq!(applied.resize_percent, 150.0);
        assert_eq!(store.snapshot(), applied);
    }

    #[test]
    fn apply_with_one_invalid_field_mutates_nothing() {
        let store = SettingsStore::default();
        let before = store.snapshot();
        let update = SettingsUpdate {
            coloring: Some("Protanopia".to_string()),
            alt_text: Some("Disabled".to_string()),
            resize_percent: Some("-25%".to_string()),
        };
        let err = store.apply(&update).expect_err("negative percent");
        assert_eq!(
            err,
            SettingsError::InvalidResizePercent("-25%".to_string())
        );
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn apply_rejects_zero_and_non_numeric_percent() {
        let store = SettingsStore::default();
        for raw in ["0%", "0", "huge", "", "NaN%"] {
            let update = SettingsUpdate {
                resize_percent: Some(raw.to_string()),
                ..SettingsUpdate::default()
            };
            assert!(store.apply(&update).is_err(), "accepted {raw:?}");
        }
        assert_eq!(store.snapshot(), AppSettings::default());
    }

    #[test]
    fn apply_accepts_partial_updates() {
        let store = SettingsStore::default();
        let update = SettingsUpdate {
            alt_text: Some("disabled".to_string()),
            ..SettingsUpdate::default()
        };
        let applied = store.apply(&update).expect("partial update");
        assert_eq!(applied.coloring, ColoringMode::Deuteranopia);
        assert!(!applied.alt_text_enabled);
        assert_eq!(applied.resize_percent, 100.0);
    }

    #[test]
    fn scale_factor_derives_from_percent() {
        let settings = AppSettings {
            resize_percent: 150.0,
            ..AppSettings::default()
        };
        assert_eq!(settings.scale_factor(), 1.5);
    }
}
