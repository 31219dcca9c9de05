//! Named multi-size profiles.
//!
//! A profile is a JSON or TOML document:
//!
//! ```toml
//! name = "league"
//!
//! [[variants]]
//! key = "small"
//! width = 34
//! height = 50
//!
//! [[variants]]
//! key = "standard"
//! width = 200
//! height = 300
//! outputSubfolder = "std"
//! placeholderPath = "placeholders/standard.png"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Key picked in first-variant mode when present.
pub const DEFAULT_VARIANT_KEY: &str = "standard";

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("failed to read profile {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in profile {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid TOML in profile {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("profile '{0}' must define at least one size variant")]
    EmptyProfile(String),
    #[error("profile '{profile}' has a variant with an empty key")]
    EmptyKey { profile: String },
    #[error("profile '{profile}': variant '{key}' has invalid size {width}x{height}")]
    InvalidDimensions {
        profile: String,
        key: String,
        width: u32,
        height: u32,
    },
    #[error("profile '{profile}': duplicate variant key '{key}'")]
    DuplicateKey { profile: String, key: String },
    #[error("profile '{profile}': variant '{key}' has invalid output subfolder '{subfolder}'")]
    InvalidSubfolder {
        profile: String,
        key: String,
        subfolder: String,
    },
    #[error("profile '{profile}': variants share output subfolder '{subfolder}'")]
    DuplicateSubfolder { profile: String, subfolder: String },
    #[error("invalid output size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
}

/// One output size within a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeVariant {
    pub key: String,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_subfolder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder_path: Option<PathBuf>,
}

impl SizeVariant {
    /// Subfolder used in all-variants mode.
    pub fn subfolder(&self) -> &str {
        self.output_subfolder
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(self.key.trim())
    }
}

/// A named, ordered, non-empty list of size variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub variants: Vec<SizeVariant>,
}

impl SizeProfile {
    /// Load and validate a profile file. The format follows the extension
    /// (`.toml`, anything else is read as JSON). Relative placeholder paths
    /// are resolved against the profile's directory.
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let text = std::fs::read_to_string(path).map_err(|source| ProfileError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));

        let mut profile: SizeProfile = if is_toml {
            toml::from_str(&text).map_err(|source| ProfileError::Toml {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            serde_json::from_str(&text).map_err(|source| ProfileError::Json {
                path: path.to_path_buf(),
                source,
            })?
        };

        if profile.name.trim().is_empty() {
            profile.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "profile".to_string());
        }

        let base = path.parent().unwrap_or_else(|| Path::new(""));
        for variant in &mut profile.variants {
            if let Some(placeholder) = variant.placeholder_path.as_mut() {
                if placeholder.is_relative() {
                    *placeholder = base.join(&*placeholder);
                }
            }
        }

        profile.validate()?;
        tracing::debug!(profile = %profile.name, variants = profile.variants.len(), "loaded size profile");
        Ok(profile)
    }

    /// Check the structural rules: at least one variant, non-empty unique
    /// keys, positive sizes, and distinct subfolders that stay inside the
    /// output directory.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.variants.is_empty() {
            return Err(ProfileError::EmptyProfile(self.name.clone()));
        }

        let mut seen = HashSet::new();
        let mut folders = HashSet::new();
        for variant in &self.variants {
            let key = variant.key.trim();
            if key.is_empty() {
                return Err(ProfileError::EmptyKey {
                    profile: self.name.clone(),
                });
            }
            if variant.width == 0 || variant.height == 0 {
                return Err(ProfileError::InvalidDimensions {
                    profile: self.name.clone(),
                    key: key.to_string(),
                    width: variant.width,
                    height: variant.height,
                });
            }
            if !seen.insert(key) {
                return Err(ProfileError::DuplicateKey {
                    profile: self.name.clone(),
                    key: key.to_string(),
                });
            }
            if !is_plain_relative(variant.subfolder()) {
                return Err(ProfileError::InvalidSubfolder {
                    profile: self.name.clone(),
                    key: key.to_string(),
                    subfolder: variant.subfolder().to_string(),
                });
            }
            // `std` and `std/` name the same directory.
            let folder: PathBuf = Path::new(variant.subfolder()).components().collect();
            if !folders.insert(folder) {
                return Err(ProfileError::DuplicateSubfolder {
                    profile: self.name.clone(),
                    subfolder: variant.subfolder().to_string(),
                });
            }
        }
        Ok(())
    }

    /// The variant used in first-variant mode: `"standard"` if present,
    /// otherwise the first one.
    pub fn default_variant(&self) -> Option<&SizeVariant> {
        self.variants
            .iter()
            .find(|v| v.key.trim() == DEFAULT_VARIANT_KEY)
            .or_else(|| self.variants.first())
    }
}

/// A relative path made only of normal components.
fn is_plain_relative(value: &str) -> bool {
    let path = Path::new(value);
    !value.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn variant(key: &str, width: u32, height: u32) -> SizeVariant {
        SizeVariant {
            key: key.into(),
            width,
            height,
            output_subfolder: None,
            placeholder_path: None,
        }
    }

    #[test]
    fn test_load_json_first_variant_exact_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("league.json");
        fs::write(
            &path,
            r#"{"name": "league", "variants": [
                {"key": "small", "width": 34, "height": 50},
                {"key": "large", "width": 400, "height": 600, "outputSubfolder": "big"}
            ]}"#,
        )
        .unwrap();

        let profile = SizeProfile::load(&path).unwrap();
        assert_eq!(profile.name, "league");
        assert_eq!(profile.variants[0], variant("small", 34, 50));
        assert_eq!(profile.variants[1].subfolder(), "big");
        assert_eq!(profile.variants[0].subfolder(), "small");
    }

    #[test]
    fn test_load_toml_resolves_placeholder_against_profile_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sizes.toml");
        fs::write(
            &path,
            r#"
name = "club"

[[variants]]
key = "standard"
width = 200
height = 300
placeholderPath = "ph/standard.png"
"#,
        )
        .unwrap();

        let profile = SizeProfile::load(&path).unwrap();
        assert_eq!(
            profile.variants[0].placeholder_path.as_deref(),
            Some(dir.path().join("ph/standard.png").as_path())
        );
    }

    #[test]
    fn test_empty_profile_error_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json");
        fs::write(&path, r#"{"name": "empty", "variants": []}"#).unwrap();

        let err = SizeProfile::load(&path).unwrap_err();
        assert!(matches!(err, ProfileError::EmptyProfile(_)));
        assert!(err.to_string().contains("at least one size variant"), "{err}");
    }

    #[test]
    fn test_missing_variants_is_empty_profile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.json");
        fs::write(&path, r#"{"name": "bare"}"#).unwrap();
        assert!(matches!(SizeProfile::load(&path), Err(ProfileError::EmptyProfile(_))));
    }

    #[test]
    fn test_name_defaults_to_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("national.json");
        fs::write(&path, r#"{"variants": [{"key": "a", "width": 1, "height": 1}]}"#).unwrap();
        assert_eq!(SizeProfile::load(&path).unwrap().name, "national");
    }

    #[test]
    fn test_invalid_json_is_reported_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        let err = SizeProfile::load(&path).unwrap_err();
        assert!(matches!(err, ProfileError::Json { .. }));
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn test_validate_rejects_zero_dimensions() {
        let profile = SizeProfile {
            name: "p".into(),
            variants: vec![variant("a", 0, 10)],
        };
        assert!(matches!(
            profile.validate(),
            Err(ProfileError::InvalidDimensions { width: 0, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_keys() {
        let profile = SizeProfile {
            name: "p".into(),
            variants: vec![variant("a", 1, 1), variant("a", 2, 2)],
        };
        assert!(matches!(profile.validate(), Err(ProfileError::DuplicateKey { .. })));
    }

    #[test]
    fn test_validate_rejects_escaping_subfolder() {
        for bad in ["../up", "/abs", "a/../../b"] {
            let mut v = variant("a", 1, 1);
            v.output_subfolder = Some(bad.into());
            let profile = SizeProfile {
                name: "p".into(),
                variants: vec![v],
            };
            assert!(
                matches!(profile.validate(), Err(ProfileError::InvalidSubfolder { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_default_variant_prefers_standard() {
        let profile = SizeProfile {
            name: "p".into(),
            variants: vec![variant("small", 34, 50), variant("standard", 200, 300)],
        };
        assert_eq!(profile.default_variant().unwrap().key, "standard");

        let profile = SizeProfile {
            name: "p".into(),
            variants: vec![variant("small", 34, 50), variant("large", 400, 600)],
        };
        assert_eq!(profile.default_variant().unwrap().key, "small");
    }

    #[test]
    fn test_validate_rejects_shared_subfolders() {
        let mut a = variant("a", 1, 1);
        a.output_subfolder = Some("out".into());
        let mut b = variant("b", 2, 2);
        b.output_subfolder = Some("out/".into());
        let profile = SizeProfile {
            name: "p".into(),
            variants: vec![a, b],
        };
        let err = profile.validate().unwrap_err();
        assert!(matches!(err, ProfileError::DuplicateSubfolder { ref subfolder, .. } if subfolder == "out/"));
        assert!(err.to_string().contains("share output subfolder"), "{err}");

        // An explicit subfolder may not collide with another variant's key.
        let mut large = variant("large", 400, 600);
        large.output_subfolder = Some("small".into());
        let profile = SizeProfile {
            name: "p".into(),
            variants: vec![variant("small", 34, 50), large],
        };
        assert!(matches!(profile.validate(), Err(ProfileError::DuplicateSubfolder { .. })));
    }

    #[test]
    fn test_default_variant_ignores_key_padding() {
        let profile = SizeProfile {
            name: "p".into(),
            variants: vec![variant("small", 34, 50), variant(" standard ", 200, 300)],
        };
        profile.validate().unwrap();
        assert_eq!(profile.default_variant().unwrap().width, 200);
        assert_eq!(profile.variants[1].subfolder(), "standard");
    }
}
