//! Expand a size request into concrete per-run variant plans.

use crate::profile::{ProfileError, SizeProfile};
use std::path::{Path, PathBuf};

/// How a profile request selects variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfileMode {
    /// Only the default variant, written straight into the base directory.
    #[default]
    FirstVariant,
    /// Every variant, each under `<base>/<subfolder>`.
    AllVariants,
}

/// What sizes the caller asked for.
#[derive(Debug, Clone)]
pub enum SizeRequest {
    Single {
        width: u32,
        height: u32,
        placeholder: Option<PathBuf>,
    },
    Profile {
        profile: SizeProfile,
        mode: ProfileMode,
    },
}

/// One output size for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantPlan {
    pub key: String,
    pub width: u32,
    pub height: u32,
    /// Absolute directory the variant's portraits go to.
    pub output_dir: PathBuf,
    pub placeholder: Option<PathBuf>,
}

/// Resolve `request` against the base output directory.
///
/// Fails before any work starts when the request is invalid: zero sizes or
/// a profile that does not validate.
pub fn resolve_variants(request: &SizeRequest, base_dir: &Path) -> Result<Vec<VariantPlan>, ProfileError> {
    let base = absolute(base_dir);

    match request {
        SizeRequest::Single {
            width,
            height,
            placeholder,
        } => {
            if *width == 0 || *height == 0 {
                return Err(ProfileError::InvalidSize {
                    width: *width,
                    height: *height,
                });
            }
            Ok(vec![VariantPlan {
                key: format!("{width}x{height}"),
                width: *width,
                height: *height,
                output_dir: base,
                placeholder: placeholder.as_deref().map(absolute),
            }])
        }
        SizeRequest::Profile { profile, mode } => {
            profile.validate()?;
            let chosen: Vec<_> = match mode {
                ProfileMode::FirstVariant => profile.default_variant().into_iter().collect(),
                ProfileMode::AllVariants => profile.variants.iter().collect(),
            };

            Ok(chosen
                .into_iter()
                .map(|v| VariantPlan {
                    key: v.key.trim().to_string(),
                    width: v.width,
                    height: v.height,
                    output_dir: match mode {
                        ProfileMode::FirstVariant => base.clone(),
                        ProfileMode::AllVariants => base.join(v.subfolder()),
                    },
                    placeholder: v.placeholder_path.as_deref().map(absolute),
                })
                .collect())
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
