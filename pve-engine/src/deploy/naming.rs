//! Instance name generation.

use uuid::Uuid;

use crate::error::{PveError, Result};

/// Longest name the platform accepts for a deployed instance.
pub const MAX_NAME_LEN: usize = 80;

const SUFFIX_LEN: usize = 8;

/// Name for a new instance.
///
/// Auto-generated names are the sanitised app name, truncated, plus a
/// random 8 hex digit suffix. Otherwise the app name is used as given,
/// with underscores (invalid in host names) turned into dashes.
pub fn instance_name(app_name: &str, autogenerate: bool) -> Result<String> {
    if app_name.trim().is_empty() {
        return Err(PveError::InvalidParameters("app name is empty".to_string()));
    }

    if autogenerate {
        Ok(generate_name(app_name))
    } else {
        Ok(app_name.trim().replace('_', "-"))
    }
}

/// `<sanitised app name>-<8 hex>`, at most [`MAX_NAME_LEN`] characters.
pub fn generate_name(app_name: &str) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string()[..SUFFIX_LEN].to_string();
    let base: String = sanitize(app_name)
        .chars()
        .take(MAX_NAME_LEN - SUFFIX_LEN - 1)
        .collect();
    let base = base.trim_end_matches(['-', '.']);

    if base.is_empty() {
        format!("app-{}", suffix)
    } else {
        format!("{}-{}", base, suffix)
    }
}

/// Keep DNS-safe characters, turning every run of anything else into one dash.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '.' {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches(['-', '.']).to_string()
}
