//! String template rendering utilities.
//!
//! Placeholders use the `{{key}}` form. Substitution is literal: values are
//! inserted as-is, with no quoting or escaping.

use regex::Regex;
use std::sync::LazyLock;

static PLACEHOLDER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap());

/// Render `template`, resolving each placeholder through `lookup`.
///
/// Returns the first placeholder `lookup` cannot resolve as the error.
pub fn render_with<F>(template: &str, mut lookup: F) -> Result<String, String>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut result = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER_PATTERN.captures_iter(template) {
        let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = lookup(key.as_str()).ok_or_else(|| key.as_str().to_string())?;
        result.push_str(&template[last..whole.start()]);
        result.push_str(&value);
        last = whole.end();
    }

    result.push_str(&template[last..]);
    Ok(result)
}
