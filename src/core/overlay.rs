//! Immutable per-run variable overlay.
//!
//! An [`Overlay`] is assembled once by the target resolver through an
//! [`OverlayBuilder`] and then only ever shared by reference. There is no way
//! to mutate a built overlay.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::utils::template;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OverlayValue {
    Text(String),
    List(Vec<String>),
}

impl OverlayValue {
    /// Text form used for command substitution. Lists join with single spaces.
    pub fn render(&self) -> String {
        match self {
            OverlayValue::Text(value) => value.clone(),
            OverlayValue::List(items) => items.join(" "),
        }
    }
}

impl From<&str> for OverlayValue {
    fn from(value: &str) -> Self {
        OverlayValue::Text(value.to_string())
    }
}

impl From<String> for OverlayValue {
    fn from(value: String) -> Self {
        OverlayValue::Text(value)
    }
}

impl From<Vec<String>> for OverlayValue {
    fn from(items: Vec<String>) -> Self {
        OverlayValue::List(items)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Overlay {
    values: BTreeMap<String, OverlayValue>,
}

impl Overlay {
    pub fn builder() -> OverlayBuilder {
        OverlayBuilder::default()
    }

    /// Reopen for additions. Existing values are carried over.
    pub fn into_builder(self) -> OverlayBuilder {
        OverlayBuilder {
            values: self.values,
        }
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.values.get(key).map(OverlayValue::render)
    }

    /// Like [`Overlay::text`] but a missing key is a configuration error.
    pub fn require(&self, key: &str) -> Result<String> {
        self.text(key)
            .ok_or_else(|| Error::config_missing_key(key, None))
    }

    /// Substitute every `{{key}}` in `text`. Values are inserted verbatim.
    pub fn render(&self, text: &str) -> Result<String> {
        template::render_with(text, |key| self.text(key))
            .map_err(|missing| Error::config_missing_key(missing, Some(text.to_string())))
    }
}

#[derive(Debug, Default)]
pub struct OverlayBuilder {
    values: BTreeMap<String, OverlayValue>,
}

impl OverlayBuilder {
    pub fn set(mut self, key: impl Into<String>, value: impl Into<OverlayValue>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Insert only when `key` is not already present.
    pub fn set_default(mut self, key: impl Into<String>, value: impl Into<OverlayValue>) -> Self {
        self.values.entry(key.into()).or_insert_with(|| value.into());
        self
    }

    /// Apply `key=value` overrides given on the command line.
    pub fn apply_overrides(mut self, overrides: &[String]) -> Result<Self> {
        for raw in overrides {
            let Some((key, value)) = raw.split_once('=') else {
                return Err(Error::validation_invalid_argument(
                    "var",
                    format!("Expected key=value, got '{}'", raw),
                    None,
                ));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::validation_invalid_argument(
                    "var",
                    format!("Empty key in '{}'", raw),
                    None,
                ));
            }
            self.values
                .insert(key.to_string(), OverlayValue::Text(value.to_string()));
        }
        Ok(self)
    }

    pub fn build(self) -> Overlay {
        Overlay {
            values: self.values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay() -> Overlay {
        Overlay::builder()
            .set("virtualenv", "webapp")
            .set("packages", vec!["git".to_string(), "nginx".to_string()])
            .build()
    }

    #[test]
    fn lists_render_space_joined() {
        let overlay = overlay();
        assert_eq!(overlay.text("packages").as_deref(), Some("git nginx"));
        assert_eq!(
            overlay.render("aptitude -y install {{packages}}").unwrap(),
            "aptitude -y install git nginx"
        );
    }

    #[test]
    fn render_missing_key_is_config_error() {
        let err = overlay().render("workon {{missing}}").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ConfigMissingKey);
        assert_eq!(err.details["key"], "missing");
    }

    #[test]
    fn set_default_keeps_existing_value() {
        let overlay = Overlay::builder()
            .set("branch", "stable")
            .set_default("branch", "master")
            .set_default("migrate_app", "")
            .build();
        assert_eq!(overlay.text("branch").as_deref(), Some("stable"));
        assert_eq!(overlay.text("migrate_app").as_deref(), Some(""));
    }

    #[test]
    fn require_reports_missing_key() {
        let overlay = overlay();
        assert_eq!(overlay.require("virtualenv").unwrap(), "webapp");
        let err = overlay.require("branch").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ConfigMissingKey);
    }

    #[test]
    fn overrides_replace_values_and_reject_malformed_input() {
        let builder = Overlay::builder().set("branch", "master");
        let overlay = builder
            .apply_overrides(&["branch=hotfix".to_string(), "extra=a=b".to_string()])
            .unwrap()
            .build();
        assert_eq!(overlay.text("branch").as_deref(), Some("hotfix"));
        assert_eq!(overlay.text("extra").as_deref(), Some("a=b"));

        let err = Overlay::builder()
            .apply_overrides(&["nokey".to_string()])
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ValidationInvalidArgument);
    }
}
