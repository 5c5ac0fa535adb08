//! Key/value substitution for URL templates and code lists

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::error;

/// `{key}` placeholder
#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^}]+)\}").expect("placeholder pattern is valid"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translator {
    map: HashMap<String, String>,
}

impl Translator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.map.insert(key.into(), value.into());
        self
    }

    /// The mapped value, or the input itself when unmapped
    pub fn translate<'a>(&'a self, input: &'a str) -> &'a str {
        self.map.get(input).map(String::as_str).unwrap_or(input)
    }

    /// Replace every `{key}` in `template`
    ///
    /// Values are URL-encoded when `url_encode` is set. Unmapped keys are
    /// logged and left in place.
    pub fn replace_in(&self, template: &str, url_encode: bool) -> String {
        PLACEHOLDER
            .replace_all(template, |caps: &Captures| {
                let key = &caps[1];
                match self.map.get(key) {
                    Some(value) if url_encode => urlencoding::encode(value).into_owned(),
                    Some(value) => value.clone(),
                    None => {
                        error!(key, template, "No replacement for placeholder");
                        caps[0].to_string()
                    }
                }
            })
            .into_owned()
    }
}
