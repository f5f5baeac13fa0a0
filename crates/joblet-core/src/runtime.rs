//! Runtime specification grammar.
//!
//! A runtime is named on the wire in one of two forms:
//! - `language:version` with an optional `+tag`, e.g. `python:3.11+cuda`
//! - a bare directory-style name, e.g. `python-3.11-cuda` or `openjdk-21`
//!
//! Both forms resolve to the same on-disk directory,
//! `<runtimes_root>/<language>-<version>[-<tag>]`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::{Error, Result};

// Bare names start with a letter, then letters, digits, dots, and dashes.
static BARE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9.\-]{0,49}$").unwrap());

/// A parsed runtime reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub language: String,
    pub version: Option<String>,
    pub tag: Option<String>,
}

impl RuntimeSpec {
    /// Parse either accepted grammar. Empty input is rejected.
    pub fn parse(spec: &str) -> Result<Self> {
        if spec.is_empty() {
            return Err(Error::InvalidArgument("empty runtime spec".into()));
        }

        if let Some((language, rest)) = spec.split_once(':') {
            if language.is_empty() || rest.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "malformed runtime spec: {spec}"
                )));
            }
            let (version, tag) = match rest.split_once('+') {
                Some((version, tag)) if !version.is_empty() && !tag.is_empty() => {
                    (version.to_string(), Some(tag.to_string()))
                }
                Some(_) => {
                    return Err(Error::InvalidArgument(format!(
                        "malformed runtime spec: {spec}"
                    )));
                }
                None => (rest.to_string(), None),
            };
            return Ok(Self {
                language: language.to_string(),
                version: Some(version),
                tag,
            });
        }

        if !BARE_NAME.is_match(spec) {
            return Err(Error::InvalidArgument(format!(
                "malformed runtime name: {spec}"
            )));
        }

        // Directory form: language[-version[-tag]]. The first dash followed
        // by a digit starts the version; anything after the next dash is tag.
        let mut language_end = spec.len();
        for (idx, _) in spec.match_indices('-') {
            if spec[idx + 1..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit())
            {
                language_end = idx;
                break;
            }
        }

        if language_end == spec.len() {
            return Ok(Self {
                language: spec.to_string(),
                version: None,
                tag: None,
            });
        }

        let language = spec[..language_end].to_string();
        let rest = &spec[language_end + 1..];
        let (version, tag) = match rest.split_once('-') {
            Some((version, tag)) => (version.to_string(), Some(tag.to_string())),
            None => (rest.to_string(), None),
        };
        Ok(Self {
            language,
            version: Some(version),
            tag,
        })
    }

    /// The canonical on-disk directory name.
    pub fn dir_name(&self) -> String {
        let mut name = self.language.clone();
        if let Some(version) = &self.version {
            name.push('-');
            name.push_str(version);
        }
        if let Some(tag) = &self.tag {
            name.push('-');
            name.push_str(tag);
        }
        name
    }
}

impl std::fmt::Display for RuntimeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.version, &self.tag) {
            (Some(version), Some(tag)) => write!(f, "{}:{version}+{tag}", self.language),
            (Some(version), None) => write!(f, "{}:{version}", self.language),
            (None, _) => f.write_str(&self.language),
        }
    }
}

impl std::str::FromStr for RuntimeSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
