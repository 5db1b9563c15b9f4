//! Language profiles for sandbox image selection
//!
//! Maps a request's language tag to the container image (and optional
//! resource overrides) its sandbox is created with. Profiles are loaded
//! from the embedded TOML table; unknown languages fall back to a bare
//! POSIX image so shell commands still run.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::Deserialize;
use tracing::warn;

/// Image used when a language has no profile
const FALLBACK_IMAGE: &str = "alpine:3.20";

/// Sandbox profile for one language
#[derive(Debug, Clone)]
pub struct LanguageProfile {
    /// Container image the sandbox is created from
    pub image: String,
    /// Memory limit override, e.g. "768m"
    pub memory_limit: Option<String>,
    /// CPU limit override, e.g. "1.0"
    pub cpu_limit: Option<String>,
}

/// Raw TOML entry for a language
#[derive(Debug, Deserialize)]
struct RawLanguageProfile {
    image: String,
    memory_limit: Option<String>,
    cpu_limit: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Table compiled into the binary, used when no profile file is present
const EMBEDDED_PROFILES: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

/// Global language profile table
static LANGUAGES: OnceLock<HashMap<String, LanguageProfile>> = OnceLock::new();

/// Initialize language profiles from the TOML table at `path`, falling back
/// to the embedded table when the file is missing
pub fn init_languages(path: &str) -> anyhow::Result<()> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(
                "Language profile file {} not readable ({}), using embedded profiles",
                path, e
            );
            EMBEDDED_PROFILES.to_string()
        }
    };
    let profiles = parse_profiles(&content)?;

    LANGUAGES
        .set(profiles)
        .map_err(|_| anyhow::anyhow!("Languages already initialized"))?;

    Ok(())
}

fn parse_profiles(content: &str) -> anyhow::Result<HashMap<String, LanguageProfile>> {
    let raw_profiles: HashMap<String, RawLanguageProfile> = toml::from_str(content)?;

    let mut profiles = HashMap::new();
    for (name, raw) in raw_profiles {
        let profile = LanguageProfile {
            image: raw.image,
            memory_limit: raw.memory_limit,
            cpu_limit: raw.cpu_limit,
        };

        profiles.insert(name.to_lowercase(), profile.clone());
        for alias in raw.aliases {
            profiles.insert(alias.to_lowercase(), profile.clone());
        }
    }

    Ok(profiles)
}

/// Profile for `language`, falling back to the bare image for unknown tags
pub fn profile_for(language: &str) -> LanguageProfile {
    LANGUAGES
        .get()
        .and_then(|langs| langs.get(&language.to_lowercase()).cloned())
        .unwrap_or_else(|| LanguageProfile {
            image: FALLBACK_IMAGE.to_string(),
            memory_limit: None,
            cpu_limit: None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_profiles() {
        let content = r#"
[python]
image = "python:3.12-slim"
aliases = ["py", "python3"]

[node]
image = "node:22-slim"
memory_limit = "768m"
"#;
        let profiles = parse_profiles(content).unwrap();

        assert_eq!(profiles["python"].image, "python:3.12-slim");
        assert_eq!(profiles["py"].image, "python:3.12-slim");
        assert_eq!(profiles["python3"].image, "python:3.12-slim");
        assert_eq!(profiles["node"].memory_limit.as_deref(), Some("768m"));
        assert!(profiles["node"].cpu_limit.is_none());
    }

    #[test]
    fn test_embedded_table_parses() {
        let profiles = parse_profiles(EMBEDDED_PROFILES).unwrap();
        assert!(profiles.contains_key("python"));
    }

    #[test]
    fn test_unknown_language_falls_back() {
        let profile = profile_for("brainfuck");
        assert_eq!(profile.image, FALLBACK_IMAGE);
        assert!(profile.memory_limit.is_none());
    }
}
