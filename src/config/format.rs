//! Support for reading configs in several formats.

use std::{fmt, path::Path, str::FromStr};

use serde::de;

/// The format used to represent the configuration data.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Format {
    #[default]
    Toml,
    Json,
    Yaml,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "toml" => Ok(Format::Toml),
            "yaml" | "yml" => Ok(Format::Yaml),
            "json" => Ok(Format::Json),
            _ => Err(format!("Invalid format: {}", s)),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let format = match self {
            Format::Toml => "toml",
            Format::Json => "json",
            Format::Yaml => "yaml",
        };
        write!(f, "{}", format)
    }
}

impl Format {
    /// Obtain the format from the file extension.
    pub fn from_path<T: AsRef<Path>>(path: T) -> Result<Self, T> {
        match path.as_ref().extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(Format::Toml),
            Some("yaml") | Some("yml") => Ok(Format::Yaml),
            Some("json") => Ok(Format::Json),
            _ => Err(path),
        }
    }
}

/// Parse the string represented in the specified format.
pub fn deserialize<T>(content: &str, format: Format) -> Result<T, String>
where
    T: de::DeserializeOwned,
{
    match format {
        Format::Toml => toml::from_str(content).map_err(|e| e.to_string()),
        Format::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
        Format::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_path() {
        let cases = [
            ("", None),
            ("deps", None),
            ("deps.conf", None),
            ("deps.toml.bak", None),
            ("deps.TOML", None),
            (".toml", None),
            ("deps.toml", Some(Format::Toml)),
            ("ci/deps.yaml", Some(Format::Yaml)),
            ("/etc/testpods/deps.yml", Some(Format::Yaml)),
            ("deps.json", Some(Format::Json)),
        ];

        for (input, expected) in cases {
            assert_eq!(Format::from_path(input).ok(), expected, "input: {:?}", input);
        }
    }

    #[test]
    fn format_from_str() {
        assert_eq!("YAML".parse::<Format>(), Ok(Format::Yaml));
        assert_eq!("yml".parse::<Format>(), Ok(Format::Yaml));
        assert!("ini".parse::<Format>().is_err());
    }
}
