//! TOML configuration loading.
//!
//! Configuration structs live next to the components they configure and derive
//! `Deserialize` with `#[serde(default)]`; this module only turns files and
//! strings into those structs.

use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::errors::{Error, Result};

/// Parse a configuration value from TOML text
pub fn from_toml_str<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(toml::from_str(text)?)
}

/// Read and parse a TOML configuration file
pub fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    debug!(path = %path.display(), "loading configuration");
    let text = std::fs::read_to_string(path).map_err(|e| Error::in_file(path, e.into()))?;
    from_toml_str(&text).map_err(|e| Error::in_file(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        name: String,
        retries: u32,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                name: "default".into(),
                retries: 3,
            }
        }
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let sample: Sample = from_toml_str("retries = 5").unwrap();
        assert_eq!(
            sample,
            Sample {
                name: "default".into(),
                retries: 5
            }
        );
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = from_toml_str::<Sample>("retries = [").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_file_names_the_path() {
        let err = load_toml::<Sample>("/nonexistent/camlink.toml").unwrap_err();
        match err {
            Error::File { path, source } => {
                assert_eq!(path, Path::new("/nonexistent/camlink.toml"));
                assert!(matches!(*source, Error::Io(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
