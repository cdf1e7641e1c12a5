//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(StrataError)` of kind `InvalidInput`
/// on parser failure or on an unexpected key.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => PortalConfig; max_threads)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::StrataError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // leftover keys are not expected hence invalid
            if let Some(key) = table.keys().next() {
                return Err($crate::StrataError::new(
                    $crate::ErrorKind::InvalidInput,
                    format!("invalid field name '{}' in config", key),
                ));
            }

            Ok(config)
        };

        compose_config()
    }};
}

/// Extracts the sub-table named `section` out of a whole TOML document and
/// re-serializes it so that it can be fed to `parsed_config!`. Returns
/// `Ok(None)` if the section is absent.
pub fn config_section(
    doc: &str,
    section: &str,
) -> Result<Option<String>, crate::StrataError> {
    let mut table = doc.parse::<toml::Table>()?;
    match table.remove(section) {
        None => Ok(None),
        Some(toml::Value::Table(sub)) => Ok(Some(sub.to_string())),
        Some(_) => Err(crate::StrataError::new(
            crate::ErrorKind::InvalidInput,
            format!("config section '{}' is not a table", section),
        )),
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use crate::utils::{ErrorKind, StrataError};

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        threads: u16,
        resource: String,
        ratio: f64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                threads: 4,
                resource: "demoResc".into(),
                ratio: 0.5,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), StrataError> {
        let config =
            parsed_config!(None => TestConfig; threads, resource, ratio)?;
        assert_eq!(config, TestConfig::default());
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), StrataError> {
        let config_str = Some("resource = 'ufs0'\nthreads = 16");
        let config =
            parsed_config!(config_str => TestConfig; threads, resource, ratio)?;
        assert_eq!(
            config,
            TestConfig {
                threads: 16,
                resource: "ufs0".into(),
                ratio: 0.5,
            }
        );
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("bogus = 3");
        let config =
            parsed_config!(config_str => TestConfig; threads, resource, ratio);
        assert!(config.is_err_and(|e| e.kind() == ErrorKind::InvalidInput));
    }

    #[test]
    fn parse_wrong_type() {
        let config_str = Some("threads = 'many'");
        let config =
            parsed_config!(config_str => TestConfig; threads, resource, ratio);
        assert!(config.is_err());
    }

    #[test]
    fn extract_section() -> Result<(), StrataError> {
        let doc = "[portal]\nmax_threads = 8\n[coord]\ndefault_resource = 'a'";
        let portal = config_section(doc, "portal")?;
        assert!(portal.is_some_and(|s| s.contains("max_threads = 8")));
        assert_eq!(config_section(doc, "tool")?, None);
        assert!(config_section("x = 1", "x").is_err());
        Ok(())
    }
}
