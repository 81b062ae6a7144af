//! Target parameter sets.
//!
//! A target is a string of the form `proto:[k1=]v1;[k2=]v2;...`. Each stream
//! type owns a *template* that fixes the recognized parameter names, their
//! positional order, and their defaults; the user's target is then overlaid
//! on top of it. Bare tokens bind positionally to the recognized names in
//! template order, keyed tokens bind by name, unknown keys are rejected.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{ErrorKind, Result, StreamError};

/// Ordered parameter set backing a stream target.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    /// Recognized parameter names, in positional order.
    order: Vec<String>,
    /// Current values, keyed by name.
    values: BTreeMap<String, String>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a target line.
    ///
    /// The first call registers the template: every token's name becomes a
    /// recognized parameter, and `name=value` tokens also set the default.
    /// Later calls overlay user values; a bare token binds to the next
    /// recognized name in template order (the positional cursor advances only
    /// on bare tokens), a keyed token binds by name. Unknown keys and excess
    /// bare tokens are [`ErrorKind::InvalidTarget`].
    pub fn add(&mut self, line: &str) -> Result<()> {
        let rest = match line.split_once(':') {
            Some((_proto, rest)) => rest,
            None => {
                return Err(StreamError::new(
                    ErrorKind::InvalidTarget,
                    "no protocol specified in target",
                ))
            }
        };

        let template = self.order.is_empty();
        let mut positional = 0usize;
        for token in rest.split(';').filter(|t| !t.is_empty()) {
            match token.split_once('=') {
                Some((key, value)) => {
                    if template {
                        self.order.push(key.to_string());
                    } else if !self.order.iter().any(|name| name == key) {
                        return Err(StreamError::new(
                            ErrorKind::InvalidTarget,
                            format!("unknown parameter: {key}"),
                        ));
                    }
                    self.values.insert(key.to_string(), value.to_string());
                }
                None => {
                    if template {
                        self.order.push(token.to_string());
                    } else {
                        let name = self.order.get(positional).ok_or_else(|| {
                            StreamError::new(
                                ErrorKind::InvalidTarget,
                                format!("too many parameters in target: {token}"),
                            )
                        })?;
                        self.values.insert(name.clone(), token.to_string());
                    }
                    positional += 1;
                }
            }
        }
        Ok(())
    }

    /// Insert or move a recognized name, optionally setting its value.
    ///
    /// With `at_start`, the name moves to the front of the positional order;
    /// used for the listener port write-back and for promoting the serial
    /// selector that actually matched.
    pub fn add_param(&mut self, name: &str, value: Option<&str>, at_start: bool) {
        self.order.retain(|n| n != name);
        if at_start {
            self.order.insert(0, name.to_string());
        } else {
            self.order.push(name.to_string());
        }
        if let Some(value) = value {
            self.values.insert(name.to_string(), value.to_string());
        }
    }

    /// Whether a value is currently bound to `key`.
    pub fn is_set(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// The raw value of `key`, or `None` when unset.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// The value of `key`. A mandatory parameter left unset surfaces here as
    /// [`ErrorKind::InvalidTarget`].
    pub fn get(&self, key: &str) -> Result<&str> {
        self.values.get(key).map(String::as_str).ok_or_else(|| {
            StreamError::new(ErrorKind::InvalidTarget, format!("parameter missing: {key}"))
        })
    }

    /// The value of `key`, parsed with the standard text grammar of `T`.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<T> {
        let raw = self.get(key)?;
        raw.parse().map_err(|_| {
            StreamError::new(
                ErrorKind::InvalidTarget,
                format!("parameter {key} has invalid value: {raw}"),
            )
        })
    }

    /// Remove a parameter and its value.
    pub fn erase(&mut self, key: &str) {
        self.order.retain(|n| n != key);
        self.values.remove(key);
    }

    /// Render every set parameter as `name=value`, `;`-separated, in
    /// positional order. Prefixing the protocol tag and re-parsing the
    /// result reproduces the same bindings.
    pub fn get_string(&self) -> String {
        self.order
            .iter()
            .filter_map(|name| self.values.get(name).map(|value| format!("{name}={value}")))
            .collect::<Vec<_>>()
            .join(";")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SER_TEMPLATE: &str =
        "ser:device;name;port=1;baud=115200;stop=1;parity=none;fc=none;bits=8;dtr=true";

    fn ser_params(target: &str) -> Result<ParameterSet> {
        let mut params = ParameterSet::new();
        params.add(SER_TEMPLATE)?;
        params.add(target)?;
        Ok(params)
    }

    #[test]
    fn positional_token_binds_first_recognized_name() {
        let params = ser_params("ser:/dev/ttyUSB0;baud=57600").unwrap();
        assert_eq!(params.get("device").unwrap(), "/dev/ttyUSB0");
        assert_eq!(params.get("baud").unwrap(), "57600");
        // Untouched defaults stay intact.
        assert_eq!(params.get("parity").unwrap(), "none");
        assert_eq!(params.get("stop").unwrap(), "1");
    }

    #[test]
    fn keyed_tokens_bind_by_name_in_any_order() {
        let params = ser_params("ser:baud=9600;port=3").unwrap();
        assert_eq!(params.get("baud").unwrap(), "9600");
        assert_eq!(params.get("port").unwrap(), "3");
        assert!(!params.is_set("device"));
    }

    #[test]
    fn lone_bare_token_lands_on_the_selector() {
        // A single bare token binds the first recognized name, which for the
        // serial template is the device path.
        let params = ser_params("ser:9600").unwrap();
        assert_eq!(params.get("device").unwrap(), "9600");
        assert_eq!(params.get("baud").unwrap(), "115200");
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = ser_params("ser:warp=9").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTarget);
    }

    #[test]
    fn excess_positional_tokens_are_rejected() {
        let mut params = ParameterSet::new();
        params.add("file:name;mode=read;fd=-1").unwrap();
        let err = params.add("file:a;b;c;d").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTarget);
    }

    #[test]
    fn missing_mandatory_parameter_surfaces_on_get() {
        let mut params = ParameterSet::new();
        params.add("tcp:host;port;sock=-1").unwrap();
        params.add("tcp:port=80").unwrap();
        let err = params.get("host").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTarget);
    }

    #[test]
    fn typed_getters_use_standard_grammar() {
        let params = ser_params("ser:port=3;baud=57600;dtr=false").unwrap();
        assert_eq!(params.get_parsed::<u32>("baud").unwrap(), 57600);
        assert!(!params.get_parsed::<bool>("dtr").unwrap());
        let err = params.get_parsed::<u32>("parity").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTarget);
    }

    #[test]
    fn get_string_round_trips() {
        let params = ser_params("ser:device=/dev/ttyACM3;baud=57600").unwrap();
        let rendered = format!("ser:{}", params.get_string());

        let reparsed = ser_params(&rendered).unwrap();
        assert_eq!(reparsed.get_string(), params.get_string());
        assert_eq!(reparsed.get("device").unwrap(), "/dev/ttyACM3");
        assert_eq!(reparsed.get("baud").unwrap(), "57600");
    }

    #[test]
    fn add_param_at_start_changes_positional_order() {
        let mut params = ParameterSet::new();
        params.add("tcpin:port=5000;address=0.0.0.0").unwrap();
        params.erase("port");
        params.add_param("port", Some("42000"), true);
        assert!(params.get_string().starts_with("port=42000"));
        assert_eq!(params.get("address").unwrap(), "0.0.0.0");
    }

    #[test]
    fn erase_removes_value_and_name() {
        let mut params = ParameterSet::new();
        params.add("tcp:host;port;connectionPort=-1;sock=-1").unwrap();
        params.add("tcp:host=a;port=1;sock=12").unwrap();
        params.erase("sock");
        assert!(!params.is_set("sock"));
        assert!(!params.get_string().contains("sock"));
    }
}
