//! Connection option parsing.
//!
//! Options arrive as a name/value map. Every hyphenated name is also
//! accepted with underscores; unknown names are rejected eagerly.

use super::error::ConnectionError;

/// Loosely typed option value, coerced per option.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<OptionValue>),
}

impl OptionValue {
    fn as_bool(&self, name: &str) -> Result<bool, ConnectionError> {
        match self {
            OptionValue::Bool(b) => Ok(*b),
            OptionValue::Int(i) => Ok(*i != 0),
            _ => Err(bad_value(name, "boolean")),
        }
    }

    fn as_int(&self, name: &str) -> Result<i64, ConnectionError> {
        match self {
            OptionValue::Int(i) => Ok(*i),
            OptionValue::Bool(b) => Ok(i64::from(*b)),
            _ => Err(bad_value(name, "integer")),
        }
    }

    fn as_seconds(&self, name: &str) -> Result<u64, ConnectionError> {
        let i = self.as_int(name)?;
        u64::try_from(i).map_err(|_| bad_value(name, "non-negative seconds"))
    }

    fn as_str(&self, name: &str) -> Result<String, ConnectionError> {
        match self {
            OptionValue::Str(s) => Ok(s.clone()),
            OptionValue::Int(i) => Ok(i.to_string()),
            OptionValue::Bool(b) => Ok(b.to_string()),
            OptionValue::List(_) => Err(bad_value(name, "string")),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for OptionValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<&str>> for OptionValue {
    fn from(value: Vec<&str>) -> Self {
        Self::List(value.into_iter().map(OptionValue::from).collect())
    }
}

fn bad_value(name: &str, expected: &str) -> ConnectionError {
    ConnectionError::InvalidOption(format!("{name}: expected {expected}"))
}

/// Parameters handed through to the transport/SASL layers untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionSettings {
    pub username: String,
    pub password: String,
    pub mechanism: String,
    pub service: String,
    pub min_ssf: Option<u32>,
    pub max_ssf: Option<u32>,
    pub heartbeat: Option<u32>,
    pub tcp_nodelay: bool,
    pub locale: String,
    pub max_channels: Option<u16>,
    pub max_frame_size: Option<u32>,
    pub protocol: String,
    pub ssl_cert_name: String,
}

/// Parsed reconnect policy plus pass-through settings.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub reconnect: bool,
    /// Seconds; negative = infinite, zero = no retry.
    pub timeout: i64,
    /// Retry count; negative = unlimited.
    pub limit: i64,
    pub min_interval: u64,
    pub max_interval: u64,
    pub replace_urls: bool,
    pub reconnect_urls: Vec<String>,
    pub reconnect_on_limit_exceeded: bool,
    pub settings: ConnectionSettings,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect: false,
            timeout: -1,
            limit: -1,
            min_interval: 3,
            max_interval: 60,
            replace_urls: false,
            reconnect_urls: Vec::new(),
            reconnect_on_limit_exceeded: true,
            settings: ConnectionSettings::default(),
        }
    }
}

/// Append a URL unless it is already present; order is first-seen.
pub(crate) fn merge_url(value: &str, urls: &mut Vec<String>) {
    if !urls.iter().any(|u| u == value) {
        urls.push(value.to_string());
    }
}

impl ConnectionOptions {
    pub fn parse<I, N>(options: I) -> Result<Self, ConnectionError>
    where
        I: IntoIterator<Item = (N, OptionValue)>,
        N: AsRef<str>,
    {
        let mut parsed = Self::default();
        for (name, value) in options {
            parsed.set_option(name.as_ref(), &value)?;
        }
        Ok(parsed)
    }

    pub fn set_option(&mut self, name: &str, value: &OptionValue) -> Result<(), ConnectionError> {
        // underscore spellings are accepted everywhere
        let key = name.replace('_', "-");
        match key.as_str() {
            "reconnect" => self.reconnect = value.as_bool(name)?,
            "reconnect-timeout" => self.timeout = value.as_int(name)?,
            "reconnect-limit" => self.limit = value.as_int(name)?,
            "reconnect-interval" => {
                let interval = value.as_seconds(name)?;
                self.min_interval = interval;
                self.max_interval = interval;
            }
            "reconnect-interval-min" => self.min_interval = value.as_seconds(name)?,
            "reconnect-interval-max" => self.max_interval = value.as_seconds(name)?,
            "reconnect-urls-replace" => self.replace_urls = value.as_bool(name)?,
            "reconnect-urls" => {
                if self.replace_urls {
                    self.reconnect_urls.clear();
                }
                match value {
                    OptionValue::List(values) => {
                        for v in values {
                            merge_url(&v.as_str(name)?, &mut self.reconnect_urls);
                        }
                    }
                    other => merge_url(&other.as_str(name)?, &mut self.reconnect_urls),
                }
            }
            "username" => self.settings.username = value.as_str(name)?,
            "password" => self.settings.password = value.as_str(name)?,
            "sasl-mechanism" | "sasl-mechanisms" => {
                self.settings.mechanism = value.as_str(name)?
            }
            "sasl-service" => self.settings.service = value.as_str(name)?,
            "sasl-min-ssf" => {
                self.settings.min_ssf = Some(
                    u32::try_from(value.as_int(name)?).map_err(|_| bad_value(name, "ssf"))?,
                )
            }
            "sasl-max-ssf" => {
                self.settings.max_ssf = Some(
                    u32::try_from(value.as_int(name)?).map_err(|_| bad_value(name, "ssf"))?,
                )
            }
            "heartbeat" => {
                self.settings.heartbeat = Some(
                    u32::try_from(value.as_int(name)?)
                        .map_err(|_| bad_value(name, "seconds"))?,
                )
            }
            "tcp-nodelay" => self.settings.tcp_nodelay = value.as_bool(name)?,
            "locale" => self.settings.locale = value.as_str(name)?,
            "max-channels" => {
                self.settings.max_channels = Some(
                    u16::try_from(value.as_int(name)?)
                        .map_err(|_| bad_value(name, "channel count"))?,
                )
            }
            "max-frame-size" => {
                self.settings.max_frame_size = Some(
                    u32::try_from(value.as_int(name)?).map_err(|_| bad_value(name, "bytes"))?,
                )
            }
            "transport" => self.settings.protocol = value.as_str(name)?,
            "ssl-cert-name" => self.settings.ssl_cert_name = value.as_str(name)?,
            "x-reconnect-on-limit-exceeded" => {
                self.reconnect_on_limit_exceeded = value.as_bool(name)?
            }
            _ => {
                return Err(ConnectionError::InvalidOption(format!(
                    "{name} not recognised"
                )))
            }
        }
        Ok(())
    }
}
