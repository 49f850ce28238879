//! Dotenv parsing for remote environment files.
//!
//! ```text
//! # comment
//! KEY=value
//! export OTHER="quoted value"
//! SINGLE='literal $value'
//! ```
//!
//! Keys must match `[A-Za-z_][A-Za-z0-9_]*`. Double-quoted values understand
//! `\n`, `\r`, `\t`, `\"` and `\\`; single-quoted values are literal.

use std::collections::BTreeMap;

use crate::error::MessageError;

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 256;

/// Maximum value length in bytes.
pub const MAX_VALUE_LENGTH: usize = 64 * 1024;

/// Parsed environment file, sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    inner: BTreeMap<String, String>,
}

impl EnvFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable, returning the previous value.
    pub fn set<K: Into<String>, V: Into<String>>(
        &mut self,
        key: K,
        value: V,
    ) -> Result<Option<String>, MessageError> {
        let key = key.into();
        let value = value.into();

        validate_key(&key)?;
        validate_value(&key, &value)?;

        Ok(self.inner.insert(key, value))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.inner
    }

    /// Parse dotenv content.
    pub fn parse(content: &str) -> Result<Self, MessageError> {
        let mut env = Self::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            parse_line(idx + 1, line, &mut env)?;
        }

        Ok(env)
    }
}

pub(crate) fn validate_key(key: &str) -> Result<(), MessageError> {
    let invalid = |reason: String| MessageError::InvalidKey {
        key: key.to_string(),
        reason,
    };

    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return Err(invalid("key cannot be empty".to_string()));
    };

    if key.len() > MAX_KEY_LENGTH {
        return Err(invalid(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }

    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(invalid(
            "key must start with a letter or underscore".to_string(),
        ));
    }

    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(invalid(format!("invalid character '{}' in key", c)));
    }

    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), MessageError> {
    if value.len() > MAX_VALUE_LENGTH {
        return Err(MessageError::InvalidValue {
            key: key.to_string(),
            reason: format!("value exceeds maximum length of {} bytes", MAX_VALUE_LENGTH),
        });
    }
    Ok(())
}

fn parse_line(line_num: usize, line: &str, env: &mut EnvFile) -> Result<(), MessageError> {
    let line = line.strip_prefix("export ").unwrap_or(line);

    let Some((key, value)) = line.split_once('=') else {
        return Err(MessageError::Parse {
            line: line_num,
            reason: "expected KEY=value format".to_string(),
        });
    };

    let value = unquote(value.trim()).map_err(|reason| MessageError::Parse {
        line: line_num,
        reason,
    })?;

    env.set(key.trim(), value)
        .map_err(|e| MessageError::Parse {
            line: line_num,
            reason: e.to_string(),
        })?;

    Ok(())
}

fn unquote(value: &str) -> Result<String, String> {
    if let Some(rest) = value.strip_prefix('\'') {
        return rest
            .strip_suffix('\'')
            .map(str::to_string)
            .ok_or_else(|| "unterminated single quote".to_string());
    }

    if let Some(rest) = value.strip_prefix('"') {
        let inner = rest
            .strip_suffix('"')
            .ok_or_else(|| "unterminated double quote".to_string())?;
        return Ok(unescape(inner));
    }

    // Unquoted: trailing ` # comment` is dropped.
    let value = match value.find(" #") {
        Some(idx) => value[..idx].trim_end(),
        None => value,
    };
    Ok(value.to_string())
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}
