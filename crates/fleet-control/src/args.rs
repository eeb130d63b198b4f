//! Positional argument access for callback handlers.
//!
//! `args[0]` is the command name; handlers parse the rest into a typed
//! request and fail with `InvalidParameters` instead of indexing blindly.

use std::fmt::Display;
use std::str::FromStr;

use fleet_core::HostId;

use crate::error::{HandlerError, HandlerResult};

#[derive(Debug, Clone, Copy)]
pub struct Args<'a> {
    command: &'a str,
    values: &'a [String],
}

impl<'a> Args<'a> {
    pub fn new(values: &'a [String]) -> Self {
        Self {
            command: values.first().map(String::as_str).unwrap_or(""),
            values,
        }
    }

    /// Require at least `count` values, the command name included.
    pub fn require(self, count: usize) -> HandlerResult<Self> {
        if self.values.len() < count {
            return Err(self.invalid(format!(
                "expected {} arguments, got {}",
                count.saturating_sub(1),
                self.values.len().saturating_sub(1)
            )));
        }
        Ok(self)
    }

    pub fn command(&self) -> &'a str {
        self.command
    }

    /// Number of values, the command name included.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn str(&self, index: usize) -> HandlerResult<&'a str> {
        self.values
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| self.invalid(format!("missing argument {index}")))
    }

    pub fn parse<T>(&self, index: usize, name: &str) -> HandlerResult<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.str(index)?;
        raw.trim()
            .parse()
            .map_err(|e| self.invalid(format!("{name} '{raw}': {e}")))
    }

    pub fn id(&self, index: usize, name: &str) -> HandlerResult<i64> {
        self.parse(index, name)
    }

    /// A host id; negative values are allowed and mean "no host".
    pub fn host(&self, index: usize, name: &str) -> HandlerResult<HostId> {
        self.parse(index, name)
    }

    pub fn invalid(&self, reason: impl Into<String>) -> HandlerError {
        HandlerError::InvalidParameters {
            command: self.command.to_string(),
            reason: reason.into(),
        }
    }
}
