//! Routed messages.
//!
//! A [`Message`] is a named record with positional and keyword payload. The
//! payload is stored as [`serde_json::Value`] so that any `Serialize` type can
//! travel through a dispatcher queue, and handlers decode it back with
//! [`Message::arg`] / [`Message::kwarg`].

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::handler::{HandlerError, HandlerResult};
use super::{BusError, BusResult};

/// One named, immutable unit of routed work.
///
/// # Example
///
/// ```
/// use subtest::bus::Message;
///
/// let message = Message::new("stage2")
///     .with_arg(&"0.1")?
///     .with_kwarg("attempt", &1)?;
///
/// assert_eq!(message.name(), "stage2");
/// assert_eq!(message.to_string(), r#"stage2("0.1",attempt=1)"#);
/// # Ok::<(), subtest::bus::BusError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Message {
    name: String,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
}

impl Message {
    /// Creates a message with no payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Appends a positional argument.
    pub fn with_arg<T: Serialize + ?Sized>(mut self, value: &T) -> BusResult<Self> {
        let value = serde_json::to_value(value).map_err(|source| BusError::Encode {
            message: self.name.clone(),
            source,
        })?;
        self.args.push(value);
        Ok(self)
    }

    /// Adds a keyword argument, replacing any previous value for `key`.
    pub fn with_kwarg<T: Serialize + ?Sized>(
        mut self,
        key: impl Into<String>,
        value: &T,
    ) -> BusResult<Self> {
        let value = serde_json::to_value(value).map_err(|source| BusError::Encode {
            message: self.name.clone(),
            source,
        })?;
        self.kwargs.insert(key.into(), value);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.kwargs
    }

    /// Decodes the positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> HandlerResult<T> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| HandlerError::MissingArgument {
                message: self.name.clone(),
                argument: index.to_string(),
            })?;
        serde_json::from_value(value.clone()).map_err(|source| HandlerError::Decode {
            message: self.name.clone(),
            argument: index.to_string(),
            source,
        })
    }

    /// Decodes every positional argument from `start` onwards.
    ///
    /// Used for trailing variadic payloads such as result details.
    pub fn rest<T: DeserializeOwned>(&self, start: usize) -> HandlerResult<Vec<T>> {
        (start..self.args.len()).map(|i| self.arg(i)).collect()
    }

    /// Decodes the keyword argument `key`, if present.
    pub fn kwarg<T: DeserializeOwned>(&self, key: &str) -> HandlerResult<Option<T>> {
        match self.kwargs.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|source| HandlerError::Decode {
                    message: self.name.clone(),
                    argument: key.to_string(),
                    source,
                }),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        parts.extend(self.kwargs.iter().map(|(k, v)| format!("{}={}", k, v)));
        write!(f, "{}({})", self.name, parts.join(","))
    }
}
