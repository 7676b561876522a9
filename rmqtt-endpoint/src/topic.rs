use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EndpointError, Result};

pub const SEPARATOR: char = '/';
/// Replacement for [`SEPARATOR`] inside persistence keys
pub const ESCAPED_SEPARATOR: char = ';';

pub const NODES: &str = "nodes";
pub const OBJECTS: &str = "objects";
pub const ATTRIBUTES: &str = "attributes";

/// Leading level of every topic the endpoint sends or receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Update,
    NodeAdded,
    Online,
    Offline,
    Set,
    Transaction,
}

impl Action {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Update => "@update",
            Action::NodeAdded => "@nodeAdded",
            Action::Online => "@online",
            Action::Offline => "@offline",
            Action::Set => "@set",
            Action::Transaction => "@transaction",
        }
    }
}

impl FromStr for Action {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self> {
        let action = match s {
            "@update" => Action::Update,
            "@nodeAdded" => Action::NodeAdded,
            "@online" => Action::Online,
            "@offline" => Action::Offline,
            "@set" => Action::Set,
            "@transaction" => Action::Transaction,
            _ => return Err(EndpointError::UnsupportedAction(s.into())),
        };
        Ok(action)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action followed by a topic path, e.g. `@set/<uuid>/nodes/<n>/objects/<o>/attributes/<a>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    action: Action,
    path: String,
}

impl Topic {
    #[inline]
    pub fn new<P: Into<String>>(action: Action, path: P) -> Self {
        Self { action, path: path.into() }
    }

    #[inline]
    pub fn action(&self) -> Action {
        self.action
    }

    /// Topic path without the action level
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn levels(&self) -> Vec<&str> {
        split_levels(&self.path)
    }
}

impl FromStr for Topic {
    type Err = EndpointError;

    fn from_str(topic: &str) -> Result<Self> {
        let (action, path) = topic
            .split_once(SEPARATOR)
            .ok_or_else(|| EndpointError::NotFound(format!("topic {:?} has no path", topic)))?;
        if path.is_empty() {
            return Err(EndpointError::NotFound(format!("topic {:?} has no path", topic)));
        }
        Ok(Topic { action: action.parse()?, path: path.into() })
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.action, SEPARATOR, self.path)
    }
}

#[inline]
pub fn split_levels(path: &str) -> Vec<&str> {
    path.split(SEPARATOR).collect()
}

/// Subscription filter covering every cloud write addressed to the endpoint
#[inline]
pub fn set_filter(uuid: &str) -> String {
    format!("{}{}{}{}#", Action::Set, SEPARATOR, uuid, SEPARATOR)
}

#[inline]
pub fn escape(path: &str) -> String {
    path.replace(SEPARATOR, &ESCAPED_SEPARATOR.to_string())
}

#[inline]
pub fn unescape(path: &str) -> String {
    path.replace(ESCAPED_SEPARATOR, &SEPARATOR.to_string())
}

/// Checks that `name` can be used as a single topic level and a persistence key fragment
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains([SEPARATOR, ESCAPED_SEPARATOR, '+', '#']) {
        return Err(EndpointError::InvalidName(name.into()));
    }
    Ok(())
}
