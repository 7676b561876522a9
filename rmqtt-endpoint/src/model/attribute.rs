use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use rmqtt_utils::{format_timestamp_millis, TimestampMillis};

use super::ObjectId;
use crate::error::{EndpointError, Result};
use crate::topic::validate_name;

/// Data type of an attribute, fixed once known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AttributeType {
    #[default]
    Invalid,
    Boolean,
    Integer,
    Number,
    String,
}

impl AttributeType {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::Invalid => "Invalid",
            AttributeType::Boolean => "Boolean",
            AttributeType::Integer => "Integer",
            AttributeType::Number => "Number",
            AttributeType::String => "String",
        }
    }
}

impl FromStr for AttributeType {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self> {
        let t = match s.to_ascii_lowercase().as_str() {
            "invalid" => AttributeType::Invalid,
            "boolean" => AttributeType::Boolean,
            "integer" => AttributeType::Integer,
            "number" => AttributeType::Number,
            "string" => AttributeType::String,
            _ => return Err(EndpointError::InvalidAttributeType(s.into())),
        };
        Ok(t)
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who may change an attribute and how it is meant to be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AttributeConstraint {
    Static,
    Parameter,
    Status,
    SetPoint,
    Measure,
    #[default]
    Invalid,
}

impl AttributeConstraint {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeConstraint::Static => "Static",
            AttributeConstraint::Parameter => "Parameter",
            AttributeConstraint::Status => "Status",
            AttributeConstraint::SetPoint => "SetPoint",
            AttributeConstraint::Measure => "Measure",
            AttributeConstraint::Invalid => "Invalid",
        }
    }
}

impl FromStr for AttributeConstraint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self> {
        let c = match s.to_ascii_lowercase().as_str() {
            "static" => AttributeConstraint::Static,
            "parameter" => AttributeConstraint::Parameter,
            "status" => AttributeConstraint::Status,
            "setpoint" => AttributeConstraint::SetPoint,
            "measure" => AttributeConstraint::Measure,
            "invalid" => AttributeConstraint::Invalid,
            _ => return Err(EndpointError::InvalidAttributeValue(format!("unknown constraint {:?}", s))),
        };
        Ok(c)
    }
}

impl fmt::Display for AttributeConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
}

impl AttributeValue {
    #[inline]
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            AttributeValue::Boolean(_) => AttributeType::Boolean,
            AttributeValue::Integer(_) => AttributeType::Integer,
            AttributeValue::Number(_) => AttributeType::Number,
            AttributeValue::String(_) => AttributeType::String,
        }
    }

    /// Zero value of a type, `None` for [`AttributeType::Invalid`]
    #[inline]
    pub fn default_for(t: AttributeType) -> Option<AttributeValue> {
        match t {
            AttributeType::Invalid => None,
            AttributeType::Boolean => Some(AttributeValue::Boolean(false)),
            AttributeType::Integer => Some(AttributeValue::Integer(0)),
            AttributeType::Number => Some(AttributeValue::Number(0.0)),
            AttributeType::String => Some(AttributeValue::String(String::new())),
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        if let AttributeValue::Boolean(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        if let AttributeValue::Integer(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            AttributeValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        if let AttributeValue::String(s) = self {
            Some(s)
        } else {
            None
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Boolean(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Integer(v as i64)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Integer(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Number(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.into())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Boolean(v) => write!(f, "{}", v),
            AttributeValue::Integer(v) => write!(f, "{}", v),
            AttributeValue::Number(v) => write!(f, "{}", v),
            AttributeValue::String(v) => f.write_str(v),
        }
    }
}

/// Observer of cloud-originated attribute changes
pub trait AttributeListener: Send + Sync {
    fn attribute_has_changed(&self, attribute: &Attribute);
}

impl<F> AttributeListener for F
where
    F: Fn(&Attribute) + Send + Sync,
{
    fn attribute_has_changed(&self, attribute: &Attribute) {
        self(attribute)
    }
}

pub type Listener = Arc<dyn AttributeListener>;

/// Leaf of the model tree holding a single typed value
#[derive(Clone, Default)]
pub struct Attribute {
    name: Option<String>,
    parent: Option<ObjectId>,
    typ: AttributeType,
    constraint: Option<AttributeConstraint>,
    value: Option<AttributeValue>,
    timestamp: Option<TimestampMillis>,
    listeners: Vec<Listener>,
}

impl Attribute {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn set_name<N: Into<String>>(&mut self, name: N) -> Result<()> {
        if let Some(old) = &self.name {
            return Err(EndpointError::Modification(format!("attribute name is already set to {:?}", old)));
        }
        let name = name.into();
        validate_name(&name)?;
        self.name = Some(name);
        Ok(())
    }

    #[inline]
    pub fn parent(&self) -> Option<ObjectId> {
        self.parent
    }

    pub(crate) fn set_parent(&mut self, parent: ObjectId) -> Result<()> {
        if self.parent.is_some() {
            return Err(EndpointError::Modification(format!(
                "attribute {:?} already has a parent",
                self.name.as_deref().unwrap_or_default()
            )));
        }
        self.parent = Some(parent);
        Ok(())
    }

    #[inline]
    pub fn attribute_type(&self) -> AttributeType {
        self.typ
    }

    /// Fixes the type. Any later call fails, even with the same type.
    pub fn set_type(&mut self, typ: AttributeType) -> Result<()> {
        if typ == AttributeType::Invalid {
            return Err(EndpointError::InvalidAttributeType(typ.to_string()));
        }
        if self.typ != AttributeType::Invalid {
            return Err(EndpointError::Modification(format!(
                "attribute type is already set to {}",
                self.typ
            )));
        }
        self.typ = typ;
        self.value = AttributeValue::default_for(typ);
        Ok(())
    }

    #[inline]
    pub fn constraint(&self) -> AttributeConstraint {
        self.constraint.unwrap_or_default()
    }

    pub fn set_constraint(&mut self, constraint: AttributeConstraint) -> Result<()> {
        if let Some(old) = self.constraint {
            return Err(EndpointError::Modification(format!("attribute constraint is already set to {}", old)));
        }
        self.constraint = Some(constraint);
        Ok(())
    }

    #[inline]
    pub fn value(&self) -> Option<&AttributeValue> {
        self.value.as_ref()
    }

    #[inline]
    pub fn timestamp(&self) -> Option<TimestampMillis> {
        self.timestamp
    }

    /// Local write, the caller supplies the change time
    pub fn set_value<V: Into<AttributeValue>>(&mut self, value: V, timestamp: TimestampMillis) -> Result<()> {
        let value = self.coerce(value.into())?;
        self.value = Some(value);
        self.timestamp = Some(timestamp);
        Ok(())
    }

    /// Write without touching the timestamp, used for static values
    pub fn set_static_value<V: Into<AttributeValue>>(&mut self, value: V) -> Result<()> {
        let value = self.coerce(value.into())?;
        self.value = Some(value);
        Ok(())
    }

    /// Cloud write. Returns `Ok(false)` and leaves the attribute untouched when
    /// `timestamp` is not newer than the current one.
    pub fn set_value_from_cloud<V: Into<AttributeValue>>(
        &mut self,
        value: V,
        timestamp: TimestampMillis,
    ) -> Result<bool> {
        if let Some(current) = self.timestamp {
            if current >= timestamp {
                log::debug!(
                    "ignoring stale update of {:?}, current timestamp: {}, received: {}",
                    self.name(),
                    format_timestamp_millis(current),
                    format_timestamp_millis(timestamp)
                );
                return Ok(false);
            }
        }
        let value = self.coerce(value.into())?;
        self.value = Some(value);
        self.timestamp = Some(timestamp);
        if self.listeners.is_empty() {
            log::warn!("attribute {:?} changed from the cloud, but no listener is registered", self.name());
        }
        Ok(true)
    }

    fn coerce(&mut self, value: AttributeValue) -> Result<AttributeValue> {
        match (self.typ, value) {
            (AttributeType::Invalid, value) => {
                self.typ = value.attribute_type();
                Ok(value)
            }
            (AttributeType::Number, AttributeValue::Integer(i)) => Ok(AttributeValue::Number(i as f64)),
            (typ, value) if typ == value.attribute_type() => Ok(value),
            (typ, value) => Err(EndpointError::Modification(format!(
                "attribute {:?} has type {}, can not assign {} value {}",
                self.name(),
                typ,
                value.attribute_type(),
                value
            ))),
        }
    }

    #[inline]
    pub fn add_listener(&mut self, listener: Listener) {
        self.listeners.push(listener);
    }

    pub fn remove_listener(&mut self, listener: &Listener) -> bool {
        let len = self.listeners.len();
        self.listeners.retain(|l| !same_listener(l, listener));
        len != self.listeners.len()
    }

    #[inline]
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn notify_listeners(&self) {
        for listener in self.listeners.iter() {
            listener.attribute_has_changed(self);
        }
    }
}

#[inline]
fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("type", &self.typ)
            .field("constraint", &self.constraint())
            .field("value", &self.value)
            .field("timestamp", &self.timestamp)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_set_name_once() {
        let mut a = Attribute::new();
        a.set_name("speed").unwrap();
        assert!(a.set_name("other").unwrap_err().is_modification());
        assert_eq!(a.name(), Some("speed"));
        assert!(matches!(Attribute::new().set_name("a/b"), Err(EndpointError::InvalidName(_))));
    }

    #[test]
    fn test_set_parent_once() {
        let mut a = Attribute::new();
        a.set_parent(ObjectId(0)).unwrap();
        assert!(a.set_parent(ObjectId(1)).unwrap_err().is_modification());
        assert_eq!(a.parent(), Some(ObjectId(0)));
    }

    #[test]
    fn test_set_type_once() {
        let mut a = Attribute::new();
        assert!(matches!(a.set_type(AttributeType::Invalid), Err(EndpointError::InvalidAttributeType(_))));
        a.set_type(AttributeType::Integer).unwrap();
        assert_eq!(a.value(), Some(&AttributeValue::Integer(0)));
        assert_eq!(a.timestamp(), None);
        assert!(a.set_type(AttributeType::Integer).unwrap_err().is_modification());
        assert!(a.set_type(AttributeType::String).unwrap_err().is_modification());
    }

    #[test]
    fn test_type_fixed_by_first_value() {
        let mut a = Attribute::new();
        a.set_value(true, 1).unwrap();
        assert_eq!(a.attribute_type(), AttributeType::Boolean);
        assert!(a.set_value(3, 2).unwrap_err().is_modification());
        assert_eq!(a.value(), Some(&AttributeValue::Boolean(true)));
        assert_eq!(a.timestamp(), Some(1));
        assert!(a.set_type(AttributeType::Boolean).unwrap_err().is_modification());
    }

    #[test]
    fn test_integer_widens_to_number() {
        let mut a = Attribute::new();
        a.set_type(AttributeType::Number).unwrap();
        a.set_value(3, 10).unwrap();
        assert_eq!(a.value(), Some(&AttributeValue::Number(3.0)));

        let mut b = Attribute::new();
        b.set_type(AttributeType::Integer).unwrap();
        assert!(b.set_value(3.5, 10).unwrap_err().is_modification());
    }

    #[test]
    fn test_constraint_once() {
        let mut a = Attribute::new();
        assert_eq!(a.constraint(), AttributeConstraint::Invalid);
        a.set_constraint(AttributeConstraint::Parameter).unwrap();
        assert!(a.set_constraint(AttributeConstraint::Status).unwrap_err().is_modification());
        assert_eq!("setpoint".parse::<AttributeConstraint>().unwrap(), AttributeConstraint::SetPoint);
        assert_eq!("MEASURE".parse::<AttributeConstraint>().unwrap(), AttributeConstraint::Measure);
        assert!("bogus".parse::<AttributeConstraint>().is_err());
    }

    #[test]
    fn test_stale_cloud_update() {
        let mut a = Attribute::new();
        a.set_type(AttributeType::Integer).unwrap();
        assert!(a.set_value_from_cloud(5, 100).unwrap());
        assert!(!a.set_value_from_cloud(6, 100).unwrap());
        assert!(!a.set_value_from_cloud(7, 99).unwrap());
        assert_eq!(a.value(), Some(&AttributeValue::Integer(5)));
        assert_eq!(a.timestamp(), Some(100));
        assert!(a.set_value_from_cloud(8, 101).unwrap());
        assert_eq!(a.value(), Some(&AttributeValue::Integer(8)));
    }

    #[test]
    fn test_static_value_keeps_timestamp() {
        let mut a = Attribute::new();
        a.set_static_value("v1.0").unwrap();
        assert_eq!(a.timestamp(), None);
        assert_eq!(a.value().and_then(|v| v.as_str()), Some("v1.0"));
    }

    #[test]
    fn test_listeners() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let listener: Listener = Arc::new(move |_: &Attribute| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let mut a = Attribute::new();
        a.add_listener(listener.clone());
        a.notify_listeners();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(a.remove_listener(&listener));
        assert!(!a.remove_listener(&listener));
        a.notify_listeners();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
