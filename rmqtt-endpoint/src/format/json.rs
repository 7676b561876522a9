use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Number, Value};

use rmqtt_utils::{millis_to_secs, secs_to_millis, Clock, SystemClock};

use super::MessageFormat;
use crate::error::{EndpointError, Result};
use crate::model::{
    Attribute, AttributeConstraint, AttributeId, AttributeType, AttributeValue, Model, NodeId, ObjectId,
};

const VERSION: &str = "v0.2";
const MESSAGE_FORMAT_VERSION: u64 = 2;
const NAME: &str = "JSON";

/// Strings that decode to `false` for boolean attributes, compared case-insensitively
const FALSE_TOKENS: [&str; 5] = ["0", "false", "falsch", "faux", "off"];

/// JSON codec, selected by a leading `{`
#[derive(Clone)]
pub struct JsonMessageFormat {
    clock: Arc<dyn Clock>,
}

impl Default for JsonMessageFormat {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl JsonMessageFormat {
    /// `clock` stamps incoming writes that carry no timestamp
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn attribute_value(&self, attribute: &Attribute) -> Value {
        let mut map = Map::new();
        map.insert("type".into(), Value::from(attribute.attribute_type().as_str()));
        map.insert("constraint".into(), Value::from(attribute.constraint().as_str()));
        if attribute.constraint() != AttributeConstraint::Static {
            if let Some(ts) = attribute.timestamp() {
                map.insert("timestamp".into(), float(millis_to_secs(ts)));
            }
        }
        map.insert("value".into(), attribute.value().map(to_json).unwrap_or(Value::Null));
        Value::Object(map)
    }

    fn object_value(&self, model: &Model, id: ObjectId) -> Result<Value> {
        let object = model.object(id)?;
        let mut map = Map::new();
        if let Some(conforms) = object.conforms() {
            map.insert("conforms".into(), Value::from(conforms));
        }
        let mut objects = Map::new();
        for (name, child) in object.objects() {
            objects.insert(name.clone(), self.object_value(model, *child)?);
        }
        map.insert("objects".into(), Value::Object(objects));
        let mut attributes = Map::new();
        for (name, child) in object.attributes() {
            attributes.insert(name.clone(), self.attribute_value(model.attribute(*child)?));
        }
        map.insert("attributes".into(), Value::Object(attributes));
        Ok(Value::Object(map))
    }

    fn node_value(&self, model: &Model, id: NodeId) -> Result<Value> {
        let node = model.node(id)?;
        let mut map = Map::new();
        map.insert("implements".into(), Value::from(node.interfaces().to_vec()));
        let mut objects = Map::new();
        for (name, child) in node.objects() {
            objects.insert(name.clone(), self.object_value(model, *child)?);
        }
        map.insert("objects".into(), Value::Object(objects));
        Ok(Value::Object(map))
    }
}

impl MessageFormat for JsonMessageFormat {
    fn name(&self) -> &'static str {
        NAME
    }

    fn discriminators(&self) -> &'static [u8] {
        b"{"
    }

    fn serialize_endpoint(&self, model: &Model) -> Result<Bytes> {
        let mut nodes = Map::new();
        for (name, id) in model.nodes() {
            nodes.insert(name.clone(), self.node_value(model, *id)?);
        }
        let mut map = Map::new();
        map.insert("version".into(), Value::from(VERSION));
        map.insert("messageFormatVersion".into(), Value::from(MESSAGE_FORMAT_VERSION));
        map.insert("supportedFormats".into(), Value::from(vec![NAME]));
        map.insert("nodes".into(), Value::Object(nodes));
        Ok(Bytes::from(serde_json::to_vec(&Value::Object(map))?))
    }

    fn serialize_node(&self, model: &Model, node: NodeId) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.node_value(model, node)?)?))
    }

    fn serialize_attribute(&self, attribute: &Attribute) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.attribute_value(attribute))?))
    }

    fn serialize_transaction(&self, model: &Model, attributes: &[AttributeId]) -> Result<Bytes> {
        let mut map = Map::new();
        for id in attributes {
            map.insert(model.topic_path(*id)?, self.attribute_value(model.attribute(*id)?));
        }
        let mut doc = Map::new();
        doc.insert("attributes".into(), Value::Object(map));
        Ok(Bytes::from(serde_json::to_vec(&Value::Object(doc))?))
    }

    fn deserialize_attribute(&self, data: &[u8], attribute: &mut Attribute) -> Result<bool> {
        let doc: Value = serde_json::from_slice(data).map_err(|e| EndpointError::Decode(e.to_string()))?;
        let doc = doc.as_object().ok_or_else(|| EndpointError::Decode("payload is not a JSON object".into()))?;

        let timestamp = match doc.get("timestamp") {
            None | Some(Value::Null) => self.clock.now_millis(),
            Some(ts) => ts
                .as_f64()
                .map(secs_to_millis)
                .ok_or_else(|| EndpointError::Decode(format!("invalid timestamp {}", ts)))?,
        };
        if timestamp == 0 {
            log::debug!("ignoring update of {:?} with zero timestamp", attribute.name());
            return Ok(false);
        }

        let value = match doc.get("value") {
            None | Some(Value::Null) => {
                log::debug!("ignoring update of {:?} without value", attribute.name());
                return Ok(false);
            }
            Some(value) => value,
        };
        let value = match coerce(value, attribute.attribute_type())? {
            Some(value) => value,
            None => {
                log::debug!("ignoring update of {:?}, attribute type is not known yet", attribute.name());
                return Ok(false);
            }
        };
        attribute.set_value_from_cloud(value, timestamp)
    }
}

#[inline]
fn float(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

fn to_json(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::Boolean(b) => Value::Bool(*b),
        AttributeValue::Integer(i) => Value::from(*i),
        AttributeValue::Number(n) => float(*n),
        AttributeValue::String(s) => Value::String(s.clone()),
    }
}

/// Converts a JSON value to the attribute's type. `None` for attributes without a type.
fn coerce(value: &Value, typ: AttributeType) -> Result<Option<AttributeValue>> {
    let value = match typ {
        AttributeType::Invalid => return Ok(None),
        AttributeType::Boolean => AttributeValue::Boolean(to_bool(value)),
        AttributeType::Integer => AttributeValue::Integer(to_i64(value)?),
        AttributeType::Number => AttributeValue::Number(to_f64(value)?),
        AttributeType::String => AttributeValue::String(to_string(value)?),
    };
    Ok(Some(value))
}

pub(crate) fn to_bool(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !FALSE_TOKENS.contains(&s.to_lowercase().as_str()),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn to_i64(value: &Value) -> Result<i64> {
    let invalid = || EndpointError::InvalidAttributeValue(format!("{} is not an integer", value));
    match value {
        Value::Bool(b) => Ok(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(i),
            None => n.as_f64().and_then(truncate).ok_or_else(invalid),
        },
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().or_else(|_| s.parse::<f64>().ok().and_then(truncate).ok_or_else(invalid))
        }
        _ => Err(invalid()),
    }
}

fn truncate(f: f64) -> Option<i64> {
    let t = f.trunc();
    if t.is_finite() && t >= i64::MIN as f64 && t <= i64::MAX as f64 {
        Some(t as i64)
    } else {
        None
    }
}

fn to_f64(value: &Value) -> Result<f64> {
    let invalid = || EndpointError::InvalidAttributeValue(format!("{} is not a number", value));
    match value {
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64().ok_or_else(invalid),
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn to_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(EndpointError::InvalidAttributeValue(format!("{} is not a string", value))),
    }
}
