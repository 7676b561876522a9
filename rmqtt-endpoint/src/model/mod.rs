//! Endpoint data model
//!
//! The tree `endpoint → nodes → objects → attributes` is stored in a [`Model`]
//! arena owned by the endpoint. Entities are addressed by typed indices and
//! only keep an upward link to their parent. Topic paths are derived on demand
//! from those links, so a path always reflects the live structure.

use std::collections::BTreeMap;

use crate::error::{EndpointError, Result};
use crate::topic::{split_levels, validate_name, ATTRIBUTES, NODES, OBJECTS, SEPARATOR};

pub use self::attribute::{
    Attribute, AttributeConstraint, AttributeListener, AttributeType, AttributeValue, Listener,
};
pub use self::node::Node;
pub use self::object::Object;

mod attribute;
mod node;
mod object;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeId(pub(crate) usize);

/// Anything that may own objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerId {
    Node(NodeId),
    Object(ObjectId),
}

impl From<NodeId> for ContainerId {
    fn from(id: NodeId) -> Self {
        ContainerId::Node(id)
    }
}

impl From<ObjectId> for ContainerId {
    fn from(id: ObjectId) -> Self {
        ContainerId::Object(id)
    }
}

/// Any addressable entity of the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityId {
    Node(NodeId),
    Object(ObjectId),
    Attribute(AttributeId),
}

impl From<NodeId> for EntityId {
    fn from(id: NodeId) -> Self {
        EntityId::Node(id)
    }
}

impl From<ObjectId> for EntityId {
    fn from(id: ObjectId) -> Self {
        EntityId::Object(id)
    }
}

impl From<AttributeId> for EntityId {
    fn from(id: AttributeId) -> Self {
        EntityId::Attribute(id)
    }
}

impl From<ContainerId> for EntityId {
    fn from(id: ContainerId) -> Self {
        match id {
            ContainerId::Node(id) => EntityId::Node(id),
            ContainerId::Object(id) => EntityId::Object(id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    uuid: String,
    nodes: BTreeMap<String, NodeId>,
    node_arena: Vec<Node>,
    object_arena: Vec<Object>,
    attribute_arena: Vec<Attribute>,
}

impl Model {
    pub fn new<U: Into<String>>(uuid: U) -> Self {
        Self {
            uuid: uuid.into(),
            nodes: BTreeMap::new(),
            node_arena: Vec::new(),
            object_arena: Vec::new(),
            attribute_arena: Vec::new(),
        }
    }

    #[inline]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Nodes attached to the endpoint, by name
    #[inline]
    pub fn nodes(&self) -> &BTreeMap<String, NodeId> {
        &self.nodes
    }

    #[inline]
    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes.get(name).copied()
    }

    pub fn create_node(&mut self) -> NodeId {
        self.node_arena.push(Node::new());
        NodeId(self.node_arena.len() - 1)
    }

    pub fn create_object(&mut self) -> ObjectId {
        self.object_arena.push(Object::new());
        ObjectId(self.object_arena.len() - 1)
    }

    pub fn create_attribute(&mut self) -> AttributeId {
        self.attribute_arena.push(Attribute::new());
        AttributeId(self.attribute_arena.len() - 1)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.node_arena.get(id.0).ok_or_else(|| EndpointError::NotFound(format!("{:?}", id)))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.node_arena.get_mut(id.0).ok_or_else(|| EndpointError::NotFound(format!("{:?}", id)))
    }

    pub fn object(&self, id: ObjectId) -> Result<&Object> {
        self.object_arena.get(id.0).ok_or_else(|| EndpointError::NotFound(format!("{:?}", id)))
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Result<&mut Object> {
        self.object_arena.get_mut(id.0).ok_or_else(|| EndpointError::NotFound(format!("{:?}", id)))
    }

    pub fn attribute(&self, id: AttributeId) -> Result<&Attribute> {
        self.attribute_arena.get(id.0).ok_or_else(|| EndpointError::NotFound(format!("{:?}", id)))
    }

    pub fn attribute_mut(&mut self, id: AttributeId) -> Result<&mut Attribute> {
        self.attribute_arena.get_mut(id.0).ok_or_else(|| EndpointError::NotFound(format!("{:?}", id)))
    }

    /// Adds an implemented-interface tag to a node that is still being built
    pub fn declare_interface<I: Into<String>>(&mut self, node: NodeId, interface: I) -> Result<()> {
        self.ensure_unregistered(node)?;
        self.node_mut(node)?.declare_interface(interface.into());
        Ok(())
    }

    pub fn set_conforms<C: Into<String>>(&mut self, object: ObjectId, conforms: C) -> Result<()> {
        self.ensure_unregistered(object)?;
        self.object_mut(object)?.set_conforms(Some(conforms.into()));
        Ok(())
    }

    /// Creates a named object under `parent`
    pub fn add_object<C, N>(&mut self, parent: C, name: N) -> Result<ObjectId>
    where
        C: Into<ContainerId>,
        N: Into<String>,
    {
        let parent = parent.into();
        let name = name.into();
        self.check_child_object(parent, &name)?;
        let id = self.create_object();
        self.attach_object(parent, id, name)?;
        Ok(id)
    }

    /// Gives a detached object its name and parent
    pub fn attach_object<C, N>(&mut self, parent: C, child: ObjectId, name: N) -> Result<()>
    where
        C: Into<ContainerId>,
        N: Into<String>,
    {
        let parent = parent.into();
        let name = name.into();
        self.check_child_object(parent, &name)?;

        let object = self.object(child)?;
        if let Some(old) = object.name() {
            return Err(EndpointError::Modification(format!("object name is already set to {:?}", old)));
        }
        if object.parent().is_some() {
            return Err(EndpointError::Modification(format!("object {:?} already has a parent", name)));
        }
        if self.is_ancestor(child, parent) {
            return Err(EndpointError::Modification(format!("object {:?} can not contain itself", name)));
        }

        let object = self.object_mut(child)?;
        object.set_name(name.clone())?;
        object.set_parent(parent)?;
        match parent {
            ContainerId::Node(id) => self.node_mut(id)?.objects_mut().insert(name, child),
            ContainerId::Object(id) => self.object_mut(id)?.objects_mut().insert(name, child),
        };
        Ok(())
    }

    /// Creates a named attribute under `parent`. `AttributeType::Invalid` leaves the
    /// type to be fixed by the first value and `AttributeConstraint::Invalid` leaves
    /// the constraint unset.
    pub fn add_attribute<N: Into<String>>(
        &mut self,
        parent: ObjectId,
        name: N,
        typ: AttributeType,
        constraint: AttributeConstraint,
    ) -> Result<AttributeId> {
        let name = name.into();
        self.check_child_attribute(parent, &name)?;
        let id = self.create_attribute();
        {
            let attribute = self.attribute_mut(id)?;
            if typ != AttributeType::Invalid {
                attribute.set_type(typ)?;
            }
            if constraint != AttributeConstraint::Invalid {
                attribute.set_constraint(constraint)?;
            }
        }
        self.attach_attribute(parent, id, name)?;
        Ok(id)
    }

    pub fn attach_attribute<N: Into<String>>(&mut self, parent: ObjectId, child: AttributeId, name: N) -> Result<()> {
        let name = name.into();
        self.check_child_attribute(parent, &name)?;

        let attribute = self.attribute_mut(child)?;
        if let Some(old) = attribute.name() {
            return Err(EndpointError::Modification(format!("attribute name is already set to {:?}", old)));
        }
        if attribute.parent().is_some() {
            return Err(EndpointError::Modification(format!("attribute {:?} already has a parent", name)));
        }
        attribute.set_name(name.clone())?;
        attribute.set_parent(parent)?;
        self.object_mut(parent)?.attributes_mut().insert(name, child);
        Ok(())
    }

    /// Attaches a node to the endpoint. From now on the node's subtree is frozen.
    pub fn attach_node<N: Into<String>>(&mut self, name: N, node: NodeId) -> Result<()> {
        let name = name.into();
        validate_name(&name)?;
        if self.nodes.contains_key(&name) {
            return Err(EndpointError::Modification(format!("endpoint already has a node named {:?}", name)));
        }
        let n = self.node(node)?;
        if n.is_registered() {
            return Err(EndpointError::Modification(format!(
                "node {:?} is already attached to an endpoint",
                n.name().unwrap_or_default()
            )));
        }
        if let Some(old) = n.name() {
            if old != name {
                return Err(EndpointError::Modification(format!("node name is already set to {:?}", old)));
            }
        }

        let n = self.node_mut(node)?;
        if n.name().is_none() {
            n.set_name(name.clone())?;
        }
        n.set_registered()?;
        self.nodes.insert(name, node);
        Ok(())
    }

    /// Whether the entity belongs to a node attached to the endpoint
    pub fn is_registered<E: Into<EntityId>>(&self, entity: E) -> bool {
        self.node_of(entity).and_then(|id| self.node(id).ok()).map(|n| n.is_registered()).unwrap_or(false)
    }

    /// Node at the top of the entity's parent chain, if the chain is complete
    pub fn node_of<E: Into<EntityId>>(&self, entity: E) -> Option<NodeId> {
        let mut current = match entity.into() {
            EntityId::Node(id) => return Some(id),
            EntityId::Object(id) => ContainerId::Object(id),
            EntityId::Attribute(id) => ContainerId::Object(self.attribute(id).ok()?.parent()?),
        };
        loop {
            match current {
                ContainerId::Node(id) => return Some(id),
                ContainerId::Object(id) => current = self.object(id).ok()?.parent()?,
            }
        }
    }

    /// Canonical topic path, e.g. `<uuid>/nodes/<n>/objects/<o>/attributes/<a>`
    pub fn topic_path<E: Into<EntityId>>(&self, entity: E) -> Result<String> {
        let entity = entity.into();
        let unattached = || EndpointError::NotFound(format!("{:?} is not attached to the endpoint", entity));

        let mut levels: Vec<&str> = Vec::new();
        let mut current = match entity {
            EntityId::Attribute(id) => {
                let attribute = self.attribute(id)?;
                levels.push(attribute.name().ok_or_else(unattached)?);
                levels.push(ATTRIBUTES);
                ContainerId::Object(attribute.parent().ok_or_else(unattached)?)
            }
            EntityId::Object(id) => ContainerId::Object(id),
            EntityId::Node(id) => ContainerId::Node(id),
        };
        loop {
            match current {
                ContainerId::Object(id) => {
                    let object = self.object(id)?;
                    levels.push(object.name().ok_or_else(unattached)?);
                    levels.push(OBJECTS);
                    current = object.parent().ok_or_else(unattached)?;
                }
                ContainerId::Node(id) => {
                    let node = self.node(id)?;
                    if !node.is_registered() {
                        return Err(unattached());
                    }
                    levels.push(node.name().ok_or_else(unattached)?);
                    levels.push(NODES);
                    levels.push(&self.uuid);
                    break;
                }
            }
        }
        levels.reverse();
        Ok(levels.join(&SEPARATOR.to_string()))
    }

    /// Walks `levels` (`<uuid>, nodes, <n>, objects, <o>, ..., attributes, <a>`) down to an attribute
    pub fn resolve(&self, levels: &[&str]) -> Result<AttributeId> {
        let mut levels = levels.iter().copied();

        match levels.next() {
            Some(uuid) if uuid == self.uuid => {}
            other => {
                return Err(EndpointError::NotFound(format!("endpoint {:?}", other.unwrap_or_default())));
            }
        }
        match levels.next() {
            Some(NODES) => {}
            other => return Err(EndpointError::NotFound(format!("segment {:?}, expected {:?}", other, NODES))),
        }
        let name = next_name(&mut levels, "node")?;
        let node = self.node_by_name(name).ok_or_else(|| EndpointError::NotFound(format!("node {:?}", name)))?;

        let mut container = ContainerId::Node(node);
        loop {
            match levels.next() {
                Some(OBJECTS) => {
                    let name = next_name(&mut levels, "object")?;
                    let child = match container {
                        ContainerId::Node(id) => self.node(id)?.object(name),
                        ContainerId::Object(id) => self.object(id)?.object(name),
                    };
                    let child = child.ok_or_else(|| EndpointError::NotFound(format!("object {:?}", name)))?;
                    container = ContainerId::Object(child);
                }
                Some(ATTRIBUTES) => {
                    let name = next_name(&mut levels, "attribute")?;
                    let ContainerId::Object(object) = container else {
                        return Err(EndpointError::NotFound(format!("attribute {:?} outside of an object", name)));
                    };
                    let id = self
                        .object(object)?
                        .attribute(name)
                        .ok_or_else(|| EndpointError::NotFound(format!("attribute {:?}", name)))?;
                    if let Some(extra) = levels.next() {
                        return Err(EndpointError::NotFound(format!("segment {:?} after attribute {:?}", extra, name)));
                    }
                    return Ok(id);
                }
                Some(other) => return Err(EndpointError::NotFound(format!("segment {:?}", other))),
                None => return Err(EndpointError::NotFound("path does not end in an attribute".into())),
            }
        }
    }

    #[inline]
    pub fn resolve_path(&self, path: &str) -> Result<AttributeId> {
        self.resolve(&split_levels(path))
    }

    fn ensure_unregistered<E: Into<EntityId>>(&self, entity: E) -> Result<()> {
        let entity = entity.into();
        if self.is_registered(entity) {
            return Err(EndpointError::Modification(format!(
                "{:?} belongs to a node that is already attached to the endpoint",
                entity
            )));
        }
        Ok(())
    }

    fn check_child_object(&self, parent: ContainerId, name: &str) -> Result<()> {
        validate_name(name)?;
        self.ensure_unregistered(parent)?;
        let exists = match parent {
            ContainerId::Node(id) => self.node(id)?.objects().contains_key(name),
            ContainerId::Object(id) => self.object(id)?.objects().contains_key(name),
        };
        if exists {
            return Err(EndpointError::Modification(format!("an object named {:?} already exists", name)));
        }
        Ok(())
    }

    fn check_child_attribute(&self, parent: ObjectId, name: &str) -> Result<()> {
        validate_name(name)?;
        self.ensure_unregistered(parent)?;
        if self.object(parent)?.attributes().contains_key(name) {
            return Err(EndpointError::Modification(format!("an attribute named {:?} already exists", name)));
        }
        Ok(())
    }

    /// Whether `object` is `container` or one of its ancestors
    fn is_ancestor(&self, object: ObjectId, container: ContainerId) -> bool {
        let mut current = Some(container);
        while let Some(c) = current {
            match c {
                ContainerId::Node(_) => return false,
                ContainerId::Object(id) if id == object => return true,
                ContainerId::Object(id) => current = self.object(id).ok().and_then(|o| o.parent()),
            }
        }
        false
    }
}

fn next_name<'a, I: Iterator<Item = &'a str>>(levels: &mut I, what: &str) -> Result<&'a str> {
    levels.next().filter(|s| !s.is_empty()).ok_or_else(|| EndpointError::NotFound(format!("{} name", what)))
}
