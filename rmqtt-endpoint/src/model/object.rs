use std::collections::BTreeMap;

use super::{AttributeId, ContainerId, ObjectId};
use crate::error::{EndpointError, Result};
use crate::topic::validate_name;

#[derive(Debug, Clone, Default)]
pub struct Object {
    name: Option<String>,
    parent: Option<ContainerId>,
    conforms: Option<String>,
    objects: BTreeMap<String, ObjectId>,
    attributes: BTreeMap<String, AttributeId>,
}

impl Object {
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
            return Err(EndpointError::Modification(format!("object name is already set to {:?}", old)));
        }
        let name = name.into();
        validate_name(&name)?;
        self.name = Some(name);
        Ok(())
    }

    #[inline]
    pub fn parent(&self) -> Option<ContainerId> {
        self.parent
    }

    pub(crate) fn set_parent(&mut self, parent: ContainerId) -> Result<()> {
        if self.parent.is_some() {
            return Err(EndpointError::Modification(format!(
                "object {:?} already has a parent",
                self.name().unwrap_or_default()
            )));
        }
        self.parent = Some(parent);
        Ok(())
    }

    /// Descriptive class tag of the object, if any
    #[inline]
    pub fn conforms(&self) -> Option<&str> {
        self.conforms.as_deref()
    }

    pub(crate) fn set_conforms(&mut self, conforms: Option<String>) {
        self.conforms = conforms;
    }

    #[inline]
    pub fn objects(&self) -> &BTreeMap<String, ObjectId> {
        &self.objects
    }

    #[inline]
    pub fn object(&self, name: &str) -> Option<ObjectId> {
        self.objects.get(name).copied()
    }

    #[inline]
    pub fn attributes(&self) -> &BTreeMap<String, AttributeId> {
        &self.attributes
    }

    #[inline]
    pub fn attribute(&self, name: &str) -> Option<AttributeId> {
        self.attributes.get(name).copied()
    }

    pub(crate) fn objects_mut(&mut self) -> &mut BTreeMap<String, ObjectId> {
        &mut self.objects
    }

    pub(crate) fn attributes_mut(&mut self) -> &mut BTreeMap<String, AttributeId> {
        &mut self.attributes
    }
}
