use std::collections::BTreeMap;

use super::ObjectId;
use crate::error::{EndpointError, Result};
use crate::topic::validate_name;

/// Top-level container attached directly to the endpoint
#[derive(Debug, Clone, Default)]
pub struct Node {
    name: Option<String>,
    registered: bool,
    interfaces: Vec<String>,
    objects: BTreeMap<String, ObjectId>,
}

impl Node {
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
            return Err(EndpointError::Modification(format!("node name is already set to {:?}", old)));
        }
        let name = name.into();
        validate_name(&name)?;
        self.name = Some(name);
        Ok(())
    }

    /// A node's only possible parent is the endpoint, so having a parent means being registered
    #[inline]
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub(crate) fn set_registered(&mut self) -> Result<()> {
        if self.registered {
            return Err(EndpointError::Modification(format!(
                "node {:?} is already attached to an endpoint",
                self.name().unwrap_or_default()
            )));
        }
        self.registered = true;
        Ok(())
    }

    /// Implemented-interface tags in declaration order
    #[inline]
    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub(crate) fn declare_interface(&mut self, interface: String) {
        if !self.interfaces.contains(&interface) {
            self.interfaces.push(interface);
        }
    }

    #[inline]
    pub fn objects(&self) -> &BTreeMap<String, ObjectId> {
        &self.objects
    }

    #[inline]
    pub fn object(&self, name: &str) -> Option<ObjectId> {
        self.objects.get(name).copied()
    }

    pub(crate) fn objects_mut(&mut self) -> &mut BTreeMap<String, ObjectId> {
        &mut self.objects
    }
}
