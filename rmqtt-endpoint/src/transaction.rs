use crate::model::{AttributeId, AttributeValue};

/// Attribute changes that are applied together and published as one `@transaction` message
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    changes: Vec<(AttributeId, AttributeValue)>,
}

impl Transaction {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn set<V: Into<AttributeValue>>(&mut self, attribute: AttributeId, value: V) -> &mut Self {
        self.changes.push((attribute, value.into()));
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    #[inline]
    pub fn changes(&self) -> &[(AttributeId, AttributeValue)] {
        &self.changes
    }

    /// Attributes in first-change order, without repetitions
    pub fn attributes(&self) -> Vec<AttributeId> {
        let mut ids: Vec<AttributeId> = Vec::with_capacity(self.changes.len());
        for (id, _) in self.changes.iter() {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction() {
        let mut tx = Transaction::new();
        assert!(tx.is_empty());
        tx.set(AttributeId(1), 1).set(AttributeId(0), true).set(AttributeId(1), 2);
        assert_eq!(tx.len(), 3);
        assert_eq!(tx.attributes(), vec![AttributeId(1), AttributeId(0)]);
        assert_eq!(tx.changes()[2].1, AttributeValue::Integer(2));
    }
}
