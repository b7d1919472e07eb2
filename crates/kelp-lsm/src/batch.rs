use crate::column_family::ColumnFamilyHandle;
use bytes::Bytes;

/// A single operation in a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        cf: ColumnFamilyHandle,
        key: Bytes,
        value: Bytes,
    },
    Delete {
        cf: ColumnFamilyHandle,
        key: Bytes,
    },
}

impl BatchOp {
    pub fn column_family(&self) -> &ColumnFamilyHandle {
        match self {
            Self::Put { cf, .. } | Self::Delete { cf, .. } => cf,
        }
    }
}

/// Ordered group of writes applied together by `Engine::put`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &mut self,
        cf: &ColumnFamilyHandle,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> &mut Self {
        self.ops.push(BatchOp::Put {
            cf: cf.clone(),
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, cf: &ColumnFamilyHandle, key: impl Into<Bytes>) -> &mut Self {
        self.ops.push(BatchOp::Delete {
            cf: cf.clone(),
            key: key.into(),
        });
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Key and value bytes carried by the batch.
    pub fn payload_bytes(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                BatchOp::Put { key, value, .. } => key.len() + value.len(),
                BatchOp::Delete { key, .. } => key.len(),
            })
            .sum()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_building() {
        let cf = ColumnFamilyHandle::new(1, 0, "default");
        let mut batch = WriteBatch::new();
        batch.put(&cf, "k1", "v1").put(&cf, "k2", "value2").delete(&cf, "k1");

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.payload_bytes(), 2 + 2 + 2 + 6 + 2);
        assert_eq!(batch.ops()[2].column_family().name(), "default");

        batch.clear();
        assert!(batch.is_empty());
    }
}
