//! The atomic long primitive (spec §1, §3, §4.6).

use std::sync::Arc;

use crate::cache::{CacheBackend, ScalarValue};
use crate::key::InternalKey;
use crate::proxy::{expect_scalar, replace_scalar, AnyProxy, Kind, RemovedFlag};
use crate::value::AtomicLongValue;

pub struct AtomicLong {
    name: String,
    key: InternalKey,
    backend: Arc<dyn CacheBackend>,
    removed: RemovedFlag,
}

impl AtomicLong {
    pub(crate) fn new(name: String, key: InternalKey, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            name,
            key,
            backend,
            removed: RemovedFlag::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self) -> crate::Result<i64> {
        self.removed.check(&self.name)?;
        let value = self.backend.scalar_get(&self.key).await?;
        let value = expect_scalar(value, Kind::AtomicLong, &self.name)?;
        match value {
            ScalarValue::AtomicLong(v) => Ok(v.v),
            _ => unreachable!("expect_scalar already checked the kind"),
        }
    }

    pub async fn set(&self, new_value: i64) -> crate::Result<()> {
        self.removed.check(&self.name)?;
        replace_scalar(
            self.backend.as_ref(),
            &self.key,
            Kind::AtomicLong,
            &self.name,
            |_| Ok(ScalarValue::AtomicLong(AtomicLongValue { v: new_value })),
        )
        .await?;
        Ok(())
    }

    pub async fn increment_and_get(&self) -> crate::Result<i64> {
        self.add_and_get(1).await
    }

    pub async fn add_and_get(&self, delta: i64) -> crate::Result<i64> {
        self.removed.check(&self.name)?;
        let next = replace_scalar(
            self.backend.as_ref(),
            &self.key,
            Kind::AtomicLong,
            &self.name,
            |current| match current {
                ScalarValue::AtomicLong(v) => {
                    Ok(ScalarValue::AtomicLong(AtomicLongValue { v: v.v + delta }))
                }
                _ => unreachable!("expect_scalar already checked the kind"),
            },
        )
        .await?;
        match next {
            ScalarValue::AtomicLong(v) => Ok(v.v),
            _ => unreachable!(),
        }
    }

    /// Returns `true` iff the stored value equalled `expect` and was
    /// replaced with `update`.
    pub async fn compare_and_set(&self, expect: i64, update: i64) -> crate::Result<bool> {
        self.removed.check(&self.name)?;
        let mut swapped = false;
        replace_scalar(
            self.backend.as_ref(),
            &self.key,
            Kind::AtomicLong,
            &self.name,
            |current| match current {
                ScalarValue::AtomicLong(v) if v.v == expect => {
                    swapped = true;
                    Ok(ScalarValue::AtomicLong(AtomicLongValue { v: update }))
                }
                other => Ok(other),
            },
        )
        .await?;
        Ok(swapped)
    }
}

impl AnyProxy for AtomicLong {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::AtomicLong
    }

    fn on_removed(&self) {
        self.removed.mark_removed();
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}
