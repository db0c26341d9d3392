//! The atomic reference primitive (spec §1, §3, §4.6). Generic over the
//! referenced type `T`; the backing cache only ever sees its JSON encoding
//! (see [`crate::cache::ScalarValue::Reference`]).

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{CacheBackend, ScalarValue};
use crate::key::InternalKey;
use crate::proxy::{expect_scalar, replace_scalar, AnyProxy, Kind, RemovedFlag};

pub struct AtomicReference<T> {
    name: String,
    key: InternalKey,
    backend: Arc<dyn CacheBackend>,
    removed: RemovedFlag,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AtomicReference<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(name: String, key: InternalKey, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            name,
            key,
            backend,
            removed: RemovedFlag::default(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self) -> crate::Result<T> {
        self.removed.check(&self.name)?;
        let value = self.backend.scalar_get(&self.key).await?;
        let value = expect_scalar(value, Kind::Reference, &self.name)?;
        decode(value, &self.name)
    }

    pub async fn set(&self, new_value: T) -> crate::Result<()> {
        self.removed.check(&self.name)?;
        let encoded =
            serde_json::to_value(&new_value).map_err(|err| crate::Error::cache_failure(err))?;
        replace_scalar(
            self.backend.as_ref(),
            &self.key,
            Kind::Reference,
            &self.name,
            |_| Ok(ScalarValue::Reference(encoded)),
        )
        .await?;
        Ok(())
    }

    /// Returns `true` iff the stored value equalled `expect` (by JSON
    /// encoding) and was replaced with `update`.
    pub async fn compare_and_set(&self, expect: &T, update: T) -> crate::Result<bool>
    where
        T: PartialEq,
    {
        self.removed.check(&self.name)?;
        let mut swapped = false;
        let update_encoded =
            serde_json::to_value(&update).map_err(|err| crate::Error::cache_failure(err))?;
        replace_scalar(
            self.backend.as_ref(),
            &self.key,
            Kind::Reference,
            &self.name,
            |current| match &current {
                ScalarValue::Reference(v) => {
                    let decoded: T = serde_json::from_value(v.clone())
                        .map_err(|err| crate::Error::cache_failure(err))?;
                    if &decoded == expect {
                        swapped = true;
                        Ok(ScalarValue::Reference(update_encoded))
                    } else {
                        Ok(current)
                    }
                }
                _ => unreachable!("expect_scalar already checked the kind"),
            },
        )
        .await?;
        Ok(swapped)
    }
}

fn decode<T: DeserializeOwned>(value: ScalarValue, name: &str) -> crate::Result<T> {
    match value {
        ScalarValue::Reference(v) => {
            serde_json::from_value(v).map_err(|err| crate::Error::cache_failure(err))
        }
        _ => Err(crate::Error::TypeMismatch {
            name: name.to_string(),
            existing: value.kind().label(),
            requested: Kind::Reference.label(),
        }),
    }
}

impl<T> AnyProxy for AtomicReference<T>
where
    T: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::Reference
    }

    fn on_removed(&self) {
        self.removed.mark_removed();
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}
