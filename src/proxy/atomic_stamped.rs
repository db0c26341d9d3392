//! The atomic stamped reference primitive (spec §1, §3, §4.6): a value
//! paired with a stamp, so a compare-and-set can be conditioned on the
//! stamp alone, the value alone, or both.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{CacheBackend, ScalarValue};
use crate::key::InternalKey;
use crate::proxy::{expect_scalar, replace_scalar, AnyProxy, Kind, RemovedFlag};

pub struct AtomicStamped<T, S> {
    name: String,
    key: InternalKey,
    backend: Arc<dyn CacheBackend>,
    removed: RemovedFlag,
    _marker: PhantomData<fn() -> (T, S)>,
}

impl<T, S> AtomicStamped<T, S>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
    S: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
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

    pub async fn get(&self) -> crate::Result<(T, S)> {
        self.removed.check(&self.name)?;
        let value = self.backend.scalar_get(&self.key).await?;
        let value = expect_scalar(value, Kind::Stamped, &self.name)?;
        decode(value, &self.name)
    }

    pub async fn set(&self, value: T, stamp: S) -> crate::Result<()> {
        self.removed.check(&self.name)?;
        let encoded = encode(&value, &stamp)?;
        replace_scalar(
            self.backend.as_ref(),
            &self.key,
            Kind::Stamped,
            &self.name,
            |_| Ok(encoded),
        )
        .await?;
        Ok(())
    }

    /// Returns `true` iff the stored value and stamp equalled
    /// `(expect_value, expect_stamp)` and were replaced.
    pub async fn compare_and_set(
        &self,
        expect_value: &T,
        update_value: T,
        expect_stamp: &S,
        update_stamp: S,
    ) -> crate::Result<bool> {
        self.removed.check(&self.name)?;
        let mut swapped = false;
        let update_encoded = encode(&update_value, &update_stamp)?;
        replace_scalar(
            self.backend.as_ref(),
            &self.key,
            Kind::Stamped,
            &self.name,
            |current| {
                let (current_v, current_s): (T, S) = decode(current.clone(), "")?;
                if &current_v == expect_value && &current_s == expect_stamp {
                    swapped = true;
                    Ok(update_encoded)
                } else {
                    Ok(current)
                }
            },
        )
        .await?;
        Ok(swapped)
    }
}

fn encode<T: Serialize, S: Serialize>(value: &T, stamp: &S) -> crate::Result<ScalarValue> {
    Ok(ScalarValue::Stamped {
        v: serde_json::to_value(value).map_err(crate::Error::cache_failure)?,
        stamp: serde_json::to_value(stamp).map_err(crate::Error::cache_failure)?,
    })
}

fn decode<T: DeserializeOwned, S: DeserializeOwned>(
    value: ScalarValue,
    name: &str,
) -> crate::Result<(T, S)> {
    match value {
        ScalarValue::Stamped { v, stamp } => {
            let v = serde_json::from_value(v).map_err(crate::Error::cache_failure)?;
            let stamp = serde_json::from_value(stamp).map_err(crate::Error::cache_failure)?;
            Ok((v, stamp))
        }
        other => Err(crate::Error::TypeMismatch {
            name: name.to_string(),
            existing: other.kind().label(),
            requested: Kind::Stamped.label(),
        }),
    }
}

impl<T, S> AnyProxy for AtomicStamped<T, S>
where
    T: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::Stamped
    }

    fn on_removed(&self) {
        self.removed.mark_removed();
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}
