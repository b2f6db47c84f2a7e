use anyhow::Result;

use crate::device::Device;
use crate::error::Error;
use crate::tensor::{DType, TensorValue};

/// Caller-provided storage for a fetched output.
///
/// The runtime copies the fetched value into whatever `allocate` returns, so
/// the returned value must have the requested dtype and shape.
pub trait OutputAllocator: Send + Sync {
    fn allocate(&self, dtype: DType, shape: &[usize], device: Device) -> Result<TensorValue>;
}

/// Copy a computed value into storage the caller owns.
pub(crate) fn materialize(
    value: &TensorValue,
    allocator: Option<&dyn OutputAllocator>,
    device: Device,
) -> crate::Result<TensorValue> {
    match allocator {
        Some(allocator) => {
            let mut out = allocator
                .allocate(value.dtype(), value.shape(), device)
                .map_err(|err| Error::allocation(format!("output allocator failed: {:#}", err)))?;
            out.copy_from(value).map_err(|err| {
                Error::allocation(format!("output allocator returned unusable storage: {}", err))
            })?;
            Ok(out)
        }
        None => value
            .try_clone()
            .map_err(|err| Error::allocation(format!("{:#}", err))),
    }
}

/// Fill the caller's fetch slots.
///
/// Slots whose dtype and shape already match are overwritten in place; any
/// other layout replaces the whole vector. New storage is allocated before
/// any slot is touched.
pub(crate) fn store_fetches(
    slots: &mut Vec<TensorValue>,
    values: &[&TensorValue],
    allocators: &[Option<&dyn OutputAllocator>],
    devices: &[Device],
) -> crate::Result<()> {
    let reuse = slots.len() == values.len();
    let mut fresh = Vec::with_capacity(values.len());
    for (index, value) in values.iter().enumerate() {
        let in_place = reuse
            && allocators[index].is_none()
            && slots[index].dtype() == value.dtype()
            && slots[index].shape() == value.shape();
        if in_place {
            fresh.push(None);
        } else {
            fresh.push(Some(materialize(value, allocators[index], devices[index])?));
        }
    }
    if !reuse {
        // nothing is in place when the slot count differs
        *slots = fresh.into_iter().flatten().collect();
        return Ok(());
    }
    for ((slot, value), fresh) in slots.iter_mut().zip(values.iter()).zip(fresh) {
        match fresh {
            Some(fresh) => *slot = fresh,
            None => slot
                .copy_from(value)
                .map_err(|err| Error::Internal(err.context("in-place fetch copy")))?,
        }
    }
    Ok(())
}
