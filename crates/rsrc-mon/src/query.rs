use api_types::DeviceClass;
use tracing::trace;

use crate::device::with_device;
use crate::device::DeviceApi;
use crate::device::DeviceDescriptor;
use crate::device::DeviceHandle;
use crate::device::LoadSnapshot;
use crate::error::DeviceError;

/// Reads the live load of one module.
///
/// The device is opened for this call only and closed before returning,
/// whatever the outcome.
pub fn query<A>(
    api: &A,
    class: DeviceClass,
    descriptor: &DeviceDescriptor,
) -> Result<LoadSnapshot, DeviceError>
where
    A: DeviceApi + ?Sized,
{
    let raw = with_device(api, class, descriptor, |handle| {
        handle.query_status(class, descriptor.hw_id)
    })?;

    trace!(
        %class,
        module_id = descriptor.module_id,
        blk_name = %descriptor.blk_name,
        ?raw,
        "Queried device status"
    );

    Ok(LoadSnapshot::from(raw))
}
