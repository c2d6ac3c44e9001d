//! Hardware claims through libusb
//!
//! Claiming opens the device, detaches any kernel driver bound to its
//! interfaces and claims every interface of the active configuration.
//! Releasing undoes this and re-attaches the drivers that were detached, so
//! the host gets the device back in its original state.

use super::enumerator::bus_id_of;
use claim::{BackendError, ClaimBackend, ClaimGrant, ClaimMethod};
use protocol::BusId;
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

struct HeldDevice {
    handle: DeviceHandle<Context>,
    grant: ClaimGrant,
    claimed_interfaces: Vec<u8>,
    detached_interfaces: Vec<u8>,
}

/// Claim backend used by the privileged claimer
pub struct RusbClaimBackend {
    context: Context,
    held: Mutex<HashMap<BusId, HeldDevice>>,
}

impl RusbClaimBackend {
    pub fn new() -> Result<Self, rusb::Error> {
        Ok(Self {
            context: Context::new()?,
            held: Mutex::new(HashMap::new()),
        })
    }

    /// Number of devices currently held open
    pub fn held_count(&self) -> usize {
        self.held.lock().map(|held| held.len()).unwrap_or(0)
    }

    fn find_device(&self, bus_id: &BusId) -> Result<Device<Context>, BackendError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        devices
            .iter()
            .find(|device| {
                match device.port_numbers() {
                    Ok(ports) if !ports.is_empty() => {
                        &bus_id_of(device.bus_number(), &ports) == bus_id
                    }
                    _ => false,
                }
            })
            .ok_or(BackendError::NotFound)
    }

    fn take_device(&self, bus_id: &BusId) -> Result<HeldDevice, BackendError> {
        let device = self.find_device(bus_id)?;
        let descriptor = device.device_descriptor().map_err(map_rusb_error)?;
        let handle = device.open().map_err(map_rusb_error)?;
        debug!("Opened {}", bus_id);

        let mut held = HeldDevice {
            handle,
            grant: ClaimGrant {
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
                device_class: descriptor.class_code(),
                device_subclass: descriptor.sub_class_code(),
                device_protocol: descriptor.protocol_code(),
                method: ClaimMethod::DirectClaim,
            },
            claimed_interfaces: Vec::new(),
            detached_interfaces: Vec::new(),
        };

        let interfaces: Vec<u8> = match device.active_config_descriptor() {
            Ok(config) => config.interfaces().map(|i| i.number()).collect(),
            Err(e) => {
                warn!("{} has no active configuration: {}", bus_id, e);
                Vec::new()
            }
        };

        for number in interfaces {
            if let Err(e) = claim_interface(&mut held, number) {
                warn!("Failed to claim interface {} of {}: {}", number, bus_id, e);
                give_back(bus_id, held);
                return Err(BackendError::Failed(format!(
                    "cannot claim interface {}: {}",
                    number, e
                )));
            }
        }

        if !held.detached_interfaces.is_empty() {
            held.grant.method = ClaimMethod::DriverDetach;
        }
        Ok(held)
    }
}

impl ClaimBackend for RusbClaimBackend {
    fn claim(&self, bus_id: &BusId) -> Result<ClaimGrant, BackendError> {
        {
            let held = self
                .held
                .lock()
                .map_err(|_| BackendError::Failed("claim table poisoned".to_string()))?;
            if let Some(existing) = held.get(bus_id) {
                return Ok(existing.grant.clone());
            }
        }

        let device = self.take_device(bus_id)?;
        let grant = device.grant.clone();
        info!(
            "Claimed {} ({:04x}:{:04x}, {} interface(s), {:?})",
            bus_id,
            grant.vendor_id,
            grant.product_id,
            device.claimed_interfaces.len(),
            grant.method
        );

        self.held
            .lock()
            .map_err(|_| BackendError::Failed("claim table poisoned".to_string()))?
            .insert(bus_id.clone(), device);
        Ok(grant)
    }

    fn release(&self, bus_id: &BusId) -> Result<(), BackendError> {
        let device = self
            .held
            .lock()
            .map_err(|_| BackendError::Failed("claim table poisoned".to_string()))?
            .remove(bus_id);

        match device {
            Some(device) => {
                let failed = give_back(bus_id, device);
                if failed.is_empty() {
                    info!("Released {}", bus_id);
                    Ok(())
                } else {
                    Err(BackendError::Failed(format!(
                        "kernel driver not re-attached to interface(s) {:?}",
                        failed
                    )))
                }
            }
            None => {
                debug!("{} was not held", bus_id);
                Ok(())
            }
        }
    }
}

fn claim_interface(held: &mut HeldDevice, number: u8) -> Result<(), rusb::Error> {
    if held.handle.kernel_driver_active(number).unwrap_or(false) {
        held.handle.detach_kernel_driver(number)?;
        held.detached_interfaces.push(number);
        debug!("Detached kernel driver from interface {}", number);
    }
    held.handle.claim_interface(number)?;
    held.claimed_interfaces.push(number);
    Ok(())
}

/// Release interfaces and re-attach detached drivers
///
/// Returns the interfaces whose driver could not be re-attached.
fn give_back(bus_id: &BusId, mut held: HeldDevice) -> Vec<u8> {
    for number in held.claimed_interfaces.drain(..) {
        if let Err(e) = held.handle.release_interface(number) {
            warn!("Failed to release interface {} of {}: {}", number, bus_id, e);
        }
    }

    let mut failed = Vec::new();
    for number in held.detached_interfaces.drain(..) {
        match held.handle.attach_kernel_driver(number) {
            Ok(()) => debug!("Re-attached kernel driver to interface {} of {}", number, bus_id),
            Err(rusb::Error::NoDevice) => {
                debug!("{} is gone, nothing to re-attach", bus_id);
            }
            Err(e) => {
                warn!(
                    "Failed to re-attach kernel driver to interface {} of {}: {}",
                    number, bus_id, e
                );
                failed.push(number);
            }
        }
    }
    failed
}

fn map_rusb_error(e: rusb::Error) -> BackendError {
    match e {
        rusb::Error::NotFound | rusb::Error::NoDevice => BackendError::NotFound,
        rusb::Error::Access => {
            BackendError::Failed("permission denied (is the claimer running as root?)".to_string())
        }
        other => BackendError::Failed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            map_rusb_error(rusb::Error::NoDevice),
            BackendError::NotFound
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::Access),
            BackendError::Failed(ref reason) if reason.contains("permission")
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::Busy),
            BackendError::Failed(_)
        ));
    }
}
