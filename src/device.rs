//! Device-state collaborator.
//!
//! Supplies the identity (kind + serial) of the active pump so that
//! device-originated records can be matched even when a driver only reports
//! its own event id.

use crate::types::DeviceIds;

/// Identity of the active pump or CGM.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub pump_type: String,
    pub pump_serial: String,
}

impl DeviceIdentity {
    pub fn new(pump_type: impl Into<String>, pump_serial: impl Into<String>) -> Self {
        Self {
            pump_type: pump_type.into(),
            pump_serial: pump_serial.into(),
        }
    }

    /// Fills missing type and serial in `ids` from this identity.
    ///
    /// Parts already present are left alone.
    pub fn complete(&self, ids: &mut DeviceIds) {
        if ids.pump_type.is_none() {
            ids.pump_type = Some(self.pump_type.clone());
        }
        if ids.pump_serial.is_none() {
            ids.pump_serial = Some(self.pump_serial.clone());
        }
    }
}

/// Provides the active device identity, if any.
pub trait DeviceState: Send + Sync {
    fn active_device(&self) -> Option<DeviceIdentity>;
}

/// No device connected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDevice;

impl DeviceState for NoDevice {
    fn active_device(&self) -> Option<DeviceIdentity> {
        None
    }
}

/// A fixed device, handy for tests and single-pump setups.
#[derive(Debug, Clone)]
pub struct FixedDevice(pub DeviceIdentity);

impl DeviceState for FixedDevice {
    fn active_device(&self) -> Option<DeviceIdentity> {
        Some(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_fills_only_missing_parts() {
        let identity = DeviceIdentity::new("OMNIPOD_DASH", "POD-1");

        let mut ids = DeviceIds {
            pump_id: Some(7),
            pump_type: None,
            pump_serial: Some("OTHER".into()),
        };
        identity.complete(&mut ids);

        assert_eq!(ids.pump_type.as_deref(), Some("OMNIPOD_DASH"));
        assert_eq!(ids.pump_serial.as_deref(), Some("OTHER"));
        assert!(ids.key().is_some());
    }

    #[test]
    fn test_defaults() {
        assert!(NoDevice.active_device().is_none());
        let fixed = FixedDevice(DeviceIdentity::new("X", "1"));
        assert_eq!(fixed.active_device().unwrap().pump_serial, "1");
    }
}
