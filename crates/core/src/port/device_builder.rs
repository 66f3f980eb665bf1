// Device Builder Port
// Device-type specific construction: transport hooks and readiness profile

use crate::domain::error::Result;
use crate::domain::{
    Communication, CommunicationArgs, DeviceConfig, DeviceIdentity, NullCommunication,
    ReadinessProfile,
};

/// Device-type specific parts of a new device handle
pub struct DeviceParts {
    pub communication: Box<dyn Communication>,
    pub readiness: ReadinessProfile,
}

impl DeviceParts {
    pub fn new(communication: Box<dyn Communication>, readiness: ReadinessProfile) -> Self {
        Self {
            communication,
            readiness,
        }
    }

    /// No transport, no health checks
    pub fn bare() -> Self {
        Self::new(Box::new(NullCommunication::default()), ReadinessProfile::new())
    }
}

/// Builds the device-type specific parts of a handle.
///
/// Errors are reported as device creation failures and are never retried.
pub trait DeviceBuilder: Send + Sync {
    fn build(
        &self,
        identity: &DeviceIdentity,
        config: &DeviceConfig,
        comm_args: &CommunicationArgs,
    ) -> Result<DeviceParts>;
}

impl<F> DeviceBuilder for F
where
    F: Fn(&DeviceIdentity, &DeviceConfig, &CommunicationArgs) -> Result<DeviceParts> + Send + Sync,
{
    fn build(
        &self,
        identity: &DeviceIdentity,
        config: &DeviceConfig,
        comm_args: &CommunicationArgs,
    ) -> Result<DeviceParts> {
        self(identity, config, comm_args)
    }
}
