use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::cadence::Cadence;
use crate::hysteresis::Inference;

/// What one `check_state` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// The poll returned no samples; nothing was written.
    NoSamples,
    /// Power and relay state were published.
    Published(Inference),
}

/// Capabilities shared by every schedulable device.
#[async_trait]
pub trait Device: Send + Sync {
    fn id(&self) -> &str;

    fn device_type(&self) -> &'static str;

    fn display_name(&self) -> &str;

    /// Parameters to persist so the device can be rebuilt by its factory.
    fn parameters(&self) -> BTreeMap<String, String>;

    fn custom_identifiers(&self) -> &BTreeMap<String, String>;

    fn cadence(&self) -> &Cadence;

    /// Poll, decide, publish. Callers serialize invocations; the device does
    /// no locking of its own.
    async fn check_state(&self) -> anyhow::Result<CheckOutcome>;
}

/// Lease / registration key: `"{device_type}-{id}"`.
pub fn lock_key(device: &dyn Device) -> String {
    format!("{}-{}", device.device_type(), device.id())
}
