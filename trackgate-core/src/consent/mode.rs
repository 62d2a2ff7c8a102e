//! Consent-mode signalling to the collector
//!
//! A `default` command goes out before the collector script loads, with a
//! wait-for-update delay so the collector never processes data under an
//! undefined consent state. An `update` command follows every change.

use crate::collector::{CollectorCall, ConsentMode, ConsentParams};
use crate::error::{Error, Result};
use crate::host::DispatchHandle;

#[derive(Debug, Clone, Copy)]
pub struct ConsentModeSync {
    wait_for_update_ms: u64,
}

impl ConsentModeSync {
    pub fn new(wait_for_update_ms: u64) -> Self {
        Self { wait_for_update_ms }
    }

    pub fn wait_for_update_ms(&self) -> u64 {
        self.wait_for_update_ms
    }

    /// Announce consent defaults. Call before the collector loads.
    pub fn init_consent_mode(
        &self,
        handle: &dyn DispatchHandle,
        analytics: bool,
        marketing: bool,
    ) -> Result<()> {
        let mut params = ConsentParams::from_flags(analytics, marketing);
        params.wait_for_update = Some(self.wait_for_update_ms);
        send(handle, ConsentMode::Default, params)
    }

    /// Announce a consent change. Takes effect immediately.
    pub fn update_consent_mode(
        &self,
        handle: &dyn DispatchHandle,
        analytics: bool,
        marketing: bool,
    ) -> Result<()> {
        send(
            handle,
            ConsentMode::Update,
            ConsentParams::from_flags(analytics, marketing),
        )
    }
}

impl Default for ConsentModeSync {
    fn default() -> Self {
        Self::new(crate::config::ConsentConfig::default().wait_for_update_ms)
    }
}

fn send(handle: &dyn DispatchHandle, mode: ConsentMode, params: ConsentParams) -> Result<()> {
    handle
        .dispatch(CollectorCall::Consent { mode, params })
        .map_err(|e| Error::ConsentUpdate(format!("{} command failed: {}", mode.as_str(), e)))
}
