use seatvm_common::{Runtime, SeatError, SeatProvider};
use std::sync::Arc;

/// The providers available on this host, one per [`Runtime`].
///
/// A workshop picks its provider once from its declared runtime and keeps it.
#[derive(Clone, Default)]
pub struct ProviderSet {
    micro_vm: Option<Arc<dyn SeatProvider>>,
    container: Option<Arc<dyn SeatProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn SeatProvider>) -> Self {
        match provider.runtime() {
            Runtime::MicroVm => self.micro_vm = Some(provider),
            Runtime::Container => self.container = Some(provider),
        }
        self
    }

    pub fn for_runtime(&self, runtime: Runtime) -> seatvm_common::Result<Arc<dyn SeatProvider>> {
        let provider = match runtime {
            Runtime::MicroVm => &self.micro_vm,
            Runtime::Container => &self.container,
        };
        provider
            .clone()
            .ok_or_else(|| SeatError::Config(format!("no {runtime} provider configured on this host")))
    }

    pub fn runtimes(&self) -> Vec<Runtime> {
        let mut runtimes = Vec::new();
        if self.micro_vm.is_some() {
            runtimes.push(Runtime::MicroVm);
        }
        if self.container.is_some() {
            runtimes.push(Runtime::Container);
        }
        runtimes
    }
}
