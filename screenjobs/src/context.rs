use crate::config::Config;
use crate::ledger::Ledger;
use crate::programs::{ProgramHost, ProgramRegistry};
use crate::provision::{Provisioner, VirtualenvProvisioner};
use crate::registry::JobRegistry;
use crate::screen::Screen;
use crate::store::{MemoryStore, Persistence};
use std::sync::Arc;

/// Everything a supervisor and its runs share, built once per host.
pub struct Context {
    pub config: Config,
    pub screen: Arc<dyn Screen>,
    pub programs: ProgramHost,
    pub registry: JobRegistry,
    pub ledger: Ledger,
}

impl Context {
    pub fn new(
        config: Config,
        screen: Arc<dyn Screen>,
        store: Arc<dyn Persistence>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Arc<Self> {
        let registry = JobRegistry::new(config.sandbox.clone(), store.clone(), provisioner);
        let ledger = Ledger::new(store);
        Arc::new(Self {
            programs: ProgramHost::new(screen.clone(), ProgramRegistry::builtin(), ledger.clone()),
            ledger,
            registry,
            screen,
            config,
        })
    }

    /// An in-memory context whose environments are built with virtualenv.
    pub fn in_memory(config: Config, screen: Arc<dyn Screen>) -> Arc<Self> {
        let provisioner = Arc::new(VirtualenvProvisioner::from_config(&config.sandbox));
        Self::new(config, screen, Arc::new(MemoryStore::new()), provisioner)
    }
}
