mod catalog_db;
mod catalog_types;
mod disk_copy_mgr;
mod garbage_collector;
mod migration_orchestrator;
mod placement_policy;
mod recall_orchestrator;
mod request_dispatcher;
mod resource_catalog;
mod stager_svc;

#[cfg(test)]
mod stager_svc_tests;
#[cfg(test)]
mod test_util;

pub use catalog_db::{CatalogPool, CatalogTxn};
pub use catalog_types::*;
pub use disk_copy_mgr::DiskCopyMgr;
pub use garbage_collector::{GarbageCollector, GcReport};
pub use migration_orchestrator::{MigrationOrchestrator, StreamsDiff};
pub use placement_policy::{PlacementCandidate, PlacementPolicy, WeightedFreeSpacePolicy};
pub use recall_orchestrator::RecallOrchestrator;
pub use request_dispatcher::{RequestDispatcher, RequestOutcome};
pub use resource_catalog::{FileClassDef, FileSystemDef, ResourceCatalog, SvcClassDef};
pub use stager_svc::{ExternalServices, StagerCatalogConfig, StagerSvc};

#[macro_use]
extern crate log;
