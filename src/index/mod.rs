pub mod admission;
pub mod analyzers;
pub mod backup;
pub mod document;
pub mod engine;
pub mod facets;
pub mod fields;
pub mod file_set;
pub mod instance;
pub mod manager;
pub mod resources;
pub mod schema;
pub mod settings;
pub mod snapshot;
pub mod storage_size;

pub use admission::{AdmissionConfig, AdmissionGate, Permit, SchemaGate};
pub use backup::BackupStatus;
pub use instance::{IndexInstance, InstanceContext, InstanceDependent};
pub use manager::IndexInstanceManager;
pub use settings::{IndexSettings, RemoteMaster};
