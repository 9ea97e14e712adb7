//! Integration harness for a service's differential backup feature.
//!
//! The harness supervises the service as an external process, tails its
//! output while driving it over HTTP, and checks that the snapshots and
//! binary diffs it writes rebuild the data file byte for byte.

pub mod api;
pub mod backup;
pub mod environment;
pub mod error;
pub mod fixtures;
pub mod output;
pub mod poller;
pub mod process;
pub mod service_config;
pub mod supervisor;
pub mod verifier;

pub use api::RestClient;
pub use backup::{apply_diff, ArtifactKind, BackupArtifact, BackupArtifactSet, ContentDigest};
pub use environment::{Environment, ThrottleSetting};
pub use error::{HarnessError, Result};
pub use output::{OutputBuffer, OutputTailer, Snapshot, TailerExit};
pub use poller::{Poller, ReadinessCondition, WaitOptions};
pub use process::{LaunchSpec, ManagedProcess};
pub use service_config::{RestToken, ServiceConfig};
pub use supervisor::{ProcessSupervisor, SupervisorConfig, SupervisorState};
pub use verifier::{BackupTrigger, BackupVerifier, Scenario, VerifierConfig};
