//! Pod spec composition and workload manifest building for kubeproc
//!
//! A submission is turned into a workload object in three steps:
//!
//! 1. [`features::compose`] builds one [`ResourceFragment`] per enabled
//!    feature and merges them in a fixed order
//! 2. [`ExecutionPolicy`] validates the requested image and placement
//! 3. [`build_job`] or [`build_workflow`] assembles the object with the
//!    bookkeeping annotations
//!
//! Nothing here talks to the API server except secret discovery, which goes
//! through the [`SecretLister`] seam.

pub mod features;
pub mod fragment;
pub mod manifest;
pub mod policy;
pub mod process;
pub mod request;
pub mod workflow;

pub use features::{compose, discover_secrets, Features, SecretLister};
pub use fragment::ResourceFragment;
pub use manifest::{build_job, Bookkeeping};
pub use policy::{AllowList, ExecutionPolicy, Placement, PolicyConfig};
pub use process::{ContainerProcess, ProcessConfig, ResultArtifact};
pub use request::RequestParameters;
pub use workflow::{
    build_workflow, Workflow, WorkflowConfig, WorkflowSpec, WorkflowStatus, WorkflowTemplates,
};
