//! Import pipelines for bringing external agent deployments into SerialAgent.

pub mod openclaw;
