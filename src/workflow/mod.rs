pub mod pipeline;
pub mod portal;
pub mod scppp;
pub mod stage;
pub mod sunarp;

pub use pipeline::{PipelineSettings, QueryPipeline};
pub use portal::{Challenge, PortalConnector, PortalSession, QueryRequest};
pub use scppp::{ScpppConnector, ScpppSession};
pub use stage::{
    session_left_open, FailureReport, PipelineFailure, PipelineOutcome, PipelineStage, QuerySuccess,
};
pub use sunarp::{SunarpConnector, SunarpSession};
