//! Background post-processing: actions, the orchestrator that runs them and
//! the serialized queue in front of the analysis provider

mod actions;
mod media;
mod orchestrator;
mod request_queue;

pub use actions::{Action, ActionRegistry, AnalyzeAction, OptimizeAction, PreviewAction};
pub use media::{render_text_preview, MediaLimits, MediaTransform, StandardMedia};
pub use orchestrator::{ActionState, ActionStatus, Orchestrator, PipelineProgress};
pub(crate) use orchestrator::publish_to_mirror;
pub use request_queue::{
    QueueWorker, QueuedRequest, RequestQueue, RetryPolicy, Upstream, UpstreamReply,
};
