//! Common imports for typical engine usage.
pub use crate::{
    Applied, ChannelHandler, MessageReconciler, MessageStore, PollHandle, SpanSnapshot, SpanTree,
    StreamConnection, StreamHandler, StreamNotice, StreamRegistry, SupervisedStream, TaskEvent,
    TaskId, Taskwatch, TaskwatchConfig, TaskwatchError, TracePoller, TraceUpdate,
};
