//! Polling-based trace span feed.

mod poller;
mod span;

pub use poller::{PollHandle, PollPhase, SpanSnapshot, TickReport, TracePoller, TraceUpdate};
pub use span::{Span, SpanNode, SpanTree};

#[cfg(test)]
pub(crate) use span::tests::span as test_span;
