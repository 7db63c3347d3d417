//! Incremental segmentation of streamed model output into prose, code and
//! thinking blocks.

mod batcher;
mod coordinator;
mod error;
mod fence;
mod ledger;
mod string_tracker;
mod types;

pub(crate) use coordinator::{CancelToken, StreamCoordinator};
pub(crate) use types::{
    BlockId, BlockKind, BlockSink, Fragment, FragmentKind, StreamMessage, StreamOutcome,
};

#[cfg(test)]
pub(crate) mod tests;
