//! Core domain types shared by every layer: build status and build events.

mod event;
mod status;

pub use event::{Event, MetadataField, Origin, OriginSource};
pub use status::BuildStatus;
