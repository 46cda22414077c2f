//! Session management: reading buffers, flush cycles, registry.

pub mod buffer;
pub mod flush;
pub mod registry;

pub use flush::FlushSettings;
pub use registry::{IngestTarget, SessionRegistry};
