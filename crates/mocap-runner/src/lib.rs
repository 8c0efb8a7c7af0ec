pub mod align;
pub mod archive;
pub mod audit;
pub mod config;
pub mod events;
pub mod locate;
pub mod metadata;
pub mod pipeline;
pub mod record;
pub mod session;
pub mod settings;
pub mod table;

pub use align::{align_events, AlignError, AlignedEvents, FrameClock, OverflowPolicy};
pub use archive::{Archive, ArchiveStore, Dataset, JsonArchiveStore};
pub use audit::{Discrepancy, DiscrepancySink, FileDiscrepancyLog, MemoryDiscrepancyLog};
pub use config::PipelineConfig;
pub use events::{EventLog, EventLogError};
pub use locate::{locate_log, LocateError};
pub use metadata::{MetaValue, SessionMetadata};
pub use pipeline::{
    build_graph, clean_outputs, plan_pipeline, run_pipeline, PipelineContext, PipelineReport,
};
pub use session::{discover_sessions, Session};
pub use table::{FrameTable, TableError};
