mod history;
mod summary;

pub use history::{refine_prompt, HistoryEntry, RecordedEntry, SessionRecord};
pub use summary::{write_summary, SessionSummary};
