pub mod health;
pub mod parser;
pub mod selectors;
pub mod sinks;
pub mod store;
pub mod transport;

pub use health::{HealthReport, write_health};
pub use parser::HtmlStructureParser;
pub use selectors::{Candidate, SelectorMatch, SelectorStrategy, default_title_candidates, try_select};
pub use sinks::{DataRecord, DeadLetterRecord, JsonlDeadLetterSink, JsonlResultSink, RunTally};
pub use store::{FileFingerprintStore, StoredFingerprint};
pub use transport::ReqwestTransport;
