pub mod matching;
pub mod router;

pub use matching::{match_rules, MatchError, MatchingConfig, RuleMatcher};
pub use router::{IngestError, IngestRouter};
