//! API Module
//!
//! Response relaying and usage accounting.

pub mod relay;
pub mod usage;

pub use relay::{AccountingSink, RelayOutcome, RelayScopes, Tap};
pub use usage::{parse_sse_line, TokenUsage, UsageRecorder, UsageScanner};
