//! The scanner agent cooperatively executes search jobs for its group:
//! it turns queued jobs into indexed prefilter queries, drains the candidate
//! iterators in adaptive batches, and confirms candidates with compiled
//! YARA rules.

#![forbid(unsafe_code)]

use eyre::Result;

use quarry_base::agent_main;
use scanner::Scanner;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    agent_main::<Scanner>().await
}
