use anyhow::{Context, Result};
use std::sync::Arc;

use playtime::clock::{ClockSync, HttpTimeSource, SystemClock};

use super::utils::{block_on, format_duration};

/// Take one clock sample against the server and print it
pub fn run_time(server: &str) -> Result<()> {
    let source = Arc::new(HttpTimeSource::new(server)?);
    let sync = ClockSync::new(source, Arc::new(SystemClock));

    block_on(async move {
        let sample = sync
            .sync_once()
            .await
            .context("Failed to sample server time")?;

        let offset_ms = sample.offset.num_milliseconds();
        println!("Server time:  {}", sync.now().format("%Y-%m-%d %H:%M:%S%.3f %Z"));
        println!("Round trip:   {} ms", sample.rtt.num_milliseconds());
        println!(
            "Local clock:  {} ms {} ({})",
            offset_ms.abs(),
            if offset_ms > 0 { "behind" } else { "ahead" },
            format_duration(sample.offset)
        );
        Ok(())
    })
}
