use anyhow::Result;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{info, warn};

use playtime::broadcast::ObserverView;
use playtime::client::ApiClient;
use playtime::clock::{ClockSync, RESYNC_INTERVAL_SECS};
use playtime::sessions::Actor;

use super::utils::{block_on, client, print_sessions, synced_clock};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Render every session's countdown once a second until Ctrl+C
pub fn run_watch(server: &str, actor: &Actor) -> Result<()> {
    let client = client(server, actor)?;

    block_on(async move {
        let clock = synced_clock(client.clone()).await;
        let resync = clock.clone().spawn(Duration::from_secs(RESYNC_INTERVAL_SECS));

        tokio::select! {
            result = watch(&client, &clock) => {
                resync.abort();
                result
            }
            _ = tokio::signal::ctrl_c() => {
                resync.abort();
                Ok(())
            }
        }
    })
}

async fn watch(client: &ApiClient, clock: &Arc<ClockSync>) -> Result<()> {
    loop {
        // Subscribe before listing so nothing committed in between is missed;
        // events older than the listing are discarded by revision
        let mut events = match client.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Cannot open event stream: {:#}", e);
                time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        let mut view = ObserverView::new();
        match client.list(None).await {
            Ok(sessions) => view.seed(sessions),
            Err(e) => {
                warn!("Cannot list sessions: {:#}", e);
                time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        }
        info!("Watching {} session(s)", view.len());

        let mut ticker = time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        view.apply(&event);
                    }
                    Some(Err(e)) => {
                        warn!("{:#}", e);
                        break;
                    }
                    None => {
                        warn!("Event stream closed by server");
                        break;
                    }
                },
                _ = ticker.tick() => render(&view, clock),
            }
        }

        time::sleep(RECONNECT_DELAY).await;
    }
}

fn render(view: &ObserverView, clock: &ClockSync) {
    // Clear screen, cursor home
    print!("\x1B[2J\x1B[H");
    let now = clock.now();
    println!(
        "Playtime  {}  (clock offset {} ms)",
        now.with_timezone(&chrono::Local).format("%H:%M:%S"),
        clock.offset().num_milliseconds()
    );
    println!();
    print_sessions(&view.sessions(), now);
}
