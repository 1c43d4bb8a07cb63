use anyhow::Result;

use playtime::billing::{daily_totals, BillingRates, ReportAnchor};
use playtime::sessions::{Actor, Session, SessionStatus};

use super::utils::{block_on, client, synced_clock};

pub struct ReportOptions {
    pub anchor: ReportAnchor,
    pub days: Option<usize>,
    pub rates: BillingRates,
}

/// Print billed totals per local calendar day, most recent first
pub fn run_report(options: ReportOptions, server: &str, actor: &Actor) -> Result<()> {
    let client = client(server, actor)?;

    block_on(async move {
        let clock = synced_clock(client.clone()).await;

        let sessions = billable(&options, client.list(None).await?);
        let mut totals = daily_totals(
            &sessions,
            &options.rates,
            options.anchor,
            clock.offset(),
            &chrono::Local,
        );
        if let Some(days) = options.days {
            totals.truncate(days);
        }

        println!(
            "Billing report ({} anchor, {} per {} min block)",
            options.anchor, options.rates.fee_per_block, options.rates.block_minutes
        );
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if totals.is_empty() {
            println!("No billable sessions");
            return Ok(());
        }

        for day in &totals {
            println!(
                "{}  {:>3} session(s)  {:>10}",
                day.date.format("%a %Y-%m-%d"),
                day.sessions,
                day.amount
            );
        }
        let grand: u64 = totals.iter().map(|d| d.amount).sum();
        println!();
        println!("Total: {}", grand);
        Ok(())
    })
}

/// Historical reports count confirmed exits only; the live view counts
/// everything that was not cancelled
fn billable(options: &ReportOptions, sessions: Vec<Session>) -> Vec<Session> {
    sessions
        .into_iter()
        .filter(|s| match options.anchor {
            ReportAnchor::Completion => s.status == SessionStatus::ConfirmedExit,
            ReportAnchor::Creation => s.status != SessionStatus::Cancelled,
        })
        .collect()
}
