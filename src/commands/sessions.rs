use anyhow::Result;
use std::sync::Arc;

use playtime::client::ApiClient;
use playtime::clock::ClockSync;
use playtime::sessions::{Actor, NewSession, SessionPatch};

use super::utils::{block_on, client, print_session, print_sessions, synced_clock};
use crate::cli::{SessionCommands, SettingsCommands};

pub fn run_sessions_command(command: SessionCommands, server: &str, actor: &Actor) -> Result<()> {
    let client = client(server, actor)?;
    block_on(async move {
        let clock = synced_clock(client.clone()).await;
        sessions_command(command, &client, &clock).await
    })
}

async fn sessions_command(
    command: SessionCommands,
    client: &ApiClient,
    clock: &Arc<ClockSync>,
) -> Result<()> {
    match command {
        SessionCommands::List { status } => {
            let sessions = client.list(status).await?;
            let refs: Vec<_> = sessions.iter().collect();
            print_sessions(&refs, clock.now());
        }
        SessionCommands::Create {
            name,
            minutes,
            notes,
        } => {
            let session = client
                .create(&NewSession {
                    child_name: name,
                    duration_minutes: minutes,
                    notes,
                })
                .await?;
            print_session("Started session", &session, clock.now());
        }
        SessionCommands::Update {
            id,
            name,
            minutes,
            notes,
        } => {
            let patch = SessionPatch {
                child_name: name,
                notes,
                duration_minutes: minutes,
            };
            if patch == SessionPatch::default() {
                anyhow::bail!("Nothing to update; pass --name, --minutes or --notes");
            }
            let session = client.update(id, &patch).await?;
            print_session("Updated session", &session, clock.now());
        }
        SessionCommands::Pause { id } => {
            let session = client.pause(id).await?;
            print_session("Paused session", &session, clock.now());
        }
        SessionCommands::Resume { id } => {
            let session = client.resume(id).await?;
            print_session("Resumed session", &session, clock.now());
        }
        SessionCommands::Confirm { id } => {
            let session = client.confirm_exit(id).await?;
            print_session("Confirmed exit for session", &session, clock.now());
        }
        SessionCommands::Cancel { id } => {
            let session = client.cancel(id).await?;
            print_session("Cancelled session", &session, clock.now());
        }
        SessionCommands::Delete { id } => {
            client.delete(id).await?;
            println!("✓ Deleted session {}", id);
        }
    }
    Ok(())
}

pub fn run_settings_command(command: SettingsCommands, server: &str, actor: &Actor) -> Result<()> {
    let client = client(server, actor)?;
    block_on(async move {
        let settings = match command {
            SettingsCommands::Get => client.settings().await?,
            SettingsCommands::Set { default_minutes } => {
                let saved = client.update_settings(default_minutes).await?;
                println!("✓ Settings saved");
                saved
            }
        };
        println!("Default session length: {} min", settings.default_duration_minutes);
        Ok(())
    })
}
