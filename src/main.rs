use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use serde_json::Value;
use std::sync::Arc;

use crm_client::auth::{AuthSession, LoginOutcome, SqliteTokenStore};
use crm_client::config::{Command, Config, LogFormat};
use crm_client::events::{NoticeLevel, SessionEvent};
use crm_client::http_client::CrmHttpClient;
use crm_client::EventSink;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    config.validate()?;

    init_logging(&config);

    tracing::debug!(
        "Backend: {}, token store: {}",
        config.base_url,
        config.token_store.display()
    );

    let store = Arc::new(SqliteTokenStore::open(&config.token_store)?);
    let events = EventSink::new();
    let notices = spawn_notice_printer(&events);

    let http = Arc::new(CrmHttpClient::new(
        config.base_url.clone(),
        store,
        events,
        config.http_connect_timeout,
        config.http_request_timeout,
    )?);
    let session = Arc::new(AuthSession::new(http.clone()));
    let sync = session.spawn_sync();

    let result = run(&config.command, &session, &http).await;

    // Give the printer a chance to drain before the runtime goes away
    tokio::task::yield_now().await;
    sync.abort();
    notices.abort();
    result
}

fn init_logging(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.with_file(true).with_line_number(true).init(),
    }
}

/// Print notices to stderr as they arrive
fn spawn_notice_printer(events: &EventSink) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                SessionEvent::Notice { level, message } => {
                    let tag = match level {
                        NoticeLevel::Success => "ok",
                        NoticeLevel::Info => "info",
                        NoticeLevel::Error => "error",
                    };
                    eprintln!("[{}] {}", tag, message);
                }
                SessionEvent::LoginRequired => {
                    eprintln!("[error] Session expired. Run `crm-client login` to sign in again.");
                }
                SessionEvent::TokensRefreshed => {}
            }
        }
    })
}

async fn run(command: &Command, session: &AuthSession, http: &CrmHttpClient) -> Result<()> {
    match command {
        Command::Login { username, password } => {
            let username = match username {
                Some(u) => u.clone(),
                None => Input::new()
                    .with_prompt("Username")
                    .interact_text()
                    .context("Failed to read username")?,
            };
            let password = match password {
                Some(p) => p.clone(),
                None => Password::new()
                    .with_prompt("Password")
                    .interact()
                    .context("Failed to read password")?,
            };

            match session.login(&username, &password).await {
                LoginOutcome::Success { user } => {
                    println!("Logged in as {}", user.username);
                    Ok(())
                }
                LoginOutcome::Failure { error } => anyhow::bail!("Login failed: {}", error),
            }
        }

        Command::Logout { local_only } => {
            session.logout(!local_only).await;
            println!("Logged out");
            Ok(())
        }

        Command::Whoami => {
            let snapshot = session.snapshot();
            match (&snapshot.user, snapshot.is_authenticated()) {
                (Some(user), true) => print_json(&serde_json::to_value(user)?),
                (None, true) => println!("Authenticated (no cached identity)"),
                _ => println!("Not logged in"),
            }
            Ok(())
        }

        Command::Verify => {
            if session.verify().await? {
                println!("Access token accepted");
            } else {
                println!("Access token rejected or missing");
            }
            Ok(())
        }

        Command::Summary => {
            print_json(&http.dashboard().summary().await?);
            Ok(())
        }

        Command::Flows => {
            print_json(&http.flows().list().await?);
            Ok(())
        }

        Command::Contacts { search } => {
            let params: Vec<(&str, &str)> = search
                .as_deref()
                .map(|s| vec![("search", s)])
                .unwrap_or_default();
            print_json(&http.contacts().list(&params).await?);
            Ok(())
        }

        Command::Reports { period } => {
            let params: Vec<(&str, &str)> = period
                .as_deref()
                .map(|p| vec![("period", p)])
                .unwrap_or_default();
            print_json(&http.analytics().reports(&params).await?);
            Ok(())
        }
    }
}

fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}
