use slobs_remote_bridge::broadcast::{BroadcastClient, Transition, TransitionConfirmer};
use slobs_remote_bridge::config::Config;
use slobs_remote_bridge::model::CommandOutcome;
use slobs_remote_bridge::remote::RemoteControl;
use slobs_remote_bridge::session::{EventExecutor, Notification, SerialExecutor, SessionOptions};
use std::sync::Arc;

const USAGE: &str = "usage: slobs-remote-bridge <config-init | stream-start | stream-stop | \
record-start | record-stop | scene <name> | collection <name> | status | watch | \
broadcast <id> <testing|live|complete>>";

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let command = args.next().ok_or(USAGE)?;
    if command == "config-init" {
        return handle_config_init();
    }

    let config = Config::load()?;
    if command == "broadcast" {
        return handle_broadcast(&config, args).await;
    }

    let argument = args.next();
    let options = if command == "watch" {
        let executor: Arc<dyn EventExecutor> =
            SerialExecutor::spawn(&tokio::runtime::Handle::current());
        SessionOptions {
            executor: Some(executor),
        }
    } else {
        SessionOptions::default()
    };

    let control = connect(&config, options).await?;
    let result = dispatch(&control, &command, argument).await;
    control.close().await;
    result
}

async fn dispatch(
    control: &RemoteControl,
    command: &str,
    argument: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        "stream-start" => report("start streaming", control.start_streaming().await?),
        "stream-stop" => {
            control.stop_streaming().await?;
            println!("streaming stopped");
        }
        "record-start" => report("start recording", control.start_recording().await?),
        "record-stop" => {
            control.stop_recording().await?;
            println!("recording stopped");
        }
        "scene" => {
            let name = argument.ok_or("missing scene name (usage: scene <name>)")?;
            report("select scene", control.select_scene(&name).await?);
        }
        "collection" => {
            let name = argument.ok_or("missing collection name (usage: collection <name>)")?;
            report("select collection", control.select_collection(&name).await?);
        }
        "status" => handle_status(control).await?,
        "watch" => handle_watch(control).await?,
        _ => return Err(format!("unknown command '{command}'\n{USAGE}").into()),
    }
    Ok(())
}

async fn connect(
    config: &Config,
    options: SessionOptions,
) -> Result<RemoteControl, Box<dyn std::error::Error>> {
    let endpoint = config.remote.endpoint()?;
    let control = RemoteControl::connect(&endpoint, options)
        .await?
        .with_stop_retry_interval(config.facade.stop_retry_interval());

    if let Some(token) = config.remote.token() {
        let outcome = control.authenticate(&token).await?;
        if !outcome.succeeded() {
            control.close().await;
            return Err("remote control API rejected the configured token".into());
        }
    }
    Ok(control)
}

fn report(action: &str, outcome: CommandOutcome) {
    if outcome.succeeded() {
        println!("{action}: ok");
    } else {
        println!("{action}: remote reported an error");
    }
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn handle_status(control: &RemoteControl) -> Result<(), Box<dyn std::error::Error>> {
    let state = control.streaming_state().await?;
    let scene = control.active_scene().await?;
    let collection = control.active_collection().await?;
    let status = serde_json::json!({
        "streaming": state,
        "activeScene": scene,
        "activeCollection": collection,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn handle_watch(control: &RemoteControl) -> Result<(), Box<dyn std::error::Error>> {
    for category in Notification::ALL {
        control.subscribe(category, |notification: Notification| {
            tracing::info!(
                resource_id = notification.resource_id(),
                "notification received"
            );
        });
    }
    control.enable_notifications().await?;
    println!("watching notifications, press ctrl-c to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
        }
        _ = control.session().closed() => {
            tracing::warn!("remote closed the session");
        }
    }
    Ok(())
}

async fn handle_broadcast(
    config: &Config,
    mut args: impl Iterator<Item = String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let usage = "usage: broadcast <id> <testing|live|complete>";
    let broadcast_id = args.next().ok_or(usage)?;
    let transition: Transition = args.next().ok_or(usage)?.parse()?;

    if !config.broadcast.enabled {
        return Err("broadcast control is disabled (set broadcast.enabled = true)".into());
    }
    let base_url = config
        .broadcast
        .base_url
        .as_deref()
        .ok_or("missing broadcast.base_url in config")?;
    let client = BroadcastClient::builder(base_url, config.broadcast.access_token()?)
        .timeout(config.broadcast.request_timeout())
        .build()?;

    let confirmer = TransitionConfirmer::new(client)
        .with_poll_interval(config.broadcast.poll_interval())
        .with_timeout(config.broadcast.timeout());
    let attempt = confirmer.confirm(&broadcast_id, transition).await?;

    println!(
        "broadcast {} is {} after {} poll(s)",
        attempt.broadcast_id,
        attempt.last_status.as_deref().unwrap_or(attempt.expected()),
        attempt.polls
    );
    Ok(())
}
