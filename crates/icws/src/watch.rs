//! `watch` subcommand: print subscribed messages until Ctrl-C.

use std::sync::Arc;

use icws_client::{ClientConfig, EventDispatcher, Listener, Subscription};
use miette::Result;
use serde_json::Value;
use tracing::{info, warn};

use crate::{Credentials, login, logout};

pub async fn run(
    config: ClientConfig,
    credentials: &Credentials,
    subscription_path: &str,
    message_types: &[String],
    representation: Option<Value>,
) -> Result<()> {
    let client = Arc::new(login(config, credentials).await?);
    let dispatcher = EventDispatcher::new(Arc::clone(&client));

    let result = watch(&dispatcher, subscription_path, message_types, representation).await;

    dispatcher.stop().await;
    logout(&client).await;
    result
}

async fn watch(
    dispatcher: &EventDispatcher,
    subscription_path: &str,
    message_types: &[String],
    representation: Option<Value>,
) -> Result<()> {
    dispatcher
        .start(None)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let mut subscription = Subscription::new(subscription_path);
    if let Some(representation) = representation {
        subscription = subscription.with_representation(representation);
    }

    let listener = Listener::new(|message| {
        let line = serde_json::to_string(message).map_err(|e| e.to_string())?;
        println!("{}", line);
        Ok(())
    });

    let types: Vec<&str> = message_types.iter().map(String::as_str).collect();
    dispatcher
        .subscribe(&types, &subscription, listener.clone())
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    info!(url = %subscription.url, "watching, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.ok();
    info!("interrupted, unsubscribing");

    if let Err(e) = dispatcher.unsubscribe(&types, &subscription, &listener).await {
        warn!(error = %e, "unsubscribe failed");
    }
    Ok(())
}
