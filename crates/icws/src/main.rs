//! icws: command-line client for Interaction Center web services
//!
//! Subcommands:
//! - `connect`: log in, print the session, log out
//! - `fetch`: read one resource and print it as JSON
//! - `watch`: subscribe to server messages and print them until Ctrl-C

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use icws_client::config::{DEFAULT_APPLICATION_NAME, DEFAULT_PORT};
use icws_client::{ClientConfig, Collection, Entity, IcwsClient, Scheme, SyncOptions};
use miette::Result;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod watch;

#[derive(Parser)]
#[command(name = "icws")]
#[command(about = "Interaction Center web services client", long_about = None)]
struct Cli {
    #[command(flatten)]
    server: ServerArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ServerArgs {
    /// Server host name
    #[arg(long, env = "ICWS_SERVER")]
    server: String,

    /// Server port
    #[arg(long, env = "ICWS_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// URI scheme (http or https)
    #[arg(long, env = "ICWS_SCHEME", default_value = "http")]
    scheme: Scheme,

    /// Application name reported at login
    #[arg(long, env = "ICWS_APPLICATION_NAME", default_value = DEFAULT_APPLICATION_NAME)]
    application_name: String,

    /// User to log in as
    #[arg(long, env = "ICWS_USERNAME")]
    username: String,

    /// Password; prompted for when absent
    #[arg(long, env = "ICWS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Extra header added to every request, as NAME=VALUE
    #[arg(long = "header", value_parser = parse_pair)]
    headers: Vec<(String, String)>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in, print the session identifiers, and log out
    Connect,

    /// Read a resource and print the response body
    Fetch {
        /// Resource path, e.g. /configuration/users
        path: String,

        /// Entity id; reads the whole collection when absent
        #[arg(long)]
        id: Option<String>,

        /// Extra path segment (repeatable)
        #[arg(long = "template")]
        template: Vec<String>,

        /// Query filter as KEY=VALUE (repeatable, order kept); defaults to select=*
        #[arg(long = "query", value_parser = parse_pair)]
        query: Vec<(String, String)>,
    },

    /// Subscribe to messages and print them until interrupted
    Watch {
        /// Subscription resource path, e.g. /messaging/subscriptions/status/user-statuses
        #[arg(long)]
        subscription: String,

        /// Message type to listen for (repeatable)
        #[arg(long = "type", required = true)]
        message_types: Vec<String>,

        /// Subscription representation as JSON
        #[arg(long)]
        representation: Option<String>,

        /// Poll interval in milliseconds
        #[arg(long, env = "ICWS_POLL_INTERVAL_MS")]
        poll_interval_ms: Option<u64>,
    },
}

/// Parse a `KEY=VALUE` argument.
fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "icws=info,icws_client=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Connect => run_connect(&cli.server).await,

        Commands::Fetch {
            path,
            id,
            template,
            query,
        } => run_fetch(&cli.server, &path, id, template, query).await,

        Commands::Watch {
            subscription,
            message_types,
            representation,
            poll_interval_ms,
        } => {
            let representation = representation
                .map(|text| serde_json::from_str(&text))
                .transpose()
                .map_err(|e| miette::miette!("Invalid representation JSON: {}", e))?;
            watch::run(
                client_config(&cli.server, poll_interval_ms),
                &credentials(&cli.server)?,
                &subscription,
                &message_types,
                representation,
            )
            .await
        }
    }
}

fn client_config(args: &ServerArgs, poll_interval_ms: Option<u64>) -> ClientConfig {
    let mut config = ClientConfig::new(args.server.clone(), args.port)
        .with_scheme(args.scheme)
        .with_application_name(args.application_name.clone());
    for (name, value) in &args.headers {
        config = config.with_header(name.clone(), value.clone());
    }
    if let Some(ms) = poll_interval_ms {
        config = config.with_poll_interval(Duration::from_millis(ms));
    }
    config
}

/// Username and password, prompting for the password if needed.
pub struct Credentials {
    pub username: String,
    pub password: String,
}

fn credentials(args: &ServerArgs) -> Result<Credentials> {
    let password = match &args.password {
        Some(password) => password.clone(),
        None => rpassword::prompt_password_stderr("Password: ")
            .map_err(|e| miette::miette!("Failed to read password: {}", e))?,
    };
    Ok(Credentials {
        username: args.username.clone(),
        password,
    })
}

/// Build a client and log in.
pub async fn login(config: ClientConfig, credentials: &Credentials) -> Result<IcwsClient> {
    let client = IcwsClient::new(config).map_err(|e| miette::miette!("{}", e))?;
    client
        .connect(&credentials.username, &credentials.password)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    Ok(client)
}

/// Log out, reporting but not failing on a rejected logout.
pub async fn logout(client: &IcwsClient) {
    if let Err(e) = client.disconnect().await {
        warn!(error = %e, "logout failed");
    }
}

async fn run_connect(args: &ServerArgs) -> Result<()> {
    let client = login(client_config(args, None), &credentials(args)?).await?;

    if let Some(info) = client.session_info().await {
        println!("session id: {}", info.session_id);
    }

    logout(&client).await;
    Ok(())
}

async fn run_fetch(
    args: &ServerArgs,
    path: &str,
    id: Option<String>,
    template: Vec<String>,
    query: Vec<(String, String)>,
) -> Result<()> {
    let client = login(client_config(args, None), &credentials(args)?).await?;

    let mut options = SyncOptions::new();
    for segment in template {
        options = options.segment(segment);
    }
    for (key, value) in query {
        options = options.query(key, value);
    }

    let result = match id {
        Some(id) => client.fetch(&Entity::new(path, id), options).await,
        None => client.fetch(&Collection::new(path), options).await,
    };
    logout(&client).await;

    let body = result.map_err(|e| miette::miette!("{}", e))?;
    let text = serde_json::to_string_pretty(&body).map_err(|e| miette::miette!("{}", e))?;
    println!("{}", text);
    Ok(())
}
