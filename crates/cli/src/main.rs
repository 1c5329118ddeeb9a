//! CLI binary to publish to and subscribe on a NATS message bus through the
//! resilient streaming client.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use harbor_bus::{Ack, Message};
use harbor_bus_nats::{NatsConnector, NatsConnectorOptions};
use harbor_streaming::{
    AckHandler, DropListener, DropReason, RegistrationStatus, StreamingClient, StreamingConfig,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The client was shut down before it could connect.
    #[error("interrupted before connecting")]
    Interrupted,

    /// Streaming client error
    #[error(transparent)]
    Streaming(#[from] harbor_streaming::Error<harbor_bus_nats::Error>),
}

type Client = StreamingClient<NatsConnector>;

/// Final outcome of one published message.
enum Settled {
    Acked(Ack<harbor_bus_nats::Error>),
    Dropped(String, DropReason),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Cluster identifier
    #[arg(long, default_value = "harbor", env = "HARBOR_CLUSTER_ID")]
    cluster_id: String,

    /// Client identifier
    #[arg(long, default_value = "harbor-cli", env = "HARBOR_CLIENT_ID")]
    client_id: String,

    /// Server URLs
    #[arg(
        long = "url",
        default_value = "nats://localhost:4222",
        env = "HARBOR_URLS",
        value_delimiter = ','
    )]
    urls: Vec<String>,

    /// Keep-alive ping interval in seconds
    #[arg(long, default_value_t = 5, env = "HARBOR_PING_INTERVAL")]
    ping_interval: u64,

    /// Unanswered pings before the connection is considered lost
    #[arg(long, default_value_t = 3, env = "HARBOR_MAX_PINGS_OUT")]
    max_pings_out: u32,

    /// Pause between connection attempts in seconds
    #[arg(long, default_value_t = 5, env = "HARBOR_RECONNECT_INTERVAL")]
    reconnect_interval: u64,

    /// Publishes held for replay while disconnected
    #[arg(long, default_value_t = 10_000, env = "HARBOR_REPLAY_CAPACITY")]
    replay_capacity: usize,

    /// Timeout of a single connection attempt in seconds
    #[arg(long, env = "HARBOR_CONNECTION_TIMEOUT")]
    connection_timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Publish messages and wait for their acknowledgements
    Publish {
        /// Subject to publish on
        #[arg(long)]
        subject: String,

        /// Message body
        #[arg(long)]
        message: String,

        /// Number of copies to publish
        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Cache publishes made while disconnected and replay them later
        #[arg(long)]
        safe: bool,
    },

    /// Print messages until interrupted, resubscribing after reconnects
    Subscribe {
        /// Subject to subscribe to; may contain wildcards
        #[arg(long)]
        subject: String,

        /// Queue group to join
        #[arg(long)]
        queue: Option<String>,

        /// Registration key
        #[arg(long, default_value = "harbor-cli")]
        key: String,
    },
}

fn streaming_config(args: &Args) -> StreamingConfig {
    StreamingConfig {
        cluster_id: args.cluster_id.clone(),
        client_id: args.client_id.clone(),
        urls: args.urls.clone(),
        ping_interval: Some(Duration::from_secs(args.ping_interval)),
        max_pings_out: Some(args.max_pings_out),
        reconnect_interval: Some(Duration::from_secs(args.reconnect_interval)),
        replay_capacity: Some(args.replay_capacity),
    }
}

fn create_client(args: &Args, drop_listener: DropListener) -> Client {
    let connector = NatsConnector::new(NatsConnectorOptions {
        connection_timeout: args.connection_timeout.map(Duration::from_secs),
    });

    StreamingClient::with_drop_listener(connector, streaming_config(args), drop_listener)
}

async fn connect(client: &Client, shutdown_token: &CancellationToken) -> Result<(), Error> {
    tokio::select! {
        result = client.connect() => {
            result?;
            Ok(())
        }
        () = shutdown_token.cancelled() => Err(Error::Interrupted),
    }
}

#[allow(clippy::too_many_arguments)]
async fn publish(
    client: &Client,
    shutdown_token: &CancellationToken,
    settled_sender: mpsc::UnboundedSender<Settled>,
    mut settled_receiver: mpsc::UnboundedReceiver<Settled>,
    subject: &str,
    message: &str,
    count: usize,
    safe: bool,
) -> Result<(), Error> {
    let ack_handler: AckHandler<harbor_bus_nats::Error> =
        Arc::new(move |ack: Ack<harbor_bus_nats::Error>| {
            let _ = settled_sender.send(Settled::Acked(ack));
        });

    for sequence in 1..=count {
        let payload = message.to_string();

        if safe {
            match client
                .safe_publish(subject, payload, Some(ack_handler.clone()))
                .await?
            {
                Some(message_id) => info!(sequence, %message_id, "published"),
                None => warn!(sequence, "cached for replay"),
            }
        } else {
            let message_id = client
                .publish_with_ack(subject, payload, ack_handler.clone())
                .await?;
            info!(sequence, %message_id, "published");
        }
    }

    wait_until_settled(&mut settled_receiver, count, shutdown_token).await;

    Ok(())
}

/// Waits until `count` publishes were acknowledged or given up on. Returns
/// how many settled before shutdown.
async fn wait_until_settled(
    settled_receiver: &mut mpsc::UnboundedReceiver<Settled>,
    count: usize,
    shutdown_token: &CancellationToken,
) -> usize {
    let mut settled = 0;

    while settled < count {
        tokio::select! {
            outcome = settled_receiver.recv() => {
                let Some(outcome) = outcome else {
                    break;
                };
                settled += 1;

                match outcome {
                    Settled::Acked(Ack { message_id, result: Ok(()) }) => {
                        info!(%message_id, "acknowledged");
                    }
                    Settled::Acked(Ack { message_id, result: Err(e) }) => {
                        error!(%message_id, error = %e, "publish failed");
                    }
                    Settled::Dropped(subject, reason) => {
                        error!(subject = %subject, ?reason, "cached publish given up on");
                    }
                }
            }
            () = shutdown_token.cancelled() => {
                warn!(outstanding = count - settled, "shutting down with unsettled publishes");
                break;
            }
        }
    }

    settled
}

async fn subscribe(
    client: &Client,
    shutdown_token: &CancellationToken,
    subject: &str,
    queue: Option<String>,
    key: String,
) -> Result<(), Error> {
    let mut spec = harbor_streaming::SubscriptionSpec::new(subject, |message: Message| {
        println!(
            "[{}] {}",
            message.subject,
            String::from_utf8_lossy(&message.payload)
        );
    });
    if let Some(queue) = queue {
        spec = spec.queue(queue);
    }

    match client.register(key, spec).await? {
        RegistrationStatus::Active => info!(subject, "subscribed"),
        RegistrationStatus::Pending => warn!(subject, "subscription pending until reconnect"),
    }

    shutdown_token.cancelled().await;

    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            _ => warn!("failed to install signal handlers, falling back to ctrl-c"),
        }
    }

    let _ = tokio::signal::ctrl_c().await;
    info!("Received interrupt signal");
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Initialize tracing for better logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    // Evicted and failed replays never reach an ack handler
    let (settled_sender, settled_receiver) = mpsc::unbounded_channel();
    let drop_listener: DropListener = Arc::new({
        let settled_sender = settled_sender.clone();
        move |subject: &str, _: &Bytes, reason: DropReason| {
            let _ = settled_sender.send(Settled::Dropped(subject.to_string(), reason));
        }
    });
    let client = create_client(&args, drop_listener);

    // Create shared shutdown token
    let shutdown_token = CancellationToken::new();

    // Set up signal handlers
    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;

        info!("Shutting down");
        signal_shutdown_token.cancel();
    });

    connect(&client, &shutdown_token).await?;

    let result = match args.command {
        Command::Publish {
            subject,
            message,
            count,
            safe,
        } => {
            publish(
                &client,
                &shutdown_token,
                settled_sender,
                settled_receiver,
                &subject,
                &message,
                count,
                safe,
            )
            .await
        }
        Command::Subscribe {
            subject,
            queue,
            key,
        } => subscribe(&client, &shutdown_token, &subject, queue, key).await,
    };

    client.close().await;

    result
}
