//! LIME Protocol CLI binary.
//!
//! # Commands
//!
//! - `serve` - Accept TCP clients, establish guest sessions and echo messages
//! - `ping` - Send ping commands over a multiplexed client and report latency

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use lime::{
    channel::{
        AuthenticationResult, MultiplexerChannel, OnDemandClientChannel, ReplyPingModule,
        ServerChannel,
    },
    config::Config,
    protocol::{
        new_id, AuthenticationScheme, Command, Message, Node, SessionCompression,
        SessionEncryption, SessionState,
    },
    transport::{TcpTransportFactory, TcpTransportListener, TransportListener},
    VERSION,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "lime")]
#[command(version = VERSION)]
#[command(about = "LIME Protocol - Session-based envelope channels", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/lime/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept clients and echo their messages back
    Serve {
        /// Listen URI (default from config)
        #[arg(short, long)]
        uri: Option<String>,

        /// Domain of the server node
        #[arg(short, long, default_value = "localhost")]
        domain: String,
    },

    /// Ping a server over a multiplexed channel
    Ping {
        /// Server URI (default from config)
        #[arg(short, long)]
        uri: Option<String>,

        /// Number of pings
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,

        /// Number of underlying channels (default from config)
        #[arg(long)]
        channels: Option<usize>,

        /// Client identity, e.g. bot@example.org (default from config)
        #[arg(short, long)]
        identity: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    if cli.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?.with_env()?,
        None => Config::load()?,
    };

    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Serve { uri, domain } => {
            let uri = uri.unwrap_or_else(|| config.listener.uri.clone());
            runtime.block_on(cmd_serve(config, uri, domain))
        },
        Commands::Ping {
            uri,
            count,
            channels,
            identity,
        } => {
            let mut config = config;
            if let Some(identity) = identity {
                config.channel.identity = lime::protocol::Identity::parse(&identity)?;
            }
            if let Some(channels) = channels {
                config.multiplexer.count = channels;
            }
            let uri = uri.unwrap_or_else(|| config.listener.uri.clone());
            runtime.block_on(cmd_ping(config, uri, count))
        },
    }
}

async fn cmd_serve(config: Config, uri: String, domain: String) -> anyhow::Result<()> {
    let listener = TcpTransportListener::new();
    listener.start(&uri).await?;
    println!("LIME server listening on {uri}");

    let server_node = Node::parse(&format!("server@{domain}/default"))?;
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    loop {
        let transport = match listener.accept_transport(&shutdown).await {
            Ok(transport) => transport,
            Err(e) if e.is_cancelled() => break,
            Err(e) => {
                tracing::warn!("Failed to accept a transport: {}", e);
                continue;
            },
        };

        let server = ServerChannel::new(
            new_id(),
            server_node.clone(),
            transport,
            config.channel.to_settings(),
        );
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(&server, &shutdown).await {
                tracing::warn!(
                    "Session {} ended: {}",
                    server.session_id().as_deref().unwrap_or("-"),
                    e
                );
            }
        });
    }

    listener.stop().await?;
    println!("LIME server stopped");
    Ok(())
}

async fn serve_connection(server: &ServerChannel, cancel: &CancellationToken) -> lime::Result<()> {
    server
        .command_modules()
        .add(Arc::new(ReplyPingModule::new(server.downgrade())));

    server
        .establish_session(
            &[SessionCompression::None],
            &[SessionEncryption::None],
            &[AuthenticationScheme::Guest],
            |node, _authentication| async move {
                let node = if node.name.is_some() {
                    node
                } else {
                    Node {
                        name: Some(new_id()),
                        ..node
                    }
                };
                AuthenticationResult::Success(node)
            },
            cancel,
        )
        .await?;

    loop {
        tokio::select! {
            message = server.receive_message(cancel) => {
                let message = message?;
                let echo = Message {
                    id: None,
                    to: message.from.clone(),
                    from: None,
                    ..message
                };
                server.send_message(echo, cancel).await?;
            }
            session = server.receive_finishing_session(cancel) => {
                let session = session?;
                if session.state == SessionState::Finishing {
                    return server.send_finished_session(cancel).await;
                }
                tracing::debug!("Ignoring a {} session", session.state);
                if session.state.is_terminal() {
                    return Ok(());
                }
            }
        }
    }
}

async fn cmd_ping(config: Config, uri: String, count: usize) -> anyhow::Result<()> {
    let factory = Arc::new(TcpTransportFactory::new(uri.clone()));
    let multiplexer = MultiplexerChannel::new(
        config.channel.builder(factory),
        config.multiplexer.count,
        config.multiplexer.input_buffer_size,
        config.multiplexer.output_buffer_size,
    )?;
    let cancel = CancellationToken::new();

    multiplexer.establish(&cancel).await?;
    println!(
        "Connected to {uri} over {} channels",
        config.multiplexer.count
    );

    let mut latencies = Vec::with_capacity(count);
    for seq in 1..=count {
        let started = Instant::now();
        let response = tokio::time::timeout(
            Duration::from_secs(10),
            multiplexer.process_command(Command::ping_request(), &cancel),
        )
        .await;
        match response {
            Ok(Ok(response)) if response.is_ping_response() => {
                let elapsed = started.elapsed();
                latencies.push(elapsed);
                println!("ping {seq}: {:.2} ms", elapsed.as_secs_f64() * 1000.0);
            },
            Ok(Ok(response)) => println!("ping {seq}: unexpected response {:?}", response.status),
            Ok(Err(e)) => println!("ping {seq}: {e}"),
            Err(_) => println!("ping {seq}: timed out"),
        }
    }

    if !latencies.is_empty() {
        let total: Duration = latencies.iter().sum();
        let average = total.as_secs_f64() * 1000.0 / latencies.len() as f64;
        println!(
            "{}/{} replies, average {:.2} ms",
            latencies.len(),
            count,
            average
        );
    }

    multiplexer.finish(&cancel).await?;
    multiplexer.dispose();
    Ok(())
}
