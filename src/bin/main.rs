use clap::{Parser, Subcommand, ValueEnum};
use netgauge::{Config, Measurer, ProgressEvent, Server, Variant};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "netgauge")]
#[command(about = "Network throughput and responsiveness measurement tool", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum VariantArg {
    /// Discrete chunk transfers over HTTP
    Chunk,
    /// Continuous framed transfer over WebSocket
    Stream,
}

impl From<VariantArg> for Variant {
    fn from(value: VariantArg) -> Self {
        match value {
            VariantArg::Chunk => Variant::Chunk,
            VariantArg::Stream => Variant::Stream,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode
    Serve {
        /// Address to bind
        #[arg(short = 'A', long, default_value = "127.0.0.1")]
        address: String,

        /// Port to listen on
        #[arg(short, long, default_value = "4443")]
        port: u16,
    },

    /// Run a measurement against a server
    Measure {
        /// Server address to connect to
        #[arg(short = 'A', long, default_value = "127.0.0.1")]
        address: String,

        /// Port to connect to
        #[arg(short, long, default_value = "4443")]
        port: u16,

        /// Protocol variant to use
        #[arg(short, long, value_enum, default_value = "chunk")]
        variant: VariantArg,

        /// Time budget per direction in seconds
        #[arg(short = 't', long, default_value = "10")]
        time: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { address, port } => {
            let server = Server::new(Config::serve(address, port));
            let shutdown = server.shutdown_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    shutdown.cancel();
                }
            });
            server.run().await?;
        }

        Commands::Measure {
            address,
            port,
            variant,
            time,
        } => {
            let config = Config::measure(address, port)
                .with_variant(variant.into())
                .with_budget(Duration::from_secs(time));

            let measurer = Measurer::new(config)?.with_callback(print_event);
            let cancel = measurer.cancellation_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });
            measurer.run().await?;
        }
    }

    Ok(())
}

fn print_event(event: ProgressEvent) {
    match event {
        ProgressEvent::SessionCreated { session_id } => {
            println!("session {session_id}");
        }
        ProgressEvent::ChunkCompleted { direction, report } => {
            println!(
                "[{direction}] chunk {:>10} B  {:8.3} s  {:10.2} Mbit/s",
                report.size,
                report.elapsed.as_secs_f64(),
                report.bits_per_second / 1_000_000.0
            );
        }
        ProgressEvent::Sample { direction, sample } => {
            println!(
                "[{direction}] {:>12} B total  {:10.2} Mbit/s",
                sample.bytes,
                sample.bits_per_second / 1_000_000.0
            );
        }
        ProgressEvent::Probe(sample) => {
            println!(
                "[probe] {:7.2} ms  {:?}",
                sample.rtt.as_secs_f64() * 1000.0,
                sample.outcome
            );
        }
        ProgressEvent::DirectionCompleted { summary } => {
            println!(
                "[{}] done: {} chunks, {} bytes, {:.2} Mbit/s",
                summary.direction,
                summary.chunks,
                summary.bytes,
                summary.bits_per_second / 1_000_000.0
            );
        }
        ProgressEvent::StreamCompleted { direction, sample } => {
            println!(
                "[{direction}] done: {} bytes, {:.2} Mbit/s",
                sample.bytes,
                sample.bits_per_second / 1_000_000.0
            );
        }
        ProgressEvent::Error(message) => {
            eprintln!("error: {message}");
        }
    }
}
