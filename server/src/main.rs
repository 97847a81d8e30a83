use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use server::command::{CommandRegistry, CommandRequest, CommandResult};
use server::config::ServerConfig;
use server::frame::{FrameBuffer, ToolStatus, TrackedFrame};
use server::server::Server;
use shared::message::IDENTITY;
use shared::TransformName;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

/// Main-method of the application.
/// Parses command-line arguments, starts the server and optionally feeds it a
/// simulated tool, then runs until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[command(author, version, about)]
    struct Args {
        /// TOML server configuration; overrides --port and --channel
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Port to listen on
        #[arg(short, long, default_value = "18944")]
        port: u16,
        /// Output channel id
        #[arg(long, default_value = "TrackerStream")]
        channel: String,
        /// Rate of the simulated ToolToTracker stream, 0 disables it
        #[arg(short, long, default_value = "30")]
        simulate_hz: u32,
        /// Number of frames kept for streaming
        #[arg(short, long, default_value = "1000")]
        buffer_size: usize,
    }

    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => {
            let mut config = ServerConfig::new(args.port, args.channel.clone());
            config.default_client_info.transform_names =
                vec![TransformName::new("Tool", "Tracker")];
            config
        }
    };

    let source = Arc::new(FrameBuffer::new(
        config.output_channel_id.clone(),
        args.buffer_size,
    ));

    let mut commands = CommandRegistry::new();
    commands.register("Echo", |request: &CommandRequest| {
        let text = request.attribute("Text").unwrap_or_default();
        CommandResult::success(text.clone()).with_parameter("Text", text)
    });

    let mut server = Server::new();
    let addr = server.start(source.clone(), commands, config).await?;
    info!("Listening on {}", addr);

    let simulation = (args.simulate_hz > 0).then(|| {
        let source = Arc::clone(&source);
        tokio::spawn(simulate_tool(source, args.simulate_hz))
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C, shutting down gracefully...");

    if let Some(simulation) = simulation {
        simulation.abort();
    }
    server.stop().await;
    Ok(())
}

/// Pushes a tool moving on a circle around the tracker origin.
async fn simulate_tool(source: Arc<FrameBuffer>, rate_hz: u32) {
    let mut interval_timer = interval(Duration::from_secs_f64(1.0 / f64::from(rate_hz)));
    interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();

    loop {
        interval_timer.tick().await;
        let t = started.elapsed().as_secs_f64();

        let mut pose = IDENTITY;
        pose[0][3] = 50.0 * t.cos();
        pose[1][3] = 50.0 * t.sin();
        pose[2][3] = -100.0;

        let frame = TrackedFrame::new(t)
            .with_transform("ToolToTracker", pose, ToolStatus::Ok)
            .with_field("FrameNumber", &format!("{}", (t * f64::from(rate_hz)) as u64));
        if !source.push(frame) {
            warn!("Simulated frame at {:.3} was not newer than the last one", t);
        }
    }
}
