use clap::Parser;
use shared::{
    ClientInfo, CommandBody, Message, MessageBody, MessageHeader, StartTrackingBody,
    TransformName, HEADER_SIZE, HEADER_VERSION_2,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Connects to a running server, subscribes and prints whatever comes back.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Server address
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port
    #[arg(short, long, default_value = "18944")]
    port: u16,
    /// Transforms to subscribe to
    #[arg(short, long, default_values_t = vec!["ToolToTracker".to_string()])]
    transform: Vec<String>,
    /// Structured command to send, e.g. Echo
    #[arg(long)]
    command: Option<String>,
    /// Also request tracking data at this resolution in milliseconds
    #[arg(long)]
    tdata_ms: Option<u32>,
    /// Stop after printing this many messages
    #[arg(short, long, default_value = "20")]
    count: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut stream = TcpStream::connect((args.host.as_str(), args.port)).await?;
    println!("Connected to {}", stream.peer_addr()?);

    let mut info = ClientInfo::default();
    for name in &args.transform {
        match TransformName::parse(name) {
            Ok(transform) => info.transform_names.push(transform),
            Err(e) => println!("Ignoring '{}': {}", name, e),
        }
    }
    send(&mut stream, MessageBody::ClientInfo(info)).await?;
    send(&mut stream, MessageBody::GetStatus).await?;

    if let Some(resolution_ms) = args.tdata_ms {
        let body = StartTrackingBody {
            resolution_ms,
            coordinate_name: String::new(),
        };
        send(&mut stream, MessageBody::StartTrackingData(body)).await?;
    }

    if let Some(name) = &args.command {
        let body = CommandBody {
            command_id: 1,
            command_name: name.clone(),
            content: format!(r#"<Command Name="{}" Text="hello" />"#, name),
        };
        send(&mut stream, MessageBody::Command(body)).await?;
    }

    let mut printed = 0;
    while printed < args.count {
        let mut header = [0u8; HEADER_SIZE];
        match timeout(Duration::from_secs(5), stream.read_exact(&mut header)).await {
            Err(_) => {
                println!("No message within 5 seconds");
                break;
            }
            Ok(Err(e)) => {
                println!("Connection closed: {}", e);
                break;
            }
            Ok(Ok(_)) => {}
        }
        let header = MessageHeader::unpack(&header)?;
        let mut body = vec![0u8; header.body_size as usize];
        stream.read_exact(&mut body).await?;

        match Message::unpack_body(&header, &body, true) {
            Ok(message) => print_message(&message),
            Err(e) => println!(
                "{} on '{}': {}",
                header.type_name(),
                header.device_name(),
                e
            ),
        }
        printed += 1;
    }

    stream.shutdown().await?;
    Ok(())
}

async fn send(stream: &mut TcpStream, body: MessageBody) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = Message::new("", body)
        .with_version(HEADER_VERSION_2)
        .pack()?;
    stream.write_all(&bytes).await?;
    Ok(())
}

fn print_message(message: &Message) {
    let kind = message.kind().type_name();
    match &message.body {
        MessageBody::Transform(transform) => {
            let m = transform.to_matrix();
            println!(
                "[{:.3}] {} {}: position ({:.1}, {:.1}, {:.1})",
                message.timestamp, kind, message.device_name, m[0][3], m[1][3], m[2][3]
            );
        }
        MessageBody::String(text) => {
            println!("[{:.3}] {} {}: {}", message.timestamp, kind, message.device_name, text.value);
        }
        MessageBody::RtsCommand(reply) => {
            println!(
                "{} uid {} '{}': {}",
                kind, reply.command_id, reply.command_name, reply.content
            );
        }
        other => println!("[{:.3}] {} {}: {:?}", message.timestamp, kind, message.device_name, other),
    }
    for (key, value) in &message.metadata {
        println!("    {} = {}", key, value);
    }
}
