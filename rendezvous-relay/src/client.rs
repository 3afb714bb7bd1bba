use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{self, DEFAULT_BUFFER_SIZE},
};

/// Relays stdin lines to the server and prints every payload it sends back.
pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (mut reader, mut writer) = stream.into_split();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let mut buffer = vec![0; DEFAULT_BUFFER_SIZE];

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input, &mut buffer).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn run_client_loop(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    buffer: &mut [u8],
) -> Result<()> {
    loop {
        input.clear();
        select! {
            bytes_read = reader.read(buffer) => {
                if !handle_server_payload(bytes_read, buffer).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_payload(bytes_read: io::Result<usize>, buffer: &[u8]) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        write_stdout("*** relay closed the connection").await?;
        return Ok(false);
    }
    write_stdout(&protocol::decode(&buffer[..bytes_read])).await?;
    Ok(true)
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let text = input.trim_end_matches(['\r', '\n']);
    if text.is_empty() {
        return Ok(true);
    }

    writer.write_all(text.as_bytes()).await?;
    writer.flush().await?;
    Ok(true)
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
