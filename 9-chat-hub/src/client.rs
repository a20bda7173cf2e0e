use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use nanoid::nanoid;
use thiserror::Error;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    sync::mpsc,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{ClientEvent, FileId, ServerEvent, SystemEvent},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames in one batch are written back-to-back, which keeps a chunk's
/// metadata directly in front of its payload even with several uploads
/// running at once.
type Batch = Vec<Message>;
type Outbound = mpsc::UnboundedSender<Batch>;

const SIMULATED_PARTS: i32 = 3;
const SIMULATED_PART_INTERVAL: Duration = Duration::from_secs(1);
const CHUNK_SIZE: usize = 64 * 1024;
const CHUNK_PACING: Duration = Duration::from_millis(50);
const HELP: &str =
    "*** commands: /say <text> | /upload <name> | /uploadfile <path> | /pdf <title> | /quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Say(String),
    /// Simulated upload: three timed progress messages, nothing stored.
    Upload(String),
    UploadFile(PathBuf),
    Pdf(String),
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown command {0}; use /say, /upload, /uploadfile, /pdf or /quit")]
    Unknown(String),
}

impl Input {
    /// Lines without a leading slash are sent as chat.
    pub fn parse(line: &str) -> Result<Self, InputError> {
        let line = line.trim();
        if !line.starts_with('/') {
            return Ok(Input::Say(line.to_string()));
        }

        let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let required = |usage| {
            if rest.is_empty() {
                Err(InputError::Usage(usage))
            } else {
                Ok(rest.to_string())
            }
        };

        match command {
            "/say" => required("/say <text>").map(Input::Say),
            "/upload" => required("/upload <name>").map(Input::Upload),
            "/uploadfile" => required("/uploadfile <path>").map(|path| Input::UploadFile(path.into())),
            "/pdf" => required("/pdf <title>").map(Input::Pdf),
            "/quit" => Ok(Input::Quit),
            other => Err(InputError::Unknown(other.to_string())),
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (socket, _) = connect_async(args.server.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (sink, mut stream) = socket.split();
    let (outbound, batches) = mpsc::unbounded_channel();
    let writer = tokio::spawn(run_writer(sink, batches));

    send_event(
        &outbound,
        &ClientEvent::System(SystemEvent::Join {
            user: args.user.clone(),
        }),
    )?;
    write_stdout(HELP).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let result = run_client_loop(&mut stream, &outbound, &mut stdin, &mut input, &args.user).await;

    drop(outbound);
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(?error, "failed to close connection cleanly"),
        Err(error) => warn!(?error, "writer task ended abnormally"),
    }
    result
}

async fn run_writer(
    mut sink: SplitSink<Socket, Message>,
    mut batches: mpsc::UnboundedReceiver<Batch>,
) -> Result<(), tungstenite::Error> {
    while let Some(batch) = batches.recv().await {
        for message in batch {
            sink.send(message).await?;
        }
    }
    sink.close().await
}

async fn run_client_loop(
    stream: &mut SplitStream<Socket>,
    outbound: &Outbound,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    user: &str,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            frame = stream.next() => {
                if !handle_server_frame(frame).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, outbound, user).await? {
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

async fn handle_server_frame(
    frame: Option<Result<Message, tungstenite::Error>>,
) -> Result<bool> {
    match frame {
        Some(Ok(Message::Text(text))) => {
            match ServerEvent::decode(&text) {
                Ok(event) => write_stdout(&render_server_event(&event)).await?,
                Err(_) => write_stdout(&format!("<< {text}")).await?,
            }
            Ok(true)
        }
        Some(Ok(Message::Close(_))) | None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Some(Ok(_)) => Ok(true),
        Some(Err(error)) => Err(error).context("connection to hub failed"),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    outbound: &Outbound,
    user: &str,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }
    if input.trim().is_empty() {
        return Ok(true);
    }

    match Input::parse(input) {
        Ok(Input::Say(text)) => send_event(
            outbound,
            &ClientEvent::Chat {
                user: user.to_string(),
                text,
            },
        )?,
        Ok(Input::Upload(name)) => {
            write_stdout(&format!("*** simulated upload started for {name}")).await?;
            tokio::spawn(simulate_upload(outbound.clone(), name));
        }
        Ok(Input::UploadFile(path)) => {
            write_stdout(&format!("*** uploading {}", path.display())).await?;
            let outbound = outbound.clone();
            tokio::spawn(async move {
                if let Err(error) = upload_file(&outbound, &path).await {
                    warn!(path = %path.display(), ?error, "upload failed");
                    let _ = write_stderr(&format!("!!! upload of {} failed: {error:#}", path.display())).await;
                }
            });
        }
        Ok(Input::Pdf(title)) => send_event(outbound, &ClientEvent::CreatePdf { title })?,
        Ok(Input::Quit) => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
        Err(error) => write_stderr(&format!("!!! {error}")).await?,
    }
    Ok(true)
}

fn send_event(outbound: &Outbound, event: &ClientEvent) -> Result<()> {
    let encoded = event.encode().context("failed to encode event")?;
    outbound
        .send(vec![Message::Text(encoded)])
        .map_err(|_| anyhow!("connection to hub is closed"))
}

async fn simulate_upload(outbound: Outbound, name: String) {
    for part in 1..=SIMULATED_PARTS {
        let chunk = ClientEvent::UploadChunk {
            name: name.clone(),
            part,
        };
        if send_event(&outbound, &chunk).is_err() {
            return;
        }
        tokio::time::sleep(SIMULATED_PART_INTERVAL).await;
    }

    let end = ClientEvent::UploadEnd {
        file_id: None,
        name: Some(name.clone()),
    };
    if send_event(&outbound, &end).is_ok() {
        let _ = write_stdout(&format!("*** simulated upload finished for {name}")).await;
    }
}

async fn upload_file(outbound: &Outbound, path: &std::path::Path) -> Result<()> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("file not found: {}", path.display()))?;
    if !metadata.is_file() {
        return Err(anyhow!("not a regular file: {}", path.display()));
    }
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;

    let file_id = FileId::new(nanoid!());
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "uploaded.bin".to_string());
    send_event(
        outbound,
        &ClientEvent::UploadStart {
            file_id: file_id.clone(),
            name,
            size: i64::try_from(metadata.len()).unwrap_or(-1),
        },
    )?;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer).await.context("failed to read file")?;
        if read == 0 {
            break;
        }
        let meta = ClientEvent::UploadChunkMeta {
            file_id: file_id.clone(),
            len: read as i32,
        };
        let batch = vec![
            Message::Text(meta.encode().context("failed to encode chunk metadata")?),
            Message::Binary(buffer[..read].to_vec()),
        ];
        outbound
            .send(batch)
            .map_err(|_| anyhow!("connection to hub is closed"))?;
        tokio::time::sleep(CHUNK_PACING).await;
    }

    send_event(
        outbound,
        &ClientEvent::UploadEnd {
            file_id: Some(file_id),
            name: None,
        },
    )?;
    write_stdout(&format!("*** upload finished: {}", path.display())).await?;
    Ok(())
}

pub fn render_server_event(event: &ServerEvent) -> String {
    match event {
        ServerEvent::Chat { user, text } => format!("[{user}] {text}"),
        ServerEvent::System(system) => match system {
            SystemEvent::Join { user } => format!("*** {user} joined the chat"),
            SystemEvent::UploadStarted { file, .. } => format!("*** upload started: {file}"),
            SystemEvent::UploadReceiving {
                file,
                part: Some(part),
                ..
            } => format!("*** receiving part {part} of {file}"),
            SystemEvent::UploadReceiving {
                file,
                received: Some(received),
                ..
            } => format!("*** receiving {file}: {received} bytes"),
            SystemEvent::UploadReceiving { file, .. } => format!("*** receiving {file}"),
            SystemEvent::UploadDone {
                file,
                path: Some(path),
                ..
            } => format!("*** upload finished: {file} -> {path}"),
            SystemEvent::UploadDone { file, .. } => format!("*** upload finished: {file}"),
            SystemEvent::PdfCreating { title } => format!("*** creating pdf: {title}"),
            SystemEvent::PdfReady { title } => format!("*** pdf ready: {title}"),
        },
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
