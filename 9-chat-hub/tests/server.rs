use std::time::Duration;

use anyhow::{Context, Result, bail};
use chat_hub::{
    config::{HubConfig, ReclaimPolicy},
    message::{ClientEvent, ServerEvent, SystemEvent},
    server::{CHAT_PATH, Server},
};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message, http::StatusCode},
};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn send_event(socket: &mut Socket, event: &ClientEvent) -> Result<()> {
    socket.send(Message::Text(event.encode()?)).await?;
    Ok(())
}

async fn next_event(socket: &mut Socket) -> Result<ServerEvent> {
    loop {
        let frame = timeout(WAIT, socket.next())
            .await
            .context("timed out waiting for a frame")?
            .context("server closed the stream")??;
        match frame {
            Message::Text(text) => return Ok(ServerEvent::decode(&text)?),
            Message::Close(_) => bail!("server closed the connection"),
            _ => continue,
        }
    }
}

/// Joins and waits for the echo, so the hub has registered the connection.
async fn join(url: &str, user: &str) -> Result<Socket> {
    let (mut socket, _) = connect_async(url).await?;
    send_event(
        &mut socket,
        &ClientEvent::System(SystemEvent::Join { user: user.into() }),
    )
    .await?;
    loop {
        if let ServerEvent::System(SystemEvent::Join { user: joined }) = next_event(&mut socket).await? {
            if joined == user {
                return Ok(socket);
            }
        }
    }
}

#[tokio::test]
async fn chat_uploads_and_pdfs_reach_every_client() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = Server::new(
        listener,
        HubConfig {
            upload_dir: dir.path().to_path_buf(),
            pdf_delay: Duration::from_millis(50),
            reclaim: ReclaimPolicy::OnDisconnect,
            ..HubConfig::default()
        },
    );
    let url = format!("ws://{}{CHAT_PATH}", server.local_addr()?);
    let hub = server.hub();

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_until(async move {
        let _ = shutdown_rx.await;
    }));

    let mut alice = join(&url, "alice").await?;
    let mut bob = join(&url, "bob").await?;
    assert_eq!(
        next_event(&mut alice).await?,
        ServerEvent::from(SystemEvent::Join { user: "bob".into() })
    );
    assert_eq!(hub.connection_count(), 2);

    send_event(
        &mut alice,
        &ClientEvent::Chat {
            user: "alice".into(),
            text: "hello".into(),
        },
    )
    .await?;
    let hello = ServerEvent::Chat {
        user: "alice".into(),
        text: "hello".into(),
    };
    assert_eq!(next_event(&mut alice).await?, hello);
    assert_eq!(next_event(&mut bob).await?, hello);

    send_event(
        &mut alice,
        &ClientEvent::UploadStart {
            file_id: "f1".into(),
            name: "x.bin".into(),
            size: 6,
        },
    )
    .await?;
    for chunk in [b"abc", b"def"] {
        send_event(
            &mut alice,
            &ClientEvent::UploadChunkMeta {
                file_id: "f1".into(),
                len: 3,
            },
        )
        .await?;
        alice.send(Message::Binary(chunk.to_vec())).await?;
    }
    send_event(
        &mut alice,
        &ClientEvent::UploadEnd {
            file_id: Some("f1".into()),
            name: None,
        },
    )
    .await?;

    assert!(matches!(
        next_event(&mut bob).await?,
        ServerEvent::System(SystemEvent::UploadStarted { size: Some(6), .. })
    ));
    for expected in [3, 6] {
        match next_event(&mut bob).await? {
            ServerEvent::System(SystemEvent::UploadReceiving { received, .. }) => {
                assert_eq!(received, Some(expected));
            }
            other => bail!("expected upload progress, got {other:?}"),
        }
    }
    let path = match next_event(&mut bob).await? {
        ServerEvent::System(SystemEvent::UploadDone {
            path: Some(path), ..
        }) => path,
        other => bail!("expected upload_done, got {other:?}"),
    };
    assert_eq!(tokio::fs::read(&path).await?, b"abcdef");

    send_event(
        &mut bob,
        &ClientEvent::CreatePdf {
            title: "Q3".into(),
        },
    )
    .await?;
    assert_eq!(
        next_event(&mut bob).await?,
        ServerEvent::from(SystemEvent::PdfCreating { title: "Q3".into() })
    );
    assert_eq!(
        next_event(&mut bob).await?,
        ServerEvent::from(SystemEvent::PdfReady { title: "Q3".into() })
    );

    alice.close(None).await?;
    bob.close(None).await?;
    let _ = shutdown_tx.send(());
    timeout(WAIT, handle).await???;
    assert_eq!(hub.connection_count(), 0);
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_connected_clients() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = Server::new(
        listener,
        HubConfig {
            upload_dir: dir.path().to_path_buf(),
            shutdown_grace: Duration::from_millis(100),
            ..HubConfig::default()
        },
    );
    let url = format!("ws://{}{CHAT_PATH}", server.local_addr()?);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_until(async move {
        let _ = shutdown_rx.await;
    }));

    let mut carol = join(&url, "carol").await?;
    let _ = shutdown_tx.send(());

    let closed = timeout(WAIT, async {
        loop {
            match carol.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "client was never closed");

    timeout(WAIT, handle).await???;
    Ok(())
}

#[tokio::test]
async fn handshakes_during_shutdown_are_refused() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = Server::new(
        listener,
        HubConfig {
            upload_dir: dir.path().to_path_buf(),
            pdf_delay: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(500),
            ..HubConfig::default()
        },
    );
    let url = format!("ws://{}{CHAT_PATH}", server.local_addr()?);
    let hub = server.hub();

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_until(async move {
        let _ = shutdown_rx.await;
    }));

    let mut dave = join(&url, "dave").await?;
    send_event(
        &mut dave,
        &ClientEvent::CreatePdf {
            title: "never".into(),
        },
    )
    .await?;
    assert_eq!(
        next_event(&mut dave).await?,
        ServerEvent::from(SystemEvent::PdfCreating {
            title: "never".into()
        })
    );
    let _ = shutdown_tx.send(());
    timeout(WAIT, async {
        while !hub.is_shutting_down() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    match connect_async(url.as_str()).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
        Ok(_) => bail!("upgrade accepted while shutting down"),
        Err(other) => bail!("unexpected handshake failure: {other}"),
    }

    timeout(WAIT, handle).await???;
    Ok(())
}
