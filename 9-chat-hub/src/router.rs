//! Turns inbound frames into store updates and broadcasts.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    binding::BinaryCorrelator,
    broadcast::Broadcaster,
    message::{ClientEvent, FileId, ServerEvent, SystemEvent},
    pool::{BackgroundTask, TaskPool},
    registry::ConnectionId,
    upload::{UploadError, UploadManager},
};

pub struct Router {
    broadcaster: Broadcaster,
    correlator: Arc<BinaryCorrelator>,
    uploads: Arc<UploadManager>,
    pool: Arc<TaskPool>,
    pdf_delay: Duration,
}

impl Router {
    pub fn new(
        broadcaster: Broadcaster,
        correlator: Arc<BinaryCorrelator>,
        uploads: Arc<UploadManager>,
        pool: Arc<TaskPool>,
        pdf_delay: Duration,
    ) -> Self {
        Self {
            broadcaster,
            correlator,
            uploads,
            pool,
            pdf_delay,
        }
    }

    /// Malformed frames are logged and dropped; the connection stays usable.
    pub async fn route_text(&self, conn: ConnectionId, raw: &str) {
        match ClientEvent::decode(raw) {
            Ok(event) => self.route_event(conn, event).await,
            Err(error) => {
                warn!(%conn, %error, frame_len = raw.len(), "dropping malformed frame");
            }
        }
    }

    pub async fn route_event(&self, conn: ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::Chat { user, text } => {
                debug!(%conn, %user, "chat");
                self.broadcaster.broadcast(&ServerEvent::Chat { user, text });
            }
            ClientEvent::UploadStart {
                file_id,
                name,
                size,
            } => self.start_upload(conn, file_id, &name, size).await,
            ClientEvent::UploadChunkMeta { file_id, len } => {
                if let Some(displaced) = self.correlator.arm(conn, file_id.clone()) {
                    warn!(%conn, %displaced, %file_id, "chunk metadata replaced an unconsumed binding");
                }
                debug!(%conn, %file_id, len, "armed binary binding");
            }
            ClientEvent::UploadChunk { name, part } => {
                info!(%conn, file = %name, part, "simulated upload chunk");
                self.broadcaster
                    .broadcast(&ServerEvent::from(SystemEvent::UploadReceiving {
                        file: name,
                        file_id: None,
                        part: Some(part),
                        received: None,
                    }));
            }
            ClientEvent::UploadEnd { file_id, name } => {
                match file_id.filter(|file_id| !file_id.is_empty()) {
                    Some(file_id) => self.finish_upload(conn, &file_id).await,
                    None => {
                        let file = name.unwrap_or_else(|| "unknown".to_string());
                        info!(%conn, %file, "simulated upload finished");
                        self.broadcaster
                            .broadcast(&ServerEvent::from(SystemEvent::UploadDone {
                                file,
                                file_id: None,
                                path: None,
                                received: None,
                            }));
                    }
                }
            }
            ClientEvent::CreatePdf { title } => self.create_pdf(conn, title),
            ClientEvent::System(SystemEvent::Join { user }) => {
                info!(%conn, %user, "user joined");
                self.broadcaster
                    .broadcast(&ServerEvent::from(SystemEvent::Join { user }));
            }
            ClientEvent::System(other) => {
                warn!(%conn, event = ?other, "ignoring system event sent by a client");
            }
            ClientEvent::Unknown => {
                warn!(%conn, "ignoring frame with unknown kind");
            }
        }
    }

    /// Binary frames belong to whatever upload the connection's last chunk
    /// metadata named. Without one, the frame is dropped.
    pub async fn route_binary(&self, conn: ConnectionId, bytes: &[u8]) {
        let Some(file_id) = self.correlator.take(conn) else {
            warn!(%conn, len = bytes.len(), "unexpected binary frame without chunk metadata");
            return;
        };

        match self.uploads.write(conn, &file_id, bytes).await {
            Ok(progress) => {
                debug!(%conn, %file_id, received = progress.received, "upload chunk written");
                self.broadcaster
                    .broadcast(&ServerEvent::from(SystemEvent::UploadReceiving {
                        file: progress.name,
                        file_id: Some(progress.file_id),
                        part: None,
                        received: Some(progress.received),
                    }));
            }
            Err(error @ UploadError::Io { .. }) => {
                warn!(%conn, %file_id, error = ?error, "upload aborted after write failure");
            }
            Err(error) => {
                warn!(%conn, %file_id, %error, len = bytes.len(), "dropping binary frame");
            }
        }
    }

    async fn start_upload(&self, conn: ConnectionId, file_id: FileId, name: &str, size: i64) {
        if file_id.is_empty() {
            warn!(%conn, name, "dropping upload_start without a fileId");
            return;
        }

        match self.uploads.start(conn, file_id, name, size).await {
            Ok(session) => {
                info!(
                    %conn,
                    file_id = %session.file_id(),
                    name = session.name(),
                    expected = size,
                    path = %session.path().display(),
                    "upload started"
                );
                self.broadcaster
                    .broadcast(&ServerEvent::from(SystemEvent::UploadStarted {
                        file_id: session.file_id().clone(),
                        file: session.name().to_string(),
                        size: session.expected_size(),
                    }));
            }
            Err(error) => {
                warn!(%conn, name, error = ?error, "could not start upload");
            }
        }
    }

    async fn finish_upload(&self, conn: ConnectionId, file_id: &FileId) {
        match self.uploads.finish(file_id).await {
            Ok(done) => {
                if let Some(expected) = done.expected_size.filter(|&expected| expected != done.received) {
                    warn!(%conn, %file_id, expected, received = done.received, "upload size differs from declared size");
                }
                info!(
                    %conn,
                    %file_id,
                    name = %done.name,
                    received = done.received,
                    path = %done.path.display(),
                    "upload finished"
                );
                self.broadcaster
                    .broadcast(&ServerEvent::from(SystemEvent::UploadDone {
                        file: done.name,
                        file_id: Some(done.file_id),
                        path: Some(done.path.display().to_string()),
                        received: Some(done.received),
                    }));
            }
            Err(error) => {
                warn!(%conn, %file_id, error = ?error, "could not finish upload");
            }
        }
    }

    /// Announces the document right away, renders it off the inbound path.
    fn create_pdf(&self, conn: ConnectionId, title: String) {
        info!(%conn, %title, "pdf requested");
        self.broadcaster
            .broadcast(&ServerEvent::from(SystemEvent::PdfCreating {
                title: title.clone(),
            }));

        let broadcaster = self.broadcaster.clone();
        let delay = self.pdf_delay;
        let task = BackgroundTask::new(
            format!("pdf:{title}"),
            async move {
                tokio::time::sleep(delay).await;
                title
            },
            move |title| {
                info!(%title, "pdf ready");
                broadcaster.broadcast(&ServerEvent::from(SystemEvent::PdfReady { title }));
            },
        );

        if let Err(error) = self.pool.submit(task) {
            warn!(%conn, %error, "pdf job rejected");
        }
    }
}
