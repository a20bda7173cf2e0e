use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-chosen opaque token identifying one file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Text frames sent by a peer. The `kind` field selects the variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientEvent {
    Chat {
        user: String,
        text: String,
    },
    UploadStart {
        #[serde(rename = "fileId")]
        file_id: FileId,
        name: String,
        /// Declared total size; negative when the sender does not know it.
        size: i64,
    },
    UploadChunkMeta {
        #[serde(rename = "fileId")]
        file_id: FileId,
        /// Advisory only, correlation never looks at it.
        len: i32,
    },
    /// Simulated upload progress, nothing is stored.
    UploadChunk {
        name: String,
        part: i32,
    },
    UploadEnd {
        #[serde(rename = "fileId", default, skip_serializing_if = "Option::is_none")]
        file_id: Option<FileId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    CreatePdf {
        title: String,
    },
    System(SystemEvent),
    #[serde(other)]
    Unknown,
}

impl ClientEvent {
    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Text frames fanned out to every peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerEvent {
    Chat { user: String, text: String },
    System(SystemEvent),
}

impl ServerEvent {
    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<SystemEvent> for ServerEvent {
    fn from(event: SystemEvent) -> Self {
        ServerEvent::System(event)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SystemEvent {
    Join {
        user: String,
    },
    UploadStarted {
        #[serde(rename = "fileId")]
        file_id: FileId,
        file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
    },
    UploadReceiving {
        file: String,
        #[serde(rename = "fileId", default, skip_serializing_if = "Option::is_none")]
        file_id: Option<FileId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        part: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        received: Option<u64>,
    },
    UploadDone {
        file: String,
        #[serde(rename = "fileId", default, skip_serializing_if = "Option::is_none")]
        file_id: Option<FileId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        received: Option<u64>,
    },
    PdfCreating {
        title: String,
    },
    PdfReady {
        title: String,
    },
}
