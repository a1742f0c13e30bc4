use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneCollection {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamingStatus {
    #[default]
    Offline,
    Starting,
    Live,
    Ending,
    Reconnecting,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    #[default]
    Offline,
    Starting,
    Recording,
    Stopping,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamingState {
    pub streaming_status: StreamingStatus,
    pub streaming_status_time: Option<String>,
    pub recording_status: RecordingStatus,
    pub recording_status_time: Option<String>,
}

impl StreamingState {
    pub fn is_streaming(&self) -> bool {
        !matches!(self.streaming_status, StreamingStatus::Offline)
    }

    pub fn is_recording(&self) -> bool {
        !matches!(self.recording_status, RecordingStatus::Offline)
    }
}

/// Result of a command whose payload is irrelevant; only the protocol-level
/// error flag is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub error: bool,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        !self.error
    }
}
