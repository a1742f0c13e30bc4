//! Typed command facade over a [`Session`].
//!
//! Every command uses a fixed request identifier. Identifiers only need to be
//! unique among requests in flight, so running the same command concurrently
//! from two callers is not supported: the later call supersedes the earlier
//! one, which fails with [`SessionError::Superseded`].

use crate::codec::{Request, ResponseFrame};
use crate::error::{RemoteError, SessionError};
use crate::model::{CommandOutcome, SceneCollection, SceneInfo, StreamingState};
use crate::session::{Notification, NotificationListener, Session, SessionOptions, SubscriptionId};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;

pub const DEFAULT_STOP_RETRY_INTERVAL: Duration = Duration::from_secs(1);

const STREAMING_SERVICE: &str = "StreamingService";
const SCENES_SERVICE: &str = "ScenesService";
const SCENE_COLLECTIONS_SERVICE: &str = "SceneCollectionsService";
const TCP_SERVER_SERVICE: &str = "TcpServerService";

/// Request identifiers per command.
pub mod ids {
    pub const START_STREAMING: u64 = 1;
    pub const STOP_STREAMING: u64 = 2;
    pub const START_RECORDING: u64 = 3;
    pub const STOP_RECORDING: u64 = 4;
    pub const STREAMING_STATE: u64 = 5;
    pub const SCENES: u64 = 6;
    pub const ACTIVE_SCENE: u64 = 7;
    pub const SELECT_SCENE: u64 = 8;
    pub const SCENE_COLLECTIONS: u64 = 9;
    pub const ACTIVE_COLLECTION: u64 = 10;
    pub const SELECT_COLLECTION: u64 = 11;
    pub const SUBSCRIBE_STREAMING_STATUS: u64 = 12;
    pub const SUBSCRIBE_RECORDING_STATUS: u64 = 13;
    pub const SUBSCRIBE_SCENE_SWITCHED: u64 = 14;
    pub const SUBSCRIBE_COLLECTION_SWITCHED: u64 = 15;
    pub const AUTH: u64 = 16;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    #[cfg(windows)]
    NamedPipe(String),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            #[cfg(windows)]
            Self::NamedPipe(name) => write!(f, r"\\.\pipe\{name}"),
        }
    }
}

pub struct RemoteControl {
    session: Session,
    stop_retry_interval: Duration,
}

impl RemoteControl {
    /// Opens the byte stream to the remote and starts a session on it.
    pub async fn connect(
        endpoint: &Endpoint,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let cannot_connect = |source: std::io::Error| SessionError::CannotConnect {
            endpoint: endpoint.to_string(),
            source,
        };

        let session = match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(cannot_connect)?;
                let (reader, writer) = stream.into_split();
                Session::open(reader, writer, options)
            }
            #[cfg(windows)]
            Endpoint::NamedPipe(_) => {
                use tokio::net::windows::named_pipe::ClientOptions;
                let pipe = ClientOptions::new()
                    .open(endpoint.to_string())
                    .map_err(cannot_connect)?;
                let (reader, writer) = tokio::io::split(pipe);
                Session::open(reader, writer, options)
            }
        };

        tracing::info!(%endpoint, "connected to remote control API");
        Ok(Self::from_session(session))
    }

    pub fn from_session(session: Session) -> Self {
        Self {
            session,
            stop_retry_interval: DEFAULT_STOP_RETRY_INTERVAL,
        }
    }

    pub fn with_stop_retry_interval(mut self, interval: Duration) -> Self {
        self.stop_retry_interval = interval;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn close(&self) {
        self.session.close().await;
    }

    pub async fn authenticate(&self, token: &str) -> Result<CommandOutcome, SessionError> {
        self.command(Request::call(ids::AUTH, TCP_SERVER_SERVICE, "auth").arg(token))
            .await
    }

    pub async fn streaming_state(&self) -> Result<StreamingState, RemoteError> {
        self.query(Request::call(ids::STREAMING_STATE, STREAMING_SERVICE, "getModel"))
            .await
    }

    pub async fn start_streaming(&self) -> Result<CommandOutcome, SessionError> {
        self.command(Request::call(ids::START_STREAMING, STREAMING_SERVICE, "startStreaming"))
            .await
    }

    /// Stops streaming. Resolves once the remote rejects a stop request, which
    /// means nothing is streaming any more.
    pub async fn stop_streaming(&self) -> Result<(), SessionError> {
        self.stop_until_rejected(Request::call(
            ids::STOP_STREAMING,
            STREAMING_SERVICE,
            "stopStreaming",
        ))
        .await
    }

    pub async fn start_recording(&self) -> Result<CommandOutcome, SessionError> {
        self.command(Request::call(ids::START_RECORDING, STREAMING_SERVICE, "startRecording"))
            .await
    }

    /// Same acknowledgement policy as [`stop_streaming`](Self::stop_streaming).
    pub async fn stop_recording(&self) -> Result<(), SessionError> {
        self.stop_until_rejected(Request::call(
            ids::STOP_RECORDING,
            STREAMING_SERVICE,
            "stopRecording",
        ))
        .await
    }

    pub async fn scenes(&self) -> Result<Vec<SceneInfo>, RemoteError> {
        self.query(Request::call(ids::SCENES, SCENES_SERVICE, "getScenes"))
            .await
    }

    pub async fn active_scene(&self) -> Result<SceneInfo, RemoteError> {
        self.query(Request::call(ids::ACTIVE_SCENE, SCENES_SERVICE, "activeScene"))
            .await
    }

    pub async fn select_scene(&self, name: &str) -> Result<CommandOutcome, RemoteError> {
        let scene = self
            .scenes()
            .await?
            .into_iter()
            .find(|scene| scene.name == name)
            .ok_or_else(|| RemoteError::UnknownName {
                kind: "scene",
                name: name.to_string(),
            })?;
        let outcome = self
            .command(
                Request::call(ids::SELECT_SCENE, SCENES_SERVICE, "makeSceneActive").arg(scene.id),
            )
            .await?;
        Ok(outcome)
    }

    pub async fn scene_collections(&self) -> Result<Vec<SceneCollection>, RemoteError> {
        self.query(Request::call(
            ids::SCENE_COLLECTIONS,
            SCENE_COLLECTIONS_SERVICE,
            "collections",
        ))
        .await
    }

    pub async fn active_collection(&self) -> Result<Option<SceneCollection>, RemoteError> {
        self.query(Request::call(
            ids::ACTIVE_COLLECTION,
            SCENE_COLLECTIONS_SERVICE,
            "activeCollection",
        ))
        .await
    }

    /// Loads the named scene collection. The remote never answers a load of
    /// the collection that is already active, so that case returns without
    /// sending anything.
    pub async fn select_collection(&self, name: &str) -> Result<CommandOutcome, RemoteError> {
        if let Some(active) = self.active_collection().await? {
            if active.name == name {
                tracing::debug!(collection = %name, "scene collection already active");
                return Ok(CommandOutcome { error: false });
            }
        }

        let collection = self
            .scene_collections()
            .await?
            .into_iter()
            .find(|collection| collection.name == name)
            .ok_or_else(|| RemoteError::UnknownName {
                kind: "scene collection",
                name: name.to_string(),
            })?;
        let outcome = self
            .command(
                Request::call(ids::SELECT_COLLECTION, SCENE_COLLECTIONS_SERVICE, "load")
                    .arg(collection.id),
            )
            .await?;
        Ok(outcome)
    }

    /// Asks the remote to start pushing the four notification categories.
    pub async fn enable_notifications(&self) -> Result<(), SessionError> {
        for category in Notification::ALL {
            let outcome = self.command(subscription_request(category)).await?;
            if outcome.error {
                tracing::warn!(?category, "remote refused event subscription");
            }
        }
        Ok(())
    }

    pub fn subscribe<L>(&self, category: Notification, listener: L) -> SubscriptionId
    where
        L: NotificationListener + 'static,
    {
        self.session.subscribe(category, listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.session.unsubscribe(id)
    }

    pub fn on_streaming_status_changed<L>(&self, listener: L) -> SubscriptionId
    where
        L: NotificationListener + 'static,
    {
        self.subscribe(Notification::StreamingStatusChanged, listener)
    }

    pub fn on_recording_status_changed<L>(&self, listener: L) -> SubscriptionId
    where
        L: NotificationListener + 'static,
    {
        self.subscribe(Notification::RecordingStatusChanged, listener)
    }

    pub fn on_scene_switched<L>(&self, listener: L) -> SubscriptionId
    where
        L: NotificationListener + 'static,
    {
        self.subscribe(Notification::SceneSwitched, listener)
    }

    pub fn on_scene_collection_switched<L>(&self, listener: L) -> SubscriptionId
    where
        L: NotificationListener + 'static,
    {
        self.subscribe(Notification::SceneCollectionSwitched, listener)
    }

    async fn command(&self, request: Request) -> Result<CommandOutcome, SessionError> {
        let raw = self.session.send_and_await(&request).await?;
        Ok(CommandOutcome {
            error: response_is_error(&raw),
        })
    }

    async fn query<T: DeserializeOwned>(&self, request: Request) -> Result<T, RemoteError> {
        let raw = self.session.send_and_await(&request).await?;
        let frame = ResponseFrame::from_raw(&raw).ok_or_else(|| RemoteError::Rejected {
            method: request.method.clone(),
            body: raw.clone(),
        })?;
        if frame.is_error() {
            return Err(RemoteError::Rejected {
                method: request.method,
                body: raw,
            });
        }
        // A missing result decodes like `null`, which suits optional payloads.
        let decoded = match frame.result::<T>() {
            Some(result) => result,
            None => serde_json::from_value(serde_json::Value::Null),
        };
        decoded.map_err(|source| RemoteError::Decode {
            method: request.method,
            source,
        })
    }

    /// Re-issues `request` every retry interval until a response carries the
    /// error flag. A missing acknowledgement counts as "not yet stopped".
    async fn stop_until_rejected(&self, request: Request) -> Result<(), SessionError> {
        let mut attempt = 1u32;
        loop {
            let reply = self
                .session
                .send_and_await_within(&request, self.stop_retry_interval)
                .await?;
            match reply {
                Some(raw) if response_is_error(&raw) => {
                    tracing::info!(method = %request.method, attempt, "remote reports already stopped");
                    return Ok(());
                }
                Some(_) => {
                    tracing::debug!(method = %request.method, attempt, "stop acknowledged; re-issuing");
                    tokio::time::sleep(self.stop_retry_interval).await;
                }
                None => {
                    tracing::debug!(method = %request.method, attempt, "stop not acknowledged; re-issuing");
                }
            }
            attempt += 1;
        }
    }
}

fn response_is_error(raw: &str) -> bool {
    ResponseFrame::from_raw(raw)
        .map(|frame| frame.is_error())
        .unwrap_or(false)
}

fn subscription_request(category: Notification) -> Request {
    let id = match category {
        Notification::StreamingStatusChanged => ids::SUBSCRIBE_STREAMING_STATUS,
        Notification::RecordingStatusChanged => ids::SUBSCRIBE_RECORDING_STATUS,
        Notification::SceneSwitched => ids::SUBSCRIBE_SCENE_SWITCHED,
        Notification::SceneCollectionSwitched => ids::SUBSCRIBE_COLLECTION_SWITCHED,
    };
    let (resource, method) = category
        .resource_id()
        .split_once('.')
        .unwrap_or((category.resource_id(), ""));
    Request::call(id, resource, method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_request;
    use crate::framing::{LineReader, LineWriter};
    use crate::model::StreamingStatus;
    use tokio::io::{duplex, split, DuplexStream};
    use tokio::task::JoinHandle;

    fn spawn_remote<F>(remote: DuplexStream, mut respond: F) -> JoinHandle<Vec<Request>>
    where
        F: FnMut(&Request) -> Vec<String> + Send + 'static,
    {
        tokio::spawn(async move {
            let (reader, writer) = split(remote);
            let mut lines = LineReader::new(reader);
            let mut out = LineWriter::new(writer);
            let mut seen = Vec::new();
            while let Some(line) = lines.next_line().await {
                let request = decode_request(&line).unwrap();
                for reply in respond(&request) {
                    if out.write_line(&reply).await.is_err() {
                        break;
                    }
                }
                seen.push(request);
            }
            seen
        })
    }

    fn control_with_remote<F>(respond: F) -> (RemoteControl, JoinHandle<Vec<Request>>)
    where
        F: FnMut(&Request) -> Vec<String> + Send + 'static,
    {
        let (local, remote) = duplex(64 * 1024);
        let (reader, writer) = split(local);
        let control = RemoteControl::from_session(Session::open(reader, writer, SessionOptions::default()));
        (control, spawn_remote(remote, respond))
    }

    #[tokio::test(start_paused = true)]
    async fn stop_streaming_succeeds_when_retry_is_rejected() {
        let mut replies = vec![
            r#"{"id":2,"error":true}"#.to_string(),
            r#"{"id":2,"error":false}"#.to_string(),
        ];
        let (control, remote) = control_with_remote(move |req| {
            assert_eq!(req.id, ids::STOP_STREAMING);
            replies.pop().into_iter().collect()
        });

        control.stop_streaming().await.unwrap();
        control.close().await;

        let seen = remote.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
        assert_eq!(seen[0].method, "stopStreaming");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_recording_retries_after_missing_acknowledgement() {
        let mut calls = 0;
        let (control, remote) = control_with_remote(move |_req| {
            calls += 1;
            if calls == 1 {
                Vec::new()
            } else {
                vec![r#"{"id":4,"error":true}"#.to_string()]
            }
        });

        control.stop_recording().await.unwrap();
        control.close().await;

        let seen = remote.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|r| r.id == ids::STOP_RECORDING));
    }

    #[tokio::test]
    async fn start_streaming_reports_success() {
        let (control, remote) =
            control_with_remote(|req| vec![format!(r#"{{"id":{},"error":false}}"#, req.id)]);

        let outcome = control.start_streaming().await.unwrap();
        assert!(outcome.succeeded());
        control.close().await;
        assert_eq!(remote.await.unwrap()[0].id, ids::START_STREAMING);
    }

    #[tokio::test]
    async fn select_collection_short_circuits_when_already_active() {
        let (control, remote) = control_with_remote(|req| match req.method.as_str() {
            "activeCollection" => vec![format!(
                r#"{{"id":{},"result":{{"id":"c1","name":"Main"}}}}"#,
                req.id
            )],
            _ => Vec::new(),
        });

        let outcome = control.select_collection("Main").await.unwrap();
        assert!(outcome.succeeded());
        control.close().await;

        let seen = remote.await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, "activeCollection");
    }

    #[tokio::test]
    async fn select_collection_loads_by_id() {
        let (control, remote) = control_with_remote(|req| match req.method.as_str() {
            "activeCollection" => vec![format!(
                r#"{{"id":{},"result":{{"id":"c1","name":"Main"}}}}"#,
                req.id
            )],
            "collections" => vec![format!(
                r#"{{"id":{},"result":[{{"id":"c1","name":"Main"}},{{"id":"c2","name":"Alt"}}]}}"#,
                req.id
            )],
            "load" => vec![format!(r#"{{"id":{},"error":false}}"#, req.id)],
            _ => Vec::new(),
        });

        let outcome = control.select_collection("Alt").await.unwrap();
        assert!(outcome.succeeded());
        control.close().await;

        let seen = remote.await.unwrap();
        let load = seen.iter().find(|r| r.method == "load").unwrap();
        assert_eq!(load.id, ids::SELECT_COLLECTION);
        assert_eq!(load.args(), &[serde_json::json!("c2")]);
    }

    #[tokio::test]
    async fn select_scene_with_unknown_name_sends_no_switch() {
        let (control, remote) = control_with_remote(|req| {
            vec![format!(
                r#"{{"id":{},"result":[{{"id":"s1","name":"Main"}}]}}"#,
                req.id
            )]
        });

        let err = control.select_scene("Missing").await.unwrap_err();
        assert!(matches!(err, RemoteError::UnknownName { kind: "scene", .. }));
        control.close().await;

        let seen = remote.await.unwrap();
        assert!(seen.iter().all(|r| r.method != "makeSceneActive"));
    }

    #[tokio::test]
    async fn streaming_state_is_decoded_and_rejection_surfaces() {
        let mut first = true;
        let (control, _remote) = control_with_remote(move |req| {
            let reply = if first {
                format!(
                    r#"{{"id":{},"result":{{"streamingStatus":"live","recordingStatus":"offline"}}}}"#,
                    req.id
                )
            } else {
                format!(r#"{{"id":{},"error":true}}"#, req.id)
            };
            first = false;
            vec![reply]
        });

        let state = control.streaming_state().await.unwrap();
        assert_eq!(state.streaming_status, StreamingStatus::Live);
        assert!(!state.is_recording());

        let err = control.scenes().await.unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { ref method, .. } if method == "getScenes"));
        control.close().await;
    }

    #[tokio::test]
    async fn enable_notifications_subscribes_to_each_event_source() {
        let (control, remote) =
            control_with_remote(|req| vec![format!(r#"{{"id":{},"result":{{"_type":"SUBSCRIPTION"}}}}"#, req.id)]);

        control.enable_notifications().await.unwrap();
        control.close().await;

        let seen = remote.await.unwrap();
        let targets: Vec<(String, String)> = seen
            .iter()
            .map(|r| (r.params.as_ref().unwrap().resource.clone(), r.method.clone()))
            .collect();
        assert_eq!(
            targets,
            vec![
                ("StreamingService".to_string(), "streamingStatusChange".to_string()),
                ("StreamingService".to_string(), "recordingStatusChange".to_string()),
                ("ScenesService".to_string(), "sceneSwitched".to_string()),
                ("SceneCollectionsService".to_string(), "collectionSwitched".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn connect_failure_names_the_endpoint() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        };
        let err = RemoteControl::connect(&endpoint, SessionOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::CannotConnect { .. }));
        assert!(err.to_string().contains(&format!("127.0.0.1:{port}")));
    }
}
