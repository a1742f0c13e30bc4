//! Live broadcast lifecycle control.
//!
//! The scheduling service only offers a transition command and a status
//! query, so a transition is confirmed by polling until the broadcast
//! reports the lifecycle status that follows the requested transition.

use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_LENGTH},
    Client, Method, Request, StatusCode, Url,
};
use serde::Deserialize;
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/youtube/v3/";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("config error: {0}")]
    Config(&'static str),
    #[error("url error: {0}")]
    Url(String),
    #[error("http error: {0}")]
    Http(#[source] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[source] serde_json::Error),
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[source] reqwest::header::InvalidHeaderValue),
    #[error("api error {}: {body}", .status.as_u16())]
    Api { status: StatusCode, body: String },
    #[error("broadcast {broadcast_id} not found")]
    NotFound { broadcast_id: String },
    #[error("broadcast {broadcast_id} did not reach '{expected}' in time")]
    TimedOut {
        broadcast_id: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BeginTest,
    GoLive,
    End,
}

impl Transition {
    /// Value of the `broadcastStatus` parameter of the transition command.
    pub fn target_status(self) -> &'static str {
        match self {
            Self::BeginTest => "testing",
            Self::GoLive => "live",
            Self::End => "complete",
        }
    }

    /// Lifecycle status that confirms the transition took effect.
    pub fn expected_lifecycle_status(self) -> &'static str {
        match self {
            Self::BeginTest => "testing",
            Self::GoLive => "liveStarting",
            Self::End => "complete",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.target_status())
    }
}

impl FromStr for Transition {
    type Err = BroadcastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "testing" | "test" => Ok(Self::BeginTest),
            "live" => Ok(Self::GoLive),
            "complete" | "end" => Ok(Self::End),
            _ => Err(BroadcastError::Config(
                "transition must be one of testing, live, complete",
            )),
        }
    }
}

/// Operations the confirmation engine needs from the scheduling service.
#[allow(async_fn_in_trait)]
pub trait BroadcastApi {
    async fn lifecycle_status(&self, broadcast_id: &str) -> Result<String, BroadcastError>;

    async fn transition(
        &self,
        transition: Transition,
        broadcast_id: &str,
    ) -> Result<(), BroadcastError>;
}

#[derive(Clone, Debug)]
pub struct BroadcastClient {
    http: Client,
    base_url: Url,
    access_token: String,
}

#[derive(Clone, Debug)]
pub struct BroadcastClientBuilder {
    base_url: String,
    access_token: String,
    timeout: Duration,
}

impl BroadcastClientBuilder {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            access_token: access_token.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<BroadcastClient, BroadcastError> {
        BroadcastClient::from_parts(self.base_url, self.access_token, self.timeout)
    }
}

impl BroadcastClient {
    pub fn builder(
        base_url: impl Into<String>,
        access_token: impl Into<String>,
    ) -> BroadcastClientBuilder {
        BroadcastClientBuilder::new(base_url, access_token)
    }

    fn from_parts(
        base_url: String,
        access_token: String,
        timeout: Duration,
    ) -> Result<Self, BroadcastError> {
        if access_token.trim().is_empty() {
            return Err(BroadcastError::Config(
                "broadcast access token must not be empty",
            ));
        }

        let mut parsed =
            Url::parse(base_url.trim()).map_err(|err| BroadcastError::Url(err.to_string()))?;
        if !parsed.path().ends_with('/') {
            let new_path = format!("{}/", parsed.path().trim_end_matches('/'));
            parsed.set_path(&new_path);
        }

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(BroadcastError::Http)?;

        Ok(Self {
            http,
            base_url: parsed,
            access_token: access_token.trim().to_string(),
        })
    }

    pub fn build_list_request(&self, broadcast_id: &str) -> Result<Request, BroadcastError> {
        self.build_request(
            Method::GET,
            "liveBroadcasts",
            &[("part", "status"), ("id", broadcast_id)],
        )
    }

    pub fn build_transition_request(
        &self,
        transition: Transition,
        broadcast_id: &str,
    ) -> Result<Request, BroadcastError> {
        let mut req = self.build_request(
            Method::POST,
            "liveBroadcasts/transition",
            &[
                ("broadcastStatus", transition.target_status()),
                ("id", broadcast_id),
                ("part", "status"),
            ],
        )?;
        req.headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        Ok(req)
    }

    fn build_request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Request, BroadcastError> {
        if query.iter().any(|(_, value)| value.trim().is_empty()) {
            return Err(BroadcastError::Config("broadcast id must not be empty"));
        }
        let mut url = self
            .base_url
            .join(path)
            .map_err(|err| BroadcastError::Url(err.to_string()))?;
        url.query_pairs_mut().extend_pairs(query);

        self.http
            .request(method, url)
            .headers(self.common_headers()?)
            .build()
            .map_err(BroadcastError::Http)
    }

    fn common_headers(&self) -> Result<HeaderMap, BroadcastError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.access_token))
                .map_err(BroadcastError::InvalidHeaderValue)?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn execute(&self, req: Request) -> Result<(StatusCode, String), BroadcastError> {
        let resp = self.http.execute(req).await.map_err(BroadcastError::Http)?;
        let status = resp.status();
        let body = resp.text().await.map_err(BroadcastError::Http)?;
        Ok((status, body))
    }
}

impl BroadcastApi for BroadcastClient {
    async fn lifecycle_status(&self, broadcast_id: &str) -> Result<String, BroadcastError> {
        let (status, body) = self.execute(self.build_list_request(broadcast_id)?).await?;
        parse_list_response(status, &body, broadcast_id)
    }

    async fn transition(
        &self,
        transition: Transition,
        broadcast_id: &str,
    ) -> Result<(), BroadcastError> {
        let req = self.build_transition_request(transition, broadcast_id)?;
        let (status, body) = self.execute(req).await?;
        parse_transition_response(status, &body)
    }
}

#[derive(Debug, Deserialize)]
struct LiveBroadcastList {
    #[serde(default)]
    items: Vec<LiveBroadcast>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveBroadcast {
    #[serde(default)]
    id: Option<String>,
    status: LiveBroadcastStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveBroadcastStatus {
    life_cycle_status: String,
}

pub fn parse_list_response(
    status: StatusCode,
    body: &str,
    broadcast_id: &str,
) -> Result<String, BroadcastError> {
    if !status.is_success() {
        return Err(BroadcastError::Api {
            status,
            body: body.to_string(),
        });
    }
    let list: LiveBroadcastList = serde_json::from_str(body).map_err(BroadcastError::Json)?;
    list.items
        .into_iter()
        .find(|item| item.id.as_deref().map_or(true, |id| id == broadcast_id))
        .map(|item| item.status.life_cycle_status)
        .ok_or_else(|| BroadcastError::NotFound {
            broadcast_id: broadcast_id.to_string(),
        })
}

pub fn parse_transition_response(status: StatusCode, body: &str) -> Result<(), BroadcastError> {
    if !status.is_success() {
        return Err(BroadcastError::Api {
            status,
            body: body.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionState {
    Requested,
    Polling,
    Confirmed,
}

/// One confirmation run. Lives only for the duration of `confirm`.
#[derive(Debug, Clone)]
pub struct TransitionAttempt {
    pub broadcast_id: String,
    pub transition: Transition,
    pub state: TransitionState,
    pub polls: u32,
    pub last_status: Option<String>,
}

impl TransitionAttempt {
    pub fn new(broadcast_id: impl Into<String>, transition: Transition) -> Self {
        Self {
            broadcast_id: broadcast_id.into(),
            transition,
            state: TransitionState::Requested,
            polls: 0,
            last_status: None,
        }
    }

    pub fn expected(&self) -> &'static str {
        self.transition.expected_lifecycle_status()
    }

    /// Records one polled status and returns the resulting state.
    pub fn observe(&mut self, status: &str) -> TransitionState {
        self.polls += 1;
        self.state = if status == self.expected() {
            TransitionState::Confirmed
        } else {
            TransitionState::Polling
        };
        self.last_status = Some(status.to_string());
        self.state
    }
}

/// Drives a transition to confirmation by polling.
///
/// Without a timeout a broadcast that never reaches the expected status keeps
/// the caller waiting forever. `with_timeout` bounds the wait; that bound is
/// an addition and off by default.
pub struct TransitionConfirmer<A> {
    api: A,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl<A> TransitionConfirmer<A>
where
    A: BroadcastApi,
{
    pub fn new(api: A) -> Self {
        Self {
            api,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub async fn confirm(
        &self,
        broadcast_id: &str,
        transition: Transition,
    ) -> Result<TransitionAttempt, BroadcastError> {
        let mut attempt = TransitionAttempt::new(broadcast_id, transition);
        let started = tokio::time::Instant::now();

        tracing::info!(broadcast_id, %transition, "requesting broadcast transition");
        if let Err(err) = self.api.transition(transition, broadcast_id).await {
            // Acceptance is not awaited; polling decides the outcome.
            tracing::warn!(broadcast_id, %transition, error = %err, "transition request failed");
        }
        attempt.state = TransitionState::Polling;

        loop {
            tokio::time::sleep(self.poll_interval).await;
            match self.api.lifecycle_status(broadcast_id).await {
                Ok(status) => {
                    if attempt.observe(&status) == TransitionState::Confirmed {
                        tracing::info!(
                            broadcast_id,
                            status = %status,
                            polls = attempt.polls,
                            "broadcast transition confirmed"
                        );
                        return Ok(attempt);
                    }
                    tracing::info!(
                        broadcast_id,
                        observed = %status,
                        expected = attempt.expected(),
                        polls = attempt.polls,
                        "waiting for broadcast transition"
                    );
                }
                Err(err) => {
                    tracing::warn!(broadcast_id, error = %err, "broadcast status poll failed");
                }
            }

            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    return Err(BroadcastError::TimedOut {
                        broadcast_id: broadcast_id.to_string(),
                        expected: attempt.expected(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn client() -> BroadcastClient {
        BroadcastClient::builder("https://api.example.test/youtube/v3", "token-123")
            .build()
            .unwrap()
    }

    #[derive(Default)]
    struct ScriptedApi {
        statuses: Mutex<VecDeque<Result<String, BroadcastError>>>,
        fallback: &'static str,
        transitions: Mutex<Vec<(Transition, String)>>,
    }

    impl ScriptedApi {
        fn new(statuses: &[&str], fallback: &'static str) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().map(|s| Ok(s.to_string())).collect()),
                fallback,
                transitions: Mutex::default(),
            }
        }
    }

    impl BroadcastApi for ScriptedApi {
        async fn lifecycle_status(&self, _broadcast_id: &str) -> Result<String, BroadcastError> {
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.to_string()))
        }

        async fn transition(
            &self,
            transition: Transition,
            broadcast_id: &str,
        ) -> Result<(), BroadcastError> {
            self.transitions
                .lock()
                .unwrap()
                .push((transition, broadcast_id.to_string()));
            Ok(())
        }
    }

    #[test]
    fn list_request_targets_status_part_with_bearer_token() {
        let req = client().build_list_request("bc-1").unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(
            req.url().as_str(),
            "https://api.example.test/youtube/v3/liveBroadcasts?part=status&id=bc-1"
        );
        assert_eq!(
            req.headers().get(AUTHORIZATION).unwrap(),
            &HeaderValue::from_static("Bearer token-123")
        );
    }

    #[test]
    fn transition_request_carries_target_status() {
        let req = client()
            .build_transition_request(Transition::GoLive, "bc-1")
            .unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(
            req.url().as_str(),
            "https://api.example.test/youtube/v3/liveBroadcasts/transition?broadcastStatus=live&id=bc-1&part=status"
        );
        assert_eq!(
            req.headers().get(CONTENT_LENGTH).unwrap(),
            &HeaderValue::from_static("0")
        );
    }

    #[test]
    fn rejects_empty_token_and_broadcast_id() {
        let err = BroadcastClient::builder(DEFAULT_BASE_URL, "  ")
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("access token"));
        assert!(client().build_list_request(" ").is_err());
    }

    #[test]
    fn parse_list_extracts_lifecycle_status() {
        let status = parse_list_response(
            StatusCode::OK,
            r#"{"kind":"youtube#liveBroadcastListResponse","items":[
                {"id":"bc-1","status":{"lifeCycleStatus":"liveStarting","privacyStatus":"public"}}
            ]}"#,
            "bc-1",
        )
        .unwrap();
        assert_eq!(status, "liveStarting");
    }

    #[test]
    fn parse_list_reports_missing_broadcast_and_api_errors() {
        let err = parse_list_response(StatusCode::OK, r#"{"items":[]}"#, "bc-9").unwrap_err();
        assert!(matches!(err, BroadcastError::NotFound { .. }));

        let err = parse_list_response(StatusCode::FORBIDDEN, "quota", "bc-9").unwrap_err();
        assert!(format!("{err}").contains("403"));
        assert!(parse_transition_response(StatusCode::BAD_REQUEST, "invalid").is_err());
        assert!(parse_transition_response(StatusCode::OK, "{}").is_ok());
    }

    #[test]
    fn transition_mapping_is_fixed() {
        assert_eq!(Transition::BeginTest.expected_lifecycle_status(), "testing");
        assert_eq!(Transition::GoLive.expected_lifecycle_status(), "liveStarting");
        assert_eq!(Transition::End.expected_lifecycle_status(), "complete");
        assert_eq!("live".parse::<Transition>().unwrap(), Transition::GoLive);
        assert!("paused".parse::<Transition>().is_err());
    }

    #[test]
    fn attempt_tracks_state_per_observation() {
        let mut attempt = TransitionAttempt::new("bc-1", Transition::End);
        assert_eq!(attempt.state, TransitionState::Requested);
        assert_eq!(attempt.observe("live"), TransitionState::Polling);
        assert_eq!(attempt.observe("complete"), TransitionState::Confirmed);
        assert_eq!(attempt.polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn go_live_confirms_on_third_poll() {
        let confirmer =
            TransitionConfirmer::new(ScriptedApi::new(&["testing", "testing", "liveStarting"], "live"));
        let started = tokio::time::Instant::now();

        let attempt = confirmer.confirm("bc-1", Transition::GoLive).await.unwrap();

        assert_eq!(attempt.polls, 3);
        assert_eq!(attempt.state, TransitionState::Confirmed);
        assert_eq!(attempt.last_status.as_deref(), Some("liveStarting"));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(
            confirmer.api().transitions.lock().unwrap().as_slice(),
            &[(Transition::GoLive, "bc-1".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_failures_keep_polling() {
        let api = ScriptedApi::new(&[], "complete");
        api.statuses.lock().unwrap().push_back(Err(BroadcastError::NotFound {
            broadcast_id: "bc-1".to_string(),
        }));
        let confirmer = TransitionConfirmer::new(api);

        let attempt = confirmer.confirm("bc-1", Transition::End).await.unwrap();
        assert_eq!(attempt.polls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn optional_timeout_bounds_the_wait() {
        let confirmer = TransitionConfirmer::new(ScriptedApi::new(&[], "ready"))
            .with_timeout(Some(Duration::from_secs(5)));

        let err = confirmer
            .confirm("bc-1", Transition::BeginTest)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BroadcastError::TimedOut {
                expected: "testing",
                ..
            }
        ));
    }
}
