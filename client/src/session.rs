//! Client session: registration, persistent channels and event routing
//!
//! The session is owned by the application's designated context. Everything
//! it owns that the network can influence (the leaderboard and the presenter)
//! lives in a [`Board`], and the network only reaches the board through the
//! session's [`Dispatcher`]. Calls made directly on the session, such as
//! registration or run submission, run on the owner's context too, so the
//! board is never touched from two places at once.

use crate::dispatcher::{DispatchHandle, Dispatcher};
use crate::error::{ClientError, ValidationError};
use crate::identity::IdentityStore;
use crate::leaderboard::{BoardChange, Leaderboard, DEFAULT_RETENTION};
use crate::liveness::{LivenessMonitor, DEFAULT_PROBE_INTERVAL};
use crate::network::{
    ConnectionState, EventSink, HttpChannel, StreamChannel, TransportEvent,
    DEFAULT_REQUEST_TIMEOUT,
};
use log::{info, warn};
use shared::{
    ActionResponse, Category, FeedEvent, ProgressReport, PromptRequest, RankingResult, Record,
    RegisterRequest, ServerFrame,
};
use std::sync::Arc;
use std::time::Duration;

/// Endpoints and tuning for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub rest_base_url: String,
    pub stream_url: String,
    pub chart_url: String,
    /// Endpoint that maps free-text prompts to game actions.
    pub prompt_url: String,
    pub request_timeout: Duration,
    pub probe_interval: Duration,
    pub retention: usize,
    /// Stage whose ranked view is pushed to the presenter as it changes.
    pub watched: Option<Category>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "http://127.0.0.1:8001".to_string(),
            stream_url: "ws://127.0.0.1:8001/ws".to_string(),
            chart_url: "ws://127.0.0.1:8001/chart".to_string(),
            prompt_url: "ws://127.0.0.1:8002/ws".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            retention: DEFAULT_RETENTION,
            watched: None,
        }
    }
}

impl SessionConfig {
    pub fn with_rest_base_url(mut self, url: impl Into<String>) -> Self {
        self.rest_base_url = url.into();
        self
    }

    pub fn with_stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = url.into();
        self
    }

    pub fn with_chart_url(mut self, url: impl Into<String>) -> Self {
        self.chart_url = url.into();
        self
    }

    pub fn with_prompt_url(mut self, url: impl Into<String>) -> Self {
        self.prompt_url = url.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_watched(mut self, category: impl Into<Category>) -> Self {
        self.watched = Some(category.into());
        self
    }
}

/// Output side of the session, implemented by the hosting UI.
pub trait Presenter: Send {
    fn status(&mut self, message: &str);

    /// Any error surfaced to the user, local or remote.
    fn error(&mut self, error: &ClientError);

    fn acknowledged(&mut self, received_text: Option<&str>);

    fn ranking(&mut self, result: &RankingResult);

    fn leaderboard(&mut self, category: &Category, rows: &[Record]);

    fn progress(&mut self, report: &ProgressReport);

    /// Action the prompt service chose for the last prompt.
    fn action(&mut self, response: &ActionResponse);
}

/// Presenter that writes everything to the log.
#[derive(Debug)]
pub struct LogPresenter {
    max_rows: usize,
}

impl LogPresenter {
    pub fn new(max_rows: usize) -> Self {
        Self { max_rows }
    }
}

impl Default for LogPresenter {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Presenter for LogPresenter {
    fn status(&mut self, message: &str) {
        info!("{}", message);
    }

    fn error(&mut self, error: &ClientError) {
        warn!("{}", error);
    }

    fn acknowledged(&mut self, received_text: Option<&str>) {
        info!("Server ACK: {}", received_text.unwrap_or("(no message)"));
    }

    fn ranking(&mut self, result: &RankingResult) {
        info!(
            "{} on stage {}: time top {:.1}% (#{}), tokens top {:.1}% (#{}) of {}",
            result.participant_id,
            result.category,
            result.duration_percentile,
            result.duration_rank,
            result.score_percentile,
            result.score_rank,
            result.total_records
        );
    }

    fn leaderboard(&mut self, category: &Category, rows: &[Record]) {
        info!("Stage {} leaderboard ({} players)", category, rows.len());
        for (place, row) in rows.iter().take(self.max_rows).enumerate() {
            info!(
                "  {:>2}. {:<16} tokens={:<5} time={:.2}s",
                place + 1,
                row.participant_id,
                row.score,
                row.duration_ms as f64 / 1000.0
            );
        }
    }

    fn progress(&mut self, report: &ProgressReport) {
        let unlocked = report.unlocked_codes();
        if unlocked.is_empty() {
            info!("Unlocked stages: (none)");
        } else {
            info!("Unlocked stages: {}", unlocked.join(", "));
        }
    }

    fn action(&mut self, response: &ActionResponse) {
        info!(
            "Action: {} (prompt length {})",
            response.code.as_deref().unwrap_or("(none)"),
            response.prompt_length
        );
    }
}

/// State mutated only by dispatched callbacks and by the session owner.
pub struct Board {
    leaderboard: Leaderboard,
    presenter: Box<dyn Presenter>,
    watched: Option<Category>,
    last_ranking: Option<RankingResult>,
}

impl Board {
    fn new(
        leaderboard: Leaderboard,
        presenter: Box<dyn Presenter>,
        watched: Option<Category>,
    ) -> Self {
        Self {
            leaderboard,
            presenter,
            watched,
            last_ranking: None,
        }
    }

    pub fn leaderboard(&self) -> &Leaderboard {
        &self.leaderboard
    }

    pub fn watched(&self) -> Option<&Category> {
        self.watched.as_ref()
    }

    pub fn last_ranking(&self) -> Option<&RankingResult> {
        self.last_ranking.as_ref()
    }

    fn on_stream_event(&mut self, event: TransportEvent) -> Result<(), ClientError> {
        match event {
            TransportEvent::Message(raw) => match ServerFrame::decode(&raw)? {
                ServerFrame::Ranking(result) => {
                    self.presenter.ranking(&result);
                    self.last_ranking = Some(result);
                }
                ServerFrame::Ack { received_text } => {
                    self.presenter.acknowledged(received_text.as_deref());
                }
                ServerFrame::Rejected { reason } => {
                    self.presenter.error(&ClientError::RemoteRejected {
                        status: None,
                        body: reason,
                    });
                }
            },
            other => self.report_transport("stream", other),
        }
        Ok(())
    }

    fn on_chart_event(&mut self, event: TransportEvent) -> Result<(), ClientError> {
        match event {
            TransportEvent::Message(raw) => {
                let change = self.leaderboard.apply(FeedEvent::decode(&raw)?);
                self.present_if_affected(&change);
            }
            other => self.report_transport("chart", other),
        }
        Ok(())
    }

    fn on_prompt_event(&mut self, event: TransportEvent) -> Result<(), ClientError> {
        match event {
            TransportEvent::Message(raw) => {
                let response = ActionResponse::decode(&raw)?;
                match response.failure() {
                    Some(reason) => self.presenter.error(&ClientError::RemoteRejected {
                        status: None,
                        body: reason.to_string(),
                    }),
                    None => self.presenter.action(&response),
                }
            }
            other => self.report_transport("prompt", other),
        }
        Ok(())
    }

    fn report_transport(&mut self, label: &str, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.presenter.status(&format!("{} connected", label)),
            TransportEvent::Error(reason) => self
                .presenter
                .status(&format!("{} error: {}", label, reason)),
            TransportEvent::Close {
                code,
                reason,
                was_clean,
            } => self.presenter.status(&format!(
                "{} closed: code={}, wasClean={}, reason={}",
                label, code, was_clean, reason
            )),
            TransportEvent::Message(_) => {}
        }
    }

    fn present_if_affected(&mut self, change: &BoardChange) {
        if let Some(category) = self.watched.clone() {
            if change.affects(&category) {
                self.present(&category);
            }
        }
    }

    fn present(&mut self, category: &Category) {
        let rows = self.leaderboard.ranked(category);
        self.presenter.leaderboard(category, &rows);
    }

    fn watch(&mut self, category: Category) {
        self.present(&category);
        self.watched = Some(category);
    }
}

/// A gameplay result as entered by the player, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSubmission {
    pub participant_id: String,
    pub category: String,
    pub score: i64,
    pub duration_ms: i64,
}

impl RunSubmission {
    pub fn new(
        participant_id: impl Into<String>,
        category: impl Into<String>,
        score: i64,
        duration_ms: i64,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            category: category.into(),
            score,
            duration_ms,
        }
    }

    /// Checks each precondition in turn and builds the wire record.
    pub fn validate(&self) -> Result<Record, ValidationError> {
        let participant_id = self.participant_id.trim();
        if participant_id.is_empty() {
            return Err(ValidationError::EmptyParticipant);
        }
        let score = u64::try_from(self.score).map_err(|_| ValidationError::NegativeScore(self.score))?;
        let duration_ms = u64::try_from(self.duration_ms)
            .map_err(|_| ValidationError::NegativeDuration(self.duration_ms))?;
        let category = self.category.trim();
        if category.is_empty() {
            return Err(ValidationError::EmptyCategory);
        }

        Ok(Record::new(participant_id, category, score, duration_ms))
    }
}

/// Free-text instruction for the prompt service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSubmission {
    pub participant_id: String,
    pub category: String,
    pub prompt: String,
}

impl PromptSubmission {
    pub fn new(
        participant_id: impl Into<String>,
        category: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            category: category.into(),
            prompt: prompt.into(),
        }
    }

    pub fn validate(&self) -> Result<PromptRequest, ValidationError> {
        let participant_id = self.participant_id.trim();
        if participant_id.is_empty() {
            return Err(ValidationError::EmptyParticipant);
        }
        let category = self.category.trim();
        if category.is_empty() {
            return Err(ValidationError::EmptyCategory);
        }
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }

        Ok(PromptRequest {
            participant_id: participant_id.to_string(),
            category: Category::from(category),
            prompt: prompt.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered(String),
}

pub struct ClientSession {
    config: SessionConfig,
    http: HttpChannel,
    stream: StreamChannel,
    chart: StreamChannel,
    prompt: StreamChannel,
    stream_monitor: Option<LivenessMonitor>,
    chart_monitor: Option<LivenessMonitor>,
    prompt_monitor: Option<LivenessMonitor>,
    dispatcher: Dispatcher<Board>,
    handle: DispatchHandle<Board>,
    board: Board,
    identity: Box<dyn IdentityStore>,
    registration: RegistrationState,
}

impl ClientSession {
    /// Builds an idle session. A previously saved identity is restored but
    /// nothing is fetched or connected.
    pub fn new(
        config: SessionConfig,
        identity: Box<dyn IdentityStore>,
        presenter: Box<dyn Presenter>,
    ) -> Result<Self, ClientError> {
        let http = HttpChannel::new(&config.rest_base_url)?.with_timeout(config.request_timeout);
        let (dispatcher, handle) = Dispatcher::new();
        let mut board = Board::new(
            Leaderboard::with_retention(config.retention),
            presenter,
            config.watched.clone(),
        );

        let registration = match identity.load() {
            Some(saved) => {
                board.presenter.status(&format!("Saved ID: {}", saved));
                RegistrationState::Registered(saved)
            }
            None => {
                board.presenter.status("Enter an ID and register");
                RegistrationState::Unregistered
            }
        };

        Ok(Self {
            config,
            http,
            stream: StreamChannel::new("stream"),
            chart: StreamChannel::new("chart"),
            prompt: StreamChannel::new("prompt"),
            stream_monitor: None,
            chart_monitor: None,
            prompt_monitor: None,
            dispatcher,
            handle,
            board,
            identity,
            registration,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn registration(&self) -> &RegistrationState {
        &self.registration
    }

    pub fn participant_id(&self) -> Option<&str> {
        match &self.registration {
            RegistrationState::Registered(id) => Some(id),
            _ => None,
        }
    }

    pub fn stream_state(&self) -> ConnectionState {
        self.stream.state()
    }

    pub fn chart_state(&self) -> ConnectionState {
        self.chart.state()
    }

    pub fn prompt_state(&self) -> ConnectionState {
        self.prompt.state()
    }

    /// Handle for enqueueing work onto the session's drain context.
    pub fn dispatch_handle(&self) -> DispatchHandle<Board> {
        self.handle.clone()
    }

    /// Registers `participant_id` with the remote service and saves it locally.
    ///
    /// Progress is fetched only when `fetch_progress` is set. A failed fetch
    /// is shown to the user but does not undo the registration, and yields
    /// `Ok(None)`.
    pub async fn register(
        &mut self,
        participant_id: &str,
        fetch_progress: bool,
    ) -> Result<Option<ProgressReport>, ClientError> {
        let participant_id = participant_id.trim().to_string();
        if participant_id.is_empty() {
            return Err(self.surface(ValidationError::EmptyParticipant.into()));
        }

        let previous = std::mem::replace(&mut self.registration, RegistrationState::Registering);
        self.board.presenter.status("Registering...");

        let request = RegisterRequest {
            participant_id: participant_id.clone(),
        };
        if let Err(e) = self.http.post(&["users"], &request).await {
            self.registration = previous;
            return Err(self.surface(e));
        }

        if let Err(e) = self.identity.save(&participant_id) {
            self.registration = previous;
            return Err(self.surface(e));
        }

        info!("Registered participant {}", participant_id);
        self.board
            .presenter
            .status(&format!("Registered ID: {}", participant_id));
        self.registration = RegistrationState::Registered(participant_id.clone());

        if !fetch_progress {
            return Ok(None);
        }
        match self.refresh_progress(&participant_id).await {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                warn!("Progress fetch after registration failed: {}", e);
                Ok(None)
            }
        }
    }

    /// Fetches and presents stage progress. Only ever called on request.
    pub async fn refresh_progress(
        &mut self,
        participant_id: &str,
    ) -> Result<ProgressReport, ClientError> {
        let participant_id = participant_id.trim();
        if participant_id.is_empty() {
            return Err(self.surface(ValidationError::EmptyParticipant.into()));
        }

        let body = match self.http.get(&["progress", participant_id]).await {
            Ok(body) => body,
            Err(e) => return Err(self.surface(e)),
        };
        let report = match ProgressReport::decode(&body) {
            Ok(report) => report,
            Err(e) => return Err(self.surface(e.into())),
        };

        self.board.presenter.progress(&report);
        Ok(report)
    }

    /// Opens every persistent channel and starts a liveness monitor for each.
    pub fn connect(&mut self) {
        self.connect_stream();
        self.connect_chart();
        self.connect_prompt();
    }

    pub fn connect_stream(&mut self) {
        let sink = self.sink(Board::on_stream_event);
        self.stream.connect(&self.config.stream_url, sink);
        restart_monitor(&mut self.stream_monitor, &self.stream, self.config.probe_interval);
    }

    pub fn connect_chart(&mut self) {
        let sink = self.sink(Board::on_chart_event);
        self.chart.connect(&self.config.chart_url, sink);
        restart_monitor(&mut self.chart_monitor, &self.chart, self.config.probe_interval);
    }

    pub fn connect_prompt(&mut self) {
        let sink = self.sink(Board::on_prompt_event);
        self.prompt.connect(&self.config.prompt_url, sink);
        restart_monitor(&mut self.prompt_monitor, &self.prompt, self.config.probe_interval);
    }

    fn sink(&self, route: fn(&mut Board, TransportEvent) -> Result<(), ClientError>) -> EventSink {
        let handle = self.handle.clone();
        Arc::new(move |event| {
            handle.enqueue(move |board: &mut Board| route(board, event));
        })
    }

    /// Validates `run` and sends it on the stream channel.
    ///
    /// Every failed precondition is reported with its own reason and nothing
    /// is transmitted.
    pub fn submit_run(&mut self, run: &RunSubmission) -> Result<(), ClientError> {
        let record = match run.validate() {
            Ok(record) => record,
            Err(e) => return Err(self.surface(e.into())),
        };
        if !self.stream.state().is_open() {
            return Err(self.surface(ClientError::NotConnected));
        }

        let payload = record.to_json()?;
        self.stream.send(&payload).map_err(|e| self.surface(e))
    }

    /// Validates `submission` and sends it on the prompt channel. The reply
    /// arrives later through [`Presenter::action`] or [`Presenter::error`].
    pub fn submit_prompt(&mut self, submission: &PromptSubmission) -> Result<(), ClientError> {
        let request = match submission.validate() {
            Ok(request) => request,
            Err(e) => return Err(self.surface(e.into())),
        };
        if !self.prompt.state().is_open() {
            return Err(self.surface(ClientError::NotConnected));
        }

        let payload = request.to_json()?;
        self.prompt.send(&payload).map_err(|e| self.surface(e))
    }

    /// Starts presenting `category` and shows its current ranking at once.
    pub fn watch(&mut self, category: impl Into<Category>) {
        self.board.watch(category.into());
    }

    pub fn ranked(&self, category: &Category) -> Vec<Record> {
        self.board.leaderboard.ranked(category)
    }

    /// Runs every queued callback. Returns how many ran.
    pub fn drain(&mut self) -> usize {
        self.dispatcher.drain(&mut self.board)
    }

    /// Waits for the next queued callback and runs it.
    pub async fn next_event(&mut self) -> bool {
        self.dispatcher.next(&mut self.board).await
    }

    pub fn dispatcher(&self) -> &Dispatcher<Board> {
        &self.dispatcher
    }

    /// Closes every channel. Callbacks already queued still drain.
    pub fn shutdown(&mut self) {
        for monitor in [
            self.stream_monitor.take(),
            self.chart_monitor.take(),
            self.prompt_monitor.take(),
        ]
        .into_iter()
        .flatten()
        {
            monitor.stop();
        }
        self.stream.close();
        self.chart.close();
        self.prompt.close();
    }

    fn surface(&mut self, error: ClientError) -> ClientError {
        self.board.presenter.error(&error);
        error
    }
}

/// Replaces the channel's monitor so repeated connects never stack probes.
fn restart_monitor(slot: &mut Option<LivenessMonitor>, channel: &StreamChannel, period: Duration) {
    if let Some(previous) = slot.take() {
        previous.stop();
    }
    *slot = Some(LivenessMonitor::spawn(channel.clone(), period));
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
