//! The agent's session loop.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::jobs::{JobHandle, JobQueue, JobRunner, WorkerPool};
use super::messages::{
    AgentMessage, CheckInStatus, ConfigUpdate, Job, JobResult, JobStatus, ServerDirective,
};
use super::schedule::{Clock, RetrySchedule, SystemClock};
use super::{AgentId, AgentState};
use crate::envelope::{Codec, PaddingStrategy, ReplayGuard, DEFAULT_REPLAY_WINDOW};
use crate::error::{Error, ErrorKind, Result, TerminationCause};
use crate::pake::{Authenticator, SessionKey};
use crate::transport::Transport;

/// What to do with the endpoint after the server rejects authentication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthFailurePolicy {
    /// Keep the same endpoint
    #[default]
    Retry,
    /// Move to the next candidate URL
    Rotate,
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Sleep, skew, retry budget and kill date
    pub schedule: RetrySchedule,
    /// Padding applied to every sealed envelope
    pub padding: PaddingStrategy,
    /// Endpoint handling after an authentication failure
    pub auth_failure_policy: AuthFailurePolicy,
    /// Jobs run at once by [`Agent::spawn_workers`]
    pub max_concurrent_jobs: usize,
    /// Host information sent with the first check-in of each session
    pub metadata: Vec<u8>,
    /// Size of the nonce replay window
    pub replay_window: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            schedule: RetrySchedule::default(),
            padding: PaddingStrategy::None,
            auth_failure_policy: AuthFailurePolicy::default(),
            max_concurrent_jobs: 4,
            metadata: Vec::new(),
            replay_window: DEFAULT_REPLAY_WINDOW,
        }
    }
}

impl AgentConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()?;
        self.padding.validate()?;
        if self.max_concurrent_jobs == 0 {
            return Err(Error::config("max concurrent jobs must be at least 1"));
        }
        if self.replay_window == 0 {
            return Err(Error::config("replay window must be non-zero"));
        }
        Ok(())
    }
}

/// One agent's session with the command server.
///
/// All network activity goes through [`Agent::authenticate`],
/// [`Agent::check_in`] and [`Agent::send`], each of which checks the kill
/// date first and counts failures against the retry budget.
pub struct Agent {
    id: AgentId,
    config: AgentConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    authenticator: Authenticator,
    codec: Codec,
    key: Option<SessionKey>,
    state: AgentState,
    failures: u32,
    initial_sent: bool,
    pending_jobs: usize,
    queue: JobQueue,
    handle: Option<JobHandle>,
    unreported: Vec<JobResult>,
    cancel: CancellationToken,
}

impl Agent {
    /// Create an agent talking through `transport`.
    pub fn new(id: AgentId, config: AgentConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let codec = Codec::new(
            id,
            config.padding,
            Some(ReplayGuard::new(config.replay_window)),
        );
        let (queue, handle) = JobQueue::new();

        Ok(Self {
            id,
            config,
            transport,
            clock: Arc::new(SystemClock),
            authenticator: Authenticator::new(id),
            codec,
            key: None,
            state: AgentState::New,
            failures: 0,
            initial_sent: false,
            pending_jobs: 0,
            queue,
            handle: Some(handle),
            unreported: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Use `clock` for kill-date checks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Agent identity.
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Consecutive failures so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// The schedule in effect (including server updates).
    pub fn schedule(&self) -> &RetrySchedule {
        &self.config.schedule
    }

    /// Padding in effect.
    pub fn padding(&self) -> PaddingStrategy {
        self.codec.padding()
    }

    /// Whether a session key is held.
    pub fn is_authenticated(&self) -> bool {
        self.key.is_some()
    }

    /// Token cancelled when the agent terminates. Cancelling it stops the agent.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The job subsystem's handle. Available once.
    pub fn take_job_handle(&mut self) -> Option<JobHandle> {
        self.handle.take()
    }

    /// Start a [`WorkerPool`] running jobs with `runner`.
    ///
    /// Returns `None` if the job handle was already taken.
    pub fn spawn_workers(&mut self, runner: Arc<dyn JobRunner>) -> Option<JoinHandle<()>> {
        let handle = self.take_job_handle()?;
        let pool = WorkerPool::new(self.config.max_concurrent_jobs);
        Some(tokio::spawn(pool.run(handle, runner, self.cancel.child_token())))
    }

    /// Register and log in, replacing any current session key.
    pub async fn authenticate(&mut self) -> Result<()> {
        let result = self.establish().await;
        self.record(result)
    }

    /// Check in with the server and return its directive.
    ///
    /// The first check-in after authentication carries the host metadata.
    pub async fn check_in(&mut self) -> Result<ServerDirective> {
        self.guard()?;
        self.state = AgentState::CheckingIn;

        let metadata = if self.initial_sent {
            Vec::new()
        } else {
            self.config.metadata.clone()
        };
        let message = AgentMessage::CheckIn {
            metadata,
            status: CheckInStatus {
                pending_jobs: self.pending_jobs,
                failures: self.failures,
            },
        };

        let result = self.exchange(&message).await;
        let directive = self.record(result)?;
        self.initial_sent = true;
        self.settle_state();
        Ok(directive)
    }

    /// Seal and deliver `message`, returning the server's directive.
    pub async fn send(&mut self, message: &AgentMessage) -> Result<ServerDirective> {
        let result = self.exchange(message).await;
        self.record(result)
    }

    /// Act on a directive from the server.
    pub fn apply_directive(&mut self, directive: ServerDirective) {
        match directive {
            ServerDirective::Idle => {}
            ServerDirective::Jobs(jobs) => {
                for job in jobs {
                    self.dispatch(job);
                }
            }
            ServerDirective::Configure(update) => {
                if let Err(err) = self.apply_update(update) {
                    warn!(agent = %self.id, error = %err, "ignoring configuration update");
                }
            }
            ServerDirective::Terminate => {
                self.terminate(TerminationCause::Commanded);
                return;
            }
        }
        self.settle_state();
    }

    /// Report finished jobs, if any.
    ///
    /// Returns the directive that came back, or `None` when there was
    /// nothing to send. Results are kept for the next attempt on failure.
    pub async fn flush_results(&mut self) -> Result<Option<ServerDirective>> {
        let mut results = std::mem::take(&mut self.unreported);
        results.extend(self.queue.drain_results());
        if results.is_empty() {
            return Ok(None);
        }

        let count = results.len();
        let message = AgentMessage::JobResults { results };
        match self.send(&message).await {
            Ok(directive) => {
                self.pending_jobs = self.pending_jobs.saturating_sub(count);
                debug!(agent = %self.id, count, "job results delivered");
                self.settle_state();
                Ok(Some(directive))
            }
            Err(err) => {
                if let AgentMessage::JobResults { results } = message {
                    self.unreported = results;
                }
                Err(err)
            }
        }
    }

    /// Run check-in cycles until the agent terminates.
    pub async fn run(&mut self) -> TerminationCause {
        info!(agent = %self.id, "agent started");

        loop {
            if let AgentState::Terminated(cause) = self.state {
                return cause;
            }
            if self.cancel.is_cancelled() {
                self.terminate(TerminationCause::Commanded);
                continue;
            }

            self.cycle().await;
            if self.state.is_terminated() {
                continue;
            }

            let sleep = self.config.schedule.next_sleep(self.clock.now());
            debug!(agent = %self.id, ?sleep, "sleeping until next check-in");
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    async fn cycle(&mut self) {
        let mut next = match self.check_in().await {
            Ok(directive) => Some(directive),
            Err(err) => {
                if !matches!(err, Error::Terminated(_)) {
                    warn!(agent = %self.id, error = %err, failures = self.failures, "check-in failed");
                }
                None
            }
        };

        while let Some(directive) = next.take() {
            self.apply_directive(directive);
            if self.state.is_terminated() {
                return;
            }
            next = match self.flush_results().await {
                Ok(directive) => directive,
                Err(err) => {
                    warn!(agent = %self.id, error = %err, "failed to deliver job results");
                    None
                }
            };
        }
    }

    async fn establish(&mut self) -> Result<()> {
        self.guard()?;
        let secret = self
            .transport
            .secret()
            .ok_or_else(|| Error::config("no pre-shared secret set"))?;

        self.key = None;
        self.authenticator.reset();

        self.state = AgentState::Registering;
        self.authenticator
            .register(self.transport.as_ref(), &secret)
            .await?;

        self.guard()?;
        self.state = AgentState::Authenticating;
        let key = self
            .authenticator
            .authenticate(self.transport.as_ref(), &secret)
            .await?;

        self.key = Some(key);
        self.initial_sent = false;
        self.state = AgentState::CheckingIn;
        Ok(())
    }

    async fn exchange(&mut self, message: &AgentMessage) -> Result<ServerDirective> {
        if self.key.is_none() {
            self.establish().await?;
        }
        self.guard()?;

        let key = self.key.as_ref().ok_or(Error::NotAuthenticated)?;
        let payload = serde_json::to_vec(message)?;
        let envelope = self.codec.seal(key, &payload, message.message_type())?;

        let reply = self.transport.send(&envelope).await?;
        let plaintext = self.codec.open(key, &reply)?;
        let directive: ServerDirective = serde_json::from_slice(&plaintext)?;

        debug!(agent = %self.id, ?directive, "directive received");
        Ok(directive)
    }

    /// Kill-date and termination check before touching the network.
    fn guard(&mut self) -> Result<()> {
        if let AgentState::Terminated(cause) = self.state {
            return Err(Error::Terminated(cause));
        }
        if self.config.schedule.is_expired(self.clock.now()) {
            self.terminate(TerminationCause::KillDate);
            return Err(Error::Terminated(TerminationCause::KillDate));
        }
        Ok(())
    }

    /// Failure accounting for one network operation.
    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        let err = match result {
            Ok(value) => {
                if self.failures > 0 {
                    debug!(agent = %self.id, failures = self.failures, "failure count reset");
                }
                self.failures = 0;
                return Ok(value);
            }
            Err(err) => err,
        };

        if matches!(err, Error::Terminated(_)) {
            return Err(err);
        }
        if !err.is_retryable() {
            warn!(agent = %self.id, error = %err, "non-retryable error");
            self.terminate(TerminationCause::Fatal);
            return Err(err);
        }

        self.failures += 1;
        if err.invalidates_session() {
            self.key = None;
            self.authenticator.reset();
        }
        if err.kind() == ErrorKind::Auth
            && self.config.auth_failure_policy == AuthFailurePolicy::Rotate
        {
            self.transport.rotate();
        }
        if self.state != AgentState::New {
            self.state = AgentState::AwaitingJob;
        }

        if self.failures >= self.config.schedule.max_retry {
            self.terminate(TerminationCause::RetriesExhausted);
        }
        Err(err)
    }

    fn dispatch(&mut self, job: Job) {
        debug!(agent = %self.id, job = %job.id, kind = %job.kind, "job received");
        self.pending_jobs += 1;

        // Without a worker pool nobody would ever read the queue
        if self.handle.is_some() {
            self.unreported
                .push(JobResult::new(job.id, JobStatus::Unsupported, Vec::new()));
            return;
        }
        if let Err(job) = self.queue.dispatch(job) {
            warn!(agent = %self.id, job = %job.id, "worker pool is gone");
            self.unreported
                .push(JobResult::new(job.id, JobStatus::Failed, Vec::new()));
        }
    }

    fn apply_update(&mut self, update: ConfigUpdate) -> Result<()> {
        let mut schedule = self.config.schedule.clone();
        if let Some(sleep) = update.sleep {
            schedule.sleep = sleep;
        }
        if let Some(skew) = update.skew {
            schedule.skew = skew;
        }
        if let Some(max_retry) = update.max_retry {
            schedule.max_retry = max_retry;
        }
        if let Some(kill_date) = update.kill_date {
            schedule.kill_date = RetrySchedule::kill_date_from_epoch(kill_date)?;
        }
        schedule.validate()?;
        let padding = update.padding.map(PaddingStrategy::from_max);
        if let Some(padding) = padding {
            padding.validate()?;
        }

        info!(
            agent = %self.id,
            sleep = ?schedule.sleep,
            skew = schedule.skew,
            max_retry = schedule.max_retry,
            kill_date = ?schedule.kill_date,
            "schedule updated"
        );
        self.config.schedule = schedule;

        if let Some(padding) = padding {
            self.config.padding = padding;
            self.codec.set_padding(padding);
        }
        Ok(())
    }

    fn settle_state(&mut self) {
        if self.state.is_terminated() {
            return;
        }
        self.state = if self.pending_jobs > 0 {
            AgentState::ExecutingJob
        } else {
            AgentState::AwaitingJob
        };
    }

    fn terminate(&mut self, cause: TerminationCause) {
        if self.state.is_terminated() {
            return;
        }
        self.state = AgentState::Terminated(cause);
        self.key = None;
        self.cancel.cancel();
        info!(
            agent = %self.id,
            cause = %cause,
            failures = self.failures,
            "agent terminated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ManualClock;
    use crate::envelope::{Envelope, MAX_PADDING};
    use crate::pake::Psk;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    /// Transport that always fails and counts attempts.
    #[derive(Default)]
    struct Unreachable {
        calls: AtomicUsize,
        rotations: AtomicUsize,
        rejected: bool,
        secret: Mutex<Option<Psk>>,
    }

    impl Unreachable {
        fn with_secret() -> Self {
            let transport = Self::default();
            transport.set_secret(Psk::new("test"));
            transport
        }
    }

    #[async_trait]
    impl Transport for Unreachable {
        async fn send(&self, _envelope: &Envelope) -> Result<Envelope> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.rejected {
                Err(Error::Rejected(401))
            } else {
                Err(Error::transport("connection refused"))
            }
        }

        fn set_secret(&self, secret: Psk) {
            *self.secret.lock() = Some(secret);
        }

        fn secret(&self) -> Option<Psk> {
            self.secret.lock().clone()
        }

        fn rotate(&self) {
            self.rotations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(max_retry: u32) -> AgentConfig {
        AgentConfig {
            schedule: RetrySchedule {
                sleep: Duration::from_secs(10),
                skew: 0,
                max_retry,
                kill_date: None,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_kill_date_stops_before_network() {
        let transport = Arc::new(Unreachable::with_secret());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut cfg = config(7);
        cfg.schedule.kill_date = Some(clock.now() - chrono::Duration::seconds(1));

        let mut agent = Agent::new(AgentId::new(), cfg, transport.clone())
            .unwrap()
            .with_clock(clock);

        assert_eq!(agent.run().await, TerminationCause::KillDate);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert!(agent.cancellation_token().is_cancelled());
        assert!(matches!(
            agent.check_in().await,
            Err(Error::Terminated(TerminationCause::KillDate))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let transport = Arc::new(Unreachable::with_secret());
        let mut agent = Agent::new(AgentId::new(), config(3), transport.clone()).unwrap();

        assert_eq!(agent.run().await, TerminationCause::RetriesExhausted);
        assert_eq!(agent.failures(), 3);
        // One registration attempt per cycle
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            agent.state(),
            AgentState::Terminated(TerminationCause::RetriesExhausted)
        );
    }

    #[tokio::test]
    async fn test_kill_date_mid_session() {
        let transport = Arc::new(Unreachable::with_secret());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut cfg = config(7);
        cfg.schedule.kill_date = Some(clock.now() + chrono::Duration::seconds(60));

        let mut agent = Agent::new(AgentId::new(), cfg, transport.clone())
            .unwrap()
            .with_clock(clock.clone());

        assert!(agent.check_in().await.is_err());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        clock.advance_secs(61);
        assert!(matches!(
            agent.check_in().await,
            Err(Error::Terminated(TerminationCause::KillDate))
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_secret_is_fatal() {
        let transport = Arc::new(Unreachable::default());
        let mut agent = Agent::new(AgentId::new(), config(7), transport.clone()).unwrap();

        assert!(matches!(agent.authenticate().await, Err(Error::Config(_))));
        assert_eq!(agent.state(), AgentState::Terminated(TerminationCause::Fatal));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejection_rotates_endpoint() {
        let transport = Arc::new(Unreachable {
            rejected: true,
            ..Unreachable::with_secret()
        });
        let mut cfg = config(7);
        cfg.auth_failure_policy = AuthFailurePolicy::Rotate;
        let mut agent = Agent::new(AgentId::new(), cfg, transport.clone()).unwrap();

        assert!(matches!(agent.authenticate().await, Err(Error::Auth(_))));
        assert!(!agent.is_authenticated());
        assert_eq!(transport.rotations.load(Ordering::SeqCst), 1);

        // Default policy stays put
        let transport = Arc::new(Unreachable {
            rejected: true,
            ..Unreachable::with_secret()
        });
        let mut agent = Agent::new(AgentId::new(), config(7), transport.clone()).unwrap();
        assert!(agent.authenticate().await.is_err());
        assert_eq!(transport.rotations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_terminates_run() {
        let transport = Arc::new(Unreachable::with_secret());
        let mut agent = Agent::new(AgentId::new(), config(100), transport).unwrap();
        let token = agent.cancellation_token();
        token.cancel();

        assert_eq!(agent.run().await, TerminationCause::Commanded);
    }

    #[test]
    fn test_terminate_directive() {
        let transport = Arc::new(Unreachable::with_secret());
        let mut agent = Agent::new(AgentId::new(), config(7), transport).unwrap();

        agent.apply_directive(ServerDirective::Terminate);
        assert_eq!(
            agent.state(),
            AgentState::Terminated(TerminationCause::Commanded)
        );
    }

    #[test]
    fn test_configure_directive() {
        let transport = Arc::new(Unreachable::with_secret());
        let mut agent = Agent::new(AgentId::new(), config(7), transport).unwrap();

        agent.apply_directive(ServerDirective::Configure(ConfigUpdate {
            sleep: Some(Duration::from_secs(60)),
            skew: Some(50),
            padding: Some(128),
            kill_date: Some(4_102_444_800),
            ..Default::default()
        }));
        assert_eq!(agent.schedule().sleep, Duration::from_secs(60));
        assert_eq!(agent.schedule().skew, 50);
        assert_eq!(agent.schedule().kill_date.unwrap().timestamp(), 4_102_444_800);
        assert_eq!(agent.padding(), PaddingStrategy::Randomized { max: 128 });

        // Invalid updates are dropped whole
        agent.apply_directive(ServerDirective::Configure(ConfigUpdate {
            sleep: Some(Duration::from_secs(5)),
            max_retry: Some(0),
            ..Default::default()
        }));
        assert_eq!(agent.schedule().sleep, Duration::from_secs(60));
        assert_eq!(agent.schedule().max_retry, 7);

        // So are pad sizes the envelope could never carry
        agent.apply_directive(ServerDirective::Configure(ConfigUpdate {
            sleep: Some(Duration::from_secs(5)),
            padding: Some(usize::MAX),
            ..Default::default()
        }));
        assert_eq!(agent.schedule().sleep, Duration::from_secs(60));
        assert_eq!(agent.padding(), PaddingStrategy::Randomized { max: 128 });
    }

    #[test]
    fn test_oversized_padding_config_rejected() {
        let transport = Arc::new(Unreachable::with_secret());
        let config = AgentConfig {
            padding: PaddingStrategy::Randomized { max: MAX_PADDING + 1 },
            ..config(7)
        };
        assert!(matches!(
            Agent::new(AgentId::new(), config, transport),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_jobs_without_workers_are_unsupported() {
        let transport = Arc::new(Unreachable::with_secret());
        let mut agent = Agent::new(AgentId::new(), config(7), transport).unwrap();
        let job = Job {
            id: Uuid::new_v4(),
            kind: "shell".into(),
            payload: Vec::new(),
        };

        agent.apply_directive(ServerDirective::Jobs(vec![job.clone()]));
        assert_eq!(agent.state(), AgentState::ExecutingJob);
        assert_eq!(agent.unreported.len(), 1);
        assert_eq!(agent.unreported[0].job_id, job.id);
        assert_eq!(agent.unreported[0].status, JobStatus::Unsupported);
    }

    #[tokio::test]
    async fn test_undelivered_results_are_kept() {
        let transport = Arc::new(Unreachable::with_secret());
        let mut agent = Agent::new(AgentId::new(), config(7), transport).unwrap();
        agent.apply_directive(ServerDirective::Jobs(vec![Job {
            id: Uuid::new_v4(),
            kind: "shell".into(),
            payload: Vec::new(),
        }]));

        assert!(agent.flush_results().await.is_err());
        assert_eq!(agent.unreported.len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let transport = Arc::new(Unreachable::with_secret());
        let cfg = AgentConfig {
            max_concurrent_jobs: 0,
            ..Default::default()
        };
        assert!(matches!(
            Agent::new(AgentId::new(), cfg, transport),
            Err(Error::Config(_))
        ));
    }
}
