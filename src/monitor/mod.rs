use crate::homeassistant::{HaClient, HaError};
use crate::ts3::{MuteStatus, Ts3Error, Ts3Session};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

const BACKOFF_SCHEDULE: [Duration; 4] = [
    Duration::from_secs(10),
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(60),
];

/// Consecutive-failure counter with a capped delay schedule. Owned by
/// the monitor, never by a session, so the count survives session
/// replacement.
#[derive(Debug, Default)]
pub struct ReconnectPolicy {
    failures: u32,
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay for the current failure count. Non-decreasing in the
    /// count, capped at the last schedule entry.
    pub fn delay(&self) -> Duration {
        let idx = (self.failures as usize).min(BACKOFF_SCHEDULE.len() - 1);
        BACKOFF_SCHEDULE[idx]
    }

    pub fn increment(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Mic is active only while neither channel is muted.
pub fn mic_active(status: MuteStatus) -> bool {
    !status.input_muted && !status.output_muted
}

/// Outbound half of the bridge. Implemented by [`HaClient`]; tests
/// substitute a recording sink.
pub trait StateSink {
    fn set_active(&self, active: bool) -> impl Future<Output = Result<(), HaError>> + Send;
}

impl StateSink for HaClient {
    fn set_active(&self, active: bool) -> impl Future<Output = Result<(), HaError>> + Send {
        self.set_mic_active(active)
    }
}

/// Drives one session through connect → authenticate → identity → poll,
/// and forwards mic-state changes to the sink. Sole owner of the
/// session, the identity, the cached mic state, and the reconnect
/// policy; failure classification happens nowhere else.
pub struct Monitor<N> {
    session: Ts3Session,
    api_key: String,
    sink: N,
    clid: Option<String>,
    policy: ReconnectPolicy,
    mic_active: bool,
    poll_interval: Duration,
    retry_interval: Duration,
}

impl<N: StateSink> Monitor<N> {
    pub fn new(
        session: Ts3Session,
        api_key: String,
        sink: N,
        initial_active: bool,
        poll_interval: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            session,
            api_key,
            sink,
            clid: None,
            policy: ReconnectPolicy::new(),
            mic_active: initial_active,
            poll_interval,
            retry_interval,
        }
    }

    /// Run until the shutdown signal flips, then push the inactive
    /// state and release the session. Shutdown is observed between
    /// ticks only.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = self.step().await;
            if sleep_or_shutdown(pause, &mut shutdown).await {
                break;
            }
        }
        self.finish().await;
    }

    /// One tick: make sure the session is established, then poll.
    /// Returns how long to pause before the next tick.
    async fn step(&mut self) -> Duration {
        if !self.session.is_connected() {
            if let Err(err) = self.establish().await {
                let delay = self.backoff(&err, "failed to connect to ts3");
                self.teardown();
                return delay;
            }
        }
        self.poll().await
    }

    async fn establish(&mut self) -> Result<(), Ts3Error> {
        self.session.connect().await?;
        self.session.authenticate(&self.api_key).await?;
        let clid = self.session.resolve_identity().await?;
        tracing::info!(%clid, "connected to ts3 clientquery");
        self.clid = Some(clid);
        Ok(())
    }

    async fn poll(&mut self) -> Duration {
        let Some(clid) = self.clid.clone() else {
            // establish() always sets the identity first; treat a missing
            // one as a dead session
            self.teardown();
            return self.retry_interval;
        };

        match self.session.query_mute_status(&clid).await {
            Ok(status) => {
                self.policy.reset();
                self.notify_if_changed(status).await;
                self.poll_interval
            }
            Err(err) if err.is_session_fatal() => {
                let delay = self.backoff(&err, "lost ts3 connection");
                if matches!(err, Ts3Error::NotConnected) {
                    self.force_inactive().await;
                }
                self.teardown();
                delay
            }
            Err(err) => {
                tracing::error!(error = %err, "mute status query failed");
                self.retry_interval
            }
        }
    }

    async fn notify_if_changed(&mut self, status: MuteStatus) {
        let desired = mic_active(status);
        if desired == self.mic_active {
            return;
        }
        match self.sink.set_active(desired).await {
            Ok(()) => {
                tracing::info!(
                    input_muted = status.input_muted,
                    output_muted = status.output_muted,
                    active = desired,
                    "mic state changed"
                );
                self.mic_active = desired;
            }
            Err(err) => {
                // cache stays stale; the same transition is retried next tick
                tracing::error!(error = %err, "failed to update home assistant state");
            }
        }
    }

    async fn force_inactive(&mut self) {
        match self.sink.set_active(false).await {
            Ok(()) => {
                tracing::info!("home assistant state forced off");
                self.mic_active = false;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to force home assistant state off");
            }
        }
    }

    /// Delay at the current failure count, then advance the count.
    fn backoff(&mut self, err: &Ts3Error, context: &'static str) -> Duration {
        let delay = self.policy.delay();
        self.policy.increment();
        tracing::error!(
            error = %err,
            failures = self.policy.failures(),
            delay_secs = delay.as_secs(),
            "{}",
            context
        );
        delay
    }

    fn teardown(&mut self) {
        self.session.close();
        self.clid = None;
    }

    async fn finish(mut self) {
        tracing::info!("monitor stopping");
        self.force_inactive().await;
        self.session.close();
    }
}

/// Sleep for `pause`, waking early on shutdown. Returns true when the
/// loop should exit.
async fn sleep_or_shutdown(pause: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(pause) => false,
        _ = shutdown.changed() => true,
    }
}
