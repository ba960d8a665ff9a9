use super::MessageChannelService;
use crate::health::{random_jitter, HealthCheckOutcome, HealthCheckToken};
use crate::{describe, ChannelError, MessageChannel};
use mesh_wire::{NetworkRequest, NetworkResponse, ResultCode, MESSAGE_TYPE_HEALTH_CHECK};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

enum ProbeResult {
    Passed,
    Failed(String),
    /// The local channel is no longer usable; a remote "closed or broken" answer is a failure
    ChannelGone,
}

impl MessageChannelService {
    /// Start one health check per registered channel, each after a random jitter.
    ///
    /// Returns the handles of the spawned checks.
    pub async fn trigger_health_check_for_all_channels(
        self: &Arc<Self>,
    ) -> Vec<JoinHandle<HealthCheckOutcome>> {
        let channels = self.all_outgoing_channels().await;
        channels
            .into_iter()
            .map(|channel| {
                let service = self.clone();
                tokio::spawn(async move { service.check_channel_health(channel).await })
            })
            .collect()
    }

    /// Run health checks every `health_check_interval` until the service is dropped or shuts down
    pub fn start_periodic_health_checks(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config().health_check_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(service) = weak.upgrade() else {
                    break;
                };
                if service.is_shutting_down() {
                    break;
                }
                service.trigger_health_check_for_all_channels().await;
            }
            debug!("Periodic health checks stopped");
        })
    }

    async fn check_channel_health(&self, channel: Arc<dyn MessageChannel>) -> HealthCheckOutcome {
        tokio::time::sleep(random_jitter(self.config().health_check_max_jitter)).await;

        if !channel.is_ready_to_use() {
            return HealthCheckOutcome::Skipped;
        }
        let Some(state) = self.health_state(channel.channel_id()) else {
            return HealthCheckOutcome::Skipped;
        };
        let _guard = state.check_lock.lock().await;
        // the channel may have changed while waiting for a running check
        if !channel.is_ready_to_use() {
            return HealthCheckOutcome::Skipped;
        }

        match self.probe(&channel).await {
            ProbeResult::Passed => {
                let previous = state.record_success();
                if previous > 0 {
                    info!(
                        "Channel {} recovered after {} failed health check(s)",
                        describe(channel.as_ref()),
                        previous
                    );
                }
                HealthCheckOutcome::Passed
            }
            ProbeResult::ChannelGone => HealthCheckOutcome::Skipped,
            ProbeResult::Failed(reason) => {
                let failures = state.record_failure();
                let limit = self.config().health_check_failure_limit;
                warn!(
                    "Health check {}/{} failed on channel {}: {}",
                    failures,
                    limit,
                    describe(channel.as_ref()),
                    reason
                );
                let marked_broken = failures >= limit;
                if marked_broken {
                    self.spawn_broken_channel_handling(channel.clone());
                }
                HealthCheckOutcome::Failed {
                    consecutive_failures: failures,
                    marked_broken,
                }
            }
        }
    }

    async fn probe(&self, channel: &Arc<dyn MessageChannel>) -> ProbeResult {
        let token = HealthCheckToken::random();
        let request = match NetworkRequest::with_payload(
            MESSAGE_TYPE_HEALTH_CHECK,
            &token,
            Some(self.local_node_info().node_id.clone()),
            None,
        ) {
            Ok(request) => request,
            Err(e) => return ProbeResult::Failed(e.to_string()),
        };

        let check_timeout = self.config().health_check_timeout;
        let response = match timeout(check_timeout, channel.send_raw_request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(ChannelError::Closed(_))) => return ProbeResult::ChannelGone,
            Ok(Err(e)) => return ProbeResult::Failed(e.to_string()),
            Err(_) => return ProbeResult::Failed(format!("no response within {check_timeout:?}")),
        };

        evaluate(&response, &token)
    }
}

fn evaluate(response: &NetworkResponse, token: &HealthCheckToken) -> ProbeResult {
    match response.result_code {
        ResultCode::Success => match response.deserialize_content::<HealthCheckToken>() {
            Ok(echoed) if &echoed == token => ProbeResult::Passed,
            Ok(_) => ProbeResult::Failed("echoed token does not match".to_string()),
            Err(e) => ProbeResult::Failed(e.to_string()),
        },
        code => ProbeResult::Failed(format!("{}: {}", code, response.error_message())),
    }
}
