//! Retrying wrapper around outbound writes.

use parlor_protocol::Frame;
use parlor_transport::{ConnectionId, Outbound};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::retry::{self, RetryPolicy};
use crate::telemetry;

/// Sends frames with a small fixed retry budget.
///
/// Failures are logged and reported as `false`; callers decide whether a
/// lost frame matters.
pub struct SafeEmitter {
    outbound: Arc<dyn Outbound>,
    policy: RetryPolicy,
}

impl SafeEmitter {
    /// Create an emitter making `attempts` tries `delay` apart.
    #[must_use]
    pub fn new(
        outbound: Arc<dyn Outbound>,
        attempts: u32,
        delay: Duration,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            outbound,
            policy: RetryPolicy::new(attempts, delay, attempt_timeout),
        }
    }

    /// Underlying outbound surface.
    #[must_use]
    pub fn outbound(&self) -> &Arc<dyn Outbound> {
        &self.outbound
    }

    /// Send `frame` to one connection.
    pub async fn emit(&self, to: &ConnectionId, frame: Frame) -> bool {
        let outbound = &self.outbound;
        let result = retry::run(&self.policy, "emit", |_| {
            let frame = frame.clone();
            async move { outbound.send(to, frame).await }
        })
        .await;

        match result {
            Ok(()) => true,
            Err(exhausted) => {
                warn!(
                    connection = %to,
                    frame = frame.frame_type().as_str(),
                    error = %exhausted,
                    "Dropping frame"
                );
                telemetry::record_emit_failure();
                false
            }
        }
    }
}
