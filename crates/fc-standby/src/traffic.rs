//! Traffic coordinator: gates load-balancer registration on the current
//! role. Registration is best-effort by contract; strategy failures are
//! logged and never propagated, so they cannot block a standby transition.

use async_trait::async_trait;
use aws_sdk_elasticloadbalancingv2::types::TargetDescription;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Pluggable "put this instance behind the load balancer" hook.
#[async_trait]
pub trait TrafficStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn register(&self) -> anyhow::Result<()>;

    async fn deregister(&self) -> anyhow::Result<()>;

    async fn is_registered(&self) -> anyhow::Result<bool>;
}

/// Default strategy: traffic management handled elsewhere (DNS, k8s service).
pub struct NoopStrategy;

#[async_trait]
impl TrafficStrategy for NoopStrategy {
    fn name(&self) -> &str {
        "noop"
    }

    async fn register(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn deregister(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn is_registered(&self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// AWS ELBv2 target-group strategy: the primary registers its target id,
/// the standby deregisters it.
pub struct ElbStrategy {
    client: aws_sdk_elasticloadbalancingv2::Client,
    target_group_arn: String,
    target_id: String,
}

impl ElbStrategy {
    pub fn new(
        client: aws_sdk_elasticloadbalancingv2::Client,
        target_group_arn: String,
        target_id: String,
    ) -> Self {
        Self {
            client,
            target_group_arn,
            target_id,
        }
    }

    fn target(&self) -> TargetDescription {
        TargetDescription::builder().id(&self.target_id).build()
    }
}

#[async_trait]
impl TrafficStrategy for ElbStrategy {
    fn name(&self) -> &str {
        "aws-elbv2"
    }

    async fn register(&self) -> anyhow::Result<()> {
        self.client
            .register_targets()
            .target_group_arn(&self.target_group_arn)
            .targets(self.target())
            .send()
            .await?;
        Ok(())
    }

    async fn deregister(&self) -> anyhow::Result<()> {
        self.client
            .deregister_targets()
            .target_group_arn(&self.target_group_arn)
            .targets(self.target())
            .send()
            .await?;
        Ok(())
    }

    async fn is_registered(&self) -> anyhow::Result<bool> {
        let health = self
            .client
            .describe_target_health()
            .target_group_arn(&self.target_group_arn)
            .send()
            .await?;

        Ok(health
            .target_health_descriptions()
            .iter()
            .any(|d| d.target().map(|t| t.id()) == Some(Some(self.target_id.as_str()))))
    }
}

/// Wraps a strategy and tracks the locally-believed registration state.
pub struct TrafficCoordinator {
    strategy: Arc<dyn TrafficStrategy>,
    registered: AtomicBool,
}

impl TrafficCoordinator {
    pub fn new(strategy: Arc<dyn TrafficStrategy>) -> Self {
        Self {
            strategy,
            registered: AtomicBool::new(false),
        }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopStrategy))
    }

    pub async fn register_as_active(&self) {
        match self.strategy.register().await {
            Ok(()) => {
                self.registered.store(true, Ordering::SeqCst);
                info!(strategy = %self.strategy.name(), "registered as active traffic target");
            }
            Err(e) => {
                warn!(
                    strategy = %self.strategy.name(),
                    error = %e,
                    "traffic registration failed, continuing"
                );
            }
        }
    }

    pub async fn deregister_from_active(&self) {
        match self.strategy.deregister().await {
            Ok(()) => {
                self.registered.store(false, Ordering::SeqCst);
                info!(strategy = %self.strategy.name(), "deregistered from active traffic");
            }
            Err(e) => {
                warn!(
                    strategy = %self.strategy.name(),
                    error = %e,
                    "traffic deregistration failed, continuing"
                );
            }
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> &'static str {
        if self.is_registered() {
            "registered"
        } else {
            "deregistered"
        }
    }
}
