//! Destroy command - Tear down a cluster from its install directory
//!
//! Usage: teardown destroy --dir <install-dir>
//!
//! Reads `metadata.json`, resolves the destroyer for its platform, and runs it
//! until every stage converges. Ctrl-C cancels the run; re-running picks up
//! from whatever is left.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use teardown_destroy::{ClusterQuota, DestroyOptions, Registry};

use crate::config::load_metadata;
use crate::Result;

/// Destroy a cluster
#[derive(Args, Debug)]
pub struct DestroyArgs {
    /// Install directory containing metadata.json
    #[arg(long, env = "TEARDOWN_DIR", default_value = ".")]
    pub dir: PathBuf,

    /// Seconds between polls of each resource type
    #[arg(long, env = "TEARDOWN_POLL_INTERVAL_SECS", default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// Seconds allowed for draining and deleting cluster volumes
    #[arg(long, env = "TEARDOWN_VOLUME_TIMEOUT_SECS", default_value_t = 600)]
    pub volume_timeout_secs: u64,

    /// Abort when volumes are still present after the volume timeout
    #[arg(long, env = "TEARDOWN_FAIL_ON_VOLUME_TIMEOUT")]
    pub fail_on_volume_timeout: bool,

    /// Kubeconfig for the management cluster (overrides metadata)
    #[arg(short = 'k', long, env = "TEARDOWN_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,
}

impl DestroyArgs {
    /// Options handed to the platform destroyer
    pub fn options(&self) -> DestroyOptions {
        DestroyOptions {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            volume_timeout: Duration::from_secs(self.volume_timeout_secs),
            fail_on_volume_timeout: self.fail_on_volume_timeout,
            kubeconfig: self.kubeconfig.clone(),
        }
    }
}

/// Cancel `token` on Ctrl-C
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping teardown");
            token.cancel();
        }
    });
}

fn report_quota(quota: &ClusterQuota) {
    for usage in &quota.quota {
        info!(
            service = %usage.service,
            name = %usage.name,
            amount = usage.amount,
            "Released quota"
        );
    }
}

/// Run the destroy command
pub async fn run(args: DestroyArgs, registry: &Registry) -> Result<()> {
    let metadata = load_metadata(&args.dir)?;
    let destroyer = registry.new_destroyer(&metadata, &args.options())?;

    info!(
        cluster = %metadata.cluster_name,
        infra_id = %metadata.infra_id,
        platform = %metadata.platform()?,
        "Starting teardown"
    );

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    match destroyer.run(&cancel).await {
        Ok(quota) => {
            if let Some(quota) = quota {
                report_quota(&quota);
            }
            info!(cluster = %metadata.cluster_name, "Teardown complete");
            Ok(())
        }
        Err(e) => {
            error!(cluster = %metadata.cluster_name, error = %e, "Teardown failed");
            Err(e.into())
        }
    }
}
