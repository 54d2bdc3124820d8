use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

use super::PollingScheduler;
use crate::config::AgentConfig;
use crate::login::{HttpKeyServer, TokioTimer};
use crate::platform;
use crate::policy::LoginPolicy;
use crate::service::{LoginService, OperationResult};

/// Wire the service to this host, the configured key server and a tokio timer
///
/// Must be called from within a tokio runtime.
pub fn build_service(config: &AgentConfig, identity: &str) -> Result<LoginService> {
    let key_server = HttpKeyServer::new(&config.key_server).context("Failed to set up key server client")?;
    let timer = TokioTimer::new(tokio::runtime::Handle::current());

    Ok(LoginService::spawn(
        platform::current(&config.login),
        Arc::new(key_server),
        Arc::new(timer),
        config.login.clone(),
        identity,
    ))
}

/// Watch the policy file and push every new version into the login service
///
/// The service stays alive between polls so expiry timers keep firing.
pub async fn run_agent_daemon(config: AgentConfig) -> Result<()> {
    tracing::info!("Starting managed login agent");
    tracing::info!("Policy file: {}", config.agent.policy_file.display());
    tracing::info!(
        "Poll interval: {} seconds (+{} seconds jitter)",
        config.agent.poll_interval,
        config.agent.poll_jitter
    );

    let service = build_service(&config, &config.agent.identity)?;
    let scheduler = PollingScheduler::from_settings(&config.agent);
    let mut applied_hash: Option<String> = None;

    loop {
        match check_policy_file(&service, &config.agent.policy_file, &mut applied_hash).await {
            Ok(Some(result)) => report(&result),
            Ok(None) => tracing::debug!("Policy unchanged"),
            Err(e) => tracing::error!("Failed to check login policy: {:#}", e),
        }

        scheduler.sleep_until_next_poll().await;
    }
}

/// Apply a policy file once and return the outcome
pub async fn check_and_apply_once(config: &AgentConfig, policy_file: &Path, identity: &str) -> Result<OperationResult> {
    let policy = LoginPolicy::load(policy_file)?;
    let service = build_service(config, identity)?;

    Ok(service.update_login_policy(policy).await)
}

/// Push the policy file into `service` if its content changed since the last successful apply
///
/// Returns `None` when there was nothing to do. A failed apply leaves
/// `applied_hash` untouched so the next poll retries it.
pub async fn check_policy_file(
    service: &LoginService,
    path: &Path,
    applied_hash: &mut Option<String>,
) -> Result<Option<OperationResult>> {
    if !path.exists() {
        tracing::debug!("Waiting for policy file {}", path.display());
        return Ok(None);
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read policy file: {}", path.display()))?;

    let hash = compute_policy_hash(&content);
    if applied_hash.as_deref() == Some(hash.as_str()) {
        return Ok(None);
    }

    tracing::info!("New login policy detected (hash: {})", &hash[..16]);

    let policy = LoginPolicy::parse_for_path(path, &content)
        .with_context(|| format!("Failed to parse policy file: {}", path.display()))?;

    let result = service.update_login_policy(policy).await;
    if result.is_success() {
        *applied_hash = Some(hash);
    }

    Ok(Some(result))
}

fn report(result: &OperationResult) {
    let audit = result.audit();
    match result {
        OperationResult::Success { .. } => {
            tracing::info!("{}: {}", audit.title, audit.body.trim_end())
        }
        OperationResult::Error { .. } => {
            tracing::error!("{}: {}", audit.title, audit.body.trim_end())
        }
    }
}

/// SHA-256 of the policy file content
fn compute_policy_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();

    format!("sha256:{}", hex)
}
