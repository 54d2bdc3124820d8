use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use managed_login::agent;
use managed_login::config::{AgentConfig, LoginSettings, get_agent_config_path};
use managed_login::login::CommandPrefixBuilder;
use managed_login::service::OperationResult;

use super::utils::{init_logging, require_admin_privileges};

fn config_path(config: Option<PathBuf>) -> PathBuf {
    config.unwrap_or_else(get_agent_config_path)
}

fn load_config(path: &Path) -> Result<AgentConfig> {
    AgentConfig::load(path).with_context(|| {
        format!(
            "Failed to load agent configuration from {}. Run 'managed-login setup' first.",
            path.display()
        )
    })
}

/// Write a new agent configuration
pub fn setup(
    config: Option<PathBuf>,
    identity: String,
    key_server_url: String,
    token: Option<String>,
    policy_file: Option<PathBuf>,
    poll_interval: u64,
    verbose: bool,
) -> Result<()> {
    init_logging(verbose, None);
    require_admin_privileges();

    println!("Managed Login Agent - Setup");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    let mut agent_config = AgentConfig::new(identity, key_server_url);
    agent_config.key_server.access_token = token;
    agent_config.agent.poll_interval = poll_interval;
    if let Some(policy_file) = policy_file {
        agent_config.agent.policy_file = policy_file;
    }

    agent_config.validate().context("Invalid configuration")?;

    let path = config_path(config);
    agent_config.save(&path)?;
    println!("✓ Configuration saved to: {}", path.display());

    println!();
    println!("Next steps:");
    println!("  1. Make sure the '{}' account exists", agent_config.login.management_user);
    println!("  2. Start the agent:");
    println!("     sudo managed-login run");
    println!();
    println!(
        "The agent will check {} every {} seconds.",
        agent_config.agent.policy_file.display(),
        poll_interval
    );

    Ok(())
}

/// Run the daemon in the foreground
pub fn run(config: Option<PathBuf>, verbose: bool) -> Result<()> {
    let agent_config = load_config(&config_path(config))?;
    init_logging(verbose, Some(&agent_config.logging.level));
    require_admin_privileges();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(agent::run_agent_daemon(agent_config))
}

/// Apply one policy file and print the audit text
pub fn apply(config: Option<PathBuf>, policy_file: PathBuf, identity: Option<String>, verbose: bool) -> Result<()> {
    let agent_config = load_config(&config_path(config))?;
    init_logging(verbose, Some(&agent_config.logging.level));
    require_admin_privileges();

    let identity = identity.unwrap_or_else(|| agent_config.agent.identity.clone());

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(agent::check_and_apply_once(&agent_config, &policy_file, &identity))?;

    let audit = result.audit();
    println!("{}", audit.title);
    print!("{}", audit.body);
    if !audit.body.ends_with('\n') {
        println!();
    }

    match result {
        OperationResult::Success { .. } => Ok(()),
        OperationResult::Error { message, .. } => anyhow::bail!(message),
    }
}

/// Print the forced-command prefix a user would get
pub fn prefix(
    config: Option<PathBuf>,
    username: String,
    email: String,
    uuid: String,
    superuser: bool,
    profile: Option<String>,
    verbose: bool,
) -> Result<()> {
    init_logging(verbose, None);

    let path = config_path(config);
    let settings = if path.exists() {
        load_config(&path)?.login
    } else {
        LoginSettings::default()
    };

    let builder = CommandPrefixBuilder::from_settings(&settings);
    println!(
        "{}",
        builder.get_key_prefix(&username, &email, &uuid, superuser, profile.as_deref())
    );

    Ok(())
}

/// Validate the configuration file
pub fn check_config(config: Option<PathBuf>, verbose: bool) -> Result<()> {
    init_logging(verbose, None);

    let path = config_path(config);
    let agent_config = load_config(&path)?;

    println!("✓ Configuration is valid: {}", path.display());
    println!();
    println!("Identity:         {}", agent_config.agent.identity);
    println!("Key server:       {}", agent_config.key_server.url);
    println!("Policy file:      {}", agent_config.agent.policy_file.display());
    println!(
        "Poll interval:    {} seconds (+{} jitter)",
        agent_config.agent.poll_interval, agent_config.agent.poll_jitter
    );
    println!("Management user:  {}", agent_config.login.management_user);
    println!("Privileged group: {}", agent_config.login.privileged_group);
    println!("Keys file:        {}", agent_config.login.keys_file.display());
    println!("Login shim:       {}", agent_config.login.shim);

    Ok(())
}
