use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{command, Parser};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use fleet_login::api::kubernetes::KubeConnector;
use fleet_login::config::{LoginConfig, DEFAULT_CERTIFICATE_TTL, KUBECONFIG_ENV, TOKEN_ENV};
use fleet_login::installation::{AthenaClient, TokenAuthenticator};
use fleet_login::issuer::{IssuerConfig, DEFAULT_MAX_WAIT, DEFAULT_POLL_INTERVAL};
use fleet_login::login::{Collaborators, LoginFlags, LoginRunner};
use fleet_login::oidc::OidcClient;
use fleet_login::Result;

/// Log in to a managed installation, or create a client certificate for one
/// of its workload clusters.
///
/// Pass an installation codename, a context name, or the Management API or
/// web UI URL of an installation. Without an argument, the current context
/// is used.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Installation codename, context name or URL, optionally followed by a
    /// workload cluster name.
    args: Vec<String>,

    #[arg(long, env = KUBECONFIG_ENV)]
    kubeconfig: Option<String>,

    /// Use this context instead of the current one.
    #[arg(long)]
    context: Option<String>,

    /// Workload cluster to create a client certificate for.
    #[arg(long, alias = "workload-cluster")]
    cluster: Option<String>,

    /// Organization owning the workload cluster.
    #[arg(long = "cluster-organization", alias = "organization")]
    organization: Option<String>,

    /// Lifetime of the client certificate, e.g. 1h, 30m or 3600s.
    #[arg(long, default_value = DEFAULT_CERTIFICATE_TTL)]
    certificate_ttl: String,

    /// RBAC group of the client certificate. Repeatable.
    #[arg(long = "certificate-group")]
    certificate_groups: Vec<String>,

    /// Write the credentials to this new file instead of the kubeconfig.
    #[arg(long)]
    self_contained: Option<PathBuf>,

    /// Do not change the current context.
    #[arg(long)]
    keep_context: bool,

    /// Use the internal API endpoint of the management cluster.
    #[arg(long)]
    internal_api: bool,

    /// Also search the default namespace for workload clusters.
    #[arg(long)]
    insecure_namespace: bool,

    /// Bearer token to log in to a management cluster with.
    #[arg(long, env = TOKEN_ENV, hide_env_values = true)]
    token: Option<String>,

    /// Seconds between checks for the signed client certificate.
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
    poll_interval: u64,

    /// Seconds to wait for the signed client certificate.
    #[arg(long, default_value_t = DEFAULT_MAX_WAIT.as_secs())]
    max_wait: u64,

    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn flags(&self) -> LoginFlags {
        LoginFlags {
            cluster: self.cluster.clone(),
            organization: self.organization.clone(),
            certificate_ttl: self.certificate_ttl.clone(),
            certificate_groups: self.certificate_groups.clone(),
            self_contained: self.self_contained.clone(),
            keep_context: self.keep_context,
            internal_api: self.internal_api,
            insecure_namespace: self.insecure_namespace,
            context_override: self.context.clone(),
        }
    }

    fn issuer(&self) -> IssuerConfig {
        IssuerConfig {
            poll_interval: Duration::from_secs(self.poll_interval),
            max_wait: Duration::from_secs(self.max_wait),
            ..IssuerConfig::default()
        }
    }
}

async fn run(args: Args) -> Result<String> {
    let config = LoginConfig::new(args.kubeconfig.as_deref(), args.flags(), args.issuer())?;
    debug!(store = %config.store_path.display(), "using kubeconfig");

    let collaborators = Collaborators {
        connector: Arc::new(KubeConnector),
        installations: Arc::new(AthenaClient::new()?),
        authenticator: Arc::new(TokenAuthenticator::new(args.token.clone())),
        renewer: Arc::new(OidcClient::new()?),
    };

    let outcome = LoginRunner::new(config, collaborators)
        .run(&args.args)
        .await?;
    Ok(outcome.to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{output}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(kind = ?e.kind(), "login failed");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
