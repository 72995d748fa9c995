//! The `login` flow.
//!
//! A run either reuses a context that is already in the kubeconfig, or logs in
//! to an installation over the network. When a workload cluster is requested,
//! a client certificate is issued for it afterwards through the management
//! cluster the first step ended up on.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::api::Connector;
use crate::config::{LoginConfig, DEFAULT_CERTIFICATE_TTL};
use crate::installation::{cluster_base_domain, Authenticator, InstallationSource};
use crate::issuer::{validate_release_version, CertificateRequest, Issuer};
use crate::kubeconfig::{naming, oidc_keys, AuthType, CredentialStore};
use crate::oidc::{apply_renewed_tokens, refresh_session, validate_oidc_provider, TokenRenewer};
use crate::resolver::{candidate_namespaces, resolve_cluster};
use crate::writer::{client_cert_entries, PersistMode, StoreWriter};
use crate::{Error, Result};

/// Options of a login run, as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginFlags {
    /// Workload cluster to issue a client certificate for.
    pub cluster: Option<String>,
    pub organization: Option<String>,
    pub certificate_ttl: String,
    pub certificate_groups: Vec<String>,
    /// Write the credentials to this new file instead of the shared store.
    pub self_contained: Option<PathBuf>,
    pub keep_context: bool,
    pub internal_api: bool,
    pub insecure_namespace: bool,
    pub context_override: Option<String>,
}

impl Default for LoginFlags {
    fn default() -> Self {
        Self {
            cluster: None,
            organization: None,
            certificate_ttl: DEFAULT_CERTIFICATE_TTL.to_string(),
            certificate_groups: Vec::new(),
            self_contained: None,
            keep_context: false,
            internal_api: false,
            insecure_namespace: false,
            context_override: None,
        }
    }
}

/// What kind of credential a step produces and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginMode {
    ReuseSession,
    NetworkLogin {
        self_contained: Option<PathBuf>,
        switch_context: bool,
    },
    ClientCertLogin {
        self_contained: Option<PathBuf>,
        switch_context: bool,
    },
}

impl LoginMode {
    fn persist_mode(&self) -> Option<PersistMode> {
        match self {
            LoginMode::ReuseSession => None,
            LoginMode::NetworkLogin {
                self_contained,
                switch_context,
            }
            | LoginMode::ClientCertLogin {
                self_contained,
                switch_context,
            } => Some(match self_contained {
                Some(path) => PersistMode::SelfContained { path: path.clone() },
                None => PersistMode::Merge {
                    select: *switch_context,
                },
            }),
        }
    }
}

/// Decisions derived once from the flags and the store a run starts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginPolicy {
    pub client_cert: bool,
    pub self_contained_mc: bool,
    pub self_contained_cc: bool,
    pub switch_management_context: bool,
    pub switch_to_client_cert_context: bool,
    pub self_contained_path: Option<PathBuf>,
    /// Current context when the run started, if it exists.
    pub origin_context: Option<String>,
    /// The `--context` override, only if it names an existing context.
    pub context_override: Option<String>,
}

impl LoginPolicy {
    pub fn derive(store: &CredentialStore, flags: &LoginFlags) -> Self {
        let context_override = flags
            .context_override
            .clone()
            .filter(|name| store.has_context(name));
        let client_cert = flags.cluster.as_deref().is_some_and(|c| !c.is_empty());
        let self_contained = flags.self_contained.is_some();

        let self_contained_mc = self_contained && !client_cert;
        let self_contained_cc = self_contained && client_cert;

        Self {
            client_cert,
            self_contained_mc,
            self_contained_cc,
            switch_management_context: context_override.is_none()
                && (client_cert || !(self_contained_mc || flags.keep_context)),
            switch_to_client_cert_context: client_cert
                && !(self_contained_cc || flags.keep_context),
            self_contained_path: flags.self_contained.clone(),
            origin_context: store
                .current_context()
                .filter(|name| store.has_context(name))
                .map(str::to_string),
            context_override,
        }
    }

    /// Mode of the management cluster step.
    pub fn management_mode(&self, network_login: bool) -> LoginMode {
        if !network_login {
            return LoginMode::ReuseSession;
        }
        LoginMode::NetworkLogin {
            self_contained: self
                .self_contained_path
                .clone()
                .filter(|_| self.self_contained_mc),
            switch_context: self.switch_management_context,
        }
    }

    /// Mode of the workload cluster step.
    pub fn client_cert_mode(&self) -> LoginMode {
        LoginMode::ClientCertLogin {
            self_contained: self
                .self_contained_path
                .clone()
                .filter(|_| self.self_contained_cc),
            switch_context: self.switch_to_client_cert_context,
        }
    }
}

/// Something that happened during a login run, worth telling the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginEvent {
    ContextNotFound {
        context: String,
        fallback: String,
    },
    ContextAlreadySelected {
        context: String,
    },
    ContextSwitched {
        context: String,
        selected: bool,
        renewed: bool,
    },
    LoggedIn {
        principal: String,
        codename: String,
        context: String,
        existed: bool,
        selected: bool,
    },
    ManagementExported {
        codename: String,
        context: String,
        path: PathBuf,
    },
    ClientCertCreated {
        cluster: String,
        context: String,
        existed: bool,
        selected: bool,
    },
    ClientCertExported {
        cluster: String,
        context: String,
        path: PathBuf,
    },
    OriginRestored {
        context: String,
    },
}

impl fmt::Display for LoginEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginEvent::ContextNotFound { context, fallback } => {
                write!(f, "No context named {context} was found, looking for context {fallback}.")
            }
            LoginEvent::ContextAlreadySelected { context } => {
                write!(f, "Context '{context}' is already selected.")
            }
            LoginEvent::ContextSwitched {
                context,
                selected,
                renewed,
            } => {
                if *renewed {
                    writeln!(f, "Renewed the authentication token of context '{context}'.")?;
                }
                if *selected {
                    write!(f, "Switched to context '{context}'.")
                } else {
                    write!(f, "Context '{context}' is ready, the current context was kept.")
                }
            }
            LoginEvent::LoggedIn {
                principal,
                codename,
                context,
                existed,
                selected,
            } => {
                writeln!(f, "Logged in successfully as '{principal}' on installation '{codename}'.")?;
                let verb = if *existed { "updated" } else { "created" };
                if *selected {
                    write!(f, "A context named '{context}' has been {verb} and selected.")
                } else {
                    write!(
                        f,
                        "A context named '{context}' has been {verb}. To use it, run 'kubectl config use-context {context}'."
                    )
                }
            }
            LoginEvent::ManagementExported {
                codename,
                context,
                path,
            } => write!(
                f,
                "Logged in to installation '{codename}'. A kubeconfig with the context '{context}' has been written to {}.",
                path.display()
            ),
            LoginEvent::ClientCertCreated {
                cluster,
                context,
                existed,
                selected,
            } => {
                writeln!(f, "Created client certificate for workload cluster '{cluster}'.")?;
                let verb = if *existed { "updated" } else { "created" };
                if *selected {
                    write!(f, "A context named '{context}' has been {verb} and selected.")
                } else {
                    write!(
                        f,
                        "A context named '{context}' has been {verb}. To use it, run 'kubectl config use-context {context}'."
                    )
                }
            }
            LoginEvent::ClientCertExported {
                cluster,
                context,
                path,
            } => write!(
                f,
                "Created client certificate for workload cluster '{cluster}'. A kubeconfig with the context '{context}' has been written to {}.",
                path.display()
            ),
            LoginEvent::OriginRestored { context } => {
                write!(f, "Switched back to context '{context}'.")
            }
        }
    }
}

/// Everything a run did, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginOutcome {
    pub events: Vec<LoginEvent>,
}

impl LoginOutcome {
    fn push(&mut self, event: LoginEvent) {
        debug!(?event, "login step");
        self.events.push(event);
    }

    /// Whether this run already obtained fresh credentials for `context`.
    fn has_fresh_session(&self, context: &str) -> bool {
        self.events.iter().any(|event| match event {
            LoginEvent::ContextSwitched {
                context: switched,
                renewed: true,
                ..
            } => switched == context,
            LoginEvent::LoggedIn {
                context: logged_in, ..
            } => logged_in == context,
            _ => false,
        })
    }
}

impl fmt::Display for LoginOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, event) in self.events.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{event}")?;
        }
        Ok(())
    }
}

/// External services a login run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub installations: Arc<dyn InstallationSource>,
    pub authenticator: Arc<dyn Authenticator>,
    pub renewer: Arc<dyn TokenRenewer>,
}

pub struct LoginRunner {
    config: LoginConfig,
    writer: StoreWriter,
    collaborators: Collaborators,
}

impl LoginRunner {
    pub fn new(config: LoginConfig, collaborators: Collaborators) -> Self {
        let writer = StoreWriter::new(config.store_path.clone(), config.cert_dir.clone());
        Self {
            config,
            writer,
            collaborators,
        }
    }

    /// Run a login for the positional `args`.
    ///
    /// No argument reuses the current context. One argument is a context
    /// name, an installation codename or an installation URL. Two arguments
    /// name an installation and a workload cluster whose client certificate
    /// context already exists.
    pub async fn run(&self, args: &[String]) -> Result<LoginOutcome> {
        let store = self.writer.load()?;
        let policy = LoginPolicy::derive(&store, &self.config.flags);
        debug!(?policy, "derived login policy");

        let mut outcome = LoginOutcome::default();
        let context = match args {
            [] => self.reuse_current_context(&store, &policy, &mut outcome).await?,
            [identifier] => {
                let identifier = identifier.to_lowercase();
                if naming::is_context_name(&identifier) || naming::is_codename(&identifier) {
                    self.switch_with_fallback(&identifier, &policy, &mut outcome)
                        .await?
                } else {
                    self.network_login(&identifier, &policy, &mut outcome)
                        .await?
                }
            }
            [installation, cluster] => {
                let identifier = format!("{installation}-{cluster}").to_lowercase();
                self.switch_with_fallback(&identifier, &policy, &mut outcome)
                    .await?
            }
            _ => {
                return Err(Error::InvalidArguments(
                    "Invalid number of arguments.".to_string(),
                ))
            }
        };

        if let Some(cluster) = self.config.flags.cluster.as_deref().filter(|c| !c.is_empty()) {
            self.client_cert_login(&context, cluster, &policy, &mut outcome)
                .await?;
        }
        Ok(outcome)
    }

    async fn reuse_current_context(
        &self,
        store: &CredentialStore,
        policy: &LoginPolicy,
        outcome: &mut LoginOutcome,
    ) -> Result<String> {
        let current = policy
            .context_override
            .clone()
            .or_else(|| store.current_context().map(str::to_string))
            .ok_or(Error::SelectedContextNonCompatible)?;
        self.switch_context(&current, policy, outcome).await
    }

    async fn switch_with_fallback(
        &self,
        identifier: &str,
        policy: &LoginPolicy,
        outcome: &mut LoginOutcome,
    ) -> Result<String> {
        let context = naming::context_for_identifier(identifier);
        match self.switch_context(&context, policy, outcome).await {
            Err(Error::ContextDoesNotExist { .. }) if !naming::is_client_cert_context(identifier) => {
                let fallback = naming::client_cert_fallback(identifier);
                outcome.push(LoginEvent::ContextNotFound {
                    context,
                    fallback: fallback.clone(),
                });
                self.switch_context(&fallback, policy, outcome).await
            }
            other => other,
        }
    }

    /// Select an existing context, renewing its OIDC session first.
    ///
    /// Sessions that cannot be renewed fall back to a network login against
    /// the issuer they were obtained from.
    async fn switch_context(
        &self,
        context: &str,
        policy: &LoginPolicy,
        outcome: &mut LoginOutcome,
    ) -> Result<String> {
        let store = self.writer.load()?;
        if !store.has_context(context) {
            return Err(Error::ContextDoesNotExist {
                name: context.to_string(),
            });
        }
        let already_selected = store.current_context() == Some(context);
        let select = policy.switch_management_context;

        match store.auth_type(context) {
            AuthType::AuthProvider => {
                let provider = store
                    .auth_provider(context)
                    .ok_or_else(|| Error::MissingAuthConfig {
                        context: context.to_string(),
                    })?;
                let (oidc, refresh_token) = match validate_oidc_provider(provider, context) {
                    Ok(validated) => validated,
                    Err(e) if e.requires_new_login() => {
                        let issuer = provider.get(oidc_keys::ISSUER).unwrap_or_default().to_string();
                        return self.login_again(context, &issuer, e, policy, outcome).await;
                    }
                    Err(e) => return Err(e),
                };

                if already_selected {
                    outcome.push(LoginEvent::ContextAlreadySelected {
                        context: context.to_string(),
                    });
                    return Ok(context.to_string());
                }

                let renewer = self.collaborators.renewer.as_ref();
                let tokens = match refresh_session(renewer, &refresh_token, &oidc).await {
                    Ok(tokens) => tokens,
                    Err(e) if e.requires_new_login() => {
                        return self
                            .login_again(context, &oidc.issuer, e, policy, outcome)
                            .await
                    }
                    Err(e) => return Err(e),
                };

                let mut renewed = apply_renewed_tokens(&store, context, &tokens)?;
                if select {
                    renewed = renewed.with_current_context(context);
                }
                self.writer.save(&renewed)?;
                outcome.push(LoginEvent::ContextSwitched {
                    context: context.to_string(),
                    selected: select,
                    renewed: true,
                });
            }
            AuthType::Token | AuthType::ClientCertificate => {
                if already_selected {
                    outcome.push(LoginEvent::ContextAlreadySelected {
                        context: context.to_string(),
                    });
                    return Ok(context.to_string());
                }
                if select {
                    self.writer.save(&store.with_current_context(context))?;
                }
                outcome.push(LoginEvent::ContextSwitched {
                    context: context.to_string(),
                    selected: select,
                    renewed: false,
                });
            }
            AuthType::Unknown => {
                return Err(Error::MissingAuthConfig {
                    context: context.to_string(),
                })
            }
        }

        info!(context = %context, selected = select, "switched context");
        Ok(context.to_string())
    }

    async fn login_again(
        &self,
        context: &str,
        issuer: &str,
        cause: Error,
        policy: &LoginPolicy,
        outcome: &mut LoginOutcome,
    ) -> Result<String> {
        warn!(context = %context, issuer = %issuer, reason = %cause, "session cannot be renewed, logging in again");
        if issuer.is_empty() {
            return Err(cause);
        }
        self.network_login(issuer, policy, outcome).await
    }

    async fn network_login(
        &self,
        url: &str,
        policy: &LoginPolicy,
        outcome: &mut LoginOutcome,
    ) -> Result<String> {
        let installation = self.collaborators.installations.resolve(url).await?;
        let session = self
            .collaborators
            .authenticator
            .authenticate(&installation)
            .await?;

        let Some(mode) = policy.management_mode(true).persist_mode() else {
            return Err(Error::InvalidArguments(
                "a network login needs a destination".to_string(),
            ));
        };
        let persisted = self.writer.persist_management(
            &installation,
            &session,
            self.config.flags.internal_api,
            &mode,
        )?;

        outcome.push(match mode {
            PersistMode::Merge { select } => LoginEvent::LoggedIn {
                principal: session.principal.clone(),
                codename: installation.codename.clone(),
                context: persisted.context.clone(),
                existed: persisted.existed,
                selected: select,
            },
            PersistMode::SelfContained { path } => LoginEvent::ManagementExported {
                codename: installation.codename.clone(),
                context: persisted.context.clone(),
                path,
            },
        });
        Ok(persisted.context)
    }

    async fn client_cert_login(
        &self,
        management_context: &str,
        cluster_name: &str,
        policy: &LoginPolicy,
        outcome: &mut LoginOutcome,
    ) -> Result<()> {
        let flags = &self.config.flags;
        self.renew_before_use(management_context, outcome).await?;
        let store = self.writer.load()?;
        let server = store
            .cluster_for_context(management_context)
            .and_then(|cluster| cluster.server.clone())
            .ok_or(Error::SelectedContextNonCompatible)?;

        let installation = self.collaborators.installations.resolve(&server).await?;
        let provider = installation.provider.as_str();
        self.config.issuer.validate_provider(provider)?;

        let apis = self
            .collaborators
            .connector
            .connect(&store, management_context)
            .await?;
        let namespaces = candidate_namespaces(
            apis.clusters.as_ref(),
            flags.organization.as_deref(),
            flags.insecure_namespace,
        )
        .await?;
        let cluster = resolve_cluster(
            apis.clusters.as_ref(),
            &cluster_name.to_lowercase(),
            provider,
            &namespaces,
        )
        .await?;
        info!(
            cluster = %cluster.name,
            namespace = %cluster.namespace,
            organization = %cluster.organization_or_na(),
            "found workload cluster"
        );

        let release = validate_release_version(&cluster)?;
        let signer_version = apis.clusters.signer_version(&release).await?;
        let base_domain = cluster_base_domain(&server)?;
        let request = CertificateRequest::new(
            &cluster,
            &base_domain,
            &flags.certificate_ttl,
            &flags.certificate_groups,
            &signer_version,
        );

        let Some(mode) = policy.client_cert_mode().persist_mode() else {
            return Err(Error::InvalidArguments(
                "a client certificate needs a destination".to_string(),
            ));
        };
        let writer = &self.writer;
        let (cluster_ref, base_domain_ref, mode_ref) = (&cluster.name, &base_domain, &mode);
        let issuer = Issuer::new(apis.certificates.clone(), self.config.issuer.clone());
        let persisted = issuer
            .issue_with(&request, move |issued| async move {
                let entries =
                    client_cert_entries(management_context, cluster_ref, base_domain_ref, &issued);
                writer.persist(&entries, mode_ref)
            })
            .await?;

        outcome.push(match &mode {
            PersistMode::Merge { select } => LoginEvent::ClientCertCreated {
                cluster: cluster.name.clone(),
                context: persisted.context.clone(),
                existed: persisted.existed,
                selected: *select,
            },
            PersistMode::SelfContained { path } => LoginEvent::ClientCertExported {
                cluster: cluster.name.clone(),
                context: persisted.context.clone(),
                path: path.clone(),
            },
        });

        if !policy.switch_to_client_cert_context {
            self.restore_origin(policy, outcome)?;
        }
        Ok(())
    }

    /// Renew the OIDC session of `context` before its credentials are sent to
    /// the management API. Renewal failures only warn and the stored token
    /// is used as is.
    async fn renew_before_use(&self, context: &str, outcome: &LoginOutcome) -> Result<()> {
        if outcome.has_fresh_session(context) {
            return Ok(());
        }
        let store = self.writer.load()?;
        let Some(provider) = store.auth_provider(context) else {
            return Ok(());
        };
        let (oidc, refresh_token) = match validate_oidc_provider(provider, context) {
            Ok(validated) => validated,
            Err(e) => {
                warn!(context = %context, reason = %e, "session cannot be renewed, using stored token");
                return Ok(());
            }
        };

        let renewer = self.collaborators.renewer.as_ref();
        match refresh_session(renewer, &refresh_token, &oidc).await {
            Ok(tokens) => {
                self.writer
                    .save(&apply_renewed_tokens(&store, context, &tokens)?)?;
                debug!(context = %context, "renewed session before API use");
            }
            Err(e) => {
                warn!(context = %context, reason = %e, "session renewal failed, using stored token");
            }
        }
        Ok(())
    }

    fn restore_origin(&self, policy: &LoginPolicy, outcome: &mut LoginOutcome) -> Result<()> {
        let Some(origin) = policy.origin_context.as_deref() else {
            return Ok(());
        };
        if self.writer.load()?.current_context() == Some(origin) {
            return Ok(());
        }

        self.writer.select(origin)?;
        outcome.push(LoginEvent::OriginRestored {
            context: origin.to_string(),
        });
        Ok(())
    }
}
