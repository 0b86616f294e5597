//! Service wiring: stores, policy, token codec and the login manager.

use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{info, warn};

use leash_auth::defaults::seed_default_policy;
use leash_auth::memory::{InMemoryCredentialStore, InMemoryPolicyAdapter};
use leash_auth::roles::leash::ADMIN;
use leash_auth::{
    CredentialStore, ExternalAuthenticator, IdentityResolver, LoginConfig, LoginManager, PolicyAdapter, PolicyEngine,
    SigningKeys, StoreError, TokenCodec,
};
use leash_core::NewUser;
use leash_infra::{GoogleAuthenticator, GoogleOAuthConfig, PostgresCredentialStore, PostgresPolicyAdapter};

use crate::config::{BootstrapAdmin, Config};

/// Everything handlers and middleware need, shared behind one `Arc`.
pub struct AppServices {
    pub store: Arc<dyn CredentialStore>,
    pub policy: Arc<PolicyEngine>,
    pub codec: Arc<TokenCodec>,
    pub resolver: IdentityResolver,
    pub login: LoginManager,
}

impl AppServices {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        policy: Arc<PolicyEngine>,
        codec: Arc<TokenCodec>,
        external: Arc<dyn ExternalAuthenticator>,
        login_config: LoginConfig,
    ) -> Self {
        let resolver = IdentityResolver::new(store.clone(), codec.clone());
        let login = LoginManager::new(store.clone(), policy.clone(), codec.clone(), external, login_config);
        Self {
            store,
            policy,
            codec,
            resolver,
            login,
        }
    }

    /// In-memory stores, an ephemeral key and the default policy.
    pub async fn in_memory(external: Arc<dyn ExternalAuthenticator>) -> anyhow::Result<Self> {
        let store: Arc<dyn CredentialStore> = Arc::new(InMemoryCredentialStore::new());
        let adapter: Arc<dyn PolicyAdapter> = Arc::new(InMemoryPolicyAdapter::new());
        let codec = Arc::new(TokenCodec::ephemeral("leash").context("failed to create token codec")?);
        let policy = prepare_policy(adapter).await?;
        Ok(Self::new(store, policy, codec, external, LoginConfig::default()))
    }
}

/// Build services from configuration (used by `main.rs`).
pub async fn build_services(config: &Config) -> anyhow::Result<AppServices> {
    let keys = match &config.key_file {
        Some(path) => leash_infra::load_or_generate(path)?,
        None => {
            warn!("no key_file configured; tokens will not survive a restart");
            SigningKeys::generate()
        }
    };
    let codec = Arc::new(TokenCodec::new(&keys, config.issuer.clone()).context("failed to create token codec")?);

    let (store, adapter): (Arc<dyn CredentialStore>, Arc<dyn PolicyAdapter>) = match &config.database_url {
        Some(url) => {
            let pool = leash_infra::postgres::connect(url, config.database_max_connections)
                .await
                .context("failed to connect to Postgres")?;
            leash_infra::postgres::migrate(&pool)
                .await
                .context("failed to apply schema")?;
            (
                Arc::new(PostgresCredentialStore::new(pool.clone())),
                Arc::new(PostgresPolicyAdapter::new(pool)),
            )
        }
        None => {
            warn!("no database_url configured; using in-memory stores");
            (
                Arc::new(InMemoryCredentialStore::new()),
                Arc::new(InMemoryPolicyAdapter::new()),
            )
        }
    };

    let Some(google) = &config.google else {
        bail!("google client configuration is required (google.client_id, google.client_secret, google.redirect_url)");
    };
    let external = Arc::new(
        GoogleAuthenticator::new(GoogleOAuthConfig {
            client_id: google.client_id.clone(),
            client_secret: google.client_secret.clone(),
            redirect_url: google.redirect_url.clone(),
        })
        .context("failed to build HTTP client")?,
    );

    let policy = prepare_policy(adapter).await?;
    if let Some(admin) = &config.bootstrap_admin {
        bootstrap_admin(store.as_ref(), admin).await?;
    }

    Ok(AppServices::new(store, policy, codec, external, config.login_config()))
}

async fn prepare_policy(adapter: Arc<dyn PolicyAdapter>) -> anyhow::Result<Arc<PolicyEngine>> {
    let policy = PolicyEngine::load(adapter).await.context("failed to load policy")?;
    seed_default_policy(&policy).context("failed to seed default policy")?;
    policy.save_policy().await.context("failed to save policy")?;
    Ok(Arc::new(policy))
}

/// Create the configured admin unless someone already owns the email.
pub async fn bootstrap_admin(store: &dyn CredentialStore, admin: &BootstrapAdmin) -> anyhow::Result<()> {
    if store.find_user_for_login(&admin.email).await?.is_some() {
        return Ok(());
    }
    let new_user = NewUser::new(admin.email.as_str(), admin.name.as_str(), ADMIN.as_str())
        .context("invalid bootstrap admin")?;
    match store.insert_user(new_user).await {
        Ok(user) => {
            info!(user_id = %user.id, "bootstrap admin created");
            Ok(())
        }
        // Another instance won the race.
        Err(StoreError::Conflict(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
