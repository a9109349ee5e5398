use crate::{
    config::{AuthConfig, AuthStrategy, Config, ConfigError},
    credentials::{
        CredentialProvider, IdentityTokenProvider, MetadataTokenProvider, StaticTokenProvider,
        TokenCache,
    },
    pipeline::Pipeline,
    predictor::VertexPredictor,
    results::BucketResultSink,
    retry::RetryPolicy,
    server::HttpServer,
    storage::{GcsObjectStore, ObjectStore},
    telemetry::Metrics,
};
use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

/// Wires the collaborators described by `config`. Validation happens first, so a missing
/// `PROJECT_ID` or `ENDPOINT_ID` fails here before any request is sent.
pub fn build_pipeline(config: &Config, metrics: Arc<Metrics>) -> Result<Pipeline, ConfigError> {
    config.validate()?;

    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| ConfigError::Invalid(format!("Failed to build HTTP client: {}", e)))?;

    let audience = config
        .auth
        .audience
        .clone()
        .unwrap_or_else(|| config.prediction.get_base_url());
    let credentials = credential_provider(&config.auth, &client, &audience)?;

    let storage_credentials: Arc<dyn CredentialProvider> = match config.auth.strategy {
        AuthStrategy::Static => credentials.clone(),
        _ => cached(
            MetadataTokenProvider::new(
                client.clone(),
                &config.auth.metadata_host,
                &config.storage.scope,
            ),
            &config.auth,
        ),
    };
    let store: Arc<dyn ObjectStore> = Arc::new(GcsObjectStore::new(
        client.clone(),
        &config.storage.base_url,
        storage_credentials,
    ));

    let predictor = VertexPredictor::new(client, &config.prediction);
    tracing::info!("Prediction endpoint: {}", predictor.endpoint_url());

    let mut pipeline = Pipeline::new(store.clone(), credentials, Arc::new(predictor))
        .with_retry(RetryPolicy::new(&config.retry))
        .with_metrics(metrics);

    if let Some(bucket) = config.results.get_destination_bucket() {
        tracing::info!("Persisting classifications to gs://{}", bucket);
        pipeline = pipeline.with_results(Arc::new(BucketResultSink::new(store, bucket)));
    }

    Ok(pipeline)
}

fn credential_provider(
    auth: &AuthConfig,
    client: &reqwest::Client,
    audience: &str,
) -> Result<Arc<dyn CredentialProvider>, ConfigError> {
    let provider = match auth.strategy {
        AuthStrategy::IdentityToken => cached(
            IdentityTokenProvider::new(client.clone(), &auth.metadata_host, audience),
            auth,
        ),
        AuthStrategy::MetadataService => cached(
            MetadataTokenProvider::new(client.clone(), &auth.metadata_host, &auth.scope),
            auth,
        ),
        AuthStrategy::Static => {
            let token = auth
                .static_token
                .as_deref()
                .ok_or_else(|| ConfigError::Invalid("auth.static_token is not set".into()))?;
            Arc::new(StaticTokenProvider::new(token)) as Arc<dyn CredentialProvider>
        }
    };
    tracing::info!("Using {:?} credentials", auth.strategy);

    Ok(provider)
}

fn cached<C: CredentialProvider>(provider: C, auth: &AuthConfig) -> Arc<dyn CredentialProvider> {
    if auth.cache_tokens {
        Arc::new(TokenCache::new(provider, auth.get_expiry_skew()))
    } else {
        Arc::new(provider)
    }
}

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let metrics = Arc::new(Metrics::new()?);

    let pipeline = match build_pipeline(&config, metrics.clone()) {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) => {
            tracing::error!("Failed to initialize pipeline: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let server = HttpServer::new(pipeline, metrics, &config.server.get_address()).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();

    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
