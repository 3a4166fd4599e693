//! Dynamic Authority - self-issued CA and CA-bundle injector for Kubernetes

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dynamic_authority::config::{
    Options, DEFAULT_CA_SECRET, DEFAULT_COMMON_NAME, DEFAULT_NAMESPACE,
};
use dynamic_authority::controller::{build_ca_issuer, build_injectors, build_serving_loader};
use dynamic_authority::injectable::InjectableKind;
use dynamic_authority::pki::{EcCurve, ROTATION_THRESHOLD};
use dynamic_authority::server;
use dynamic_authority::serving::CertificateHolder;
use dynamic_authority::store::KubeStore;

/// Dynamic Authority - keeps a self-signed CA, its trust bundle and every
/// consumer of that bundle up to date
#[derive(Parser, Debug)]
#[command(name = "dynamic-authority", version, about, long_about = None)]
struct Cli {
    /// Namespace of the CA Secret
    #[arg(long, env = "DYNAMIC_AUTHORITY_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Name of the CA Secret
    #[arg(long, env = "DYNAMIC_AUTHORITY_CA_SECRET", default_value = DEFAULT_CA_SECRET)]
    ca_secret: String,

    /// Validity of each generated CA in seconds (0 = 7 days)
    #[arg(long, env = "DYNAMIC_AUTHORITY_CA_DURATION_SECS", default_value = "0")]
    ca_duration_secs: u64,

    /// Elliptic curve size for CA keys: 256, 384 or 521
    #[arg(long, env = "DYNAMIC_AUTHORITY_KEY_CURVE", default_value = "384")]
    key_curve: u32,

    /// Subject common name of generated CAs
    #[arg(long, env = "DYNAMIC_AUTHORITY_COMMON_NAME", default_value = DEFAULT_COMMON_NAME)]
    common_name: String,

    /// Fraction of the CA lifetime after which it is rotated
    #[arg(long, env = "DYNAMIC_AUTHORITY_ROTATION_THRESHOLD", default_value_t = ROTATION_THRESHOLD)]
    rotation_threshold: f64,

    /// Seconds between level-triggered re-checks without a change event
    #[arg(long, env = "DYNAMIC_AUTHORITY_RESYNC_SECS", default_value = "300")]
    resync_secs: u64,

    /// Address of the TLS health listener
    #[arg(long, env = "DYNAMIC_AUTHORITY_LISTEN_ADDR", default_value = "0.0.0.0:9443")]
    listen_addr: SocketAddr,

    /// Consumer kinds to inject the bundle into (default: all)
    ///
    /// Accepts kind names or the aliases validating, mutating, crd, apiservice.
    #[arg(long, env = "DYNAMIC_AUTHORITY_INJECTABLES", value_delimiter = ',')]
    injectables: Vec<InjectableKind>,

    /// Emit logs as JSON
    #[arg(long, env = "DYNAMIC_AUTHORITY_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn options(&self) -> anyhow::Result<Options> {
        let injectables = if self.injectables.is_empty() {
            InjectableKind::ALL.to_vec()
        } else {
            self.injectables.clone()
        };

        let options = Options {
            namespace: self.namespace.clone(),
            ca_secret: self.ca_secret.clone(),
            ca_duration: Duration::from_secs(self.ca_duration_secs),
            key_curve: EcCurve::from_bits(self.key_curve)?,
            common_name: self.common_name.clone(),
            rotation_threshold: self.rotation_threshold,
            resync_interval: Duration::from_secs(self.resync_secs),
            listen_addr: self.listen_addr,
            injectables,
        };
        options.validate()?;
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    // This MUST succeed for the listener and the API client to work.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             This may indicate a conflict with another crypto provider.",
            e
        );
        std::process::exit(1);
    }

    // When compiled with FIPS feature, verify FIPS mode is actually active
    #[cfg(feature = "fips")]
    {
        if let Err(e) = aws_lc_rs::try_fips_mode() {
            eprintln!(
                "CRITICAL: FIPS feature is enabled but FIPS mode failed to initialize: {}",
                e
            );
            std::process::exit(1);
        }
        eprintln!("FIPS mode: ENABLED (aws-lc-rs FIPS 140-3 validated module)");
    }

    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let options = Arc::new(cli.options()?);
    info!(
        secret = %options.ca_key(),
        curve = %options.key_curve,
        ca_duration_secs = options.effective_ca_duration().as_secs(),
        rotation_threshold = options.rotation_threshold,
        injectables = ?options.injectables,
        "starting dynamic authority"
    );

    run(options).await
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,dynamic_authority=debug,kube=info,tower=warn,hyper=warn")
    });

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Run every controller and the TLS listener until a shutdown signal
async fn run(options: Arc<Options>) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let store = Arc::new(KubeStore::new(client.clone()));
    let holder = Arc::new(CertificateHolder::new());
    let cancel = CancellationToken::new();

    info!("Starting controllers:");
    let mut controllers = vec![
        build_ca_issuer(client.clone(), store.clone(), options.clone(), cancel.clone()),
        build_serving_loader(
            client.clone(),
            store.clone(),
            holder.clone(),
            options.clone(),
            cancel.clone(),
        ),
    ];
    controllers.extend(build_injectors(client, store, options.clone(), cancel.clone()));

    let mut tasks = JoinSet::new();
    for controller in controllers {
        tasks.spawn(controller);
    }

    let mut listener = tokio::spawn(server::serve(options.listen_addr, holder, cancel.clone()));

    let listener_result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            None
        }
        result = &mut listener => Some(result),
    };
    cancel.cancel();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "controller task failed");
        }
    }

    let listener_result = match listener_result {
        Some(result) => result,
        None => listener.await,
    };
    listener_result
        .map_err(|e| anyhow::anyhow!("TLS listener task failed: {}", e))?
        .map_err(|e| anyhow::anyhow!("TLS listener failed: {}", e))?;

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
