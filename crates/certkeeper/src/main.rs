//! certkeeper - Main entry point
//!
//! Obtains, renews and advertises ACME certificates, either for a single
//! domain set described by flags or for every certificate of a TOML file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use certkeeper::scheduler::shutdown_signal;
use certkeeper::{
    AcmeConnector, CaConnector, ConsulNotifier, NoopNotifier, Notifier, Orchestrator,
    RenewalScheduler,
};
use certkeeper_config::{
    AcmeConfig, CertLayout, CertificateConfig, Config, KeyAlgorithm, MirrorConfig, RegistryConfig,
    ScheduleConfig, DEFAULT_CERT_BASE_NAME, DEFAULT_KEY_NAME, LETS_ENCRYPT_PRODUCTION,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// certkeeper - keeps ACME certificates present, fresh and advertised
#[derive(Parser, Debug)]
#[command(name = "certkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file; replaces the certificate flags below
    #[arg(short = 'c', long = "config", env = "CERTKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// ACME account contact email
    #[arg(long, env = "CERTKEEPER_EMAIL")]
    email: Option<String>,

    /// Comma separated domain names, the first one is the primary name
    #[arg(long, env = "CERTKEEPER_DOMAINS")]
    domains: Option<String>,

    /// Directory holding the domain private key
    #[arg(long, env = "CERTKEEPER_KEY_PATH", default_value = ".")]
    key_path: PathBuf,

    /// File name of the domain private key inside --key-path
    #[arg(long, env = "CERTKEEPER_KEY_NAME", default_value = DEFAULT_KEY_NAME)]
    key_name: String,

    /// Directory receiving the certificate bundle
    #[arg(long, env = "CERTKEEPER_CERT_PATH", default_value = ".")]
    cert_path: PathBuf,

    /// Certificate file base name: <base>.crt, or <base><N>.crt when split
    #[arg(long, env = "CERTKEEPER_CERT_BASE_NAME", default_value = DEFAULT_CERT_BASE_NAME)]
    cert_base_name: String,

    /// Bundle layout: one file or one file per certificate
    #[arg(long, env = "CERTKEEPER_CERT_LAYOUT", default_value = "concat")]
    cert_layout: CertLayout,

    /// Additional directory receiving a copy of the bundle (repeatable)
    #[arg(long = "mirror")]
    mirrors: Vec<PathBuf>,

    /// Renew when fewer than this many days of validity remain
    #[arg(long, env = "CERTKEEPER_RENEW_BEFORE", default_value_t = 30)]
    renew_before: u32,

    /// Webroot served at /.well-known/acme-challenge/
    #[arg(long, env = "CERTKEEPER_WEBROOT")]
    webroot: Option<PathBuf>,

    /// Directory holding the ACME account key [default: <state-dir>/<email>]
    #[arg(long, env = "CERTKEEPER_ACCOUNT_KEY")]
    account_key: Option<PathBuf>,

    /// Algorithm for newly generated keys
    #[arg(long, env = "CERTKEEPER_KEY_ALGORITHM", default_value = "rsa4096")]
    key_algorithm: KeyAlgorithm,

    /// ACME directory URL
    #[arg(long, env = "CERTKEEPER_DIRECTORY_URL", default_value = LETS_ENCRYPT_PRODUCTION)]
    directory_url: String,

    /// Use the Let's Encrypt staging directory
    #[arg(long, env = "CERTKEEPER_STAGING")]
    staging: bool,

    /// Directory for ACME account state
    #[arg(long, env = "CERTKEEPER_STATE_DIR", default_value = "./.letsencrypt")]
    state_dir: PathBuf,

    /// Consul agent address; availability is not advertised without it
    #[arg(long = "consul", env = "CERTKEEPER_CONSUL")]
    consul: Option<String>,

    /// Consul service name
    #[arg(long, env = "CERTKEEPER_SERVICE_NAME", default_value = "tls-certs")]
    service_name: String,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,

    /// Hours between passes
    #[arg(long, env = "CERTKEEPER_INTERVAL_HOURS", default_value_t = 24)]
    interval_hours: u64,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    /// Configuration for a single certificate described by flags
    fn to_config(&self) -> Result<Config> {
        let Some(ref email) = self.email else {
            bail!("--email is required without --config");
        };
        let Some(ref domains) = self.domains else {
            bail!("--domains is required without --config");
        };
        let Some(ref webroot) = self.webroot else {
            bail!("--webroot is required without --config");
        };

        let acme = AcmeConfig {
            email: email.clone(),
            directory_url: self.directory_url.clone(),
            staging: self.staging,
            state_dir: self.state_dir.clone(),
            account_key_dir: self
                .account_key
                .clone()
                .unwrap_or_else(|| self.state_dir.join(email)),
            webroot: webroot.clone(),
            key_algorithm: self.key_algorithm,
            order_timeout_secs: 300,
        };

        let certificate = CertificateConfig {
            name: None,
            domains: domains
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect(),
            key_dir: self.key_path.clone(),
            key_name: self.key_name.clone(),
            cert_dir: self.cert_path.clone(),
            cert_base_name: self.cert_base_name.clone(),
            layout: self.cert_layout,
            mirrors: self
                .mirrors
                .iter()
                .map(|dir| MirrorConfig {
                    dir: dir.clone(),
                    layout: self.cert_layout,
                })
                .collect(),
            renew_before_days: self.renew_before,
            key_algorithm: None,
        };

        let registry = self.consul.as_ref().map(|address| RegistryConfig {
            address: address.clone(),
            service_name: self.service_name.clone(),
            check_ttl_secs: 432_000,
        });

        Ok(Config {
            acme,
            registry,
            schedule: ScheduleConfig {
                once: self.once,
                interval_hours: self.interval_hours,
            },
            certificates: vec![certificate],
        })
    }

    fn load_config(&self) -> Result<Config> {
        let mut config = match self.config {
            Some(ref path) => {
                info!(path = %path.display(), "Loading configuration file");
                Config::from_file(path).context("Failed to load configuration file")?
            }
            None => self.to_config()?,
        };
        if self.once {
            config.schedule.once = true;
        }
        config.validate().context("Configuration validation failed")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let config = cli.load_config()?;

    if cli.test {
        info!(
            certificates = config.certificates.len(),
            registry = config.registry.is_some(),
            "Configuration test successful"
        );
        println!("certkeeper: configuration test is successful");
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(config))
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

async fn run(config: Config) -> Result<()> {
    let connector: Arc<dyn CaConnector> = Arc::new(AcmeConnector::from_config(&config.acme));

    let notifier: Arc<dyn Notifier> = match config.registry {
        Some(ref registry) => Arc::new(
            ConsulNotifier::from_config(registry)
                .await
                .context("Failed to connect to Consul")?,
        ),
        None => {
            info!("No registry configured, availability is not advertised");
            Arc::new(NoopNotifier)
        }
    };

    let orchestrators = config
        .certificates
        .iter()
        .map(|cert| {
            Orchestrator::from_config(&config.acme, cert, Arc::clone(&connector), Arc::clone(&notifier))
        })
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to set up certificates")?;

    let scheduler = RenewalScheduler::new(orchestrators);
    let scheduler = if config.schedule.once {
        scheduler.once()
    } else {
        scheduler.with_interval(Duration::from_secs(config.schedule.interval_hours * 3600))
    };

    info!(
        email = %config.acme.email,
        directory = %config.acme.effective_directory_url(),
        "certkeeper started"
    );

    scheduler
        .run(shutdown_signal())
        .await
        .context("Certificate maintenance stopped")
}
