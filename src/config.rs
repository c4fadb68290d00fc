use clap::Parser;
use std::time::Duration;

/// Runtime configuration, read from flags or `PVPOOL_`-prefixed environment
/// variables.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Raise log verbosity to debug
    #[arg(long, env = "PVPOOL_DEBUG", default_value_t = false)]
    pub debug: bool,

    /// Kubernetes namespace this deployment runs in, if known
    #[arg(long, env = "PVPOOL_NAMESPACE")]
    pub namespace: Option<String>,

    /// Identity used when recording Kubernetes events
    #[arg(long, env = "PVPOOL_NAME", default_value = "pvpool-controller")]
    pub name: String,

    /// Longest the work queue may wait before retrying an object that
    /// encountered an error
    #[arg(
        long,
        env = "PVPOOL_CONTROLLER_MAX_RECONCILE_BACKOFF_DURATION",
        value_parser = humantime::parse_duration,
        default_value = "1m"
    )]
    pub controller_max_reconcile_backoff_duration: Duration,

    /// Name of the service that provides access to the admission webhook
    #[arg(long, env = "PVPOOL_WEBHOOK_SERVICE_NAME")]
    pub webhook_service_name: Option<String>,

    /// Name of the secret that holds the webhook serving certificate
    #[arg(long, env = "PVPOOL_WEBHOOK_CERTIFICATE_SECRET_NAME")]
    pub webhook_certificate_secret_name: Option<String>,

    /// Name of the ValidatingWebhookConfiguration for the API server to
    /// communicate with the webhook
    #[arg(long, env = "PVPOOL_VALIDATING_WEBHOOK_CONFIGURATION_NAME")]
    pub validating_webhook_configuration_name: Option<String>,
}
