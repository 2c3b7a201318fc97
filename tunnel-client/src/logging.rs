use std::sync::OnceLock;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

static LOG_RELOADER: OnceLock<FilterHandle> = OnceLock::new();

pub fn init(default_level: &str, json: bool) {
    let filter = EnvFilter::try_new(default_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let registry = tracing_subscriber::registry().with(filter_layer);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let _ = LOG_RELOADER.set(handle);
}

pub fn set_log_level(level: &str) {
    let Some(handle) = LOG_RELOADER.get() else {
        tracing::warn!("log reloader not initialized");
        return;
    };
    match EnvFilter::try_new(level) {
        Ok(filter) => {
            if handle.reload(filter).is_err() {
                tracing::warn!(level, "failed to reload log filter");
            }
        }
        Err(e) => tracing::warn!(level, error = %e, "invalid log level"),
    }
}
