use std::fmt::Debug;

use axum::http::StatusCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

const LOG_MODULES: &[&str] = &["push_relay", "tower_http=info"];

pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut env_filter = EnvFilter::default();

        for module in LOG_MODULES {
            let directive = if module.contains('=') {
                module.to_string()
            } else {
                format!("{}=info", module)
            };
            env_filter = env_filter.add_directive(
                directive
                    .parse()
                    .expect("Could not parse logging directive"),
            );
        }

        env_filter
    });

    if std::env::var("LOG_JSON").is_ok() {
        let stackdriver = tracing_stackdriver::layer();
        let subscriber = Registry::default().with(stackdriver).with(env_filter);

        tracing::subscriber::set_global_default(subscriber)
            .expect("Could not set up global logger");
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

pub type WebResult<T> = std::result::Result<T, StatusCode>;

pub trait LogError<T> {
    fn log_error_status(self, status: StatusCode) -> WebResult<T>;

    fn log_error_unprocessable(self) -> WebResult<T>
    where
        Self: Sized,
    {
        self.log_error_status(StatusCode::UNPROCESSABLE_ENTITY)
    }
}

impl<T, E> LogError<T> for Result<T, E>
where
    E: Debug,
{
    fn log_error_status(self, status: StatusCode) -> WebResult<T> {
        match self {
            Ok(v) => Ok(v),
            Err(error) => {
                if status.is_server_error() {
                    tracing::error!(?error, %status, "Error: {:?}", error);
                } else {
                    tracing::warn!(?error, %status, "Rejected: {:?}", error);
                }

                Err(status)
            }
        }
    }
}
