use std::net::SocketAddr;
use std::path::PathBuf;

use url::Url;

use crate::browser::chromium::ChromiumSettings;

/// Process-wide configuration, resolved from the environment once at
/// startup. The pure `select_*` helpers keep the resolution testable.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    /// Root for everything the gateway writes: ledger db, artifacts.
    pub data_root: PathBuf,
    /// Base URL under which persisted artifacts are advertised.
    pub artifact_public_base: Url,
    /// Concurrent generation tasks per integration.
    pub concurrency_limit: usize,
    pub chromium: ChromiumSettings,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {name}: {message}")]
    Invalid { name: &'static str, message: String },
}

impl GatewayConfig {
    pub fn resolve() -> Result<Self, ConfigError> {
        let env = |name: &str| std::env::var(name).ok();
        Self::select(
            env("ARTGEN_BIND").as_deref(),
            env("ARTGEN_DATA_ROOT").as_deref(),
            env("ARTGEN_PUBLIC_BASE").as_deref(),
            env("ARTGEN_CONCURRENCY").as_deref(),
            env("ARTGEN_HEADLESS").as_deref(),
            env("ARTGEN_CHROME").as_deref(),
            env("ARTGEN_PROFILE_DIR").as_deref(),
        )
    }

    fn select(
        bind: Option<&str>,
        data_root: Option<&str>,
        public_base: Option<&str>,
        concurrency: Option<&str>,
        headless: Option<&str>,
        chrome: Option<&str>,
        profile_dir: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let bind = non_blank(bind)
            .unwrap_or("127.0.0.1:8790")
            .parse::<SocketAddr>()
            .map_err(|err| ConfigError::Invalid {
                name: "ARTGEN_BIND",
                message: err.to_string(),
            })?;
        let data_root = PathBuf::from(non_blank(data_root).unwrap_or("var/artgen"));
        let artifact_public_base = Url::parse(
            non_blank(public_base).unwrap_or("http://127.0.0.1:8790/artifacts"),
        )
        .map_err(|err| ConfigError::Invalid {
            name: "ARTGEN_PUBLIC_BASE",
            message: err.to_string(),
        })?;
        let concurrency_limit = match non_blank(concurrency) {
            None => 2,
            Some(raw) => raw.parse::<usize>().ok().filter(|n| *n >= 1).ok_or_else(|| {
                ConfigError::Invalid {
                    name: "ARTGEN_CONCURRENCY",
                    message: format!("{raw:?} is not a positive integer"),
                }
            })?,
        };
        let chromium = ChromiumSettings {
            headless: !matches!(non_blank(headless), Some("0") | Some("false")),
            executable: non_blank(chrome).map(PathBuf::from),
            user_data_dir: non_blank(profile_dir).map(PathBuf::from),
        };
        Ok(Self {
            bind,
            data_root,
            artifact_public_base,
            concurrency_limit,
            chromium,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
