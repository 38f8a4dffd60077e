#[cfg(not(target_os = "espidf"))]
mod native {
    const SERVER_URL: Option<&str> = option_env!("MICRO_OTA_SERVER_URL");
    const STAGED_IMAGE_PATH: &str = "staged-update.bin";

    use std::path::PathBuf;
    use std::time::Duration;

    use micro_ota::common::{
        config::UpdateConfig,
        exec::Executor,
        ota::OtaUpdater,
        sched::UpdateScheduler,
        target::InMemorySlot,
        transport::HttpTransport,
        version::{FirmwareVersion, VersionStore},
    };
    use micro_ota::native::{log::initialize_logger, tcp::NativeConnector};
    use serde::Deserialize;

    #[derive(Deserialize, Debug, Default)]
    struct Config {
        #[serde(default)]
        server: Server,
    }

    #[derive(Deserialize, Debug, Default)]
    struct Server {
        url: Option<String>,
        ca_certificate: Option<PathBuf>,
        poll_interval_secs: Option<u64>,
        max_request_size: Option<usize>,
    }

    // At runtime, settings from the config file override values statically
    // compiled from the same file at build time; the MICRO_OTA_SERVER_URL
    // environment variable beats both.

    fn load_config(path: &str) -> Config {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Config>(content.as_str()) {
                Ok(config) => {
                    log::info!("loaded agent configuration from `{}`", path);
                    config
                }
                Err(e) => {
                    log::error!("ignoring malformed `{}`: {}", path, e);
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    pub(crate) fn main_native() {
        initialize_logger();

        let config_path =
            std::env::var("MICRO_OTA_CONFIG").unwrap_or_else(|_| "ota.json".to_owned());
        let local = load_config(&config_path);

        let url = std::env::var("MICRO_OTA_SERVER_URL")
            .ok()
            .or(local.server.url)
            .or(SERVER_URL.map(str::to_owned));
        let Some(url) = url else {
            log::error!(
                "no update server configured; set server.url in `{}` or MICRO_OTA_SERVER_URL",
                config_path
            );
            std::process::exit(1);
        };

        let mut config = match UpdateConfig::new(&url) {
            Ok(config) => config,
            Err(e) => {
                log::error!("bad update server url `{}`: {}", url, e);
                std::process::exit(1);
            }
        };
        if let Some(secs) = local.server.poll_interval_secs {
            config = config.with_poll_interval(Duration::from_secs(secs));
        }
        if let Some(size) = local.server.max_request_size {
            config = match config.with_max_http_request_size(size) {
                Ok(config) => config,
                Err(e) => {
                    log::error!("bad max_request_size: {}", e);
                    std::process::exit(1);
                }
            };
        }
        if let Some(path) = local.server.ca_certificate {
            match std::fs::read(&path) {
                Ok(pem) => config = config.with_trust_anchor(pem),
                Err(e) => {
                    log::error!("cannot read ca certificate `{}`: {}", path.display(), e);
                    std::process::exit(1);
                }
            }
        }

        let running = FirmwareVersion::from(env!("CARGO_PKG_VERSION"));
        log::info!(
            "agent running firmware {}, watching {}",
            running,
            config.base_url()
        );

        let exec = Executor::new();
        let transport = HttpTransport::new(exec.clone(), NativeConnector::new(), config.clone());
        let slot = InMemorySlot::new();
        let updater = OtaUpdater::new(transport, slot.clone(), VersionStore::new(running), config);
        let updater = exec.block_on(UpdateScheduler::new(updater).run());

        if updater.is_update_ready() {
            if let Err(e) = std::fs::write(STAGED_IMAGE_PATH, slot.data()) {
                log::error!("failed to persist staged image: {}", e);
                std::process::exit(1);
            }
            log::info!(
                "staged image written to `{}`; restart onto it to finish the update",
                STAGED_IMAGE_PATH
            );
        }
    }
}

fn main() {
    #[cfg(not(target_os = "espidf"))]
    {
        native::main_native();
    }
}
