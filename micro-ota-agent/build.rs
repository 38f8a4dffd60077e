use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Config {
    pub server: Server,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Server {
    pub url: String,
}

fn main() {
    println!("cargo:rerun-if-changed=ota.json");

    // bake the server url into the binary so a deployed agent needs no
    // config file; a runtime ota.json still overrides it
    if let Ok(content) = std::fs::read_to_string("ota.json") {
        if let Ok(cfg) = serde_json::from_str::<Config>(content.as_str()) {
            println!("cargo:rustc-env=MICRO_OTA_SERVER_URL={}", cfg.server.url);
        }
    }
}
