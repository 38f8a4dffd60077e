use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use axum::{extract::State, routing::get, Router};
use local_ip_address::local_ip;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_IMAGE_DIR: &str = "images";
const PORT: u16 = 3001;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=debug,tower_http=debug", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let image_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGE_DIR));

    tokio::join!(serve(router(image_dir.clone()), image_dir, PORT),);
}

fn router(image_dir: PathBuf) -> Router {
    Router::new()
        .route("/info", get(info))
        .nest_service("/static", ServeDir::new(image_dir.clone()))
        .with_state(image_dir)
}

/// Replies with the filename a device should fetch next: the most recently
/// modified `.bin` in the image directory, or an empty body when nothing is
/// staged.
async fn info(State(image_dir): State<PathBuf>) -> String {
    newest_image(&image_dir).unwrap_or_default()
}

fn newest_image(dir: &Path) -> Option<String> {
    let mut newest: Option<(SystemTime, String)> = None;
    for entry in std::fs::read_dir(dir).ok()?.flatten() {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !name.ends_with(".bin") {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, name));
        }
    }
    newest.map(|(_, name)| name)
}

async fn serve(app: Router, image_dir: PathBuf, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    // get private address
    let local = local_ip().unwrap();
    tracing::info!(
        "serving firmware images from `{}`:\n\n\thttp://{local}:{port}/info\n\thttp://{local}:{port}/static/<filename>",
        image_dir.display()
    );
    axum::serve(listener, app.layer(TraceLayer::new_for_http()))
        .await
        .unwrap();
}
