#[macro_use]
extern crate rocket;

use chargespot_rs::api;
use chargespot_rs::channel::{DispatchReport, HttpMessenger, LogMessenger, Messenger};
use chargespot_rs::metrics;
use chargespot_rs::poll::{CycleReport, Poller, StationReport};
use chargespot_rs::settings::read_settings;
use chargespot_rs::shutdown::ShutdownSignal;
use chargespot_rs::store::{FileStore, MemoryStore, StateStore};
use chargespot_rs::Error;
use rocket::serde::json::Json;
use rocket::State;
use std::sync::Arc;

/// Structure containing state for API handlers.
pub struct StateData {
    poller: Arc<Poller>,
}

#[get("/metrics")]
async fn metrics_route() -> Result<String, Error> {
    metrics::read()
}

/// Outcome of the last completed poll cycle, `null` before the first one.
#[get("/stations")]
fn stations_route(state: &State<StateData>) -> Json<Option<CycleReport>> {
    Json(state.poller.last_cycle())
}

/// Poll one station now; waits while the poll loop is processing the same station.
#[post("/stations/<key>/refresh")]
async fn refresh_route(key: &str, state: &State<StateData>) -> Result<Json<StationReport>, Error> {
    state.poller.refresh(key).await.map(Json)
}

#[post("/test-notification")]
async fn test_notification_route(state: &State<StateData>) -> Result<Json<DispatchReport>, Error> {
    state.poller.send_test().await.map(Json)
}

async fn serve() -> Result<(), Error> {
    let settings = read_settings()?;
    let validated = settings.validate()?;

    let store: Arc<dyn StateStore> = match &settings.state_file {
        Some(path) => Arc::new(FileStore::open(path.clone()).await?),
        None => {
            log::warn!("No state_file configured; state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    let messenger: Arc<dyn Messenger> = match &settings.messaging_url {
        Some(url) => Arc::new(HttpMessenger::new(url)?),
        None => {
            log::warn!("No messaging_url configured; notifications are only logged");
            Arc::new(LogMessenger)
        }
    };
    let source = Arc::new(api::api(settings.api_url.clone(), settings.fetch_timeout())?);

    let poller = Arc::new(Poller::new(&settings, validated, source, store, messenger));
    let purged = poller.purge_removed().await?;
    if purged > 0 {
        log::info!("Removed state of {} unconfigured stations", purged);
    }
    log::info!(
        "Polling {} stations every {} minutes",
        poller.stations().len(),
        settings.poll_interval().as_secs() / 60
    );

    let shutdown = ShutdownSignal::new();
    let poll_loop = tokio::spawn(poller.clone().run(settings.poll_interval(), shutdown.clone()));

    let launched = rocket::build()
        .manage(StateData { poller })
        .mount(
            "/",
            routes![
                metrics_route,
                stations_route,
                refresh_route,
                test_notification_route
            ],
        )
        .launch()
        .await;

    /* Let an in-flight cycle finish before exiting */
    shutdown.trigger();
    if let Err(e) = poll_loop.await {
        log::error!("Poll loop terminated abnormally: {}", e);
    }

    launched.map(|_| ()).map_err(|e| {
        log::error!("Server error: {}", e);
        Error::InternalError
    })
}

#[rocket::main]
async fn main() {
    env_logger::init();

    if let Err(e) = serve().await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
